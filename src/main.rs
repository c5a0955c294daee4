//! VU1 Dial Bridge - Rust Implementation
//!
//! Sync and sensor-binding bridge for VU1 analog dials.

use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vu1_dial_bridge::adapters::{self, Startable};
use vu1_dial_bridge::binding::BindingManager;
use vu1_dial_bridge::bus::{self, BusEvent};
use vu1_dial_bridge::coordinator::{CoordinatorSettings, DialCoordinator};
use vu1_dial_bridge::dials::{DialConfigStore, JsonFileBlobStore};
use vu1_dial_bridge::registry::MemoryDeviceRegistry;
use vu1_dial_bridge::sources::SourceHub;
use vu1_dial_bridge::{api, config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vu1_dial_bridge=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting VU1 Dial Bridge v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("VU1_BRIDGE_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!("Configuration loaded, port: {}", config.port);

    // VU1 server client
    let client = Arc::new(adapters::vu1::Vu1Client::new(
        adapters::vu1::Vu1ClientOptions::from_config(&config.server),
    )?);
    let check = client.test_connection().await;
    if check.connected && client.has_api_key() && !check.authenticated {
        bail!(
            "VU1 server at {} rejected the API key: {}",
            client.base_url(),
            check.error.unwrap_or_default()
        );
    }
    if check.connected {
        tracing::info!(
            "VU1 server reachable at {} ({} dial(s))",
            client.base_url(),
            check.dials.len()
        );
    } else {
        // Not fatal: the coordinator keeps polling until the server shows up
        tracing::warn!(
            "VU1 server at {} not reachable yet: {}",
            client.base_url(),
            check.error.unwrap_or_default()
        );
    }

    // Create event bus
    let bus = bus::create_bus();
    tracing::info!("Event bus initialized");

    // Dial config store
    let data_dir = config::get_data_dir();
    let blob = Arc::new(JsonFileBlobStore::in_data_dir(data_dir));
    let configs = DialConfigStore::new(blob, bus.clone());

    // Local collaborators
    let registry = Arc::new(MemoryDeviceRegistry::new());
    let sources = Arc::new(SourceHub::new());

    // Sensor bindings
    let bindings = BindingManager::new(
        configs.clone(),
        sources.clone(),
        config.sync.debounce(),
        bus.clone(),
    );
    // Loads the persisted dial configs
    bindings.setup().await;

    // Coordinator
    let coordinator = DialCoordinator::new(
        client,
        configs,
        registry.clone(),
        bindings.clone(),
        bus.clone(),
        CoordinatorSettings::from_config(&config.sync),
    )
    .await;

    // MQTT bridge
    let mqtt = Arc::new(adapters::mqtt::MqttAdapter::new(bus.clone(), sources.clone()));
    if let Some(ref mqtt_config) = config.mqtt {
        mqtt.configure(mqtt_config).await;
        tracing::info!("MQTT bridge configured for {}", mqtt_config.host);
    }

    let services: Vec<Arc<dyn Startable>> = vec![
        coordinator.clone() as Arc<dyn Startable>,
        mqtt.clone() as Arc<dyn Startable>,
    ];
    adapters::traits::start_all(&services).await;

    // Build application state and routes
    let port = config.port;
    let state = api::AppState::new(coordinator, registry, sources, mqtt, bus.clone(), config);
    let app = api::router(state)
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: bindings first so no write races the stopping services
    tracing::info!("Shutting down services...");
    bus.publish(BusEvent::ShuttingDown {
        reason: Some("signal".to_string()),
    });
    bindings.shutdown().await;
    adapters::traits::stop_all(&services).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
