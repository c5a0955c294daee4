//! MQTT Adapter
//!
//! Bridges MQTT and the dial engine:
//! - `{prefix}/sources/{source_id}/state` messages feed the source hub
//! - dial snapshots go out on `{prefix}/dials/{dial_id}/state` (retained)
//! - refresh failures and shutdown go out on `{prefix}/status`

use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, SharedBus};
use crate::config::MqttConfig;
use crate::sources::SourceHub;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TOPIC_PREFIX: &str = "vu1-dial-bridge";
const CLIENT_ID: &str = "vu1-dial-bridge";

/// MQTT connection status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttStatus {
    pub configured: bool,
    pub connected: bool,
    pub host: Option<String>,
    pub port: u16,
    pub topic_prefix: String,
}

/// Internal state
struct MqttState {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    topic_prefix: String,
    connected: bool,
    running: bool,
}

impl Default for MqttState {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            connected: false,
            running: false,
        }
    }
}

/// One outbound MQTT message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
    pub retain: bool,
}

/// MQTT Adapter
pub struct MqttAdapter {
    state: Arc<RwLock<MqttState>>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    sources: Arc<SourceHub>,
    bus: SharedBus,
    shutdown: RwLock<CancellationToken>,
}

impl MqttAdapter {
    pub fn new(bus: SharedBus, sources: Arc<SourceHub>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MqttState::default())),
            client: Arc::new(RwLock::new(None)),
            sources,
            bus,
            shutdown: RwLock::new(CancellationToken::new()),
        }
    }

    /// Configure the MQTT connection
    pub async fn configure(&self, config: &MqttConfig) {
        let mut state = self.state.write().await;
        state.host = Some(config.host.clone());
        state.port = config.port;
        state.username = config.username.clone();
        state.password = config.password.clone();
        if let Some(prefix) = config.topic_prefix.as_deref().filter(|p| !p.is_empty()) {
            state.topic_prefix = prefix.trim_end_matches('/').to_string();
        }
    }

    /// Check if configured
    pub async fn is_configured(&self) -> bool {
        self.state.read().await.host.is_some()
    }

    /// Get connection status
    pub async fn get_status(&self) -> MqttStatus {
        let state = self.state.read().await;
        MqttStatus {
            configured: state.host.is_some(),
            connected: state.connected,
            host: state.host.clone(),
            port: state.port,
            topic_prefix: state.topic_prefix.clone(),
        }
    }

    /// Start MQTT connection and bridge (internal - use Startable trait)
    async fn start_internal(&self) -> Result<()> {
        let (host, port, username, password, topic_prefix) = {
            let mut state = self.state.write().await;
            if state.running {
                return Ok(());
            }
            let host = state
                .host
                .clone()
                .ok_or_else(|| anyhow!("MQTT host not configured"))?;
            state.running = true;
            (
                host,
                state.port,
                state.username.clone(),
                state.password.clone(),
                state.topic_prefix.clone(),
            )
        };

        let shutdown = {
            let mut token = self.shutdown.write().await;
            *token = CancellationToken::new();
            token.clone()
        };

        let mut options = MqttOptions::new(CLIENT_ID, &host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&username, &password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        *self.client.write().await = Some(client.clone());

        // Queued until the connection comes up
        let source_topic = format!("{}/sources/+/state", topic_prefix);
        client.subscribe(&source_topic, QoS::AtLeastOnce).await?;

        tracing::info!("MQTT connecting to {}:{}...", host, port);

        // Event loop: connection state + inbound source states
        let state = self.state.clone();
        let sources = self.sources.clone();
        let prefix = topic_prefix.clone();
        let loop_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_shutdown.cancelled() => {
                        tracing::info!("MQTT event loop shutting down");
                        break;
                    }
                    result = eventloop.poll() => match result {
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let Some(source_id) = parse_source_topic(&prefix, &publish.topic) else {
                                continue;
                            };
                            match parse_source_payload(&publish.payload) {
                                Some(value) => {
                                    sources.set_state(source_id, &value).await;
                                }
                                None => tracing::debug!(
                                    "Ignoring empty MQTT state for source {}",
                                    source_id
                                ),
                            }
                        }
                        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                            tracing::info!("MQTT connected (code: {:?})", ack.code);
                            state.write().await.connected = true;
                        }
                        Ok(Event::Incoming(Incoming::Disconnect)) => {
                            tracing::warn!("MQTT disconnected");
                            state.write().await.connected = false;
                        }
                        Err(e) => {
                            tracing::error!("MQTT error: {}", e);
                            state.write().await.connected = false;
                            tokio::select! {
                                _ = loop_shutdown.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                            }
                        }
                        _ => {}
                    },
                }
            }
        });

        // Bus forwarder: dial snapshots and status out
        tokio::spawn(forward_bus_events(
            self.bus.subscribe(),
            self.client.clone(),
            topic_prefix,
            shutdown,
        ));

        Ok(())
    }

    /// Stop MQTT connection (internal - use Startable trait)
    async fn stop_internal(&self) {
        // Cancel background tasks first
        self.shutdown.read().await.cancel();

        let client = self.client.write().await.take();
        if let Some(c) = client {
            let _ = c.disconnect().await;
        }

        {
            let mut state = self.state.write().await;
            state.connected = false;
            state.running = false;
        }

        tracing::info!("MQTT adapter stopped");
    }
}

crate::impl_startable!(MqttAdapter, "mqtt", is_configured);

/// Publish bus events until shutdown or until the bus goes away
async fn forward_bus_events(
    mut rx: broadcast::Receiver<BusEvent>,
    client_slot: Arc<RwLock<Option<AsyncClient>>>,
    topic_prefix: String,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            // The next DialsUpdated carries full state
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("MQTT bus forwarder lagged by {} events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let client = client_slot.read().await.clone();
        let Some(client) = client else {
            continue;
        };
        for message in event_messages(&topic_prefix, &event) {
            if let Err(e) = publish_message(&client, &message).await {
                tracing::warn!("MQTT publish to {} failed: {}", message.topic, e);
            }
        }
    }
    tracing::info!("MQTT bus forwarder stopped");
}

async fn publish_message(client: &AsyncClient, message: &OutboundMessage) -> Result<()> {
    let payload = serde_json::to_string(&message.payload)?;
    client
        .publish(
            &message.topic,
            QoS::AtMostOnce,
            message.retain,
            payload.as_bytes(),
        )
        .await?;
    Ok(())
}

/// Source id from `{prefix}/sources/{source_id}/state`
pub fn parse_source_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/sources/")?;
    let source_id = rest.strip_suffix("/state")?;
    (!source_id.is_empty() && !source_id.contains('/')).then_some(source_id)
}

/// Source state from a message payload: raw text, or JSON `{"state": ...}`
pub fn parse_source_payload(payload: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        return match obj.get("state")? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        };
    }

    Some(text.to_string())
}

/// Messages a bus event turns into
pub fn event_messages(prefix: &str, event: &BusEvent) -> Vec<OutboundMessage> {
    match event {
        BusEvent::DialsUpdated { dials } => dials
            .iter()
            .map(|dial| OutboundMessage {
                topic: format!("{}/dials/{}/state", prefix, dial.dial_id),
                payload: json!(dial),
                retain: true,
            })
            .collect(),
        BusEvent::DialsUpdateFailed { error } => vec![OutboundMessage {
            topic: format!("{}/status", prefix),
            payload: json!({
                "online": true,
                "last_update_success": false,
                "error": error,
            }),
            retain: false,
        }],
        BusEvent::DialsRemoved { dial_ids } => dial_ids
            .iter()
            .map(|dial_id| OutboundMessage {
                topic: format!("{}/dials/{}/state", prefix, dial_id),
                payload: json!({ "dial_id": dial_id, "removed": true }),
                retain: true,
            })
            .collect(),
        BusEvent::ShuttingDown { reason } => vec![OutboundMessage {
            topic: format!("{}/status", prefix),
            payload: json!({
                "online": false,
                "reason": reason,
            }),
            retain: false,
        }],
        _ => Vec::new(),
    }
}
