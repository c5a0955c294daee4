//! HTTP API handlers

use crate::adapters::mqtt::{parse_source_payload, MqttAdapter};
use crate::adapters::vu1::Vu1Error;
use crate::bus::SharedBus;
use crate::config::Config;
use crate::coordinator::{DialCoordinator, DialError};
use crate::diagnostics;
use crate::dials::{BehaviorPreset, DialConfig, DialConfigUpdate, EasingSettings};
use crate::registry::MemoryDeviceRegistry;
use crate::sources::SourceHub;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DialCoordinator>,
    pub registry: Arc<MemoryDeviceRegistry>,
    pub sources: Arc<SourceHub>,
    pub mqtt: Arc<MqttAdapter>,
    pub bus: SharedBus,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        coordinator: Arc<DialCoordinator>,
        registry: Arc<MemoryDeviceRegistry>,
        sources: Arc<SourceHub>,
        mqtt: Arc<MqttAdapter>,
        bus: SharedBus,
        config: Config,
    ) -> Self {
        Self {
            coordinator,
            registry,
            sources,
            mqtt,
            bus,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

/// All API routes. Middleware is layered on by the caller.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/status", get(status_handler))
        .route("/diagnostics", get(diagnostics_handler))
        // Dials
        .route("/dials", get(dials_handler))
        .route("/dials/refresh", post(refresh_handler))
        .route("/dials/provision", post(provision_handler))
        .route("/dials/{dial_id}", get(dial_handler))
        .route("/dials/{dial_id}/config", get(dial_config_handler))
        .route("/dials/{dial_id}/config", post(dial_config_update_handler))
        .route("/dials/{dial_id}/name", post(dial_name_handler))
        .route("/dials/{dial_id}/value", post(dial_value_handler))
        .route("/dials/{dial_id}/backlight", post(dial_backlight_handler))
        .route("/dials/{dial_id}/easing", post(dial_easing_handler))
        .route("/dials/{dial_id}/preset", post(dial_preset_handler))
        .route("/dials/{dial_id}/reload", post(dial_reload_handler))
        .route("/dials/{dial_id}/calibrate", post(dial_calibrate_handler))
        .route("/dials/{dial_id}/image", get(dial_image_handler))
        .route("/dials/{dial_id}/image", post(dial_image_upload_handler))
        // Local device registry
        .route("/devices", get(devices_handler))
        .route("/devices/{dial_id}/name", put(device_name_handler))
        // Sources
        .route("/sources", get(sources_handler))
        .route("/sources/{source_id}", post(source_state_handler))
        // Event stream (SSE)
        .route("/events", get(events_handler))
        .with_state(state)
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn ok_response() -> Response {
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

impl IntoResponse for DialError {
    fn into_response(self) -> Response {
        let status = match &self {
            DialError::UnknownDial(_) => StatusCode::NOT_FOUND,
            DialError::Server(e) => server_error_status(e),
        };
        error_response(status, self.to_string())
    }
}

fn server_error_status(error: &Vu1Error) -> StatusCode {
    match error {
        Vu1Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Vu1Error::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        Vu1Error::Auth(_) | Vu1Error::Api(_) => StatusCode::BAD_GATEWAY,
    }
}

fn to_response(result: Result<(), DialError>) -> Response {
    match result {
        Ok(()) => ok_response(),
        Err(e) => e.into_response(),
    }
}

/// General status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub uptime_secs: u64,
    pub last_update_success: bool,
    pub dial_count: usize,
    pub binding_count: usize,
    pub mqtt_connected: bool,
    pub bus_subscribers: usize,
}

/// GET /status - Service health check
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let coordinator = state.coordinator.status().await;
    let mqtt_status = state.mqtt.get_status().await;

    Json(StatusResponse {
        service: "vu1-dial-bridge",
        version: env!("CARGO_PKG_VERSION"),
        git_sha: env!("VU1_BRIDGE_GIT_SHA"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        last_update_success: coordinator.last_update_success,
        dial_count: coordinator.dial_count,
        binding_count: state.coordinator.bindings().binding_count().await,
        mqtt_connected: mqtt_status.connected,
        bus_subscribers: state.bus.subscriber_count(),
    })
}

/// GET /diagnostics - Redacted diagnostics snapshot
pub async fn diagnostics_handler(State(state): State<AppState>) -> Json<diagnostics::Diagnostics> {
    Json(diagnostics::collect(&state.config, &state.coordinator).await)
}

// =============================================================================
// Dial handlers
// =============================================================================

/// GET /dials - Every dial in the current snapshot
pub async fn dials_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut dials: Vec<_> = state.coordinator.snapshot().await.into_values().collect();
    dials.sort_by(|a, b| a.uid().cmp(b.uid()));
    Json(dials)
}

/// GET /dials/{dial_id} - One dial from the snapshot
pub async fn dial_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
) -> Response {
    match state.coordinator.get_dial(&dial_id).await {
        Some(dial) => (StatusCode::OK, Json(dial)).into_response(),
        None => DialError::UnknownDial(dial_id).into_response(),
    }
}

/// POST /dials/refresh - Run a refresh cycle now
pub async fn refresh_handler(State(state): State<AppState>) -> Response {
    match state.coordinator.refresh().await {
        Ok(()) => (StatusCode::OK, Json(state.coordinator.status().await)).into_response(),
        Err(e) => error_response(server_error_status(&e), e.to_string()),
    }
}

/// POST /dials/provision - Provision newly attached dials
pub async fn provision_handler(State(state): State<AppState>) -> Response {
    match state.coordinator.provision_new_dials().await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Config as served by the API
#[derive(Serialize)]
pub struct DialConfigResponse {
    pub dial_id: String,
    #[serde(flatten)]
    pub config: DialConfig,
    pub behavior_preset: BehaviorPreset,
    pub config_sha: String,
}

impl DialConfigResponse {
    fn new(dial_id: String, config: DialConfig) -> Self {
        Self {
            dial_id,
            behavior_preset: config.behavior_preset(),
            config_sha: config.config_sha(),
            config,
        }
    }
}

/// GET /dials/{dial_id}/config - Stored config (defaults if never set)
pub async fn dial_config_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
) -> Json<DialConfigResponse> {
    let config = state.coordinator.configs().get(&dial_id).await;
    Json(DialConfigResponse::new(dial_id, config))
}

/// POST /dials/{dial_id}/config - Partial config update
pub async fn dial_config_update_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !body.is_object() {
        return error_response(StatusCode::BAD_REQUEST, "expected a JSON object");
    }
    let update = DialConfigUpdate::from_json(&body);
    let config = state.coordinator.configs().update(&dial_id, update).await;
    state.coordinator.bindings().reconfigure_binding(&dial_id).await;
    (StatusCode::OK, Json(DialConfigResponse::new(dial_id, config))).into_response()
}

#[derive(Deserialize)]
pub struct NameRequest {
    pub name: String,
}

/// POST /dials/{dial_id}/name - Rename on the server
pub async fn dial_name_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(req): Json<NameRequest>,
) -> Response {
    to_response(state.coordinator.set_dial_name(&dial_id, &req.name).await)
}

#[derive(Deserialize)]
pub struct ValueRequest {
    pub value: i64,
}

/// POST /dials/{dial_id}/value - Move the needle (switches the dial to manual)
pub async fn dial_value_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(req): Json<ValueRequest>,
) -> Response {
    to_response(state.coordinator.set_dial_value(&dial_id, req.value).await)
}

#[derive(Deserialize)]
pub struct BacklightRequest {
    pub red: i64,
    pub green: i64,
    pub blue: i64,
}

/// POST /dials/{dial_id}/backlight - Set and remember the backlight color
pub async fn dial_backlight_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(req): Json<BacklightRequest>,
) -> Response {
    to_response(
        state
            .coordinator
            .set_dial_backlight(&dial_id, [req.red, req.green, req.blue])
            .await,
    )
}

/// Easing fields left out keep their stored value
#[derive(Deserialize)]
pub struct EasingRequest {
    pub dial_period: Option<u32>,
    pub dial_step: Option<u32>,
    pub backlight_period: Option<u32>,
    pub backlight_step: Option<u32>,
}

/// POST /dials/{dial_id}/easing - Write easing to the server and config
pub async fn dial_easing_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(req): Json<EasingRequest>,
) -> Response {
    let current = state.coordinator.configs().get(&dial_id).await.easing();
    let easing = EasingSettings {
        dial_period: req.dial_period.unwrap_or(current.dial_period),
        dial_step: req.dial_step.unwrap_or(current.dial_step),
        backlight_period: req.backlight_period.unwrap_or(current.backlight_period),
        backlight_step: req.backlight_step.unwrap_or(current.backlight_step),
    };
    match state.coordinator.set_dial_easing(&dial_id, easing).await {
        Ok(applied) => (StatusCode::OK, Json(applied)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct PresetRequest {
    pub preset: String,
}

/// POST /dials/{dial_id}/preset - Apply a behavior preset
pub async fn dial_preset_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(req): Json<PresetRequest>,
) -> Response {
    let preset: BehaviorPreset = match req.preset.parse() {
        Ok(preset) => preset,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    match state
        .coordinator
        .apply_behavior_preset(&dial_id, preset)
        .await
    {
        Ok(applied) => (
            StatusCode::OK,
            Json(json!({
                "preset": preset,
                "description": preset.description(),
                "easing": applied,
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /dials/{dial_id}/reload - Reload dial configuration on the server
pub async fn dial_reload_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
) -> Response {
    to_response(state.coordinator.reload_dial(&dial_id).await)
}

#[derive(Deserialize)]
pub struct CalibrateRequest {
    pub value: Option<i64>,
}

/// POST /dials/{dial_id}/calibrate - Calibrate; the body is optional
pub async fn dial_calibrate_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    body: Bytes,
) -> Response {
    let value = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<CalibrateRequest>(&body) {
            Ok(req) => req.value,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    };
    to_response(state.coordinator.calibrate_dial(&dial_id, value).await)
}

/// GET /dials/{dial_id}/image - Current background image (PNG)
pub async fn dial_image_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
) -> Response {
    match state.coordinator.get_dial_image(&dial_id).await {
        Ok(image) => (StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], image).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /dials/{dial_id}/image - Upload a background image (raw PNG body)
pub async fn dial_image_upload_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "image body is empty");
    }
    to_response(state.coordinator.set_dial_image(&dial_id, body.to_vec()).await)
}

// =============================================================================
// Device registry handlers
// =============================================================================

/// GET /devices - Local device entries
pub async fn devices_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

#[derive(Deserialize)]
pub struct DeviceNameRequest {
    pub name: Option<String>,
}

/// PUT /devices/{dial_id}/name - Rename locally; null clears the override
pub async fn device_name_handler(
    State(state): State<AppState>,
    Path(dial_id): Path<String>,
    Json(req): Json<DeviceNameRequest>,
) -> Response {
    match state
        .registry
        .rename_by_user(&dial_id, req.name.as_deref())
        .await
    {
        Some(entry) => (StatusCode::OK, Json(entry)).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Device not found: {}", dial_id),
        ),
    }
}

// =============================================================================
// Source handlers
// =============================================================================

/// GET /sources - Latest state of every source
pub async fn sources_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sources.list().await)
}

/// POST /sources/{source_id} - Report a source state (raw text or {"state": ...})
pub async fn source_state_handler(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    body: Bytes,
) -> Response {
    match parse_source_payload(&body) {
        Some(value) => {
            let source = state.sources.set_state(&source_id, &value).await;
            (StatusCode::OK, Json(source)).into_response()
        }
        None => error_response(StatusCode::BAD_REQUEST, "missing source state"),
    }
}

// =============================================================================
// SSE Events
// =============================================================================

/// GET /events - Server-Sent Events stream
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| {
        match result {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(_) => None,
            },
            Err(_) => None, // Skip lagged messages
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
