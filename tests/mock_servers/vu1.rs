//! Mock VU1 dial server for testing
//!
//! Simulates the `/api/v0/dial/...` REST interface, including API key checks,
//! the `{"status": "ok", "data": ...}` envelope and the raw image endpoint.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nmock";

/// Mock dial state
#[derive(Debug, Clone)]
pub struct MockDial {
    pub uid: String,
    pub name: String,
    pub value: u8,
    pub backlight: [u8; 3],
    pub easing: [u32; 4],
}

impl MockDial {
    pub fn new(uid: &str, name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            value: 0,
            backlight: [0, 0, 0],
            easing: [50, 5, 50, 5],
        }
    }

    fn list_entry(&self) -> Value {
        json!({
            "uid": self.uid,
            "dial_name": self.name,
            "value": self.value,
            "backlight": {
                "red": self.backlight[0],
                "green": self.backlight[1],
                "blue": self.backlight[2],
            },
            "image_file": format!("img_{}.png", self.uid),
        })
    }

    fn status(&self) -> Value {
        json!({
            "uid": self.uid,
            "dial_name": self.name,
            "value": self.value,
            "backlight": {
                "red": self.backlight[0],
                "green": self.backlight[1],
                "blue": self.backlight[2],
            },
            "easing": {
                "dial_period": self.easing[0],
                "dial_step": self.easing[1],
                "backlight_period": self.easing[2],
                "backlight_step": self.easing[3],
            },
            "version": { "firmware": "1.0", "hardware": "1.0", "protocol": "V1" },
        })
    }
}

/// One request as seen by the mock
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
    pub ingress_path: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct MockVu1State {
    api_key: Option<String>,
    dials: Vec<MockDial>,
    requests: Vec<RecordedRequest>,
    /// Forced HTTP status for every request
    forced_status: Option<StatusCode>,
    /// Forced `{"status": "fail"}` message for every request
    forced_failure: Option<String>,
}

/// Mock VU1 Server
pub struct MockVu1Server {
    addr: SocketAddr,
    state: Arc<RwLock<MockVu1State>>,
    handle: JoinHandle<()>,
}

type Shared = Arc<RwLock<MockVu1State>>;

impl MockVu1Server {
    /// Start a mock server on a random port. `api_key` None accepts any request.
    pub async fn start(api_key: Option<&str>) -> Self {
        let state = Arc::new(RwLock::new(MockVu1State {
            api_key: api_key.map(str::to_string),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/api/v0/dial/list", get(handle_list))
            .route("/api/v0/dial/provision", get(handle_provision))
            .route("/api/v0/dial/{uid}/{action}", get(handle_dial))
            .route("/api/v0/dial/{uid}/easing/{kind}", get(handle_easing))
            .route(
                "/api/v0/dial/{uid}/image/{op}",
                get(handle_image_get).post(handle_image_set),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn add_dial(&self, uid: &str, name: &str) {
        self.state
            .write()
            .await
            .dials
            .push(MockDial::new(uid, name));
    }

    pub async fn remove_dial(&self, uid: &str) {
        self.state.write().await.dials.retain(|d| d.uid != uid);
    }

    pub async fn rename(&self, uid: &str, name: &str) {
        let mut state = self.state.write().await;
        if let Some(dial) = state.dials.iter_mut().find(|d| d.uid == uid) {
            dial.name = name.to_string();
        }
    }

    pub async fn set_easing(&self, uid: &str, easing: [u32; 4]) {
        let mut state = self.state.write().await;
        if let Some(dial) = state.dials.iter_mut().find(|d| d.uid == uid) {
            dial.easing = easing;
        }
    }

    pub async fn dial(&self, uid: &str) -> Option<MockDial> {
        let state = self.state.read().await;
        state.dials.iter().find(|d| d.uid == uid).cloned()
    }

    pub async fn force_status(&self, status: Option<StatusCode>) {
        self.state.write().await.forced_status = status;
    }

    pub async fn force_failure(&self, message: Option<&str>) {
        self.state.write().await.forced_failure = message.map(str::to_string);
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.read().await.requests.clone()
    }

    /// Requests whose path ends with the given suffix
    pub async fn requests_to(&self, suffix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.path.ends_with(suffix))
            .collect()
    }

    pub async fn stop(self) {
        self.handle.abort();
    }
}

fn ok(data: Value) -> Response {
    Json(json!({ "status": "ok", "message": "", "data": data })).into_response()
}

fn fail(message: &str) -> Response {
    Json(json!({ "status": "fail", "message": message, "data": null })).into_response()
}

/// Record the request and apply key checks and forced failures
async fn admit(
    state: &Shared,
    path: String,
    query: HashMap<String, String>,
    headers: &HeaderMap,
    body: Vec<u8>,
) -> Option<Response> {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mut state = state.write().await;
    state.requests.push(RecordedRequest {
        path,
        authorization: header_str(header::AUTHORIZATION.as_str()),
        ingress_path: header_str("x-ingress-path"),
        content_type: header_str(header::CONTENT_TYPE.as_str()),
        query: query.clone(),
        body,
    });

    if let Some(status) = state.forced_status {
        return Some((status, "forced").into_response());
    }
    if let Some(expected) = &state.api_key {
        if query.get("key") != Some(expected) {
            return Some((StatusCode::UNAUTHORIZED, "bad key").into_response());
        }
    }
    if let Some(message) = &state.forced_failure {
        return Some(fail(message));
    }
    None
}

fn percent(query: &HashMap<String, String>, field: &str) -> Option<u8> {
    query
        .get(field)?
        .parse::<u8>()
        .ok()
        .filter(|v| *v <= 100)
}

async fn handle_list(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let path = "/api/v0/dial/list".to_string();
    if let Some(rejected) = admit(&state, path, query, &headers, Vec::new()).await {
        return rejected;
    }
    let state = state.read().await;
    ok(Value::Array(
        state.dials.iter().map(MockDial::list_entry).collect(),
    ))
}

async fn handle_provision(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let path = "/api/v0/dial/provision".to_string();
    if let Some(rejected) = admit(&state, path, query, &headers, Vec::new()).await {
        return rejected;
    }
    ok(json!({ "provisioned": 0 }))
}

async fn handle_dial(
    State(state): State<Shared>,
    Path((uid, action)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/api/v0/dial/{}/{}", uid, action);
    if let Some(rejected) = admit(&state, path, query.clone(), &headers, Vec::new()).await {
        return rejected;
    }

    let mut state = state.write().await;
    let Some(dial) = state.dials.iter_mut().find(|d| d.uid == uid) else {
        return fail("Unknown dial");
    };

    match action.as_str() {
        "status" => ok(dial.status()),
        "set" => match percent(&query, "value") {
            Some(value) => {
                dial.value = value;
                ok(Value::Null)
            }
            None => fail("Invalid value"),
        },
        "backlight" => {
            match (
                percent(&query, "red"),
                percent(&query, "green"),
                percent(&query, "blue"),
            ) {
                (Some(r), Some(g), Some(b)) => {
                    dial.backlight = [r, g, b];
                    ok(Value::Null)
                }
                _ => fail("Invalid backlight"),
            }
        }
        "name" => match query.get("name") {
            Some(name) if !name.is_empty() => {
                dial.name = name.clone();
                ok(Value::Null)
            }
            _ => fail("Missing name"),
        },
        "reload" | "calibrate" => ok(Value::Null),
        _ => (StatusCode::NOT_FOUND, "unknown action").into_response(),
    }
}

async fn handle_easing(
    State(state): State<Shared>,
    Path((uid, kind)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/api/v0/dial/{}/easing/{}", uid, kind);
    if let Some(rejected) = admit(&state, path, query.clone(), &headers, Vec::new()).await {
        return rejected;
    }

    let mut state = state.write().await;
    let Some(dial) = state.dials.iter_mut().find(|d| d.uid == uid) else {
        return fail("Unknown dial");
    };

    let period = query.get("period").and_then(|v| v.parse::<u32>().ok());
    let step = query.get("step").and_then(|v| v.parse::<u32>().ok());
    match (kind.as_str(), period, step) {
        ("get", _, _) => ok(json!({
            "dial_step": dial.easing[1],
            "dial_period": dial.easing[0],
            "backlight_step": dial.easing[3],
            "backlight_period": dial.easing[2],
        })),
        ("dial", Some(period), Some(step)) => {
            dial.easing[0] = period;
            dial.easing[1] = step;
            ok(Value::Null)
        }
        ("backlight", Some(period), Some(step)) => {
            dial.easing[2] = period;
            dial.easing[3] = step;
            ok(Value::Null)
        }
        _ => fail("Invalid easing"),
    }
}

async fn handle_image_get(
    State(state): State<Shared>,
    Path((uid, op)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/api/v0/dial/{}/image/{}", uid, op);
    if let Some(rejected) = admit(&state, path, query, &headers, Vec::new()).await {
        return rejected;
    }
    if op != "get" {
        return (StatusCode::METHOD_NOT_ALLOWED, "use POST").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        PNG_BYTES.to_vec(),
    )
        .into_response()
}

async fn handle_image_set(
    State(state): State<Shared>,
    Path((uid, op)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/api/v0/dial/{}/image/{}", uid, op);
    if let Some(rejected) = admit(&state, path, query, &headers, body.to_vec()).await {
        return rejected;
    }
    if op != "set" {
        return (StatusCode::METHOD_NOT_ALLOWED, "use GET").into_response();
    }
    ok(Value::Null)
}
