//! VU1 server HTTP client
//!
//! Typed facade over the dial server's `/api/v0/dial/*` endpoints.
//! Every request carries the API key as the `key` query parameter; when the
//! server sits behind a supervisor ingress proxy the supervisor token and the
//! ingress path are sent as headers as well.
//!
//! JSON replies carry a `status` field that must be `"ok"`, regardless of the
//! HTTP status code. Failures are classified as:
//! - `Connection`: transport errors and timeouts (transient)
//! - `Auth`: HTTP 401/403 (fix the key)
//! - `Api`: any other server-side failure

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::dials::{DialInfo, DialStatus};

pub const DEFAULT_PORT: u16 = 5340;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALIBRATION_VALUE: i64 = 1024;

const LIST_ENDPOINT: &str = "api/v0/dial/list";
const PROVISION_ENDPOINT: &str = "api/v0/dial/provision";

/// Dial server errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Vu1Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Auth(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Vu1Error {
    /// Worth retrying on the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

pub type Vu1Result<T> = Result<T, Vu1Error>;

/// Supervisor ingress credentials
#[derive(Debug, Clone, PartialEq)]
pub struct IngressAuth {
    pub slug: String,
    pub supervisor_token: String,
}

#[derive(Debug, Clone)]
pub struct Vu1ClientOptions {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub timeout: Duration,
    pub ingress: Option<IngressAuth>,
}

impl Vu1ClientOptions {
    pub fn new(host: impl Into<String>, port: u16, api_key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
            ingress: None,
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            api_key: server.api_key.clone(),
            timeout: Duration::from_secs(server.timeout_secs.max(1)),
            ingress: server.ingress.as_ref().map(|i| IngressAuth {
                slug: i.slug.clone(),
                supervisor_token: i.supervisor_token.clone(),
            }),
        }
    }
}

/// Outcome of a connection test, split into reachability and credential validity
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionCheck {
    pub connected: bool,
    pub authenticated: bool,
    pub dials: Vec<DialInfo>,
    pub error: Option<String>,
}

impl ConnectionCheck {
    fn unreachable(error: String) -> Self {
        Self {
            connected: false,
            authenticated: false,
            dials: Vec::new(),
            error: Some(error),
        }
    }
}

/// Dial server operations used by the coordinator and the binding manager
#[async_trait]
pub trait DialApi: Send + Sync {
    async fn get_dial_list(&self) -> Vu1Result<Vec<DialInfo>>;
    async fn get_dial_status(&self, dial_id: &str) -> Vu1Result<DialStatus>;
    /// Needle position, 0-100
    async fn set_dial_value(&self, dial_id: &str, value: i64) -> Vu1Result<()>;
    /// Backlight, each channel 0-100
    async fn set_dial_backlight(&self, dial_id: &str, red: i64, green: i64, blue: i64)
        -> Vu1Result<()>;
    async fn set_dial_name(&self, dial_id: &str, name: &str) -> Vu1Result<()>;
    async fn set_dial_easing(&self, dial_id: &str, period: u32, step: u32) -> Vu1Result<()>;
    async fn set_backlight_easing(&self, dial_id: &str, period: u32, step: u32)
        -> Vu1Result<()>;
    async fn reload_dial(&self, dial_id: &str) -> Vu1Result<()>;
    async fn calibrate_dial(&self, dial_id: &str, value: i64) -> Vu1Result<()>;
    async fn get_dial_image(&self, dial_id: &str) -> Vu1Result<Vec<u8>>;
    async fn set_dial_image(&self, dial_id: &str, image: Vec<u8>) -> Vu1Result<()>;
    async fn provision_new_dials(&self) -> Vu1Result<Value>;
}

/// Parsed server reply
enum Reply {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Reply {
    fn data(self) -> Value {
        match self {
            Reply::Json(mut body) => body
                .get_mut("data")
                .map(Value::take)
                .unwrap_or(Value::Null),
            Reply::Bytes(_) => Value::Null,
        }
    }
}

/// HTTP client for one VU1 server
pub struct Vu1Client {
    http: Client,
    base_url: Url,
    api_key: String,
    ingress: Option<IngressAuth>,
}

impl Vu1Client {
    pub fn new(options: Vu1ClientOptions) -> Vu1Result<Self> {
        let base_url = server_url(&options.host, options.port)?;
        let http = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Vu1Error::Connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            api_key: options.api_key,
            ingress: options.ingress,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn url(&self, endpoint: &str) -> Vu1Result<Url> {
        self.base_url
            .join(endpoint)
            .map_err(|e| Vu1Error::InvalidArgument(format!("bad endpoint {}: {}", endpoint, e)))
    }

    /// Attach ingress headers and the API key
    fn authorize(&self, mut request: RequestBuilder, endpoint: &str) -> RequestBuilder {
        if let Some(ingress) = &self.ingress {
            request = request
                .bearer_auth(&ingress.supervisor_token)
                .header("X-Ingress-Path", format!("/{}", endpoint));
        }
        if !self.api_key.is_empty() {
            request = request.query(&[("key", self.api_key.as_str())]);
        }
        request
    }

    async fn get(&self, endpoint: &str, params: &[(&str, String)]) -> Vu1Result<Reply> {
        let url = self.url(endpoint)?;
        debug!(endpoint, "VU1 request");
        let request = self.authorize(self.http.get(url).query(params), endpoint);
        self.send(request, endpoint).await
    }

    async fn send(&self, request: RequestBuilder, endpoint: &str) -> Vu1Result<Reply> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(endpoint, status = status.as_u16(), "VU1 response");

        match status {
            StatusCode::UNAUTHORIZED => {
                return Err(Vu1Error::Auth(
                    "authentication failed: invalid API key".to_string(),
                ))
            }
            StatusCode::FORBIDDEN => {
                return Err(Vu1Error::Auth("access forbidden: invalid API key".to_string()))
            }
            s if s.is_client_error() || s.is_server_error() => {
                if let Ok(body) = response.text().await {
                    debug!(endpoint, body = %truncate(&body, 200), "VU1 error response");
                }
                return Err(Vu1Error::Api(format!("HTTP error {}", s.as_u16())));
            }
            _ => {}
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        let body = response.bytes().await.map_err(transport_error)?;

        if !is_json {
            return Ok(Reply::Bytes(body.to_vec()));
        }

        let json: Value = serde_json::from_slice(&body)
            .map_err(|e| Vu1Error::Api(format!("invalid JSON response: {}", e)))?;
        check_status(&json)?;
        Ok(Reply::Json(json))
    }

    /// One round-trip to the dial list, classified for setup diagnostics
    pub async fn test_connection(&self) -> ConnectionCheck {
        debug!("Testing connection to {}", self.base_url());

        if self.has_api_key() {
            return match self.get_dial_list().await {
                Ok(dials) => ConnectionCheck {
                    connected: true,
                    authenticated: true,
                    dials,
                    error: None,
                },
                Err(Vu1Error::Connection(e)) => {
                    ConnectionCheck::unreachable(format!("Connection failed: {}", e))
                }
                Err(e) => {
                    debug!("Server reachable but API key rejected: {}", e);
                    ConnectionCheck {
                        connected: true,
                        authenticated: false,
                        dials: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
        }

        // Without a key only reachability can be tested
        let url = match self.url(LIST_ENDPOINT) {
            Ok(url) => url,
            Err(e) => return ConnectionCheck::unreachable(e.to_string()),
        };
        let request = self.authorize(self.http.get(url), LIST_ENDPOINT);
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if is_vu1_listening(status) {
                    debug!("Server is reachable (HTTP {})", status.as_u16());
                    ConnectionCheck {
                        connected: true,
                        authenticated: false,
                        dials: Vec::new(),
                        error: (status != StatusCode::OK)
                            .then(|| "No API key provided".to_string()),
                    }
                } else {
                    ConnectionCheck::unreachable(format!(
                        "Server returned HTTP {}",
                        status.as_u16()
                    ))
                }
            }
            Err(e) => ConnectionCheck::unreachable(format!("Connection failed: {}", e)),
        }
    }

    pub async fn get_easing_options(&self, dial_id: &str) -> Vu1Result<Value> {
        require_dial_id(dial_id)?;
        Ok(self.get(&dial_endpoint(dial_id, "easing/get"), &[]).await?.data())
    }
}

#[async_trait]
impl DialApi for Vu1Client {
    async fn get_dial_list(&self) -> Vu1Result<Vec<DialInfo>> {
        let data = self.get(LIST_ENDPOINT, &[]).await?.data();
        let Value::Array(entries) = data else {
            return Err(Vu1Error::Api("invalid dial list format".to_string()));
        };

        Ok(entries
            .iter()
            .filter_map(|entry| {
                let info = DialInfo::from_value(entry);
                if info.is_none() {
                    warn!("Invalid dial data: {}", entry);
                }
                info
            })
            .collect())
    }

    async fn get_dial_status(&self, dial_id: &str) -> Vu1Result<DialStatus> {
        require_dial_id(dial_id)?;
        let data = self.get(&dial_endpoint(dial_id, "status"), &[]).await?.data();
        Ok(DialStatus::from_value(data))
    }

    async fn set_dial_value(&self, dial_id: &str, value: i64) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        let value = require_percent("value", value)?;
        self.get(&dial_endpoint(dial_id, "set"), &[("value", value.to_string())])
            .await?;
        Ok(())
    }

    async fn set_dial_backlight(
        &self,
        dial_id: &str,
        red: i64,
        green: i64,
        blue: i64,
    ) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        let red = require_percent("red", red)?;
        let green = require_percent("green", green)?;
        let blue = require_percent("blue", blue)?;
        self.get(
            &dial_endpoint(dial_id, "backlight"),
            &[
                ("red", red.to_string()),
                ("green", green.to_string()),
                ("blue", blue.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn set_dial_name(&self, dial_id: &str, name: &str) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        if name.trim().is_empty() {
            return Err(Vu1Error::InvalidArgument(
                "name must be a non-empty string".to_string(),
            ));
        }
        self.get(&dial_endpoint(dial_id, "name"), &[("name", name.to_string())])
            .await?;
        Ok(())
    }

    async fn set_dial_easing(&self, dial_id: &str, period: u32, step: u32) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        require_easing(period, step)?;
        self.get(
            &dial_endpoint(dial_id, "easing/dial"),
            &[("period", period.to_string()), ("step", step.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn set_backlight_easing(&self, dial_id: &str, period: u32, step: u32) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        require_easing(period, step)?;
        self.get(
            &dial_endpoint(dial_id, "easing/backlight"),
            &[("period", period.to_string()), ("step", step.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn reload_dial(&self, dial_id: &str) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        self.get(&dial_endpoint(dial_id, "reload"), &[]).await?;
        Ok(())
    }

    async fn calibrate_dial(&self, dial_id: &str, value: i64) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        self.get(
            &dial_endpoint(dial_id, "calibrate"),
            &[("value", value.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn get_dial_image(&self, dial_id: &str) -> Vu1Result<Vec<u8>> {
        require_dial_id(dial_id)?;
        match self.get(&dial_endpoint(dial_id, "image/get"), &[]).await? {
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Json(_) => Err(Vu1Error::Api(
                "expected image data, got JSON".to_string(),
            )),
        }
    }

    async fn set_dial_image(&self, dial_id: &str, image: Vec<u8>) -> Vu1Result<()> {
        require_dial_id(dial_id)?;
        if image.is_empty() {
            return Err(Vu1Error::InvalidArgument("image data is empty".to_string()));
        }

        let endpoint = dial_endpoint(dial_id, "image/set");
        let size = image.len();
        let part = Part::bytes(image)
            .file_name("background.png")
            .mime_str("image/png")
            .map_err(|e| Vu1Error::InvalidArgument(e.to_string()))?;
        let form = Form::new().part("imgfile", part);

        debug!("Uploading image for dial {} ({} bytes)", dial_id, size);
        let request = self.authorize(self.http.post(self.url(&endpoint)?).multipart(form), &endpoint);
        self.send(request, &endpoint).await?;
        tracing::info!("Uploaded image for dial {}", dial_id);
        Ok(())
    }

    async fn provision_new_dials(&self) -> Vu1Result<Value> {
        Ok(self.get(PROVISION_ENDPOINT, &[]).await?.data())
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Whether a dial server answers on host:port.
///
/// 401/403 count as present: the server is up, it just wants a key.
pub async fn probe_server(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(base) = server_url(host, port) else {
        return false;
    };
    let Ok(url) = base.join(LIST_ENDPOINT) else {
        return false;
    };
    let Ok(http) = Client::builder().timeout(timeout).build() else {
        return false;
    };
    match http.get(url).send().await {
        Ok(response) => is_vu1_listening(response.status()),
        Err(e) => {
            debug!("No VU1 server at {}:{}: {}", host, port, e);
            false
        }
    }
}

/// Find a dial server: the given address first, then localhost on the default port
pub async fn discover_server(host: &str, port: u16) -> Option<(String, u16)> {
    let mut candidates = vec![(host.to_string(), port)];
    if (host, port) != ("localhost", DEFAULT_PORT) {
        candidates.push(("localhost".to_string(), DEFAULT_PORT));
    }

    for (candidate_host, candidate_port) in candidates {
        if probe_server(&candidate_host, candidate_port, DEFAULT_TIMEOUT).await {
            tracing::info!(
                "VU1 server discovered at {}:{}",
                candidate_host,
                candidate_port
            );
            return Some((candidate_host, candidate_port));
        }
    }
    None
}

// =============================================================================
// Helpers
// =============================================================================

fn server_url(host: &str, port: u16) -> Vu1Result<Url> {
    Url::parse(&format!("http://{}:{}/", host, port)).map_err(|e| {
        Vu1Error::InvalidArgument(format!("invalid server address {}:{}: {}", host, port, e))
    })
}

fn dial_endpoint(dial_id: &str, action: &str) -> String {
    format!("api/v0/dial/{}/{}", urlencoding::encode(dial_id), action)
}

fn is_vu1_listening(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    )
}

fn transport_error(e: reqwest::Error) -> Vu1Error {
    if e.is_timeout() {
        Vu1Error::Connection(format!("request timed out: {}", e))
    } else {
        Vu1Error::Connection(e.to_string())
    }
}

fn check_status(body: &Value) -> Vu1Result<()> {
    if body.get("status").and_then(|s| s.as_str()) == Some("ok") {
        return Ok(());
    }
    let message = body
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown error");
    Err(Vu1Error::Api(message.to_string()))
}

fn require_dial_id(dial_id: &str) -> Vu1Result<()> {
    if dial_id.trim().is_empty() {
        return Err(Vu1Error::InvalidArgument(
            "dial_id must be a non-empty string".to_string(),
        ));
    }
    Ok(())
}

fn require_percent(field: &str, value: i64) -> Vu1Result<u8> {
    if !(0..=100).contains(&value) {
        return Err(Vu1Error::InvalidArgument(format!(
            "{} must be between 0 and 100, got {}",
            field, value
        )));
    }
    Ok(value as u8)
}

fn require_easing(period: u32, step: u32) -> Vu1Result<()> {
    if period == 0 {
        return Err(Vu1Error::InvalidArgument("period must be positive".to_string()));
    }
    if !(1..=100).contains(&step) {
        return Err(Vu1Error::InvalidArgument(format!(
            "step must be between 1 and 100, got {}",
            step
        )));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}
