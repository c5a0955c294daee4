//! Dial configuration store - per-dial local settings
//!
//! Each dial has:
//! - Bound source (numeric source that drives the needle in automatic mode)
//! - Value range mapped onto the 0-100 needle scale
//! - Backlight color
//! - Update mode (manual / automatic)
//! - Dial and backlight easing
//!
//! Updates merge onto the stored config, are sanitized field by field, persisted
//! as one document, then fanned out to per-dial listeners.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::{BehaviorPreset, EasingSettings, DEFAULT_EASING_PERIOD, DEFAULT_EASING_STEP};
use crate::bus::{BusEvent, SharedBus};

const DOCUMENT_VERSION: u64 = 1;
const CONFIG_FILE_NAME: &str = "dial_configs.json";

/// How the needle position is driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    #[default]
    Manual,
    Automatic,
}

impl UpdateMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Some(Self::Manual),
            "automatic" => Some(Self::Automatic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }
}

/// Dial configuration (always fully populated)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialConfig {
    pub bound_source: Option<String>,
    pub value_min: f64,
    pub value_max: f64,
    /// RGB, each 0-100
    pub backlight_color: [u8; 3],
    pub update_mode: UpdateMode,
    pub dial_easing_period: u32,
    pub dial_easing_step: u32,
    pub backlight_easing_period: u32,
    pub backlight_easing_step: u32,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            bound_source: None,
            value_min: 0.0,
            value_max: 100.0,
            backlight_color: [100, 100, 100],
            update_mode: UpdateMode::Manual,
            dial_easing_period: DEFAULT_EASING_PERIOD,
            dial_easing_step: DEFAULT_EASING_STEP,
            backlight_easing_period: DEFAULT_EASING_PERIOD,
            backlight_easing_step: DEFAULT_EASING_STEP,
        }
    }
}

impl DialConfig {
    /// Source driving this dial, only when automatic mode is on
    pub fn automatic_source(&self) -> Option<&str> {
        match self.update_mode {
            UpdateMode::Automatic => self.bound_source.as_deref(),
            UpdateMode::Manual => None,
        }
    }

    pub fn easing(&self) -> EasingSettings {
        EasingSettings {
            dial_period: self.dial_easing_period,
            dial_step: self.dial_easing_step,
            backlight_period: self.backlight_easing_period,
            backlight_step: self.backlight_easing_step,
        }
    }

    pub fn behavior_preset(&self) -> BehaviorPreset {
        BehaviorPreset::matching(&self.easing())
    }

    /// Short hash of the config, so pollers can detect changes cheaply
    pub fn config_sha(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(json!(self).to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..4])
    }

    /// Apply a partial update. Every field is validated on its own; a missing
    /// or invalid field keeps the current value.
    pub fn merged(&self, update: &DialConfigUpdate) -> DialConfig {
        let mut next = self.clone();

        if let Some(source) = &update.bound_source {
            next.bound_source = source
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }
        if let Some(min) = update.value_min.filter(|v| v.is_finite()) {
            next.value_min = min;
        }
        if let Some(max) = update.value_max.filter(|v| v.is_finite()) {
            next.value_max = max;
        }
        if next.value_min > next.value_max {
            std::mem::swap(&mut next.value_min, &mut next.value_max);
        }
        if let Some(rgb) = update.backlight_color {
            next.backlight_color = rgb.map(|c| c.clamp(0, 100) as u8);
        }
        if let Some(mode) = update.update_mode {
            next.update_mode = mode;
        }

        let (pmin, pmax) = EasingSettings::PERIOD_RANGE;
        let (smin, smax) = EasingSettings::STEP_RANGE;
        let period = |v: i64| v.clamp(pmin as i64, pmax as i64) as u32;
        let step = |v: i64| v.clamp(smin as i64, smax as i64) as u32;
        if let Some(v) = update.dial_easing_period {
            next.dial_easing_period = period(v);
        }
        if let Some(v) = update.dial_easing_step {
            next.dial_easing_step = step(v);
        }
        if let Some(v) = update.backlight_easing_period {
            next.backlight_easing_period = period(v);
        }
        if let Some(v) = update.backlight_easing_step {
            next.backlight_easing_step = step(v);
        }

        next
    }
}

/// Partial config update.
///
/// `bound_source: Some(None)` clears the source. Deserialization is lenient:
/// a field with the wrong shape is dropped instead of failing the whole update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DialConfigUpdate {
    pub bound_source: Option<Option<String>>,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    pub backlight_color: Option<[i64; 3]>,
    pub update_mode: Option<UpdateMode>,
    pub dial_easing_period: Option<i64>,
    pub dial_easing_step: Option<i64>,
    pub backlight_easing_period: Option<i64>,
    pub backlight_easing_step: Option<i64>,
}

impl DialConfigUpdate {
    pub fn from_json(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        // Older documents used "bound_entity"
        let source = obj.get("bound_source").or_else(|| obj.get("bound_entity"));
        let bound_source = match source {
            None => None,
            Some(Value::Null) => Some(None),
            Some(Value::String(s)) => Some(Some(s.clone())),
            Some(_) => None,
        };

        Self {
            bound_source,
            value_min: obj.get("value_min").and_then(lenient_f64),
            value_max: obj.get("value_max").and_then(lenient_f64),
            backlight_color: obj.get("backlight_color").and_then(lenient_rgb),
            update_mode: obj
                .get("update_mode")
                .and_then(|v| v.as_str())
                .and_then(UpdateMode::parse),
            dial_easing_period: obj.get("dial_easing_period").and_then(lenient_i64),
            dial_easing_step: obj.get("dial_easing_step").and_then(lenient_i64),
            backlight_easing_period: obj.get("backlight_easing_period").and_then(lenient_i64),
            backlight_easing_step: obj.get("backlight_easing_step").and_then(lenient_i64),
        }
    }

    /// Update carrying only the four easing values
    pub fn with_easing(easing: EasingSettings) -> Self {
        Self {
            dial_easing_period: Some(easing.dial_period as i64),
            dial_easing_step: Some(easing.dial_step as i64),
            backlight_easing_period: Some(easing.backlight_period as i64),
            backlight_easing_step: Some(easing.backlight_step as i64),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl<'de> Deserialize<'de> for DialConfigUpdate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_json(&value))
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_rgb(value: &Value) -> Option<[i64; 3]> {
    let items = value.as_array()?;
    if items.len() != 3 {
        return None;
    }
    let mut rgb = [0i64; 3];
    for (slot, item) in rgb.iter_mut().zip(items) {
        *slot = lenient_i64(item)?;
    }
    Some(rgb)
}

// =============================================================================
// Persistence
// =============================================================================

/// Whole-document persistent storage for the config blob
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load the stored document, None if nothing was saved yet
    async fn load(&self) -> Result<Option<Value>>;

    /// Replace the stored document
    async fn save(&self, document: &Value) -> Result<()>;
}

/// Blob store backed by a JSON file in the data directory
pub struct JsonFileBlobStore {
    path: PathBuf,
}

impl JsonFileBlobStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location: `<data_dir>/dial_configs.json`
    pub fn in_data_dir(data_dir: PathBuf) -> Self {
        Self::new(data_dir.join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl BlobStore for JsonFileBlobStore {
    async fn load(&self) -> Result<Option<Value>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let document = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(document))
    }

    async fn save(&self, document: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(document)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

/// In-memory blob store (tests, ephemeral runs)
#[derive(Default)]
pub struct MemoryBlobStore {
    document: Mutex<Option<Value>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: Value) -> Self {
        Self {
            document: Mutex::new(Some(document)),
            ..Default::default()
        }
    }

    pub async fn document(&self) -> Option<Value> {
        self.document.lock().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self) -> Result<Option<Value>> {
        Ok(self.document.lock().await.clone())
    }

    async fn save(&self, document: &Value) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("blob store unavailable");
        }
        *self.document.lock().await = Some(document.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Listeners
// =============================================================================

/// Receives configuration changes for the dials it registered on
#[async_trait]
pub trait ConfigListener: Send + Sync {
    async fn on_config_changed(&self, dial_id: &str, config: &DialConfig) -> Result<()>;
}

/// Handle returned by `add_listener`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerMap = HashMap<String, Vec<(ListenerId, Arc<dyn ConfigListener>)>>;

// =============================================================================
// Store
// =============================================================================

/// Dial configuration store
#[derive(Clone)]
pub struct DialConfigStore {
    configs: Arc<RwLock<HashMap<String, DialConfig>>>,
    listeners: Arc<RwLock<ListenerMap>>,
    next_listener_id: Arc<AtomicU64>,
    persist: Arc<Mutex<()>>,
    blob: Arc<dyn BlobStore>,
    bus: SharedBus,
}

impl DialConfigStore {
    pub fn new(blob: Arc<dyn BlobStore>, bus: SharedBus) -> Self {
        Self {
            configs: Arc::new(RwLock::new(HashMap::new())),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener_id: Arc::new(AtomicU64::new(1)),
            persist: Arc::new(Mutex::new(())),
            blob,
            bus,
        }
    }

    /// Load persisted configs. A missing or unreadable document starts empty.
    pub async fn load(&self) {
        let document = match self.blob.load().await {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::debug!("No stored dial configs");
                return;
            }
            Err(e) => {
                tracing::warn!("Failed to load dial configs, starting empty: {:#}", e);
                return;
            }
        };

        let Some(entries) = document.get("dial_configs").and_then(|v| v.as_object()) else {
            tracing::warn!("Stored dial config document has no dial_configs map, ignoring");
            return;
        };

        // Stored entries go through the same sanitizer as live updates
        let loaded: HashMap<String, DialConfig> = entries
            .iter()
            .map(|(dial_id, raw)| {
                let update = DialConfigUpdate::from_json(raw);
                (dial_id.clone(), DialConfig::default().merged(&update))
            })
            .collect();

        let count = loaded.len();
        *self.configs.write().await = loaded;
        tracing::info!("Loaded {} dial config(s)", count);
    }

    /// Config for a dial, defaults if none stored
    pub async fn get(&self, dial_id: &str) -> DialConfig {
        let configs = self.configs.read().await;
        configs.get(dial_id).cloned().unwrap_or_default()
    }

    /// All stored configs
    pub async fn all(&self) -> HashMap<String, DialConfig> {
        self.configs.read().await.clone()
    }

    /// Merge a partial update onto the stored config, persist, notify
    pub async fn update(&self, dial_id: &str, update: DialConfigUpdate) -> DialConfig {
        let config = {
            let mut configs = self.configs.write().await;
            let current = configs.get(dial_id).cloned().unwrap_or_default();
            let next = current.merged(&update);
            configs.insert(dial_id.to_string(), next.clone());
            next
        };

        if let Err(e) = self.save().await {
            tracing::error!("Failed to persist dial configs: {:#}", e);
        }

        let config_sha = config.config_sha();
        tracing::info!("Updated dial config: {} (sha: {})", dial_id, config_sha);
        self.bus.publish(BusEvent::DialConfigChanged {
            dial_id: dial_id.to_string(),
            config_sha,
        });

        self.notify_listeners(dial_id, &config).await;
        config
    }

    async fn save(&self) -> Result<()> {
        // Serialize saves so documents land in snapshot order
        let persist_guard = self.persist.lock().await;
        let document = {
            let configs = self.configs.read().await;
            json!({
                "version": DOCUMENT_VERSION,
                "saved_at": Utc::now(),
                "dial_configs": &*configs,
            })
        };
        let result = self.blob.save(&document).await;
        drop(persist_guard);
        result
    }

    pub async fn add_listener(
        &self,
        dial_id: &str,
        listener: Arc<dyn ConfigListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(dial_id.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub async fn remove_listener(&self, dial_id: &str, id: ListenerId) {
        let mut listeners = self.listeners.write().await;
        if let Some(entries) = listeners.get_mut(dial_id) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                listeners.remove(dial_id);
            }
        }
    }

    /// Notify in registration order; one failing listener does not stop the rest
    async fn notify_listeners(&self, dial_id: &str, config: &DialConfig) {
        let targets: Vec<Arc<dyn ConfigListener>> = {
            let listeners = self.listeners.read().await;
            listeners
                .get(dial_id)
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        for listener in targets {
            if let Err(e) = listener.on_config_changed(dial_id, config).await {
                tracing::error!("Error notifying config listener for {}: {:#}", dial_id, e);
            }
        }
    }
}
