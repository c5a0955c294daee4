//! Dial data model
//!
//! Dials are owned by the VU1 server. The bridge caches what the server reports:
//! - `DialInfo`: one entry of the dial list (uid, name, value, backlight, image)
//! - `DialStatus`: the detailed status document (easing, versions, hashes)
//! - `Dial`: both merged, as held in the coordinator snapshot

pub mod store;

pub use store::{
    BlobStore, ConfigListener, DialConfig, DialConfigStore, DialConfigUpdate, JsonFileBlobStore,
    ListenerId, MemoryBlobStore, UpdateMode,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Snapshot of every dial known to the coordinator, keyed by dial uid
pub type DialSnapshot = HashMap<String, Dial>;

pub const DEFAULT_EASING_PERIOD: u32 = 50;
pub const DEFAULT_EASING_STEP: u32 = 5;

/// Backlight color, each channel 0-100
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlight {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// One entry from `/api/v0/dial/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialInfo {
    pub uid: String,
    pub dial_name: String,
    pub value: u8,
    pub backlight: Backlight,
    pub image_file: String,
}

impl DialInfo {
    /// Parse a dial list entry. Entries without a uid are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let uid = obj.get("uid").and_then(|v| v.as_str())?;
        if uid.is_empty() {
            return None;
        }

        let backlight = obj
            .get("backlight")
            .and_then(|v| v.as_object())
            .map(|b| Backlight {
                red: channel(b.get("red")),
                green: channel(b.get("green")),
                blue: channel(b.get("blue")),
            })
            .unwrap_or_default();

        Some(Self {
            uid: uid.to_string(),
            dial_name: obj
                .get("dial_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            value: channel(obj.get("value")),
            backlight,
            image_file: obj
                .get("image_file")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Read a 0-100 channel value, tolerating floats and numeric strings
fn channel(value: Option<&Value>) -> u8 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if raw.is_finite() {
        raw.clamp(0.0, 100.0) as u8
    } else {
        0
    }
}

/// Detailed status document from `/api/v0/dial/{id}/status`.
///
/// Kept as a JSON object because the server adds fields between releases.
/// An empty status marks a dial whose status fetch failed this cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialStatus(pub Map<String, Value>);

impl DialStatus {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Current needle position as reported in the detailed status
    pub fn value(&self) -> Option<f64> {
        self.0.get("value").and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// Easing settings reported by the hardware.
    ///
    /// Returns None when the status or its `easing` block is missing or empty.
    /// Individual values that fail to parse fall back to the defaults.
    pub fn easing(&self) -> Option<EasingSettings> {
        let easing = self.0.get("easing")?.as_object()?;
        if easing.is_empty() {
            return None;
        }
        Some(EasingSettings {
            dial_period: coerce_u32(easing.get("dial_period"), DEFAULT_EASING_PERIOD),
            dial_step: coerce_u32(easing.get("dial_step"), DEFAULT_EASING_STEP),
            backlight_period: coerce_u32(easing.get("backlight_period"), DEFAULT_EASING_PERIOD),
            backlight_step: coerce_u32(easing.get("backlight_step"), DEFAULT_EASING_STEP),
        })
    }

    /// Firmware/hardware/protocol version block, if present
    pub fn version_info(&self) -> Option<&Map<String, Value>> {
        self.0.get("version").and_then(|v| v.as_object())
    }
}

/// Integer coercion for server-reported values.
///
/// Integers pass through, floats truncate, integer strings parse;
/// anything else (null, bool, "5.5", negative) yields the fallback.
fn coerce_u32(value: Option<&Value>, fallback: u32) -> u32 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(fallback)
}

/// Dial and backlight easing (transition smoothing) parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EasingSettings {
    pub dial_period: u32,
    pub dial_step: u32,
    pub backlight_period: u32,
    pub backlight_step: u32,
}

impl Default for EasingSettings {
    fn default() -> Self {
        Self {
            dial_period: DEFAULT_EASING_PERIOD,
            dial_step: DEFAULT_EASING_STEP,
            backlight_period: DEFAULT_EASING_PERIOD,
            backlight_step: DEFAULT_EASING_STEP,
        }
    }
}

impl EasingSettings {
    pub const PERIOD_RANGE: (u32, u32) = (1, 10_000);
    pub const STEP_RANGE: (u32, u32) = (1, 100);

    /// Clamp every value into the range the config store accepts
    pub fn sanitized(self) -> Self {
        let period = |v: u32| v.clamp(Self::PERIOD_RANGE.0, Self::PERIOD_RANGE.1);
        let step = |v: u32| v.clamp(Self::STEP_RANGE.0, Self::STEP_RANGE.1);
        Self {
            dial_period: period(self.dial_period),
            dial_step: step(self.dial_step),
            backlight_period: period(self.backlight_period),
            backlight_step: step(self.backlight_step),
        }
    }
}

/// Behavior presets matching the VU-Server web UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorPreset {
    Responsive,
    Balanced,
    Smooth,
    Custom,
}

impl BehaviorPreset {
    pub const ALL: [BehaviorPreset; 4] = [
        BehaviorPreset::Responsive,
        BehaviorPreset::Balanced,
        BehaviorPreset::Smooth,
        BehaviorPreset::Custom,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Responsive => "responsive",
            Self::Balanced => "balanced",
            Self::Smooth => "smooth",
            Self::Custom => "custom",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Responsive => "Responsive",
            Self::Balanced => "Balanced",
            Self::Smooth => "Smooth",
            Self::Custom => "Custom",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Responsive => "Dial is very responsive but may overshoot on large changes",
            Self::Balanced => "Balance between responsive and smooth dial",
            Self::Smooth => "Dial moves slowly with minimum overshoot",
            Self::Custom => "Manual configuration",
        }
    }

    /// Easing values for the preset. `Custom` has none.
    pub fn easing(&self) -> Option<EasingSettings> {
        let (dial_period, dial_step, backlight_period, backlight_step) = match self {
            Self::Responsive => (50, 20, 50, 20),
            Self::Balanced => (50, 5, 50, 10),
            Self::Smooth => (50, 1, 50, 5),
            Self::Custom => return None,
        };
        Some(EasingSettings {
            dial_period,
            dial_step,
            backlight_period,
            backlight_step,
        })
    }

    /// Which preset an easing configuration corresponds to
    pub fn matching(easing: &EasingSettings) -> Self {
        Self::ALL
            .into_iter()
            .find(|preset| preset.easing().as_ref() == Some(easing))
            .unwrap_or(Self::Custom)
    }
}

impl fmt::Display for BehaviorPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for BehaviorPreset {
    type Err = String;

    /// Accepts the key ("smooth") or the display name ("Smooth")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.key().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown behavior preset: {}", s))
    }
}

/// A dial as cached by the coordinator: list entry merged with detailed status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dial {
    #[serde(flatten)]
    pub info: DialInfo,
    pub detailed_status: DialStatus,
}

impl Dial {
    pub fn uid(&self) -> &str {
        &self.info.uid
    }

    pub fn summary(&self) -> DialSummary {
        let value = self
            .detailed_status
            .value()
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 100.0) as u8)
            .unwrap_or(self.info.value);
        DialSummary {
            dial_id: self.info.uid.clone(),
            name: self.info.dial_name.clone(),
            value,
            backlight: self.info.backlight,
            status_available: !self.detailed_status.is_empty(),
        }
    }
}

/// Compact per-dial view published to display consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialSummary {
    pub dial_id: String,
    pub name: String,
    pub value: u8,
    pub backlight: Backlight,
    pub status_available: bool,
}
