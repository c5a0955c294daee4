//! Diagnostics snapshot with secrets redacted

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::binding::BindingSummary;
use crate::config::Config;
use crate::coordinator::{CoordinatorStatus, DialCoordinator};
use crate::dials::DialConfig;

pub const REDACTED: &str = "**REDACTED**";

const SECRET_KEYS: &[&str] = &["api_key", "supervisor_token", "password"];

#[derive(Debug, Clone, Serialize)]
pub struct DialDiagnostics {
    pub name: String,
    pub image_file: String,
    pub detailed_status: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub generated_at: DateTime<Utc>,
    pub version: &'static str,
    pub config: Value,
    pub coordinator: CoordinatorStatus,
    pub dials: BTreeMap<String, DialDiagnostics>,
    pub dial_configs: BTreeMap<String, DialConfig>,
    pub bindings: Vec<BindingSummary>,
}

/// Replace every non-empty secret field, at any depth, with a placeholder
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) {
                    let present = match field {
                        Value::Null => false,
                        Value::String(s) => !s.is_empty(),
                        _ => true,
                    };
                    if present {
                        *field = Value::String(REDACTED.to_string());
                    }
                } else {
                    redact(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Serialized config with secrets redacted
pub fn redacted_config(config: &Config) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    redact(&mut value);
    value
}

pub async fn collect(config: &Config, coordinator: &DialCoordinator) -> Diagnostics {
    let dials = coordinator
        .snapshot()
        .await
        .into_iter()
        .map(|(dial_id, dial)| {
            let entry = DialDiagnostics {
                name: dial.info.dial_name,
                image_file: dial.info.image_file,
                detailed_status: dial.detailed_status.0,
            };
            (dial_id, entry)
        })
        .collect();

    Diagnostics {
        generated_at: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        config: redacted_config(config),
        coordinator: coordinator.status().await,
        dials,
        dial_configs: coordinator.configs().all().await.into_iter().collect(),
        bindings: coordinator.bindings().binding_summaries().await,
    }
}
