//! Local device registry
//!
//! The local side of the name sync. Each dial gets a device entry holding the
//! integration-assigned name and, optionally, a name the user picked. Changes
//! are broadcast so the coordinator can push local renames to the server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Device entry for one dial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub dial_id: String,
    /// Name assigned by the integration (mirrors the server name)
    pub name: String,
    /// Name set by the user locally; wins over `name` and is never overwritten by sync
    pub name_by_user: Option<String>,
}

impl DeviceEntry {
    pub fn effective_name(&self) -> &str {
        self.name_by_user.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// The effective name of a device changed
    NameChanged { dial_id: String, name: String },
}

/// Device registry collaborator
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get(&self, dial_id: &str) -> Option<DeviceEntry>;

    /// Register a device if missing; returns the (possibly pre-existing) entry
    async fn ensure_device(&self, dial_id: &str, name: &str) -> DeviceEntry;

    /// Set the integration-assigned name
    async fn update_name(&self, dial_id: &str, name: &str) -> Option<DeviceEntry>;

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// In-memory device registry
pub struct MemoryDeviceRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for MemoryDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeviceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub async fn list(&self) -> Vec<DeviceEntry> {
        let devices = self.devices.read().await;
        let mut list: Vec<_> = devices.values().cloned().collect();
        list.sort_by(|a, b| a.dial_id.cmp(&b.dial_id));
        list
    }

    /// Rename from the user's side. `None` or blank clears the override.
    pub async fn rename_by_user(&self, dial_id: &str, name: Option<&str>) -> Option<DeviceEntry> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        let (entry, changed) = {
            let mut devices = self.devices.write().await;
            let device = devices.get_mut(dial_id)?;
            let before = device.effective_name().to_string();
            device.name_by_user = name.map(str::to_string);
            let changed = device.effective_name() != before;
            (device.clone(), changed)
        };
        if changed {
            self.emit_name(&entry);
        }
        Some(entry)
    }

    fn emit_name(&self, entry: &DeviceEntry) {
        let _ = self.events.send(RegistryEvent::NameChanged {
            dial_id: entry.dial_id.clone(),
            name: entry.effective_name().to_string(),
        });
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn get(&self, dial_id: &str) -> Option<DeviceEntry> {
        self.devices.read().await.get(dial_id).cloned()
    }

    async fn ensure_device(&self, dial_id: &str, name: &str) -> DeviceEntry {
        let mut devices = self.devices.write().await;
        devices
            .entry(dial_id.to_string())
            .or_insert_with(|| {
                tracing::info!("Registered dial device {} ({})", dial_id, name);
                DeviceEntry {
                    dial_id: dial_id.to_string(),
                    name: if name.is_empty() {
                        format!("VU1 Dial {}", dial_id)
                    } else {
                        name.to_string()
                    },
                    name_by_user: None,
                }
            })
            .clone()
    }

    async fn update_name(&self, dial_id: &str, name: &str) -> Option<DeviceEntry> {
        let (entry, changed) = {
            let mut devices = self.devices.write().await;
            let device = devices.get_mut(dial_id)?;
            let before = device.effective_name().to_string();
            device.name = name.to_string();
            let changed = device.effective_name() != before;
            (device.clone(), changed)
        };
        if changed {
            self.emit_name(&entry);
        }
        Some(entry)
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_device_keeps_existing_entry() {
        let registry = MemoryDeviceRegistry::new();
        let first = registry.ensure_device("D1", "CPU").await;
        let second = registry.ensure_device("D1", "Other").await;
        assert_eq!(first, second);
        assert_eq!(second.name, "CPU");
    }

    #[tokio::test]
    async fn blank_server_name_gets_placeholder() {
        let registry = MemoryDeviceRegistry::new();
        let entry = registry.ensure_device("D9", "").await;
        assert_eq!(entry.name, "VU1 Dial D9");
    }

    #[tokio::test]
    async fn update_name_emits_only_on_change() {
        let registry = MemoryDeviceRegistry::new();
        registry.ensure_device("D1", "CPU").await;
        let mut rx = registry.subscribe();

        registry.update_name("D1", "CPU").await;
        registry.update_name("D1", "GPU").await;

        assert_eq!(
            rx.recv().await.unwrap(),
            RegistryEvent::NameChanged {
                dial_id: "D1".to_string(),
                name: "GPU".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_name_overrides_and_masks_integration_name() {
        let registry = MemoryDeviceRegistry::new();
        registry.ensure_device("D1", "CPU").await;
        let mut rx = registry.subscribe();

        let entry = registry.rename_by_user("D1", Some("Load")).await.unwrap();
        assert_eq!(entry.effective_name(), "Load");
        assert!(matches!(rx.recv().await.unwrap(), RegistryEvent::NameChanged { name, .. } if name == "Load"));

        // Integration rename is stored but hidden behind the user's choice
        registry.update_name("D1", "GPU").await;
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.get("D1").await.unwrap().name, "GPU");
    }

    #[tokio::test]
    async fn unknown_device_is_not_created_by_updates() {
        let registry = MemoryDeviceRegistry::new();
        assert!(registry.update_name("nope", "x").await.is_none());
        assert!(registry.rename_by_user("nope", Some("x")).await.is_none());
        assert!(registry.list().await.is_empty());
    }
}
