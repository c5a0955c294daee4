//! DialCoordinator - Poll-and-reconcile loop for the VU1 server
//!
//! The coordinator owns the dial snapshot. Every cycle it fetches the dial list,
//! fans out status fetches, then reconciles the server's view with local state:
//! - names flow server -> local registry unless the user renamed the device
//! - local renames flow registry -> server through `set_dial_name`
//! - hardware easing reported by the server overwrites the stored config
//!
//! Locally-originated writes open a short grace window per dial so the next
//! poll does not read our own write back as a remote change.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::vu1::{DialApi, Vu1Error, DEFAULT_CALIBRATION_VALUE};
use crate::binding::{BindingManager, DialDirectory};
use crate::bus::{BusEvent, NameSyncDirection, SharedBus};
use crate::config::SyncConfig;
use crate::dials::{
    BehaviorPreset, Dial, DialConfigStore, DialConfigUpdate, DialInfo, DialSnapshot, DialStatus,
    DialSummary, EasingSettings, UpdateMode,
};
use crate::registry::{DeviceRegistry, RegistryEvent};

/// Errors from operations addressing one dial
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("Unknown dial: {0}")]
    UnknownDial(String),
    #[error(transparent)]
    Server(#[from] Vu1Error),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub update_interval: Duration,
    pub grace_period: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            update_interval: sync.update_interval(),
            grace_period: sync.grace_period(),
        }
    }
}

/// Grace windows for one dial
#[derive(Debug, Default)]
struct SyncState {
    name_grace_until: Option<Instant>,
    behavior_grace_until: Option<Instant>,
}

fn window_open(until: Option<Instant>) -> bool {
    until.is_some_and(|until| Instant::now() < until)
}

#[derive(Default)]
struct CoordinatorState {
    dials: DialSnapshot,
    last_update_success: bool,
    last_error: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    /// Last name seen on either side, used to drop echoes of our own renames
    previous_names: HashMap<String, String>,
    running: bool,
}

/// Coordinator health, as reported by /status and diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub dial_count: usize,
    pub update_interval_secs: u64,
}

pub struct DialCoordinator {
    me: Weak<DialCoordinator>,
    client: Arc<dyn DialApi>,
    configs: DialConfigStore,
    registry: Arc<dyn DeviceRegistry>,
    bindings: BindingManager,
    bus: SharedBus,
    settings: CoordinatorSettings,
    state: RwLock<CoordinatorState>,
    sync: Mutex<HashMap<String, SyncState>>,
    refresh: Notify,
    /// Held for the duration of a cycle so cycles never overlap
    cycle: Mutex<()>,
    shutdown: RwLock<CancellationToken>,
}

impl DialCoordinator {
    /// Build the coordinator and register it as the bindings' dial directory
    pub async fn new(
        client: Arc<dyn DialApi>,
        configs: DialConfigStore,
        registry: Arc<dyn DeviceRegistry>,
        bindings: BindingManager,
        bus: SharedBus,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            client,
            configs,
            registry,
            bindings: bindings.clone(),
            bus,
            settings,
            state: RwLock::new(CoordinatorState::default()),
            sync: Mutex::new(HashMap::new()),
            refresh: Notify::new(),
            cycle: Mutex::new(()),
            shutdown: RwLock::new(CancellationToken::new()),
        });
        let directory: Weak<dyn DialDirectory> = Arc::downgrade(&coordinator) as Weak<dyn DialDirectory>;
        bindings.register_directory(directory).await;
        coordinator
    }

    pub fn bindings(&self) -> &BindingManager {
        &self.bindings
    }

    pub fn configs(&self) -> &DialConfigStore {
        &self.configs
    }

    // =========================================================================
    // Refresh cycle
    // =========================================================================

    /// Ask the poll loop for an early cycle
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Run one poll-and-reconcile cycle
    pub async fn refresh(&self) -> Result<(), Vu1Error> {
        let cycle_guard = self.cycle.lock().await;
        let result = self.run_cycle().await;
        drop(cycle_guard);
        result
    }

    async fn run_cycle(&self) -> Result<(), Vu1Error> {
        let list = match self.client.get_dial_list().await {
            Ok(list) => list,
            Err(e) => {
                self.record_failure(&e).await;
                return Err(e);
            }
        };

        let statuses = self.fetch_statuses(&list).await;
        let snapshot: DialSnapshot = list
            .into_iter()
            .zip(statuses)
            .map(|(info, detailed_status)| {
                (
                    info.uid.clone(),
                    Dial {
                        info,
                        detailed_status,
                    },
                )
            })
            .collect();

        let previous: HashSet<String> = {
            let state = self.state.read().await;
            state.dials.keys().cloned().collect()
        };
        let mut discovered: Vec<String> = snapshot
            .keys()
            .filter(|id| !previous.contains(*id))
            .cloned()
            .collect();
        let mut removed: Vec<String> = previous
            .iter()
            .filter(|id| !snapshot.contains_key(*id))
            .cloned()
            .collect();
        discovered.sort();
        removed.sort();

        for dial in snapshot.values() {
            self.registry
                .ensure_device(dial.uid(), &dial.info.dial_name)
                .await;
        }

        for dial in snapshot.values() {
            if dial.detailed_status.is_empty() {
                continue;
            }
            self.sync_name_from_server(dial.uid(), &dial.info.dial_name)
                .await;
            self.check_server_behavior_change(dial.uid(), &dial.detailed_status)
                .await;
        }

        let summaries = summarize(&snapshot);
        {
            let mut state = self.state.write().await;
            state.dials = snapshot.clone();
            state.last_update_success = true;
            state.last_error = None;
            state.last_updated = Some(Utc::now());
            for dial_id in &removed {
                state.previous_names.remove(dial_id);
            }
        }

        if !discovered.is_empty() {
            info!("Discovered dial(s): {:?}", discovered);
            self.bus.publish(BusEvent::DialsDiscovered {
                dial_ids: discovered,
            });
        }
        if !removed.is_empty() {
            info!("Dial(s) gone from server: {:?}", removed);
            self.bus.publish(BusEvent::DialsRemoved { dial_ids: removed });
        }
        debug!("Dial refresh complete: {} dial(s)", summaries.len());
        self.bus.publish(BusEvent::DialsUpdated { dials: summaries });

        self.bindings.update_bindings(&snapshot).await;
        Ok(())
    }

    /// Fetch every dial's status concurrently. A failed or cancelled fetch
    /// yields an empty status for that dial only.
    async fn fetch_statuses(&self, list: &[DialInfo]) -> Vec<DialStatus> {
        let cancel = self.shutdown.read().await.clone();

        let tasks = list.iter().map(|info| {
            let client = self.client.clone();
            let cancel = cancel.clone();
            let dial_id = info.uid.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Status update cancelled for dial {}", dial_id);
                        DialStatus::default()
                    }
                    result = client.get_dial_status(&dial_id) => match result {
                        Ok(status) => status,
                        Err(e) => {
                            warn!("Failed to get status for dial {}: {}", dial_id, e);
                            DialStatus::default()
                        }
                    },
                }
            })
        });

        join_all(tasks)
            .await
            .into_iter()
            .zip(list)
            .map(|(joined, info)| {
                joined.unwrap_or_else(|e| {
                    error!("Status task for dial {} failed: {}", info.uid, e);
                    DialStatus::default()
                })
            })
            .collect()
    }

    async fn record_failure(&self, e: &Vu1Error) {
        error!("Dial refresh failed: {}", e);
        {
            let mut state = self.state.write().await;
            state.last_update_success = false;
            state.last_error = Some(e.to_string());
        }
        self.bus.publish(BusEvent::DialsUpdateFailed {
            error: e.to_string(),
        });
    }

    // =========================================================================
    // Name sync
    // =========================================================================

    pub async fn mark_name_change(&self, dial_id: &str) {
        let until = Instant::now() + self.settings.grace_period;
        let mut sync = self.sync.lock().await;
        sync.entry(dial_id.to_string()).or_default().name_grace_until = Some(until);
        debug!("Started name change grace period for {}", dial_id);
    }

    async fn clear_name_grace(&self, dial_id: &str) {
        let mut sync = self.sync.lock().await;
        if let Some(entry) = sync.get_mut(dial_id) {
            entry.name_grace_until = None;
        }
    }

    pub async fn name_grace_active(&self, dial_id: &str) -> bool {
        let sync = self.sync.lock().await;
        window_open(sync.get(dial_id).and_then(|s| s.name_grace_until))
    }

    async fn remember_name(&self, dial_id: &str, name: &str) {
        let mut state = self.state.write().await;
        state
            .previous_names
            .insert(dial_id.to_string(), name.to_string());
    }

    async fn sync_name_from_server(&self, dial_id: &str, server_name: &str) {
        if server_name.is_empty() {
            return;
        }
        if self.name_grace_active(dial_id).await {
            debug!("Ignoring server name change for {} during grace period", dial_id);
            return;
        }

        if let Some(device) = self.registry.get(dial_id).await {
            if device.name_by_user.is_none() && device.name != server_name {
                info!(
                    "Server name for {} changed ('{}' -> '{}'), updating device",
                    dial_id, device.name, server_name
                );
                // Recorded first so the registry's change event is recognised as ours
                self.remember_name(dial_id, server_name).await;
                self.registry.update_name(dial_id, server_name).await;
                self.bus.publish(BusEvent::DialNameSynced {
                    dial_id: dial_id.to_string(),
                    name: server_name.to_string(),
                    direction: NameSyncDirection::ServerToLocal,
                });
            }
        }

        self.remember_name(dial_id, server_name).await;
    }

    /// Rename a dial on the server and mirror it locally
    pub async fn set_dial_name(&self, dial_id: &str, name: &str) -> Result<(), DialError> {
        self.mark_name_change(dial_id).await;

        if let Err(e) = self.client.set_dial_name(dial_id, name).await {
            error!("Failed to set dial name for {} on server: {}", dial_id, e);
            self.clear_name_grace(dial_id).await;
            return Err(e.into());
        }

        // The grace window is left to expire on its own
        self.remember_name(dial_id, name).await;
        self.registry.update_name(dial_id, name).await;
        self.bus.publish(BusEvent::DialNameSynced {
            dial_id: dial_id.to_string(),
            name: name.to_string(),
            direction: NameSyncDirection::LocalToServer,
        });
        info!("Synced name '{}' to server for dial {}", name, dial_id);

        self.request_refresh();
        Ok(())
    }

    /// Entry point for registry-side renames
    pub async fn handle_local_name_change(&self, dial_id: &str, name: &str) {
        if self.name_grace_active(dial_id).await {
            debug!("Ignoring local name change for {} during grace period", dial_id);
            return;
        }

        let unchanged = {
            let state = self.state.read().await;
            state.previous_names.get(dial_id).map(String::as_str) == Some(name)
        };
        if unchanged {
            return;
        }

        info!("Device name changed locally for dial {}: '{}'", dial_id, name);
        if let Err(e) = self.set_dial_name(dial_id, name).await {
            error!("Failed to sync device name to server: {}", e);
        }
    }

    // =========================================================================
    // Behavior (easing) sync
    // =========================================================================

    pub async fn mark_behavior_change(&self, dial_id: &str) {
        let until = Instant::now() + self.settings.grace_period;
        let mut sync = self.sync.lock().await;
        sync.entry(dial_id.to_string())
            .or_default()
            .behavior_grace_until = Some(until);
        debug!("Started behavior grace period for {}", dial_id);
    }

    pub async fn behavior_grace_active(&self, dial_id: &str) -> bool {
        let sync = self.sync.lock().await;
        window_open(sync.get(dial_id).and_then(|s| s.behavior_grace_until))
    }

    async fn check_server_behavior_change(&self, dial_id: &str, status: &DialStatus) {
        if self.behavior_grace_active(dial_id).await {
            debug!("Ignoring server behavior change for {} during grace period", dial_id);
            return;
        }
        let Some(server) = status.easing() else {
            return;
        };
        let server = server.sanitized();

        let current = self.configs.get(dial_id).await.easing();
        if current != server {
            info!(
                "Server easing for {} changed ({:?} -> {:?}), updating config",
                dial_id, current, server
            );
            self.configs
                .update(dial_id, DialConfigUpdate::with_easing(server))
                .await;
        }
    }

    /// Write dial and backlight easing to the server and store it
    pub async fn set_dial_easing(
        &self,
        dial_id: &str,
        easing: EasingSettings,
    ) -> Result<EasingSettings, DialError> {
        self.require_dial(dial_id).await?;
        let easing = easing.sanitized();

        self.mark_behavior_change(dial_id).await;
        self.client
            .set_dial_easing(dial_id, easing.dial_period, easing.dial_step)
            .await?;
        if let Err(e) = self
            .client
            .set_backlight_easing(dial_id, easing.backlight_period, easing.backlight_step)
            .await
        {
            // The dial half is already on the server; keep config in step with it
            let partial = EasingSettings {
                dial_period: easing.dial_period,
                dial_step: easing.dial_step,
                ..self.configs.get(dial_id).await.easing()
            };
            self.configs
                .update(dial_id, DialConfigUpdate::with_easing(partial))
                .await;
            error!(
                "Backlight easing write failed for {} after dial easing was applied: {}",
                dial_id, e
            );
            return Err(e.into());
        }

        self.configs
            .update(dial_id, DialConfigUpdate::with_easing(easing))
            .await;
        self.bindings.reconfigure_binding(dial_id).await;
        info!("Applied easing to dial {}: {:?}", dial_id, easing);

        self.request_refresh();
        Ok(easing)
    }

    /// Apply a named easing preset. `custom` leaves everything as is.
    pub async fn apply_behavior_preset(
        &self,
        dial_id: &str,
        preset: BehaviorPreset,
    ) -> Result<Option<EasingSettings>, DialError> {
        let Some(easing) = preset.easing() else {
            debug!("Preset {} has no easing values, nothing to apply", preset);
            return Ok(None);
        };
        let applied = self.set_dial_easing(dial_id, easing).await?;
        info!("Applied {} preset to dial {}", preset, dial_id);
        Ok(Some(applied))
    }

    // =========================================================================
    // Dial actions
    // =========================================================================

    async fn require_dial(&self, dial_id: &str) -> Result<(), DialError> {
        let state = self.state.read().await;
        if state.dials.contains_key(dial_id) {
            Ok(())
        } else {
            Err(DialError::UnknownDial(dial_id.to_string()))
        }
    }

    /// Move the needle by hand. An automatic dial drops back to manual first.
    pub async fn set_dial_value(&self, dial_id: &str, value: i64) -> Result<(), DialError> {
        self.require_dial(dial_id).await?;

        let config = self.configs.get(dial_id).await;
        if config.update_mode == UpdateMode::Automatic {
            info!("Manual value for automatic dial {}, switching to manual", dial_id);
            self.configs
                .update(
                    dial_id,
                    DialConfigUpdate {
                        update_mode: Some(UpdateMode::Manual),
                        ..Default::default()
                    },
                )
                .await;
            self.bindings.reconfigure_binding(dial_id).await;
        }

        self.client.set_dial_value(dial_id, value).await?;
        self.request_refresh();
        Ok(())
    }

    /// Set the backlight and remember it for automatic updates
    pub async fn set_dial_backlight(&self, dial_id: &str, rgb: [i64; 3]) -> Result<(), DialError> {
        self.require_dial(dial_id).await?;
        let [red, green, blue] = rgb;
        self.client
            .set_dial_backlight(dial_id, red, green, blue)
            .await?;

        self.configs
            .update(
                dial_id,
                DialConfigUpdate {
                    backlight_color: Some(rgb),
                    ..Default::default()
                },
            )
            .await;
        self.bindings.reconfigure_binding(dial_id).await;
        self.request_refresh();
        Ok(())
    }

    pub async fn reload_dial(&self, dial_id: &str) -> Result<(), DialError> {
        self.require_dial(dial_id).await?;
        self.client.reload_dial(dial_id).await?;
        info!("Reloaded dial {}", dial_id);
        self.request_refresh();
        Ok(())
    }

    pub async fn calibrate_dial(&self, dial_id: &str, value: Option<i64>) -> Result<(), DialError> {
        self.require_dial(dial_id).await?;
        let value = value.unwrap_or(DEFAULT_CALIBRATION_VALUE);
        self.client.calibrate_dial(dial_id, value).await?;
        info!("Calibrated dial {} (value {})", dial_id, value);
        self.request_refresh();
        Ok(())
    }

    pub async fn get_dial_image(&self, dial_id: &str) -> Result<Vec<u8>, DialError> {
        self.require_dial(dial_id).await?;
        Ok(self.client.get_dial_image(dial_id).await?)
    }

    pub async fn set_dial_image(&self, dial_id: &str, image: Vec<u8>) -> Result<(), DialError> {
        self.require_dial(dial_id).await?;
        let size = image.len();
        self.client.set_dial_image(dial_id, image).await?;
        info!("Uploaded {} byte image to dial {}", size, dial_id);
        self.request_refresh();
        Ok(())
    }

    /// Ask the server to provision newly attached dials
    pub async fn provision_new_dials(&self) -> Result<Value, DialError> {
        let result = self.client.provision_new_dials().await?;
        info!("Provisioned new dials");
        self.request_refresh();
        Ok(result)
    }

    // =========================================================================
    // Snapshot reads
    // =========================================================================

    pub async fn snapshot(&self) -> DialSnapshot {
        self.state.read().await.dials.clone()
    }

    pub async fn get_dial(&self, dial_id: &str) -> Option<Dial> {
        self.state.read().await.dials.get(dial_id).cloned()
    }

    pub async fn summaries(&self) -> Vec<DialSummary> {
        summarize(&self.state.read().await.dials)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = self.state.read().await;
        CoordinatorStatus {
            running: state.running,
            last_update_success: state.last_update_success,
            last_error: state.last_error.clone(),
            last_updated: state.last_updated,
            dial_count: state.dials.len(),
            update_interval_secs: self.settings.update_interval.as_secs(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn start_internal(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        // Fresh token per run; the previous one may be cancelled
        let shutdown = {
            let mut token = self.shutdown.write().await;
            *token = CancellationToken::new();
            token.clone()
        };

        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        tokio::spawn(run_polling_loop(me.clone(), shutdown.clone()));
        tokio::spawn(run_registry_listener(me, shutdown));

        info!(
            "Dial coordinator started (interval {:?}, grace {:?})",
            self.settings.update_interval, self.settings.grace_period
        );
        Ok(())
    }

    async fn stop_internal(&self) {
        self.shutdown.read().await.cancel();
        self.state.write().await.running = false;
        info!("Dial coordinator stopped");
    }
}

crate::impl_startable!(DialCoordinator, "coordinator");

#[async_trait]
impl DialDirectory for DialCoordinator {
    async fn client_for(&self, dial_id: &str) -> Option<Arc<dyn DialApi>> {
        let state = self.state.read().await;
        state
            .dials
            .contains_key(dial_id)
            .then(|| self.client.clone())
    }

    async fn dial(&self, dial_id: &str) -> Option<Dial> {
        self.get_dial(dial_id).await
    }
}

fn summarize(snapshot: &DialSnapshot) -> Vec<DialSummary> {
    let mut summaries: Vec<_> = snapshot.values().map(Dial::summary).collect();
    summaries.sort_by(|a, b| a.dial_id.cmp(&b.dial_id));
    summaries
}

/// Poll on the interval, or early when a refresh is requested
async fn run_polling_loop(coordinator: Arc<DialCoordinator>, shutdown: CancellationToken) {
    let mut poll_timer = interval(coordinator.settings.update_interval);
    poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Dial polling shutting down");
                break;
            }
            _ = poll_timer.tick() => {}
            _ = coordinator.refresh.notified() => {
                // A requested cycle restarts the interval
                poll_timer.reset();
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            // Failures are logged and published inside the cycle
            _ = coordinator.refresh() => {}
        }
    }
}

/// Route registry renames into the coordinator
async fn run_registry_listener(coordinator: Arc<DialCoordinator>, shutdown: CancellationToken) {
    let mut rx = coordinator.registry.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(RegistryEvent::NameChanged { dial_id, name }) => {
                coordinator.handle_local_name_change(&dial_id, &name).await;
            }
            Err(RecvError::Lagged(n)) => warn!("Registry listener lagged by {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Registry listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Startable;
    use crate::bus::create_bus;
    use crate::dials::MemoryBlobStore;
    use crate::registry::MemoryDeviceRegistry;
    use crate::sources::SourceHub;
    use crate::testing::FakeDialServer;
    use tokio::time::sleep;

    const GRACE: Duration = Duration::from_secs(10);

    struct Harness {
        coordinator: Arc<DialCoordinator>,
        server: Arc<FakeDialServer>,
        registry: Arc<MemoryDeviceRegistry>,
        configs: DialConfigStore,
        hub: Arc<SourceHub>,
        bus: SharedBus,
    }

    async fn harness(dials: &[(&str, &str)]) -> Harness {
        let bus = create_bus();
        let server = FakeDialServer::with_dials(dials);
        let registry = Arc::new(MemoryDeviceRegistry::new());
        let configs = DialConfigStore::new(Arc::new(MemoryBlobStore::new()), bus.clone());
        let hub = Arc::new(SourceHub::new());
        let bindings = BindingManager::new(
            configs.clone(),
            hub.clone(),
            Duration::from_secs(5),
            bus.clone(),
        );
        let coordinator = DialCoordinator::new(
            server.clone(),
            configs.clone(),
            registry.clone(),
            bindings,
            bus.clone(),
            CoordinatorSettings {
                update_interval: Duration::from_secs(30),
                grace_period: GRACE,
            },
        )
        .await;
        Harness {
            coordinator,
            server,
            registry,
            configs,
            hub,
            bus,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_registers_and_announces_dials() {
        let h = harness(&[("D1", "CPU"), ("D2", "GPU")]).await;
        let mut rx = h.bus.subscribe();

        h.coordinator.refresh().await.unwrap();

        assert_eq!(h.registry.get("D1").await.unwrap().name, "CPU");
        assert_eq!(h.registry.get("D2").await.unwrap().name, "GPU");

        let mut discovered = None;
        let mut updated = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                BusEvent::DialsDiscovered { dial_ids } => discovered = Some(dial_ids),
                BusEvent::DialsUpdated { dials } => updated = Some(dials),
                _ => {}
            }
        }
        assert_eq!(discovered.unwrap(), vec!["D1", "D2"]);
        assert_eq!(updated.unwrap().len(), 2);
        assert!(h.coordinator.status().await.last_update_success);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_status_does_not_fail_the_cycle() {
        let h = harness(&[("A", "a"), ("B", "b"), ("C", "c")]).await;
        h.server.fail_status("B");

        h.coordinator.refresh().await.unwrap();

        let snapshot = h.coordinator.snapshot().await;
        assert_eq!(snapshot.len(), 3);
        assert!(!snapshot["A"].detailed_status.is_empty());
        assert!(snapshot["B"].detailed_status.is_empty());
        assert!(!snapshot["C"].detailed_status.is_empty());
        assert!(h.coordinator.status().await.last_update_success);
    }

    #[tokio::test(start_paused = true)]
    async fn list_failure_keeps_stale_snapshot() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        let mut rx = h.bus.subscribe();
        h.server
            .fail_list(Some(Vu1Error::Connection("refused".to_string())));
        let err = h.coordinator.refresh().await.unwrap_err();
        assert!(matches!(err, Vu1Error::Connection(_)));

        assert_eq!(h.coordinator.snapshot().await.len(), 1);
        let status = h.coordinator.status().await;
        assert!(!status.last_update_success);
        assert!(status.last_error.unwrap().contains("refused"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::DialsUpdateFailed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn server_rename_reaches_registry_in_one_cycle() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        h.server.rename("D1", "CPU Load");
        h.coordinator.refresh().await.unwrap();

        assert_eq!(h.registry.get("D1").await.unwrap().name, "CPU Load");
        assert!(h.server.calls_starting_with("name").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_named_device_is_not_overwritten() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();
        h.registry.rename_by_user("D1", Some("Mine")).await;
        // Push the user's name through as the listener task would
        h.coordinator.handle_local_name_change("D1", "Mine").await;
        sleep(GRACE + Duration::from_secs(1)).await;

        h.server.rename("D1", "Other");
        h.coordinator.refresh().await.unwrap();

        let device = h.registry.get("D1").await.unwrap();
        assert_eq!(device.effective_name(), "Mine");
        assert_eq!(device.name, "Mine");
    }

    #[tokio::test(start_paused = true)]
    async fn local_rename_writes_server_once_and_is_not_reverted() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        h.coordinator.handle_local_name_change("D1", "Temp").await;
        assert_eq!(h.server.calls_starting_with("name"), vec!["name D1 Temp"]);
        assert!(h.coordinator.name_grace_active("D1").await);

        // Server still reports the old name for one more cycle
        h.server.rename("D1", "CPU");
        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.registry.get("D1").await.unwrap().name, "Temp");

        // Echo of our own rename is ignored
        h.coordinator.handle_local_name_change("D1", "Temp").await;
        assert_eq!(h.server.calls_starting_with("name").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rename_clears_grace() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();
        h.server
            .fail_writes(Some(Vu1Error::Api("nope".to_string())));

        let err = h.coordinator.set_dial_name("D1", "Temp").await.unwrap_err();
        assert!(matches!(err, DialError::Server(Vu1Error::Api(_))));
        assert!(!h.coordinator.name_grace_active("D1").await);
        assert_eq!(h.registry.get("D1").await.unwrap().name, "CPU");
    }

    #[tokio::test(start_paused = true)]
    async fn successful_rename_keeps_grace_until_expiry() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        h.coordinator.set_dial_name("D1", "Temp").await.unwrap();
        assert!(h.coordinator.name_grace_active("D1").await);

        sleep(GRACE + Duration::from_millis(1)).await;
        assert!(!h.coordinator.name_grace_active("D1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn server_easing_overwrites_config() {
        let h = harness(&[("D1", "CPU")]).await;
        let server_easing = EasingSettings {
            dial_period: 80,
            dial_step: 2,
            backlight_period: 40,
            backlight_step: 9,
        };
        h.server.set_easing("D1", server_easing);

        h.coordinator.refresh().await.unwrap();

        assert_eq!(h.configs.get("D1").await.easing(), server_easing);
    }

    #[tokio::test(start_paused = true)]
    async fn local_easing_survives_grace_window() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        let smooth = BehaviorPreset::Smooth.easing().unwrap();
        h.coordinator
            .apply_behavior_preset("D1", BehaviorPreset::Smooth)
            .await
            .unwrap();
        assert_eq!(h.configs.get("D1").await.behavior_preset(), BehaviorPreset::Smooth);

        // Server reports something else while the window is open
        h.server.set_easing("D1", EasingSettings::default());
        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.configs.get("D1").await.easing(), smooth);

        // After expiry the server wins again
        sleep(GRACE + Duration::from_secs(1)).await;
        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.configs.get("D1").await.easing(), EasingSettings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn half_applied_easing_keeps_dial_half_in_config() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();
        h.server
            .fail_call("backlight_easing", Vu1Error::Api("busy".to_string()));

        let wanted = EasingSettings {
            dial_period: 80,
            dial_step: 9,
            backlight_period: 70,
            backlight_step: 4,
        };
        let result = h.coordinator.set_dial_easing("D1", wanted).await;
        assert!(matches!(result, Err(DialError::Server(Vu1Error::Api(_)))));

        let stored = h.configs.get("D1").await.easing();
        assert_eq!(
            stored,
            EasingSettings {
                dial_period: 80,
                dial_step: 9,
                backlight_period: 50,
                backlight_step: 5,
            }
        );
        assert_eq!(h.server.calls_starting_with("dial_easing"), vec!["dial_easing D1 80 9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_preset_is_a_no_op() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();
        let applied = h
            .coordinator
            .apply_behavior_preset("D1", BehaviorPreset::Custom)
            .await
            .unwrap();
        assert!(applied.is_none());
        assert!(h.server.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn actions_on_unknown_dial_are_rejected() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        let err = h.coordinator.set_dial_value("nope", 10).await.unwrap_err();
        assert!(matches!(err, DialError::UnknownDial(id) if id == "nope"));
        assert!(h.coordinator.reload_dial("nope").await.is_err());
        assert!(h.server.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_value_switches_automatic_dial_to_manual() {
        let h = harness(&[("D1", "CPU")]).await;
        h.hub.set_state("temp1", "10").await;
        h.configs
            .update(
                "D1",
                DialConfigUpdate {
                    bound_source: Some(Some("temp1".to_string())),
                    update_mode: Some(UpdateMode::Automatic),
                    ..Default::default()
                },
            )
            .await;
        h.coordinator.refresh().await.unwrap();
        assert_eq!(h.coordinator.bindings().binding_count().await, 1);

        h.coordinator.set_dial_value("D1", 70).await.unwrap();

        assert_eq!(h.configs.get("D1").await.update_mode, UpdateMode::Manual);
        assert_eq!(h.coordinator.bindings().binding_count().await, 0);
        assert!(h.server.calls().contains(&"value D1 70".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn backlight_is_stored_in_config() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();

        h.coordinator
            .set_dial_backlight("D1", [10, 20, 30])
            .await
            .unwrap();

        assert_eq!(h.configs.get("D1").await.backlight_color, [10, 20, 30]);
        assert_eq!(h.server.calls(), vec!["backlight D1 10 20 30"]);
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_defaults_to_1024() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.refresh().await.unwrap();
        h.coordinator.calibrate_dial("D1", None).await.unwrap();
        assert_eq!(h.server.calls(), vec!["calibrate D1 1024"]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_dial_is_announced_and_unbound() {
        let h = harness(&[("D1", "CPU"), ("D2", "GPU")]).await;
        h.coordinator.refresh().await.unwrap();
        let mut rx = h.bus.subscribe();

        h.server.remove_dial("D2");
        h.coordinator.refresh().await.unwrap();

        let removed = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|e| match e {
            BusEvent::DialsRemoved { dial_ids } => Some(dial_ids),
            _ => None,
        });
        assert_eq!(removed.unwrap(), vec!["D2"]);
        assert!(h.coordinator.client_for("D2").await.is_none());
        assert!(h.coordinator.client_for("D1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_rename_is_pushed_by_listener_task() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.start().await.unwrap();
        // First tick fires immediately
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.registry.get("D1").await.unwrap().name, "CPU");

        h.registry.rename_by_user("D1", Some("Desk")).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(h.server.calls_starting_with("name"), vec!["name D1 Desk"]);
        assert_eq!(h.server.name_of("D1").as_deref(), Some("Desk"));

        h.coordinator.stop().await;
        assert!(!h.coordinator.status().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_runs_on_interval() {
        let h = harness(&[("D1", "CPU")]).await;
        h.coordinator.start().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        h.server.rename("D1", "Renamed");
        sleep(Duration::from_secs(31)).await;
        assert_eq!(h.registry.get("D1").await.unwrap().name, "Renamed");

        h.coordinator.stop().await;
    }
}
