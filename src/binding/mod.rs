//! Source-to-dial bindings
//!
//! A binding drives one dial from one numeric source while the dial is in
//! automatic mode. Source events are fanned out by one forwarding task per
//! watched source (shared by every dial bound to it) into per-dial
//! debouncers, so a noisy source produces at most one write per cooldown.

pub mod debounce;
pub mod mapping;

pub use debounce::{DebounceState, Debouncer};
pub use mapping::{map_value, parse_source_value};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::vu1::DialApi;
use crate::bus::{BusEvent, SharedBus};
use crate::dials::{Dial, DialConfig, DialConfigStore, DialSnapshot};
use crate::sources::{SourceRegistry, SourceState};

/// Default debounce cooldown per dial
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Resolves which server client is responsible for a dial
#[async_trait]
pub trait DialDirectory: Send + Sync {
    /// Client for a dial, None while the dial is unknown
    async fn client_for(&self, dial_id: &str) -> Option<Arc<dyn DialApi>>;

    /// Latest cached data for a dial
    async fn dial(&self, dial_id: &str) -> Option<Dial>;
}

struct Binding {
    source_id: String,
    config: DialConfig,
    dial: Dial,
    client: Arc<dyn DialApi>,
    /// Most recent event seen for the source; applied when the debouncer fires
    last_state: Option<SourceState>,
}

/// The single subscription on a source, shared by `count` bindings
struct SourceWatch {
    count: usize,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BindingState {
    bindings: HashMap<String, Binding>,
    debouncers: HashMap<String, Debouncer>,
    watches: HashMap<String, SourceWatch>,
}

struct BindingInner {
    configs: DialConfigStore,
    sources: Arc<dyn SourceRegistry>,
    directories: RwLock<Vec<Weak<dyn DialDirectory>>>,
    state: Mutex<BindingState>,
    /// Held across create and remove so watch counts stay balanced
    reconcile: Mutex<()>,
    debounce: Duration,
    bus: SharedBus,
}

/// Diagnostics view of one binding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingSummary {
    pub dial_id: String,
    pub source_id: String,
    pub has_last_state: bool,
}

/// Sensor binding manager
#[derive(Clone)]
pub struct BindingManager {
    inner: Arc<BindingInner>,
}

impl BindingManager {
    pub fn new(
        configs: DialConfigStore,
        sources: Arc<dyn SourceRegistry>,
        debounce: Duration,
        bus: SharedBus,
    ) -> Self {
        Self {
            inner: Arc::new(BindingInner {
                configs,
                sources,
                directories: RwLock::new(Vec::new()),
                state: Mutex::new(BindingState::default()),
                reconcile: Mutex::new(()),
                debounce,
                bus,
            }),
        }
    }

    fn from_inner(inner: Arc<BindingInner>) -> Self {
        Self { inner }
    }

    /// Load persisted dial configuration
    pub async fn setup(&self) {
        self.inner.configs.load().await;
        tracing::info!("Binding manager ready");
    }

    /// Add a place to look up dial clients. Held weakly.
    pub async fn register_directory(&self, directory: Weak<dyn DialDirectory>) {
        self.inner.directories.write().await.push(directory);
    }

    /// Reconcile bindings against a fresh dial snapshot
    pub async fn update_bindings(&self, snapshot: &DialSnapshot) {
        let stale: Vec<String> = {
            let state = self.inner.state.lock().await;
            state
                .bindings
                .keys()
                .filter(|dial_id| !snapshot.contains_key(*dial_id))
                .cloned()
                .collect()
        };
        for dial_id in stale {
            self.remove_binding(&dial_id).await;
        }

        for (dial_id, dial) in snapshot {
            let config = self.inner.configs.get(dial_id).await;
            self.update_binding(dial_id, &config, dial).await;
        }
    }

    /// Bring one dial's binding in line with its config
    pub async fn update_binding(&self, dial_id: &str, config: &DialConfig, dial: &Dial) {
        let reconcile_guard = self.inner.reconcile.lock().await;
        let created = self.sync_binding(dial_id, config, dial).await;
        drop(reconcile_guard);

        // Bring the dial up to date now instead of waiting for the next change
        let fresh_source = if created { config.automatic_source() } else { None };
        if let Some(source_id) = fresh_source {
            if let Some(current) = self.inner.sources.current(source_id).await {
                self.apply_state(dial_id, &current).await;
            }
        }
    }

    /// Returns true when a new binding was created. Caller holds `reconcile`.
    async fn sync_binding(&self, dial_id: &str, config: &DialConfig, dial: &Dial) -> bool {
        let Some(source_id) = config.automatic_source() else {
            self.drop_binding(dial_id).await;
            return false;
        };

        let same_source = {
            let mut state = self.inner.state.lock().await;
            state.bindings.get_mut(dial_id).map(|binding| {
                if binding.source_id == source_id {
                    binding.config = config.clone();
                    binding.dial = dial.clone();
                    true
                } else {
                    false
                }
            })
        };

        match same_source {
            Some(true) => false,
            Some(false) => {
                self.drop_binding(dial_id).await;
                self.create_binding(dial_id, source_id, config, dial).await
            }
            None => self.create_binding(dial_id, source_id, config, dial).await,
        }
    }

    /// Re-read a dial's config and cached data and update its binding
    pub async fn reconfigure_binding(&self, dial_id: &str) {
        let config = self.inner.configs.get(dial_id).await;
        let Some(dial) = self.lookup_dial(dial_id).await else {
            tracing::warn!("Could not find dial data for {} during reconfiguration", dial_id);
            return;
        };
        self.update_binding(dial_id, &config, &dial).await;
        tracing::info!("Reconfigured binding for dial {}", dial_id);
    }

    async fn create_binding(
        &self,
        dial_id: &str,
        source_id: &str,
        config: &DialConfig,
        dial: &Dial,
    ) -> bool {
        if !self.inner.sources.exists(source_id).await {
            tracing::warn!("Bound source {} does not exist for dial {}", source_id, dial_id);
            return false;
        }

        let Some(client) = self.resolve_client(dial_id).await else {
            tracing::debug!("No client found for dial {} (server may still be loading)", dial_id);
            return false;
        };

        let needs_watch = {
            let state = self.inner.state.lock().await;
            !state.watches.contains_key(source_id)
        };
        let receiver = if needs_watch {
            Some(self.inner.sources.subscribe(source_id).await)
        } else {
            None
        };

        let debouncer = self.spawn_debouncer(dial_id);
        let replaced = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            state.bindings.insert(
                dial_id.to_string(),
                Binding {
                    source_id: source_id.to_string(),
                    config: config.clone(),
                    dial: dial.clone(),
                    client,
                    last_state: None,
                },
            );
            match state.watches.get_mut(source_id) {
                Some(watch) => watch.count += 1,
                None => {
                    if let Some(rx) = receiver {
                        state
                            .watches
                            .insert(source_id.to_string(), self.spawn_watch(source_id, rx));
                    }
                }
            }
            state.debouncers.insert(dial_id.to_string(), debouncer)
        };
        if let Some(old) = replaced {
            old.cancel();
        }

        tracing::info!("Created binding: {} -> dial {}", source_id, dial_id);
        true
    }

    /// Tear down a dial's binding. Unsubscribes from the source when this was
    /// its last binding.
    pub async fn remove_binding(&self, dial_id: &str) {
        let reconcile_guard = self.inner.reconcile.lock().await;
        self.drop_binding(dial_id).await;
        drop(reconcile_guard);
    }

    /// Caller holds `reconcile`
    async fn drop_binding(&self, dial_id: &str) {
        let (debouncer, finished) = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(binding) = state.bindings.remove(dial_id) else {
                return;
            };
            let debouncer = state.debouncers.remove(dial_id);
            let remaining = state.watches.get_mut(&binding.source_id).map(|watch| {
                watch.count = watch.count.saturating_sub(1);
                watch.count
            });
            let finished = if remaining == Some(0) {
                state.watches.remove(&binding.source_id)
            } else {
                None
            };
            (debouncer, finished)
        };

        if let Some(debouncer) = debouncer {
            debouncer.cancel();
        }
        if let Some(watch) = finished {
            watch.cancel.cancel();
            // Wait so the subscription is really gone when we return
            let _ = watch.task.await;
        }
        tracing::info!("Removed binding for dial {}", dial_id);
    }

    /// Record a source event on every binding watching it and poke their debouncers
    pub async fn on_source_changed(&self, state: &SourceState) {
        let mut guard = self.inner.state.lock().await;
        let locked = &mut *guard;
        for (dial_id, binding) in locked.bindings.iter_mut() {
            if binding.source_id != state.source_id {
                continue;
            }
            binding.last_state = Some(state.clone());
            if let Some(debouncer) = locked.debouncers.get(dial_id) {
                debouncer.trigger();
            }
        }
    }

    /// Apply the most recent observed state of a dial's source
    pub async fn apply_pending(&self, dial_id: &str) {
        let last = {
            let state = self.inner.state.lock().await;
            state
                .bindings
                .get(dial_id)
                .and_then(|binding| binding.last_state.clone())
        };
        if let Some(last) = last {
            self.apply_state(dial_id, &last).await;
        }
    }

    /// Parse, map and write one source state to a dial
    pub async fn apply_state(&self, dial_id: &str, source: &SourceState) {
        let target = {
            let state = self.inner.state.lock().await;
            state
                .bindings
                .get(dial_id)
                .map(|binding| (binding.client.clone(), binding.config.clone()))
        };
        let Some((client, config)) = target else {
            return;
        };

        let Some(value) = parse_source_value(&source.state) else {
            tracing::debug!(
                "Source {} state {:?} is not numeric, skipping dial {}",
                source.source_id,
                source.state,
                dial_id
            );
            return;
        };
        let dial_value = map_value(value, config.value_min, config.value_max);

        if let Err(e) = client.set_dial_value(dial_id, i64::from(dial_value)).await {
            tracing::error!("Failed to update dial {} from source: {}", dial_id, e);
            return;
        }
        self.inner.bus.publish(BusEvent::DialValueApplied {
            dial_id: dial_id.to_string(),
            source_id: source.source_id.clone(),
            value: dial_value,
        });

        let [red, green, blue] = config.backlight_color;
        if let Err(e) = client
            .set_dial_backlight(dial_id, red.into(), green.into(), blue.into())
            .await
        {
            tracing::error!("Failed to apply backlight to dial {}: {}", dial_id, e);
        }

        tracing::debug!(
            "Applied source value {} -> dial {} (value: {})",
            value,
            dial_id,
            dial_value
        );
    }

    /// Cancel every debouncer, then remove every binding
    pub async fn shutdown(&self) {
        let dial_ids: Vec<String> = {
            let state = self.inner.state.lock().await;
            for debouncer in state.debouncers.values() {
                debouncer.cancel();
            }
            state.bindings.keys().cloned().collect()
        };
        for dial_id in dial_ids {
            self.remove_binding(&dial_id).await;
        }
        tracing::info!("Binding manager shut down");
    }

    pub async fn binding_summaries(&self) -> Vec<BindingSummary> {
        let state = self.inner.state.lock().await;
        let mut summaries: Vec<_> = state
            .bindings
            .iter()
            .map(|(dial_id, binding)| BindingSummary {
                dial_id: dial_id.clone(),
                source_id: binding.source_id.clone(),
                has_last_state: binding.last_state.is_some(),
            })
            .collect();
        summaries.sort_by(|a, b| a.dial_id.cmp(&b.dial_id));
        summaries
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.state.lock().await.bindings.len()
    }

    pub async fn bound_source(&self, dial_id: &str) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.bindings.get(dial_id).map(|b| b.source_id.clone())
    }

    /// Number of sources with a live subscription
    pub async fn watched_source_count(&self) -> usize {
        self.inner.state.lock().await.watches.len()
    }

    /// Cached dial data the binding was last refreshed with
    pub async fn bound_dial(&self, dial_id: &str) -> Option<Dial> {
        let state = self.inner.state.lock().await;
        state.bindings.get(dial_id).map(|b| b.dial.clone())
    }

    async fn live_directories(&self) -> Vec<Arc<dyn DialDirectory>> {
        let directories = self.inner.directories.read().await;
        directories.iter().filter_map(Weak::upgrade).collect()
    }

    async fn resolve_client(&self, dial_id: &str) -> Option<Arc<dyn DialApi>> {
        for directory in self.live_directories().await {
            if let Some(client) = directory.client_for(dial_id).await {
                return Some(client);
            }
        }
        None
    }

    async fn lookup_dial(&self, dial_id: &str) -> Option<Dial> {
        for directory in self.live_directories().await {
            if let Some(dial) = directory.dial(dial_id).await {
                return Some(dial);
            }
        }
        None
    }

    fn spawn_debouncer(&self, dial_id: &str) -> Debouncer {
        let weak = Arc::downgrade(&self.inner);
        let dial_id = dial_id.to_string();
        Debouncer::spawn(self.inner.debounce, move || {
            let weak = weak.clone();
            let dial_id = dial_id.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    BindingManager::from_inner(inner).apply_pending(&dial_id).await;
                }
            }
        })
    }

    fn spawn_watch(&self, source_id: &str, rx: broadcast::Receiver<SourceState>) -> SourceWatch {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_source(
            Arc::downgrade(&self.inner),
            source_id.to_string(),
            rx,
            cancel.clone(),
        ));
        tracing::debug!("Subscribed to source {}", source_id);
        SourceWatch {
            count: 1,
            cancel,
            task,
        }
    }
}

/// Owns the subscription for one source and hands its events to the manager
async fn forward_source(
    inner: Weak<BindingInner>,
    source_id: String,
    mut rx: broadcast::Receiver<SourceState>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = BindingManager::from_inner(inner);

        match event {
            Ok(state) => manager.on_source_changed(&state).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Source {} lagged by {} events, re-reading", source_id, skipped);
                if let Some(state) = manager.inner.sources.current(&source_id).await {
                    manager.on_source_changed(&state).await;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("Unsubscribed from source {}", source_id);
}
