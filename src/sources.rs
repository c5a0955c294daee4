//! Numeric data sources
//!
//! A source is anything that reports a textual state which may carry a number
//! ("23.5", "23.5°C", "unavailable"). The binding manager watches sources
//! through `SourceRegistry`; `SourceHub` is the in-process implementation fed by
//! MQTT and the HTTP API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

const SOURCE_CHANNEL_CAPACITY: usize = 32;

/// Latest reported state of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub source_id: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

/// Source collaborator used by the binding manager
#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Whether the source is known (registered or has reported at least once)
    async fn exists(&self, source_id: &str) -> bool;

    async fn current(&self, source_id: &str) -> Option<SourceState>;

    /// Subscribe to state changes of one source
    async fn subscribe(&self, source_id: &str) -> broadcast::Receiver<SourceState>;
}

struct SourceEntry {
    current: Option<SourceState>,
    sender: broadcast::Sender<SourceState>,
}

impl SourceEntry {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(SOURCE_CHANNEL_CAPACITY);
        Self {
            current: None,
            sender,
        }
    }
}

/// In-memory source registry
#[derive(Default)]
pub struct SourceHub {
    sources: RwLock<HashMap<String, SourceEntry>>,
}

impl SourceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a source before it has reported a state
    pub async fn register(&self, source_id: &str) {
        let mut sources = self.sources.write().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(SourceEntry::new);
    }

    /// Record a new state and notify subscribers.
    ///
    /// Repeating the current state is not a change and is not broadcast.
    pub async fn set_state(&self, source_id: &str, state: &str) -> SourceState {
        let mut sources = self.sources.write().await;
        let entry = sources
            .entry(source_id.to_string())
            .or_insert_with(SourceEntry::new);

        if let Some(current) = &entry.current {
            if current.state == state {
                return current.clone();
            }
        }

        let next = SourceState {
            source_id: source_id.to_string(),
            state: state.to_string(),
            updated_at: Utc::now(),
        };
        entry.current = Some(next.clone());
        // No subscribers is fine
        let _ = entry.sender.send(next.clone());
        tracing::debug!("Source {} -> {}", source_id, state);
        next
    }

    pub async fn list(&self) -> Vec<SourceState> {
        let sources = self.sources.read().await;
        let mut list: Vec<_> = sources
            .values()
            .filter_map(|entry| entry.current.clone())
            .collect();
        list.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        list
    }

    /// Live subscriptions on a source
    pub async fn subscriber_count(&self, source_id: &str) -> usize {
        let sources = self.sources.read().await;
        sources
            .get(source_id)
            .map(|entry| entry.sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceRegistry for SourceHub {
    async fn exists(&self, source_id: &str) -> bool {
        self.sources.read().await.contains_key(source_id)
    }

    async fn current(&self, source_id: &str) -> Option<SourceState> {
        let sources = self.sources.read().await;
        sources.get(source_id).and_then(|entry| entry.current.clone())
    }

    async fn subscribe(&self, source_id: &str) -> broadcast::Receiver<SourceState> {
        let mut sources = self.sources.write().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(SourceEntry::new)
            .sender
            .subscribe()
    }
}
