use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Startable - Uniform service lifecycle trait
// =============================================================================

/// Trait for background services that can be started/stopped uniformly.
/// The daemon starts and stops the coordinator and the MQTT bridge through it.
#[async_trait]
pub trait Startable: Send + Sync {
    /// Service name (e.g., "coordinator", "mqtt")
    fn name(&self) -> &'static str;

    /// Start the service. No-op if already running.
    async fn start(&self) -> Result<()>;

    /// Stop the service gracefully.
    async fn stop(&self);

    /// Whether this service can be started (e.g., has required config).
    /// Default: true.
    async fn can_start(&self) -> bool {
        true
    }
}

/// Macro to implement Startable trait with minimal boilerplate.
///
/// Services must implement:
/// - `async fn start_internal(&self) -> Result<()>`
/// - `async fn stop_internal(&self)`
/// - Optionally: custom `can_start` method (pass as third arg)
///
/// Usage:
/// ```ignore
/// impl_startable!(DialCoordinator, "coordinator");
/// impl_startable!(MqttAdapter, "mqtt", is_configured);  // custom can_start
/// ```
#[macro_export]
macro_rules! impl_startable {
    // With custom can_start method
    ($adapter:ty, $name:literal, $can_start:ident) => {
        #[async_trait::async_trait]
        impl $crate::adapters::Startable for $adapter {
            fn name(&self) -> &'static str {
                $name
            }

            async fn start(&self) -> anyhow::Result<()> {
                self.start_internal().await
            }

            async fn stop(&self) {
                self.stop_internal().await
            }

            async fn can_start(&self) -> bool {
                self.$can_start().await
            }
        }
    };
    // Default can_start (always true)
    ($adapter:ty, $name:literal) => {
        #[async_trait::async_trait]
        impl $crate::adapters::Startable for $adapter {
            fn name(&self) -> &'static str {
                $name
            }

            async fn start(&self) -> anyhow::Result<()> {
                self.start_internal().await
            }

            async fn stop(&self) {
                self.stop_internal().await
            }
        }
    };
}

/// Start every service that can start, in order. A failing service is
/// logged and skipped.
pub async fn start_all(services: &[Arc<dyn Startable>]) {
    for service in services {
        let name = service.name();
        if !service.can_start().await {
            debug!("Service {} cannot start (not configured?), skipping", name);
            continue;
        }
        match service.start().await {
            Ok(()) => info!("Started service: {}", name),
            Err(e) => warn!("Failed to start service {}: {:#}", name, e),
        }
    }
}

/// Stop services in reverse start order
pub async fn stop_all(services: &[Arc<dyn Startable>]) {
    for service in services.iter().rev() {
        service.stop().await;
        debug!("Stopped service: {}", service.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        configured: bool,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        async fn start_internal(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn stop_internal(&self) {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }

        async fn is_configured(&self) -> bool {
            self.configured
        }
    }

    impl_startable!(Recorder, "recorder", is_configured);

    fn recorder(
        name: &'static str,
        configured: bool,
        fail: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn Startable> {
        Arc::new(Recorder {
            name,
            configured,
            fail,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn start_all_skips_unconfigured_and_survives_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let services = vec![
            recorder("a", true, true, &log),
            recorder("b", false, false, &log),
            recorder("c", true, false, &log),
        ];

        start_all(&services).await;
        stop_all(&services).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start c", "stop c", "stop b", "stop a"]
        );
    }
}
