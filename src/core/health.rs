//! Health monitoring
//!
//! The monitor is the only component that writes service status into the
//! registry during normal operation. It has two inputs:
//!
//! - step-level outcomes relayed by the workflow engine, which move a service
//!   between `available` and `degraded`;
//! - an optional periodic probe of every bound backend, which can take a
//!   service down to `unavailable` and bring it back.

use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    capability::{ServiceId, ServiceStatus},
    registry::CapabilityRegistry,
};
use crate::backend::{BackendError, BackendPool};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Consecutive failures before a service is downgraded
    pub failure_threshold: u32,
    /// Consecutive successes before a service is restored
    pub success_threshold: u32,
    /// Per-probe timeout
    pub timeout_secs: u64,
    pub check_interval_secs: u64,
    /// Run the active probe task
    pub enabled: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_secs: 5,
            check_interval_secs: 60,
            enabled: false,
        }
    }
}

/// Sink for step-level service outcomes
pub trait HealthReporter: Send + Sync + fmt::Debug {
    fn report_success(&self, service: &ServiceId);
    fn report_failure(&self, service: &ServiceId, error: &BackendError);
}

#[derive(Debug, Default, Clone, Copy)]
struct Streak {
    failures: u32,
    successes: u32,
}

impl Streak {
    fn success(&mut self) -> u32 {
        self.failures = 0;
        self.successes = self.successes.saturating_add(1);
        self.successes
    }

    fn failure(&mut self) -> u32 {
        self.successes = 0;
        self.failures = self.failures.saturating_add(1);
        self.failures
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<CapabilityRegistry>,
    config: HealthCheckConfig,
    relayed: DashMap<ServiceId, Streak>,
    probed: DashMap<ServiceId, Streak>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<CapabilityRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            config,
            relayed: DashMap::new(),
            probed: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    fn transition(&self, service: &ServiceId, status: ServiceStatus, reason: &str) {
        match self.registry.mark_status(service, status) {
            Ok(()) => info!(service_id = %service, status = %status, reason, "Health transition"),
            Err(e) => warn!(service_id = %service, error = %e, "Health transition for unregistered service"),
        }
    }

    /// Record one probe result and apply any resulting transition
    fn record_probe(&self, service: &ServiceId, result: Result<(), BackendError>) {
        let current = self.registry.status_of(service);
        let mut streak = self.probed.entry(service.clone()).or_default();
        match result {
            Ok(()) => {
                let successes = streak.success();
                drop(streak);
                if current != Some(ServiceStatus::Available)
                    && successes >= self.config.success_threshold
                {
                    self.transition(service, ServiceStatus::Available, "probe succeeded");
                    self.relayed.remove(service);
                }
            }
            Err(e) => {
                let failures = streak.failure();
                drop(streak);
                debug!(service_id = %service, failures, error = %e, "Health probe failed");
                if current != Some(ServiceStatus::Unavailable)
                    && failures >= self.config.failure_threshold
                {
                    self.transition(service, ServiceStatus::Unavailable, "probe failed");
                }
            }
        }
    }

    /// Probe every bound backend once, in parallel
    pub async fn probe_all(&self, pool: &BackendPool) {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let probes = pool.entries().into_iter().map(|(id, backend)| async move {
            let result = match tokio::time::timeout(timeout, backend.health_check()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            (id, result)
        });

        for (id, result) in futures::future::join_all(probes).await {
            self.record_probe(&id, result);
        }
    }

    /// Spawn the periodic probe task
    pub fn start(self: &Arc<Self>, pool: BackendPool) -> HealthProbeHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let interval_secs = self.config.check_interval_secs.max(1);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.probe_all(&pool).await,
                    _ = shutdown_rx.changed() => {
                        debug!("Health probe task shutting down");
                        break;
                    }
                }
            }
        });

        HealthProbeHandle {
            handle,
            shutdown: shutdown_tx,
        }
    }
}

impl HealthReporter for HealthMonitor {
    fn report_success(&self, service: &ServiceId) {
        let successes = self.relayed.entry(service.clone()).or_default().success();
        if self.registry.status_of(service) == Some(ServiceStatus::Degraded)
            && successes >= self.config.success_threshold
        {
            self.transition(service, ServiceStatus::Available, "step calls recovered");
        }
    }

    fn report_failure(&self, service: &ServiceId, error: &BackendError) {
        let failures = self.relayed.entry(service.clone()).or_default().failure();
        debug!(service_id = %service, failures, error = %error, "Step call failure relayed");
        if self.registry.status_of(service) == Some(ServiceStatus::Available)
            && failures >= self.config.failure_threshold
        {
            self.transition(service, ServiceStatus::Degraded, "repeated step call failures");
        }
    }
}

/// Handle to the background probe task
pub struct HealthProbeHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for HealthProbeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbeHandle")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl HealthProbeHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use serde_json::{Map, Value};

    use super::*;
    use crate::{
        backend::{InferenceBackend, InferenceRequest},
        core::capability::{Capability, ServiceDescriptor},
    };

    #[derive(Debug)]
    struct Probe {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl InferenceBackend for Probe {
        async fn invoke(&self, _: InferenceRequest) -> Result<Map<String, Value>, BackendError> {
            Ok(Map::new())
        }

        async fn health_check(&self) -> Result<(), BackendError> {
            if self.healthy.load(Ordering::Relaxed) {
                Ok(())
            } else {
                Err(BackendError::Connection {
                    message: "refused".into(),
                })
            }
        }
    }

    fn setup(status: ServiceStatus) -> (Arc<CapabilityRegistry>, HealthMonitor, ServiceId) {
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register(
                ServiceDescriptor::new("whisper", vec![Capability::new("speech-to-text")])
                    .with_status(status),
            )
            .unwrap();
        let config = HealthCheckConfig {
            failure_threshold: 2,
            success_threshold: 2,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(registry.clone(), config);
        (registry, monitor, ServiceId::new("whisper"))
    }

    fn timeout_err() -> BackendError {
        BackendError::Timeout { timeout_ms: 10 }
    }

    #[test]
    fn test_relayed_failures_degrade_after_threshold() {
        let (registry, monitor, id) = setup(ServiceStatus::Available);

        monitor.report_failure(&id, &timeout_err());
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Available));
        monitor.report_failure(&id, &timeout_err());
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Degraded));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (registry, monitor, id) = setup(ServiceStatus::Available);

        monitor.report_failure(&id, &timeout_err());
        monitor.report_success(&id);
        monitor.report_failure(&id, &timeout_err());
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Available));
    }

    #[test]
    fn test_relayed_successes_restore_degraded() {
        let (registry, monitor, id) = setup(ServiceStatus::Degraded);

        monitor.report_success(&id);
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Degraded));
        monitor.report_success(&id);
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Available));
    }

    #[tokio::test]
    async fn test_probe_marks_unavailable_then_recovers() {
        let (registry, monitor, id) = setup(ServiceStatus::Available);
        let backend = Arc::new(Probe {
            healthy: AtomicBool::new(false),
        });
        let pool = BackendPool::new();
        pool.bind(id.clone(), backend.clone());

        monitor.probe_all(&pool).await;
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Available));
        monitor.probe_all(&pool).await;
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Unavailable));

        backend.healthy.store(true, Ordering::Relaxed);
        monitor.probe_all(&pool).await;
        monitor.probe_all(&pool).await;
        assert_eq!(registry.status_of(&id), Some(ServiceStatus::Available));
    }

    #[tokio::test]
    async fn test_probe_task_shutdown() {
        let (_registry, monitor, id) = setup(ServiceStatus::Unknown);
        let pool = BackendPool::new();
        pool.bind(
            id,
            Arc::new(Probe {
                healthy: AtomicBool::new(true),
            }),
        );

        let monitor = Arc::new(monitor);
        let handle = monitor.start(pool);
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("probe task should stop promptly");
    }
}
