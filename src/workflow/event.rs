//! Workflow event system for observability

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{RunId, RunPhase, StepId, WorkflowStatus};
use crate::core::capability::ServiceId;

/// Default timeout for subscriber event handlers
const DEFAULT_SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(30);

/// Events emitted by the workflow engine
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    RunStarted {
        run_id: RunId,
        desired: Vec<String>,
    },
    PhaseChanged {
        run_id: RunId,
        phase: RunPhase,
    },
    PlanningFailed {
        run_id: RunId,
        output: Option<String>,
        error: String,
    },
    StepDispatched {
        run_id: RunId,
        step_id: StepId,
        service: ServiceId,
    },
    StepSucceeded {
        run_id: RunId,
        step_id: StepId,
        service: ServiceId,
        duration: Duration,
        attempts: u32,
    },
    StepFailed {
        run_id: RunId,
        step_id: StepId,
        error: String,
    },
    StepSkipped {
        run_id: RunId,
        step_id: StepId,
        reason: String,
    },
    DeadlineExceeded {
        run_id: RunId,
        in_flight: usize,
    },
    RunFinished {
        run_id: RunId,
        status: WorkflowStatus,
        duration: Duration,
    },
}

/// Trait for subscribing to workflow events
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &WorkflowEvent);
}

/// Event bus for publishing and subscribing to workflow events
///
/// Each subscriber is notified in its own spawned task bounded by a timeout,
/// so a slow or panicking subscriber never stalls the engine or its peers.
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Arc<dyn EventSubscriber>>>>,
    subscriber_timeout: Duration,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SUBSCRIBER_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            subscriber_timeout: timeout,
        }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Removes the subscriber by pointer equality
    pub async fn unsubscribe(&self, subscriber: &Arc<dyn EventSubscriber>) -> bool {
        let mut subs = self.subscribers.write().await;
        let len_before = subs.len();
        subs.retain(|s| !Arc::ptr_eq(s, subscriber));
        subs.len() < len_before
    }

    /// Fire-and-forget publish to every subscriber
    pub async fn publish(&self, event: WorkflowEvent) {
        let subscribers: Vec<_> = self.subscribers.read().await.iter().cloned().collect();
        if subscribers.is_empty() {
            return;
        }
        let timeout = self.subscriber_timeout;

        for (idx, subscriber) in subscribers.into_iter().enumerate() {
            let event = event.clone();
            tokio::spawn(async move {
                if tokio::time::timeout(timeout, subscriber.on_event(&event))
                    .await
                    .is_err()
                {
                    warn!(
                        subscriber_index = idx,
                        timeout_secs = timeout.as_secs(),
                        "Event subscriber timed out"
                    );
                }
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_timeout", &self.subscriber_timeout)
            .finish_non_exhaustive()
    }
}

/// Renders events through `tracing`
pub struct LoggingSubscriber;

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    async fn on_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::RunStarted { run_id, desired } => {
                info!(run_id = %run_id, desired = ?desired, "Run started");
            }
            WorkflowEvent::PhaseChanged { run_id, phase } => {
                debug!(run_id = %run_id, phase = %phase, "Run phase changed");
            }
            WorkflowEvent::PlanningFailed {
                run_id,
                output,
                error,
            } => {
                warn!(
                    run_id = %run_id,
                    output = output.as_deref().unwrap_or("-"),
                    error = error,
                    "Planning failed"
                );
            }
            WorkflowEvent::StepDispatched {
                run_id,
                step_id,
                service,
            } => {
                info!(run_id = %run_id, step_id = %step_id, service_id = %service, "Step dispatched");
            }
            WorkflowEvent::StepSucceeded {
                run_id,
                step_id,
                service,
                duration,
                attempts,
            } => {
                info!(
                    run_id = %run_id,
                    step_id = %step_id,
                    service_id = %service,
                    duration_ms = duration.as_millis() as u64,
                    attempts = attempts,
                    "Step succeeded"
                );
            }
            WorkflowEvent::StepFailed {
                run_id,
                step_id,
                error,
            } => {
                warn!(run_id = %run_id, step_id = %step_id, error = error, "Step failed");
            }
            WorkflowEvent::StepSkipped {
                run_id,
                step_id,
                reason,
            } => {
                info!(run_id = %run_id, step_id = %step_id, reason = reason, "Step skipped");
            }
            WorkflowEvent::DeadlineExceeded { run_id, in_flight } => {
                warn!(run_id = %run_id, in_flight = in_flight, "Run deadline exceeded");
            }
            WorkflowEvent::RunFinished {
                run_id,
                status,
                duration,
            } => {
                info!(
                    run_id = %run_id,
                    status = ?status,
                    duration_ms = duration.as_millis() as u64,
                    "Run finished"
                );
            }
        }
    }
}
