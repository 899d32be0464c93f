//! Step executor
//!
//! Runs one planned step: binds inputs, calls the owning service under the
//! step timeout and retry policy, fails over to alternate services offering
//! the same capability, and normalizes the response. Every outcome is a
//! [`StepResult`]; nothing here returns an error to the engine.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    normalize::normalize_response,
    types::{ErrorDetail, ErrorKind, PlanStep, StepResult},
};
use crate::{
    backend::{BackendError, BackendPool, InferenceRequest},
    core::{
        capability::ServiceId,
        registry::CapabilityRegistry,
        retry::{MaxRetriesExceeded, RetryConfig, RetryExecutor},
    },
};

/// Timeout and retry settings applied to one step
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPolicy {
    /// Per-call timeout, applied to every attempt
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Resolves once `cancel` flips to true; never resolves if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum ServiceAttempt {
    Produced(Map<String, Value>),
    Failed(BackendError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<CapabilityRegistry>,
    backends: BackendPool,
}

impl StepExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, backends: BackendPool) -> Self {
        Self { registry, backends }
    }

    pub fn backends(&self) -> &BackendPool {
        &self.backends
    }

    /// Bind the step's inputs from the resolved-values pool
    fn bind_inputs(
        step: &PlanStep,
        pool: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ErrorDetail> {
        let mut inputs = step.parameters.clone();
        for binding in &step.bindings {
            match pool.get(&binding.name) {
                Some(value) => {
                    inputs.insert(binding.param.clone(), value.clone());
                }
                None => {
                    return Err(ErrorDetail::new(
                        ErrorKind::PreconditionFailed,
                        format!("input '{}' is not available", binding.name),
                    ))
                }
            }
        }
        Ok(inputs)
    }

    /// Planned service first (while still selectable), then the registry's
    /// current alternates in preference order
    fn candidates(&self, step: &PlanStep) -> Vec<ServiceId> {
        let mut candidates = Vec::new();
        if self
            .registry
            .status_of(&step.service)
            .is_some_and(|s| s.is_selectable())
        {
            candidates.push(step.service.clone());
        } else {
            debug!(
                step_id = %step.id,
                service_id = %step.service,
                "Planned service no longer selectable"
            );
        }
        for desc in self.registry.services_for(&step.contract.capability) {
            if !candidates.contains(&desc.id) {
                candidates.push(desc.id);
            }
        }
        candidates
    }

    pub async fn execute(
        &self,
        step: &PlanStep,
        pool: &Map<String, Value>,
        policy: &ExecutionPolicy,
        mut cancel: watch::Receiver<bool>,
    ) -> StepResult {
        let start = Instant::now();

        let inputs = match Self::bind_inputs(step, pool) {
            Ok(inputs) => inputs,
            Err(detail) => {
                error!(step_id = %step.id, error = %detail, "Step precondition failed");
                return StepResult::failed(step, detail).with_latency(start.elapsed());
            }
        };

        let candidates = self.candidates(step);
        if candidates.is_empty() {
            let detail = ErrorDetail::new(
                ErrorKind::NoCapableService,
                format!(
                    "no available service offers capability '{}'",
                    step.contract.capability
                ),
            );
            warn!(step_id = %step.id, error = %detail, "No service to execute step");
            return StepResult::failed(step, detail).with_latency(start.elapsed());
        }

        let mut attempts = 0u32;
        let mut service_failures = Vec::new();
        let mut last_error: Option<(ServiceId, BackendError)> = None;

        for (position, service) in candidates.iter().enumerate() {
            let Some(backend) = self.backends.get(service) else {
                warn!(step_id = %step.id, service_id = %service, "No backend bound for service");
                continue;
            };
            if position > 0 {
                info!(step_id = %step.id, service_id = %service, "Failing over to alternate service");
            }

            let request = InferenceRequest {
                service: service.clone(),
                capability: step.contract.capability.clone(),
                output: step.output().to_string(),
                inputs: inputs.clone(),
            };

            let call_timeout = policy.timeout;
            let retry = RetryExecutor::execute_with_retry(
                &policy.retry,
                |_attempt| {
                    let backend = Arc::clone(&backend);
                    let request = request.clone();
                    async move {
                        match tokio::time::timeout(call_timeout, backend.invoke(request)).await {
                            Ok(result) => result,
                            Err(_) => Err(BackendError::Timeout {
                                timeout_ms: call_timeout.as_millis() as u64,
                            }),
                        }
                    }
                },
                |result, _attempt| matches!(result, Err(e) if e.is_transient()),
                |result, delay, next_attempt| {
                    if let Err(e) = result {
                        debug!(
                            step_id = %step.id,
                            service_id = %service,
                            error = %e,
                            next_attempt = next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying transient failure"
                        );
                    }
                },
            );

            let attempt = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => ServiceAttempt::Cancelled,
                outcome = retry => {
                    let (result, used) = match outcome {
                        Ok((result, used)) => (result, used),
                        Err(MaxRetriesExceeded { last, attempts: used }) => (last, used),
                    };
                    attempts += used;
                    match result.and_then(|payload| {
                        normalize_response(&step.contract, payload, step.whole_payload_fallback)
                    }) {
                        Ok(values) => ServiceAttempt::Produced(values),
                        Err(e) => ServiceAttempt::Failed(e),
                    }
                }
            };

            match attempt {
                ServiceAttempt::Produced(values) => {
                    let mut result = StepResult::success(step, service.clone(), values)
                        .with_latency(start.elapsed());
                    result.attempts = attempts;
                    result.service_failures = service_failures;
                    return result;
                }
                ServiceAttempt::Cancelled => {
                    let mut result = StepResult::failed(
                        step,
                        ErrorDetail::new(
                            ErrorKind::DeadlineExceeded,
                            "step cancelled by run deadline",
                        ),
                    )
                    .with_latency(start.elapsed());
                    result.attempts = attempts;
                    result.service_failures = service_failures;
                    return result;
                }
                ServiceAttempt::Failed(e) => {
                    warn!(
                        step_id = %step.id,
                        service_id = %service,
                        error = %e,
                        "Service call failed"
                    );
                    let failover = e.allows_failover();
                    if failover {
                        service_failures.push((service.clone(), e.clone()));
                    }
                    last_error = Some((service.clone(), e));
                    if !failover {
                        break;
                    }
                }
            }
        }

        let message = match &last_error {
            Some((service, e)) => format!("service '{service}' failed: {e}"),
            None => "no bound backend for any candidate service".to_string(),
        };
        let mut result = StepResult::failed(
            step,
            ErrorDetail::new(ErrorKind::StepExecutionFailed, message),
        )
        .with_latency(start.elapsed());
        result.attempts = attempts;
        result.service_failures = service_failures;
        result
    }
}
