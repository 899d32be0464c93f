//! Workflow engine
//!
//! Drives an execution plan through the step executor. A single coordinator
//! owns the resolved-values pool and the per-step bookkeeping; spawned step
//! tasks report back over an mpsc channel, so pool merges are serialized
//! without locks.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    event::{EventBus, WorkflowEvent},
    executor::{ExecutionPolicy, StepExecutor},
    planner::{ExplicitStep, PlanningError, WorkflowPlanner},
    types::{
        ErrorDetail, ErrorKind, ExecutionPlan, RequestConfig, RunId, RunPhase, RunSettings,
        StepId, StepResult, WorkflowResult, WorkflowStatus,
    },
};
use crate::core::{health::HealthReporter, retry::RetryConfig};

/// How a run reacts to desired outputs that cannot be planned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    /// Execute whatever can be planned; report the rest per output
    #[default]
    BestEffort,
    /// Fail the whole run on the first planning error
    AllOrNothing,
}

/// Engine defaults, overridable per request through [`RequestConfig`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub step_timeout_ms: u64,
    /// Overall run deadline
    pub run_timeout_ms: u64,
    pub max_concurrency: usize,
    /// Time in-flight steps get to wind down after the deadline
    pub grace_period_ms: u64,
    pub planning_mode: PlanningMode,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            run_timeout_ms: 300_000,
            max_concurrency: 4,
            grace_period_ms: 1_000,
            planning_mode: PlanningMode::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Coordinator state for one run
struct RunState<'a> {
    plan: &'a ExecutionPlan,
    pool: Map<String, Value>,
    results: BTreeMap<StepId, StepResult>,
    reverse: HashMap<StepId, Vec<usize>>,
    unmet: Vec<usize>,
    finished: Vec<bool>,
    /// Ready steps by plan position
    ready: BTreeSet<usize>,
}

impl<'a> RunState<'a> {
    fn new(plan: &'a ExecutionPlan, inputs: Map<String, Value>) -> Self {
        let unmet: Vec<usize> = plan.steps.iter().map(|s| s.depends_on.len()).collect();
        let ready = unmet
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();
        Self {
            plan,
            pool: inputs,
            results: BTreeMap::new(),
            reverse: plan.reverse_dependencies(),
            unmet,
            finished: vec![false; plan.steps.len()],
            ready,
        }
    }

    /// First binding of step `idx` with no value in the pool
    fn missing_input(&self, idx: usize) -> Option<&str> {
        self.plan.steps[idx]
            .bindings
            .iter()
            .find(|b| !self.pool.contains_key(&b.name))
            .map(|b| b.name.as_str())
    }

    /// Values bound by step `idx`, taken from the pool
    fn inputs_for(&self, idx: usize) -> Map<String, Value> {
        self.plan.steps[idx]
            .bindings
            .iter()
            .filter_map(|b| self.pool.get(&b.name).map(|v| (b.name.clone(), v.clone())))
            .collect()
    }

    fn record(&mut self, idx: usize, result: StepResult) {
        self.finished[idx] = true;
        self.results.insert(result.step_id.clone(), result);
    }

    fn unlock_dependents(&mut self, step_id: &StepId) {
        let Some(dependents) = self.reverse.get(step_id) else {
            return;
        };
        for &dep in dependents {
            self.unmet[dep] = self.unmet[dep].saturating_sub(1);
            if self.unmet[dep] == 0 && !self.finished[dep] {
                self.ready.insert(dep);
            }
        }
    }

    /// Mark every transitive dependent of `failed` as skipped; returns them
    fn skip_dependents(&mut self, failed: &StepId, cause: &ErrorDetail) -> Vec<(StepId, String)> {
        let plan = self.plan;
        let mut skipped = Vec::new();
        let mut queue: VecDeque<StepId> = VecDeque::from([failed.clone()]);
        let mut seen: HashSet<StepId> = HashSet::new();

        while let Some(id) = queue.pop_front() {
            let dependents = self.reverse.get(&id).cloned().unwrap_or_default();
            for dep in dependents {
                if self.finished[dep] {
                    continue;
                }
                let step = &plan.steps[dep];
                if !seen.insert(step.id.clone()) {
                    continue;
                }
                let reason = format!("dependency '{id}' did not succeed");
                let kind = match cause.kind {
                    ErrorKind::DeadlineExceeded => ErrorKind::DeadlineExceeded,
                    _ => ErrorKind::StepExecutionFailed,
                };
                let result = StepResult::skipped(step, ErrorDetail::new(kind, reason.clone()));
                self.ready.remove(&dep);
                queue.push_back(step.id.clone());
                skipped.push((step.id.clone(), reason));
                self.record(dep, result);
            }
        }
        skipped
    }
}

/// `start + after`, saturating to a far-future instant on overflow
fn instant_after(start: tokio::time::Instant, after: Duration) -> tokio::time::Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + Duration::from_secs(86_400 * 365 * 30))
}

pub struct WorkflowEngine {
    planner: Arc<WorkflowPlanner>,
    executor: Arc<StepExecutor>,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
    health: Option<Arc<dyn HealthReporter>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("health", &self.health.is_some())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn new(planner: Arc<WorkflowPlanner>, executor: Arc<StepExecutor>, config: EngineConfig) -> Self {
        Self {
            planner,
            executor,
            config,
            event_bus: Arc::new(EventBus::new()),
            health: None,
        }
    }

    /// Relay step-level service outcomes to a health collaborator
    pub fn with_health_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.health = Some(reporter);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn planner(&self) -> &Arc<WorkflowPlanner> {
        &self.planner
    }

    /// Produce `desired` outputs from `inputs`.
    ///
    /// Never fails: planning and execution failures are reported inside the
    /// returned [`WorkflowResult`].
    pub async fn run(
        &self,
        inputs: Map<String, Value>,
        desired: &[String],
        request: Option<&RequestConfig>,
    ) -> WorkflowResult {
        let run_id = RunId::new();
        let settings = RunSettings::resolve(&self.config, request);
        self.event_bus
            .publish(WorkflowEvent::RunStarted {
                run_id,
                desired: desired.to_vec(),
            })
            .await;
        self.phase(run_id, RunPhase::Planning).await;

        let available: HashSet<String> = inputs.keys().cloned().collect();
        let outcome = self.planner.plan_best_effort(&available, desired);

        if settings.planning_mode == PlanningMode::AllOrNothing {
            if let Some((output, err)) = outcome.errors.first() {
                return self
                    .planning_failed(run_id, Some(output.clone()), err)
                    .await;
            }
        }
        for (output, err) in &outcome.errors {
            self.event_bus
                .publish(WorkflowEvent::PlanningFailed {
                    run_id,
                    output: Some(output.clone()),
                    error: err.to_string(),
                })
                .await;
        }

        self.execute_plan(run_id, outcome.plan, inputs, &settings, outcome.errors)
            .await
    }

    /// Execute a caller-specified step list
    pub async fn run_explicit(
        &self,
        inputs: Map<String, Value>,
        steps: &[ExplicitStep],
        request: Option<&RequestConfig>,
    ) -> WorkflowResult {
        let run_id = RunId::new();
        let settings = RunSettings::resolve(&self.config, request);
        self.event_bus
            .publish(WorkflowEvent::RunStarted {
                run_id,
                desired: steps.iter().map(|s| s.output.clone()).collect(),
            })
            .await;
        self.phase(run_id, RunPhase::Planning).await;

        let available: HashSet<String> = inputs.keys().cloned().collect();
        match self.planner.plan_explicit(&available, steps) {
            Ok(plan) => {
                self.execute_plan(run_id, plan, inputs, &settings, Vec::new())
                    .await
            }
            Err(err) => self.planning_failed(run_id, None, &err).await,
        }
    }

    async fn phase(&self, run_id: RunId, phase: RunPhase) {
        self.event_bus
            .publish(WorkflowEvent::PhaseChanged { run_id, phase })
            .await;
    }

    async fn planning_failed(
        &self,
        run_id: RunId,
        output: Option<String>,
        err: &PlanningError,
    ) -> WorkflowResult {
        warn!(run_id = %run_id, error = %err, "Run failed during planning");
        self.event_bus
            .publish(WorkflowEvent::PlanningFailed {
                run_id,
                output,
                error: err.to_string(),
            })
            .await;
        self.phase(run_id, RunPhase::Done).await;
        self.event_bus
            .publish(WorkflowEvent::RunFinished {
                run_id,
                status: WorkflowStatus::Failed,
                duration: std::time::Duration::ZERO,
            })
            .await;
        WorkflowResult::planning_failed(run_id, err.detail())
    }

    fn relay_health(&self, result: &StepResult) {
        let Some(health) = &self.health else {
            return;
        };
        for (service, err) in &result.service_failures {
            health.report_failure(service, err);
        }
        if let (true, Some(service)) = (result.is_success(), &result.service) {
            health.report_success(service);
        }
    }

    async fn execute_plan(
        &self,
        run_id: RunId,
        plan: ExecutionPlan,
        inputs: Map<String, Value>,
        settings: &RunSettings,
        planning_errors: Vec<(String, PlanningError)>,
    ) -> WorkflowResult {
        let started = Instant::now();
        self.phase(run_id, RunPhase::Executing).await;
        info!(
            run_id = %run_id,
            steps = plan.len(),
            max_concurrency = settings.max_concurrency,
            deadline_ms = settings.deadline.as_millis() as u64,
            "Executing plan"
        );

        let policy = ExecutionPolicy {
            timeout: settings.step_timeout,
            retry: settings.retry.clone(),
        };
        let deadline = instant_after(tokio::time::Instant::now(), settings.deadline);
        let mut grace_deadline = instant_after(deadline, settings.grace_period);
        let mut deadline_hit = false;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::channel::<(usize, StepResult)>(plan.len().max(1));
        let mut state = RunState::new(&plan, inputs);
        let mut running: HashMap<usize, JoinHandle<()>> = HashMap::new();

        loop {
            while !deadline_hit && running.len() < settings.max_concurrency {
                let Some(idx) = state.ready.pop_first() else {
                    break;
                };
                if let Some(missing) = state.missing_input(idx) {
                    let reason = format!("input '{missing}' was not produced by its dependency");
                    self.skip_unbound(run_id, &mut state, idx, reason).await;
                    continue;
                }

                let step = plan.steps[idx].clone();
                self.event_bus
                    .publish(WorkflowEvent::StepDispatched {
                        run_id,
                        step_id: step.id.clone(),
                        service: step.service.clone(),
                    })
                    .await;

                let step_inputs = state.inputs_for(idx);
                let executor = Arc::clone(&self.executor);
                let policy = policy.clone();
                let cancel = cancel_rx.clone();
                let tx = tx.clone();
                let handle = tokio::spawn(async move {
                    let result = executor.execute(&step, &step_inputs, &policy, cancel).await;
                    if tx.send((idx, result)).await.is_err() {
                        debug!(step_id = %step.id, "Coordinator gone before step completion");
                    }
                });
                running.insert(idx, handle);
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = tokio::time::sleep_until(deadline), if !deadline_hit => {
                    deadline_hit = true;
                    grace_deadline = instant_after(tokio::time::Instant::now(), settings.grace_period);
                    warn!(run_id = %run_id, in_flight = running.len(), "Run deadline exceeded");
                    let _ = cancel_tx.send(true);
                    self.event_bus
                        .publish(WorkflowEvent::DeadlineExceeded {
                            run_id,
                            in_flight: running.len(),
                        })
                        .await;
                }
                _ = tokio::time::sleep_until(grace_deadline), if deadline_hit => {
                    warn!(run_id = %run_id, aborted = running.len(), "Grace period elapsed, aborting steps");
                    let mut aborted: Vec<usize> = running.keys().copied().collect();
                    aborted.sort_unstable();
                    for idx in aborted {
                        if let Some(handle) = running.remove(&idx) {
                            handle.abort();
                        }
                        let result = StepResult::failed(
                            &plan.steps[idx],
                            ErrorDetail::new(ErrorKind::DeadlineExceeded, "step aborted after grace period"),
                        );
                        self.complete_step(run_id, &mut state, idx, result).await;
                    }
                    break;
                }
                received = rx.recv() => {
                    let Some((idx, result)) = received else { break };
                    running.remove(&idx);
                    self.relay_health(&result);
                    self.complete_step(run_id, &mut state, idx, result).await;
                }
            }
        }

        // Steps never dispatched because the deadline passed first
        for idx in 0..plan.steps.len() {
            if !state.finished[idx] {
                let step = &plan.steps[idx];
                let reason = "run deadline exceeded before dispatch".to_string();
                self.event_bus
                    .publish(WorkflowEvent::StepSkipped {
                        run_id,
                        step_id: step.id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                state.record(
                    idx,
                    StepResult::skipped(step, ErrorDetail::new(ErrorKind::DeadlineExceeded, reason)),
                );
            }
        }

        self.phase(run_id, RunPhase::Aggregating).await;
        let result = Self::aggregate(run_id, &plan, state, planning_errors);
        let duration = started.elapsed();
        info!(
            run_id = %run_id,
            status = ?result.status,
            outputs = result.outputs.len(),
            duration_ms = duration.as_millis() as u64,
            "Run finished"
        );
        self.event_bus
            .publish(WorkflowEvent::RunFinished {
                run_id,
                status: result.status,
                duration,
            })
            .await;
        self.phase(run_id, RunPhase::Done).await;
        result
    }

    /// Skip a ready step whose dependency succeeded without producing one of
    /// its bound inputs, along with everything downstream of it
    async fn skip_unbound(
        &self,
        run_id: RunId,
        state: &mut RunState<'_>,
        idx: usize,
        reason: String,
    ) {
        let plan = state.plan;
        let step = &plan.steps[idx];
        let step_id = step.id.clone();
        warn!(run_id = %run_id, step_id = %step_id, reason = %reason, "Skipping step");
        let cause = ErrorDetail::new(ErrorKind::StepExecutionFailed, reason.clone());
        let result = StepResult::skipped(step, cause.clone());
        self.event_bus
            .publish(WorkflowEvent::StepSkipped {
                run_id,
                step_id: step_id.clone(),
                reason,
            })
            .await;
        state.record(idx, result);

        for (skipped, reason) in state.skip_dependents(&step_id, &cause) {
            self.event_bus
                .publish(WorkflowEvent::StepSkipped {
                    run_id,
                    step_id: skipped,
                    reason,
                })
                .await;
        }
    }

    async fn complete_step(
        &self,
        run_id: RunId,
        state: &mut RunState<'_>,
        idx: usize,
        result: StepResult,
    ) {
        let step_id = result.step_id.clone();

        if result.is_success() {
            self.event_bus
                .publish(WorkflowEvent::StepSucceeded {
                    run_id,
                    step_id: step_id.clone(),
                    service: result
                        .service
                        .clone()
                        .unwrap_or_else(|| state.plan.steps[idx].service.clone()),
                    duration: result.latency,
                    attempts: result.attempts,
                })
                .await;
            for (name, value) in &result.values {
                state.pool.insert(name.clone(), value.clone());
            }
            state.record(idx, result);
            state.unlock_dependents(&step_id);
            return;
        }

        let cause = result.error.clone().unwrap_or_else(|| {
            ErrorDetail::new(ErrorKind::StepExecutionFailed, "step failed without detail")
        });
        self.event_bus
            .publish(WorkflowEvent::StepFailed {
                run_id,
                step_id: step_id.clone(),
                error: cause.to_string(),
            })
            .await;
        state.record(idx, result);

        for (skipped, reason) in state.skip_dependents(&step_id, &cause) {
            self.event_bus
                .publish(WorkflowEvent::StepSkipped {
                    run_id,
                    step_id: skipped,
                    reason,
                })
                .await;
        }
    }

    fn aggregate(
        run_id: RunId,
        plan: &ExecutionPlan,
        state: RunState<'_>,
        planning_errors: Vec<(String, PlanningError)>,
    ) -> WorkflowResult {
        let RunState { pool, results, .. } = state;

        let mut outputs = Map::new();
        for name in &plan.passthrough {
            if let Some(v) = pool.get(name) {
                outputs.insert(name.clone(), v.clone());
            }
        }
        for result in results.values().filter(|r| r.is_success()) {
            for (name, value) in &result.values {
                outputs.insert(name.clone(), value.clone());
            }
        }

        let planning: HashMap<String, PlanningError> = planning_errors.into_iter().collect();
        let mut output_errors = BTreeMap::new();
        let mut produced = 0usize;
        let mut all_unplannable = true;
        let mut first_planning_error = None;

        for name in &plan.desired {
            if outputs.contains_key(name) {
                produced += 1;
                all_unplannable = false;
                continue;
            }
            if let Some(err) = planning.get(name) {
                if first_planning_error.is_none() {
                    first_planning_error = Some(err.detail());
                }
                output_errors.insert(name.clone(), err.detail());
                continue;
            }
            all_unplannable = false;

            let producer = plan
                .steps
                .iter()
                .find(|s| s.contract.produces(name))
                .and_then(|s| results.get(&s.id));
            let detail = match producer.and_then(|r| r.error.clone()) {
                Some(detail) => detail,
                None => ErrorDetail::new(
                    ErrorKind::StepExecutionFailed,
                    format!("response did not include '{name}'"),
                ),
            };
            output_errors.insert(name.clone(), detail);
        }

        let status = WorkflowStatus::from_counts(produced, plan.desired.len());
        let error = match (status, all_unplannable) {
            (WorkflowStatus::Failed, true) => first_planning_error,
            _ => None,
        };

        WorkflowResult {
            run_id,
            status,
            outputs,
            steps: results,
            output_errors,
            error,
        }
    }
}
