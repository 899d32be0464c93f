//! Core workflow types: plans, step results and the response envelope

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::engine::{EngineConfig, PlanningMode};
use crate::{
    backend::BackendError,
    catalog::StepContract,
    core::{capability::ServiceId, retry::RetryConfig},
};

/// Unique identifier for a plan step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier of the planned step producing `output`
    pub fn for_output(output: &str) -> Self {
        Self(format!("produce_{output}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a bound input value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "step", rename_all = "snake_case")]
pub enum InputSource {
    Caller,
    Step(StepId),
}

/// Binds a value in the run's pool to a request parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    /// Key in the resolved-values pool
    pub name: String,
    /// Key in the outbound request
    pub param: String,
    pub source: InputSource,
}

impl InputBinding {
    pub fn same_name(name: &str, source: InputSource) -> Self {
        Self {
            name: name.to_string(),
            param: name.to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub id: StepId,
    pub contract: Arc<StepContract>,
    pub service: ServiceId,
    pub bindings: Vec<InputBinding>,
    /// Literal request parameters merged under the bound inputs
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    pub depends_on: Vec<StepId>,
    /// Store the whole payload under the primary output when the response
    /// lacks it
    #[serde(skip)]
    pub whole_payload_fallback: bool,
}

impl PlanStep {
    pub fn output(&self) -> &str {
        &self.contract.output
    }
}

/// Topologically ordered steps for one request
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    /// Desired outputs satisfied directly by caller inputs
    pub passthrough: Vec<String>,
    /// Desired outputs, deduplicated, in request order
    pub desired: Vec<String>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, id: &StepId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn step_ids(&self) -> Vec<&StepId> {
        self.steps.iter().map(|s| &s.id).collect()
    }

    /// Reverse dependency map: step -> indices of steps that depend on it
    pub fn reverse_dependencies(&self) -> HashMap<StepId, Vec<usize>> {
        let mut reverse: HashMap<StepId, Vec<usize>> = HashMap::new();
        for (idx, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                reverse.entry(dep.clone()).or_default().push(idx);
            }
        }
        reverse
    }

    /// Every step appears after all the steps it depends on
    pub fn is_topologically_ordered(&self) -> bool {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !step.depends_on.iter().all(|d| seen.contains(d)) {
                return false;
            }
            seen.insert(&step.id);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnplannableOutput,
    CyclicDependency,
    NoCapableService,
    StepExecutionFailed,
    PreconditionFailed,
    DeadlineExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::UnplannableOutput => "unplannable_output",
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::NoCapableService => "no_capable_service",
            ErrorKind::StepExecutionFailed => "step_execution_failed",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
        };
        f.write_str(s)
    }
}

/// Request-level failure carried as data in results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub output: String,
    pub outcome: StepOutcome,
    /// Produced values, output name -> value
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(rename = "latency_ms", with = "duration_ms")]
    pub latency: Duration,
    /// Remote attempts across every service tried
    #[serde(default)]
    pub attempts: u32,
    /// Service that produced the values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceId>,
    /// Service-side failures seen along the way, relayed to health monitoring
    #[serde(skip)]
    pub service_failures: Vec<(ServiceId, BackendError)>,
}

impl StepResult {
    pub fn success(step: &PlanStep, service: ServiceId, values: Map<String, Value>) -> Self {
        Self {
            step_id: step.id.clone(),
            output: step.output().to_string(),
            outcome: StepOutcome::Success,
            values,
            error: None,
            latency: Duration::ZERO,
            attempts: 0,
            service: Some(service),
            service_failures: Vec::new(),
        }
    }

    pub fn failed(step: &PlanStep, error: ErrorDetail) -> Self {
        Self {
            step_id: step.id.clone(),
            output: step.output().to_string(),
            outcome: StepOutcome::Failed,
            values: Map::new(),
            error: Some(error),
            latency: Duration::ZERO,
            attempts: 0,
            service: None,
            service_failures: Vec::new(),
        }
    }

    pub fn skipped(step: &PlanStep, error: ErrorDetail) -> Self {
        Self {
            outcome: StepOutcome::Skipped,
            ..Self::failed(step, error)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StepOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Partial,
    Failed,
}

impl WorkflowStatus {
    /// Status from how many desired outputs were produced
    pub fn from_counts(produced: usize, desired: usize) -> Self {
        if produced == desired {
            WorkflowStatus::Completed
        } else if produced == 0 {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Partial
        }
    }
}

/// Response envelope returned by every engine run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub status: WorkflowStatus,
    /// Every produced output plus passed-through desired outputs
    pub outputs: Map<String, Value>,
    pub steps: BTreeMap<StepId, StepResult>,
    /// Why each missing desired output was not produced
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_errors: BTreeMap<String, ErrorDetail>,
    /// Run-level failure (planning)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl WorkflowResult {
    /// Planning failed: nothing executed, no outputs
    pub fn planning_failed(run_id: RunId, error: ErrorDetail) -> Self {
        Self {
            run_id,
            status: WorkflowStatus::Failed,
            outputs: Map::new(),
            steps: BTreeMap::new(),
            output_errors: BTreeMap::new(),
            error: Some(error),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.get(&StepId::new(id))
    }
}

/// Phases of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Planning,
    Executing,
    Aggregating,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Planning => "planning",
            RunPhase::Executing => "executing",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Per-request overrides of the engine defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Overall run deadline
    pub timeout_ms: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub retry_policy: Option<RetryConfig>,
    /// Per-step call timeout
    pub step_timeout_ms: Option<u64>,
    pub planning_mode: Option<PlanningMode>,
}

/// Effective settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub deadline: Duration,
    pub step_timeout: Duration,
    pub max_concurrency: usize,
    pub retry: RetryConfig,
    pub grace_period: Duration,
    pub planning_mode: PlanningMode,
}

impl RunSettings {
    pub fn resolve(defaults: &EngineConfig, request: Option<&RequestConfig>) -> Self {
        let request = request.cloned().unwrap_or_default();
        Self {
            deadline: Duration::from_millis(request.timeout_ms.unwrap_or(defaults.run_timeout_ms)),
            step_timeout: Duration::from_millis(
                request.step_timeout_ms.unwrap_or(defaults.step_timeout_ms),
            ),
            max_concurrency: request
                .max_concurrency
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            retry: request.retry_policy.unwrap_or_else(|| defaults.retry.clone()),
            grace_period: Duration::from_millis(defaults.grace_period_ms),
            planning_mode: request.planning_mode.unwrap_or(defaults.planning_mode),
        }
    }
}
