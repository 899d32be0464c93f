//! Capability workflow planning and execution

mod engine;
mod event;
mod executor;
pub mod normalize;
mod planner;
pub mod types;

pub use engine::{EngineConfig, PlanningMode, WorkflowEngine};
pub use event::{EventBus, EventSubscriber, LoggingSubscriber, WorkflowEvent};
pub use executor::{ExecutionPolicy, StepExecutor};
pub use planner::{ExplicitStep, PlanOutcome, PlanningError, WorkflowPlanner};
pub use types::*;
