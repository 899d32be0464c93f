//! Workflow planner
//!
//! Backward-chains from the desired outputs through the contract catalog,
//! resolves a service per step and orders the result topologically. Ties are
//! broken by contract declaration order so identical inputs always produce
//! identical plans.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::types::{
    ErrorDetail, ErrorKind, ExecutionPlan, InputBinding, InputSource, PlanStep, StepId,
};
use crate::{
    catalog::{ContractCatalog, SharedCatalog, StepContract},
    core::{
        capability::{Capability, ServiceId},
        registry::CapabilityRegistry,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("No contract produces output '{name}'")]
    UnplannableOutput { name: String },

    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("No available service offers capability '{capability}' required for '{output}'")]
    NoCapableService { capability: Capability, output: String },

    #[error("Invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },
}

impl PlanningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanningError::UnplannableOutput { .. } | PlanningError::InvalidStep { .. } => {
                ErrorKind::UnplannableOutput
            }
            PlanningError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            PlanningError::NoCapableService { .. } => ErrorKind::NoCapableService,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

/// Best-effort planning result
#[derive(Debug, Clone, Default)]
pub struct PlanOutcome {
    /// Plan covering every plannable desired output
    pub plan: ExecutionPlan,
    /// Unplannable desired outputs, in request order
    pub errors: Vec<(String, PlanningError)>,
}

/// A caller-specified step for explicit workflows.
///
/// String parameters of the form `$name` reference a caller input or the
/// output of an earlier step; every other parameter is passed literally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplicitStep {
    pub id: String,
    pub capability: Capability,
    #[serde(default)]
    pub service: Option<ServiceId>,
    pub output: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug)]
pub struct WorkflowPlanner {
    catalog: Arc<SharedCatalog>,
    registry: Arc<CapabilityRegistry>,
}

/// Per-request planning scratch state
struct PlanningPass<'a> {
    catalog: &'a ContractCatalog,
    registry: &'a CapabilityRegistry,
    available: &'a HashSet<String>,
    /// Service chosen per capability, resolved once per request
    services: HashMap<Capability, Option<ServiceId>>,
}

impl PlanningPass<'_> {
    /// DFS from `name`, collecting producer contract indices into `closure`
    fn collect(
        &self,
        name: &str,
        pending: &mut Vec<(usize, String)>,
        closure: &mut BTreeSet<usize>,
    ) -> Result<(), PlanningError> {
        if self.available.contains(name) {
            return Ok(());
        }

        let (idx, contract) =
            self.catalog
                .lookup(name)
                .ok_or_else(|| PlanningError::UnplannableOutput {
                    name: name.to_string(),
                })?;

        if closure.contains(&idx) {
            return Ok(());
        }
        if let Some(pos) = pending.iter().position(|(i, _)| *i == idx) {
            let mut path: Vec<String> = pending[pos..].iter().map(|(_, n)| n.clone()).collect();
            path.push(name.to_string());
            return Err(PlanningError::CyclicDependency { path });
        }

        pending.push((idx, name.to_string()));
        for input in &contract.inputs {
            self.collect(input, pending, closure)?;
        }
        pending.pop();

        closure.insert(idx);
        Ok(())
    }

    fn resolve_service(&mut self, contract: &StepContract) -> Result<ServiceId, PlanningError> {
        let registry = self.registry;
        self.services
            .entry(contract.capability.clone())
            .or_insert_with(|| {
                registry
                    .services_for(&contract.capability)
                    .into_iter()
                    .next()
                    .map(|d| d.id)
            })
            .clone()
            .ok_or_else(|| PlanningError::NoCapableService {
                capability: contract.capability.clone(),
                output: contract.output.clone(),
            })
    }
}

impl WorkflowPlanner {
    pub fn new(catalog: Arc<SharedCatalog>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<SharedCatalog> {
        &self.catalog
    }

    /// Plan every desired output or fail on the first one that cannot be planned
    pub fn plan(
        &self,
        available: &HashSet<String>,
        desired: &[String],
    ) -> Result<ExecutionPlan, PlanningError> {
        let outcome = self.plan_best_effort(available, desired);
        match outcome.errors.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(outcome.plan),
        }
    }

    /// Plan each desired output independently. Outputs that cannot be planned
    /// are reported in [`PlanOutcome::errors`]; the plan covers the rest.
    pub fn plan_best_effort(&self, available: &HashSet<String>, desired: &[String]) -> PlanOutcome {
        let catalog = self.catalog.load();
        let mut pass = PlanningPass {
            catalog: &catalog,
            registry: &self.registry,
            available,
            services: HashMap::new(),
        };

        let mut seen = HashSet::new();
        let desired: Vec<String> = desired
            .iter()
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect();

        let mut passthrough = Vec::new();
        let mut errors = Vec::new();
        let mut selected: BTreeSet<usize> = BTreeSet::new();
        let mut chosen: HashMap<usize, ServiceId> = HashMap::new();

        for output in &desired {
            if available.contains(output) {
                passthrough.push(output.clone());
                continue;
            }

            let mut closure = BTreeSet::new();
            let mut pending = Vec::new();
            if let Err(err) = pass.collect(output, &mut pending, &mut closure) {
                debug!(output = %output, error = %err, "Output cannot be planned");
                errors.push((output.clone(), err));
                continue;
            }

            let mut resolved = Vec::with_capacity(closure.len());
            let mut failure = None;
            for &idx in &closure {
                let Some(contract) = catalog.contract_at(idx) else {
                    continue;
                };
                match pass.resolve_service(&contract) {
                    Ok(service) => resolved.push((idx, service)),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            match failure {
                Some(err) => {
                    debug!(output = %output, error = %err, "Output cannot be planned");
                    errors.push((output.clone(), err));
                }
                None => {
                    selected.extend(closure);
                    chosen.extend(resolved);
                }
            }
        }

        let steps = Self::order_steps(&catalog, available, &selected, &chosen);
        debug!(
            steps = steps.len(),
            passthrough = passthrough.len(),
            unplannable = errors.len(),
            "Plan built"
        );

        PlanOutcome {
            plan: ExecutionPlan {
                steps,
                passthrough,
                desired,
            },
            errors,
        }
    }

    /// Kahn's algorithm over the selected contracts, smallest declaration
    /// index first among ready contracts.
    fn order_steps(
        catalog: &ContractCatalog,
        available: &HashSet<String>,
        selected: &BTreeSet<usize>,
        chosen: &HashMap<usize, ServiceId>,
    ) -> Vec<PlanStep> {
        let contracts = catalog.all_contracts();

        // producer index for each non-available input, restricted to the selection
        let producer_of = |input: &str| -> Option<usize> {
            if available.contains(input) {
                return None;
            }
            catalog
                .lookup(input)
                .map(|(idx, _)| idx)
                .filter(|idx| selected.contains(idx))
        };

        let mut in_degree: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &idx in selected {
            let deps: BTreeSet<usize> = contracts[idx]
                .inputs
                .iter()
                .filter_map(|i| producer_of(i))
                .collect();
            in_degree.insert(idx, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&idx, _)| idx)
            .collect();
        let mut steps = Vec::with_capacity(selected.len());

        while let Some(idx) = ready.pop_first() {
            let contract = &contracts[idx];
            let Some(service) = chosen.get(&idx).cloned() else {
                continue;
            };

            let mut bindings = Vec::with_capacity(contract.inputs.len());
            let mut depends_on: Vec<StepId> = Vec::new();
            for input in &contract.inputs {
                let source = match producer_of(input) {
                    Some(p) => {
                        let step_id = StepId::for_output(&contracts[p].output);
                        if !depends_on.contains(&step_id) {
                            depends_on.push(step_id.clone());
                        }
                        InputSource::Step(step_id)
                    }
                    None => InputSource::Caller,
                };
                bindings.push(InputBinding::same_name(input, source));
            }

            steps.push(PlanStep {
                id: StepId::for_output(&contract.output),
                contract: Arc::clone(contract),
                service,
                bindings,
                parameters: Map::new(),
                depends_on,
                whole_payload_fallback: false,
            });

            if let Some(children) = dependents.get(&idx) {
                for child in children {
                    if let Some(deg) = in_degree.get_mut(child) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(*child);
                        }
                    }
                }
            }
        }

        steps
    }

    /// Validate and bind a caller-specified step list
    pub fn plan_explicit(
        &self,
        available: &HashSet<String>,
        steps: &[ExplicitStep],
    ) -> Result<ExecutionPlan, PlanningError> {
        let mut produced: HashMap<String, StepId> = HashMap::new();
        let mut step_ids: HashSet<&str> = HashSet::new();
        let mut planned = Vec::with_capacity(steps.len());

        for step in steps {
            if step.id.trim().is_empty() || !step_ids.insert(step.id.as_str()) {
                return Err(PlanningError::InvalidStep {
                    step: step.id.clone(),
                    reason: "step id must be non-empty and unique".to_string(),
                });
            }
            if step.output.trim().is_empty() || produced.contains_key(&step.output) {
                return Err(PlanningError::InvalidStep {
                    step: step.id.clone(),
                    reason: format!("output '{}' must be non-empty and unique", step.output),
                });
            }

            let mut bindings = Vec::new();
            let mut parameters = Map::new();
            let mut depends_on: Vec<StepId> = Vec::new();
            for (param, value) in &step.parameters {
                match value.as_str().and_then(|s| s.strip_prefix('$')) {
                    Some(name) => {
                        let source = if let Some(producer) = produced.get(name) {
                            if !depends_on.contains(producer) {
                                depends_on.push(producer.clone());
                            }
                            InputSource::Step(producer.clone())
                        } else if available.contains(name) {
                            InputSource::Caller
                        } else {
                            return Err(PlanningError::UnplannableOutput {
                                name: name.to_string(),
                            });
                        };
                        bindings.push(InputBinding {
                            name: name.to_string(),
                            param: param.clone(),
                            source,
                        });
                    }
                    None => {
                        parameters.insert(param.clone(), value.clone());
                    }
                }
            }

            let service = self.resolve_explicit_service(step)?;
            let inputs: Vec<&str> = bindings.iter().map(|b| b.name.as_str()).collect();
            let id = StepId::new(step.id.clone());
            produced.insert(step.output.clone(), id.clone());

            planned.push(PlanStep {
                id,
                contract: Arc::new(StepContract::new(
                    step.output.clone(),
                    step.capability.as_str(),
                    &inputs,
                )),
                service,
                bindings,
                parameters,
                depends_on,
                whole_payload_fallback: true,
            });
        }

        Ok(ExecutionPlan {
            desired: steps.iter().map(|s| s.output.clone()).collect(),
            steps: planned,
            passthrough: Vec::new(),
        })
    }

    fn resolve_explicit_service(&self, step: &ExplicitStep) -> Result<ServiceId, PlanningError> {
        let no_service = || PlanningError::NoCapableService {
            capability: step.capability.clone(),
            output: step.output.clone(),
        };

        match &step.service {
            Some(pinned) => {
                let desc = self.registry.get(pinned).ok_or_else(no_service)?;
                if desc.status.is_selectable() && desc.offers(&step.capability) {
                    Ok(desc.id)
                } else {
                    Err(no_service())
                }
            }
            None => self
                .registry
                .services_for(&step.capability)
                .into_iter()
                .next()
                .map(|d| d.id)
                .ok_or_else(no_service),
        }
    }
}
