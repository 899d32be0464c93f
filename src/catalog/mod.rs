//! Step contract catalog
//!
//! Immutable once built. Every construction path validates the contracts
//! (unique producers, no dependency cycles); hot reload goes through
//! [`SharedCatalog::swap`], which validates before replacing the active
//! catalog so readers never observe an invalid one.

pub mod contract;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::info;

pub use self::contract::{ResponseMapping, StepContract};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("No contract produces output '{name}'")]
    NotFound { name: String },

    #[error("Output '{name}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        name: String,
        first: String,
        second: String,
    },

    #[error("Contract dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Invalid contract '{output}': {reason}")]
    InvalidContract { output: String, reason: String },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Default)]
pub struct ContractCatalog {
    /// Declaration order
    contracts: Vec<Arc<StepContract>>,
    /// Every produced name (primary or additional) -> contract index
    by_output: HashMap<String, usize>,
}

impl ContractCatalog {
    pub fn new(contracts: Vec<StepContract>) -> CatalogResult<Self> {
        let catalog = Self::build_index(contracts)?;
        catalog.check_acyclic()?;
        Ok(catalog)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    fn build_index(contracts: Vec<StepContract>) -> CatalogResult<Self> {
        let mut by_output = HashMap::new();

        for (idx, contract) in contracts.iter().enumerate() {
            if contract.output.trim().is_empty() {
                return Err(CatalogError::InvalidContract {
                    output: contract.output.clone(),
                    reason: "output name must not be empty".to_string(),
                });
            }
            if contract.capability.as_str().trim().is_empty() {
                return Err(CatalogError::InvalidContract {
                    output: contract.output.clone(),
                    reason: "capability must not be empty".to_string(),
                });
            }
            if let Some(input) = contract.inputs.iter().find(|i| i.trim().is_empty()) {
                return Err(CatalogError::InvalidContract {
                    output: contract.output.clone(),
                    reason: format!("input name '{input}' must not be empty"),
                });
            }

            let mut seen_here = HashSet::new();
            for name in contract.produced_outputs() {
                if !seen_here.insert(name) {
                    return Err(CatalogError::InvalidContract {
                        output: contract.output.clone(),
                        reason: format!("output '{name}' declared twice"),
                    });
                }
                if let Some(&other) = by_output.get(name) {
                    let first: &StepContract = &contracts[other];
                    return Err(CatalogError::DuplicateProducer {
                        name: name.to_string(),
                        first: first.output.clone(),
                        second: contract.output.clone(),
                    });
                }
                by_output.insert(name.to_string(), idx);
            }
        }

        Ok(Self {
            contracts: contracts.into_iter().map(Arc::new).collect(),
            by_output,
        })
    }

    /// Reject catalogs where a contract transitively consumes its own output
    fn check_acyclic(&self) -> CatalogResult<()> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for idx in 0..self.contracts.len() {
            if !visited.contains(&idx) {
                if let Some(path) = self.find_cycle(idx, &mut visited, &mut stack) {
                    return Err(CatalogError::Cycle { path });
                }
            }
        }
        Ok(())
    }

    /// DFS over producer edges; returns the cycle as output names
    fn find_cycle(
        &self,
        idx: usize,
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|&i| i == idx) {
            let mut path: Vec<String> = stack[pos..]
                .iter()
                .map(|&i| self.contracts[i].output.clone())
                .collect();
            path.push(self.contracts[idx].output.clone());
            return Some(path);
        }
        if visited.contains(&idx) {
            return None;
        }

        visited.insert(idx);
        stack.push(idx);

        for input in &self.contracts[idx].inputs {
            if let Some(&producer) = self.by_output.get(input) {
                if let Some(path) = self.find_cycle(producer, visited, stack) {
                    return Some(path);
                }
            }
        }

        stack.pop();
        None
    }

    /// Contract producing `name`, as primary or additional output
    pub fn contract_for(&self, name: &str) -> CatalogResult<Arc<StepContract>> {
        self.lookup(name)
            .map(|(_, contract)| contract)
            .ok_or_else(|| CatalogError::NotFound {
                name: name.to_string(),
            })
    }

    /// Contract producing `name` together with its declaration index
    pub fn lookup(&self, name: &str) -> Option<(usize, Arc<StepContract>)> {
        self.by_output
            .get(name)
            .map(|&idx| (idx, Arc::clone(&self.contracts[idx])))
    }

    pub fn contract_at(&self, idx: usize) -> Option<Arc<StepContract>> {
        self.contracts.get(idx).cloned()
    }

    /// All contracts in declaration order
    pub fn all_contracts(&self) -> Vec<Arc<StepContract>> {
        self.contracts.clone()
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Build without the cycle check, to exercise the planner's own detection
    #[cfg(test)]
    pub(crate) fn new_unchecked(contracts: Vec<StepContract>) -> CatalogResult<Self> {
        Self::build_index(contracts)
    }
}

/// Atomically swappable handle to the active catalog
#[derive(Debug, Default)]
pub struct SharedCatalog {
    active: RwLock<Arc<ContractCatalog>>,
}

impl SharedCatalog {
    pub fn new(catalog: ContractCatalog) -> Self {
        Self {
            active: RwLock::new(Arc::new(catalog)),
        }
    }

    /// Snapshot of the active catalog; stays valid across a concurrent swap
    pub fn load(&self) -> Arc<ContractCatalog> {
        Arc::clone(&self.active.read())
    }

    /// Validate `contracts` and make them the active catalog. On error the
    /// active catalog is left untouched.
    pub fn swap(&self, contracts: Vec<StepContract>) -> CatalogResult<()> {
        let next = Arc::new(ContractCatalog::new(contracts)?);
        let count = next.len();
        *self.active.write() = next;
        info!(contracts = count, "Contract catalog swapped");
        Ok(())
    }
}
