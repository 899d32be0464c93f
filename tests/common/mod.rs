// Shared helpers for integration tests
#![allow(dead_code)]

pub mod mock_service;

use std::sync::Arc;

use capability_orchestrator::{
    backend::{BackendPool, InferenceBackend},
    catalog::{ContractCatalog, SharedCatalog, StepContract},
    core::{
        Capability, CapabilityRegistry, HealthCheckConfig, HealthMonitor, PreferenceStrategy,
        RetryConfig, ServiceDescriptor, ServiceId, ServiceStatus,
    },
    workflow::{EngineConfig, StepExecutor, WorkflowEngine, WorkflowPlanner},
};
use serde_json::{Map, Value};

/// The speech-to-text / summarization / note-generation catalog used across tests
pub fn scribe_contracts() -> Vec<StepContract> {
    vec![
        StepContract::new("transcription", "speech-to-text", &["audio_url"])
            .with_additional_outputs(&["language"]),
        StepContract::new("summary", "summarize", &["transcription"]),
        StepContract::new("soap_note", "soap-generation", &["transcription"]),
        StepContract::new("insights", "reasoning", &["summary", "soap_note"]),
    ]
}

/// Engine defaults with millisecond backoff so retry tests stay fast
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        step_timeout_ms: 2_000,
        run_timeout_ms: 10_000,
        grace_period_ms: 100,
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        ..Default::default()
    }
}

pub struct TestOrchestrator {
    pub registry: Arc<CapabilityRegistry>,
    pub backends: BackendPool,
    pub catalog: Arc<SharedCatalog>,
    pub planner: Arc<WorkflowPlanner>,
    pub health: Arc<HealthMonitor>,
    pub engine: WorkflowEngine,
}

pub struct TestOrchestratorBuilder {
    services: Vec<(ServiceDescriptor, Option<Arc<dyn InferenceBackend>>)>,
    contracts: Vec<StepContract>,
    config: EngineConfig,
    strategy: PreferenceStrategy,
    health: HealthCheckConfig,
}

impl TestOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            contracts: scribe_contracts(),
            config: fast_engine_config(),
            strategy: PreferenceStrategy::default(),
            health: HealthCheckConfig::default(),
        }
    }

    /// Register an available service bound to `backend`
    pub fn service(
        mut self,
        id: &str,
        capabilities: &[&str],
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        let descriptor = ServiceDescriptor::new(
            id,
            capabilities.iter().map(|c| Capability::new(*c)).collect(),
        )
        .with_status(ServiceStatus::Available);
        self.services.push((descriptor, Some(backend)));
        self
    }

    /// Register `descriptor` bound to `backend`
    pub fn bound(mut self, descriptor: ServiceDescriptor, backend: Arc<dyn InferenceBackend>) -> Self {
        self.services.push((descriptor, Some(backend)));
        self
    }

    /// Register a service with an explicit descriptor and no backend
    pub fn descriptor(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push((descriptor, None));
        self
    }

    pub fn contracts(mut self, contracts: Vec<StepContract>) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strategy(mut self, strategy: PreferenceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn health(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> TestOrchestrator {
        let registry = Arc::new(CapabilityRegistry::with_strategy(self.strategy));
        let backends = BackendPool::new();
        for (descriptor, backend) in self.services {
            let id: ServiceId = descriptor.id.clone();
            registry.register(descriptor).unwrap();
            if let Some(backend) = backend {
                backends.bind(id, backend);
            }
        }

        let catalog = Arc::new(SharedCatalog::new(
            ContractCatalog::new(self.contracts).unwrap(),
        ));
        let planner = Arc::new(WorkflowPlanner::new(catalog.clone(), registry.clone()));
        let executor = Arc::new(StepExecutor::new(registry.clone(), backends.clone()));
        let health = Arc::new(HealthMonitor::new(registry.clone(), self.health));
        let engine = WorkflowEngine::new(planner.clone(), executor, self.config)
            .with_health_reporter(health.clone());

        TestOrchestrator {
            registry,
            backends,
            catalog,
            planner,
            health,
            engine,
        }
    }
}

impl Default for TestOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

pub fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}
