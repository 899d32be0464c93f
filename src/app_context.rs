//! Wiring from [`OrchestratorConfig`] to a running orchestrator

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    backend::{http::HttpBackend, BackendError, BackendPool},
    catalog::{CatalogError, ContractCatalog, SharedCatalog},
    config::{ConfigError, OrchestratorConfig},
    core::{
        capability::ServiceId, CapabilityRegistry, HealthMonitor, HealthProbeHandle,
        RegistryError,
    },
    workflow::{EventBus, LoggingSubscriber, StepExecutor, WorkflowEngine, WorkflowPlanner},
};

#[derive(Debug, thiserror::Error)]
pub enum AppContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Failed to create backend for service '{service}': {source}")]
    Backend {
        service: String,
        #[source]
        source: BackendError,
    },
}

#[derive(Clone)]
pub struct AppContext {
    pub config: OrchestratorConfig,
    pub registry: Arc<CapabilityRegistry>,
    pub backends: BackendPool,
    pub catalog: Arc<SharedCatalog>,
    pub planner: Arc<WorkflowPlanner>,
    pub health: Arc<HealthMonitor>,
    pub engine: Arc<WorkflowEngine>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("services", &self.registry.len())
            .field("contracts", &self.catalog.load().len())
            .field("backends", &self.backends.len())
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Build every component from a validated configuration. Services with an
    /// endpoint get an [`HttpBackend`] bound.
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self, AppContextError> {
        config.validate()?;

        let registry = Arc::new(CapabilityRegistry::with_strategy(config.preference));
        let backends = BackendPool::new();

        for service in &config.services {
            registry.register(service.descriptor())?;
            if let Some(endpoint) = &service.endpoint {
                let backend =
                    HttpBackend::from_endpoint(endpoint).map_err(|source| {
                        AppContextError::Backend {
                            service: service.id.clone(),
                            source,
                        }
                    })?;
                debug!(service_id = %service.id, url = backend.invoke_url(), "Bound HTTP backend");
                backends.bind(ServiceId::new(service.id.as_str()), Arc::new(backend));
            }
        }

        let catalog = Arc::new(SharedCatalog::new(ContractCatalog::new(
            config.contracts.clone(),
        )?));
        let planner = Arc::new(WorkflowPlanner::new(catalog.clone(), registry.clone()));
        let executor = Arc::new(StepExecutor::new(registry.clone(), backends.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            config.health_check.clone(),
        ));

        let event_bus = Arc::new(EventBus::new());
        event_bus.subscribe(Arc::new(LoggingSubscriber)).await;

        let engine = Arc::new(
            WorkflowEngine::new(planner.clone(), executor, config.engine.clone())
                .with_event_bus(event_bus)
                .with_health_reporter(health.clone()),
        );

        info!(
            services = registry.len(),
            contracts = catalog.load().len(),
            backends = backends.len(),
            preference = ?config.preference,
            "Orchestrator initialized"
        );

        Ok(Self {
            config,
            registry,
            backends,
            catalog,
            planner,
            health,
            engine,
        })
    }

    /// Start the periodic probe task when enabled in configuration
    pub fn start_health_probe(&self) -> Option<HealthProbeHandle> {
        if !self.config.health_check.enabled {
            return None;
        }
        Some(self.health.start(self.backends.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::StepContract,
        config::{EndpointConfig, ServiceConfig},
        core::capability::{Capability, ServiceStatus},
    };

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            services: vec![
                ServiceConfig {
                    id: "whisper".to_string(),
                    capabilities: vec!["speech-to-text".to_string()],
                    weight: 1,
                    initial_status: ServiceStatus::Available,
                    endpoint: Some(EndpointConfig::new("http://127.0.0.1:9")),
                },
                ServiceConfig {
                    id: "offline".to_string(),
                    capabilities: vec!["summarize".to_string()],
                    weight: 1,
                    initial_status: ServiceStatus::Unavailable,
                    endpoint: None,
                },
            ],
            contracts: vec![
                StepContract::new("transcription", "speech-to-text", &["audio_url"]),
                StepContract::new("summary", "summarize", &["transcription"]),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_from_config() {
        let ctx = AppContext::from_config(config()).await.unwrap();
        assert_eq!(ctx.registry.len(), 2);
        assert_eq!(ctx.backends.len(), 1);
        assert_eq!(ctx.catalog.load().len(), 2);
        assert_eq!(
            ctx.registry.services_for(&Capability::new("speech-to-text")).len(),
            1
        );
        assert!(ctx
            .registry
            .services_for(&Capability::new("summarize"))
            .is_empty());
        assert!(ctx.start_health_probe().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.engine.max_concurrency = 0;
        assert!(matches!(
            AppContext::from_config(cfg).await,
            Err(AppContextError::Config(_))
        ));
    }
}
