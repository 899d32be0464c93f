use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ConfigResult, ConfigValidator};
use crate::{
    catalog::StepContract,
    core::{
        capability::{Capability, ServiceDescriptor, ServiceStatus},
        HealthCheckConfig, PreferenceStrategy,
    },
    workflow::EngineConfig,
};

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub services: Vec<ServiceConfig>,
    /// Declaration order is the planner's tie-break order
    pub contracts: Vec<StepContract>,
    pub engine: EngineConfig,
    pub preference: PreferenceStrategy,
    pub health_check: HealthCheckConfig,
}

impl OrchestratorConfig {
    /// Load and validate a YAML (or JSON) file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ValidationFailed {
                reason: format!("Failed to read config from {}: {}", path.display(), e),
            })?;
        Self::from_yaml_str(&contents).map_err(|e| match e {
            ConfigError::ValidationFailed { reason } => ConfigError::ValidationFailed {
                reason: format!("{}: {}", path.display(), reason),
            },
            other => other,
        })
    }

    pub fn from_yaml_str(contents: &str) -> ConfigResult<Self> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::ValidationFailed {
                reason: format!("Failed to parse config: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ConfigValidator::validate(self)
    }
}

fn default_weight() -> u32 {
    1
}

fn default_initial_status() -> ServiceStatus {
    ServiceStatus::Available
}

/// One inference service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Statically configured services are trusted until the health monitor says otherwise
    #[serde(default = "default_initial_status")]
    pub initial_status: ServiceStatus,
    /// Services without an endpoint are registered but have no backend bound
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,
}

impl ServiceConfig {
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(
            self.id.clone(),
            self.capabilities
                .iter()
                .map(|c| Capability::new(c.as_str()))
                .collect(),
        )
        .with_status(self.initial_status)
        .with_weight(self.weight)
    }
}

fn default_invoke_path() -> String {
    "/runsync".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_endpoint_timeout_secs() -> u64 {
    60
}

/// HTTP job endpoint of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_invoke_path")]
    pub path: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Environment variable holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_endpoint_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            path: default_invoke_path(),
            health_path: default_health_path(),
            api_key_env: None,
            timeout_secs: default_endpoint_timeout_secs(),
        }
    }
}
