use std::collections::HashSet;

use super::*;
use crate::{catalog::ContractCatalog, core::RetryConfig, workflow::EngineConfig};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &OrchestratorConfig) -> ConfigResult<()> {
        Self::validate_services(&config.services)?;
        Self::validate_engine(&config.engine)?;
        Self::validate_retry(&config.engine.retry)?;
        Self::validate_health_check(config)?;
        Self::validate_contracts(config)?;
        Ok(())
    }

    fn validate_services(services: &[ServiceConfig]) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for (idx, service) in services.iter().enumerate() {
            if service.id.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("services[{idx}].id"),
                });
            }
            if !seen.insert(service.id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "services.id".to_string(),
                    value: service.id.clone(),
                    reason: "Duplicate service id".to_string(),
                });
            }
            if service.capabilities.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("services[{}].capabilities", service.id),
                });
            }
            if let Some(cap) = service.capabilities.iter().find(|c| c.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("services[{}].capabilities", service.id),
                    value: cap.clone(),
                    reason: "Capability name must not be empty".to_string(),
                });
            }
            if let Some(endpoint) = &service.endpoint {
                Self::validate_endpoint(&service.id, endpoint)?;
            }
        }
        Ok(())
    }

    fn validate_endpoint(id: &str, endpoint: &EndpointConfig) -> ConfigResult<()> {
        let field = format!("services[{id}].endpoint.url");
        match ::url::Url::parse(&endpoint.url) {
            Ok(parsed) => {
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidValue {
                        field,
                        value: endpoint.url.clone(),
                        reason: "URL scheme must be http or https".to_string(),
                    });
                }
                if parsed.host_str().is_none() {
                    return Err(ConfigError::InvalidValue {
                        field,
                        value: endpoint.url.clone(),
                        reason: "URL must have a valid host".to_string(),
                    });
                }
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    field,
                    value: endpoint.url.clone(),
                    reason: format!("Invalid URL: {e}"),
                });
            }
        }

        for (name, path) in [("path", &endpoint.path), ("health_path", &endpoint.health_path)] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    field: format!("services[{id}].endpoint.{name}"),
                    value: path.clone(),
                    reason: "Must start with '/'".to_string(),
                });
            }
        }

        if endpoint.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("services[{id}].endpoint.timeout_secs"),
                value: "0".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_engine(engine: &EngineConfig) -> ConfigResult<()> {
        if engine.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_concurrency".to_string(),
                value: "0".to_string(),
                reason: "Must be >= 1".to_string(),
            });
        }
        if engine.step_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.step_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if engine.run_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.run_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if engine.run_timeout_ms < engine.step_timeout_ms {
            return Err(ConfigError::IncompatibleConfig {
                reason: format!(
                    "engine.run_timeout_ms ({}) is shorter than engine.step_timeout_ms ({})",
                    engine.run_timeout_ms, engine.step_timeout_ms
                ),
            });
        }
        Ok(())
    }

    fn validate_retry(retry: &RetryConfig) -> ConfigResult<()> {
        if retry.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.retry.initial_backoff_ms".to_string(),
                value: retry.initial_backoff_ms.to_string(),
                reason: "Must be > 0".to_string(),
            });
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "engine.retry.max_backoff_ms".to_string(),
                value: retry.max_backoff_ms.to_string(),
                reason: "Must be >= initial_backoff_ms".to_string(),
            });
        }
        if retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.retry.backoff_multiplier".to_string(),
                value: retry.backoff_multiplier.to_string(),
                reason: "Must be >= 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                field: "engine.retry.jitter_factor".to_string(),
                value: retry.jitter_factor.to_string(),
                reason: "Must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }

    fn validate_health_check(config: &OrchestratorConfig) -> ConfigResult<()> {
        let hc = &config.health_check;
        if hc.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.failure_threshold".to_string(),
                value: "0".to_string(),
                reason: "Must be >= 1".to_string(),
            });
        }
        if hc.success_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check.success_threshold".to_string(),
                value: "0".to_string(),
                reason: "Must be >= 1".to_string(),
            });
        }
        if hc.enabled && (hc.timeout_secs == 0 || hc.check_interval_secs == 0) {
            return Err(ConfigError::InvalidValue {
                field: "health_check".to_string(),
                value: format!(
                    "timeout_secs={}, check_interval_secs={}",
                    hc.timeout_secs, hc.check_interval_secs
                ),
                reason: "Probe timeout and interval must be > 0 when enabled".to_string(),
            });
        }
        if hc.enabled && config.services.iter().all(|s| s.endpoint.is_none()) {
            return Err(ConfigError::IncompatibleConfig {
                reason: "health_check.enabled requires at least one service endpoint"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_contracts(config: &OrchestratorConfig) -> ConfigResult<()> {
        ContractCatalog::new(config.contracts.clone()).map_err(|e| {
            ConfigError::ValidationFailed {
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }
}
