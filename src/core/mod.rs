//! Core registry, retry and health components

pub mod capability;
pub mod error;
pub mod health;
pub mod registry;
pub mod retry;

pub use capability::{Capability, ServiceDescriptor, ServiceId, ServiceStatus};
pub use error::{RegistryError, RegistryResult};
pub use health::{HealthCheckConfig, HealthMonitor, HealthProbeHandle, HealthReporter};
pub use registry::{CapabilityRegistry, PreferenceStrategy};
pub use retry::{
    is_retryable_status, BackoffCalculator, MaxRetriesExceeded, RetryConfig, RetryExecutor,
};
