//! Error types for the capability registry

use super::capability::ServiceId;

/// Registry-related errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Service not found: {id}")]
    ServiceNotFound { id: ServiceId },

    #[error("Invalid service descriptor for {id}: {reason}")]
    InvalidDescriptor { id: ServiceId, reason: String },
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
