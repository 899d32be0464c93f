//! Inference backends
//!
//! Every remote service is reached through an [`InferenceBackend`]. The
//! executor never talks to the network directly; it only sees classified
//! [`BackendError`]s and JSON payloads.

pub mod http;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

pub use self::http::HttpBackend;
use crate::core::{
    capability::{Capability, ServiceId},
    retry::is_retryable_status,
};

/// One remote call: bound input values plus the context they were bound for
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub service: ServiceId,
    pub capability: Capability,
    /// Output the caller expects the call to produce
    pub output: String,
    pub inputs: Map<String, Value>,
}

/// Classified failure of a remote call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Service returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Request rejected: {message}")]
    Rejected { message: String },

    #[error("Request cancelled")]
    Cancelled,
}

impl BackendError {
    /// Transient errors are retried against the same service
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Timeout { .. } | BackendError::Connection { .. } => true,
            BackendError::Status { status, .. } => is_retryable_status(*status),
            BackendError::MalformedResponse { .. }
            | BackendError::Rejected { .. }
            | BackendError::Cancelled => false,
        }
    }

    /// Whether another service offering the same capability may succeed
    /// where this one failed. Caller errors (4xx, rejected input) would fail
    /// the same way anywhere.
    pub fn allows_failover(&self) -> bool {
        match self {
            BackendError::MalformedResponse { .. } => true,
            BackendError::Cancelled | BackendError::Rejected { .. } => false,
            other => other.is_transient(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A remote inference service
#[async_trait]
pub trait InferenceBackend: Send + Sync + fmt::Debug {
    /// Perform one call. Retries and timeouts are applied by the caller.
    async fn invoke(&self, request: InferenceRequest) -> Result<Map<String, Value>, BackendError>;

    /// Probe reachability. Backends without a probe endpoint report healthy.
    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backends bound to registered service identifiers
#[derive(Debug, Default, Clone)]
pub struct BackendPool {
    backends: Arc<DashMap<ServiceId, Arc<dyn InferenceBackend>>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, id: ServiceId, backend: Arc<dyn InferenceBackend>) {
        self.backends.insert(id, backend);
    }

    pub fn get(&self, id: &ServiceId) -> Option<Arc<dyn InferenceBackend>> {
        self.backends.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every binding, safe to hold across awaits
    pub fn entries(&self) -> Vec<(ServiceId, Arc<dyn InferenceBackend>)> {
        self.backends
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
