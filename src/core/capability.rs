//! Capability and service descriptor types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named class of work a service can perform (e.g. `speech-to-text`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for a registered service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Reachability of a service as last observed by health checking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Available,
    Degraded,
    Unavailable,
}

impl ServiceStatus {
    /// Whether a service in this status may be handed out for new work
    pub fn is_selectable(self) -> bool {
        matches!(self, ServiceStatus::Available | ServiceStatus::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Unknown => "unknown",
            ServiceStatus::Available => "available",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_weight() -> u32 {
    1
}

/// Registration record for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub status: ServiceStatus,
    pub last_checked: DateTime<Utc>,
    /// Relative preference used by the weighted ordering strategy
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            id: ServiceId::new(id),
            capabilities,
            status: ServiceStatus::Unknown,
            last_checked: Utc::now(),
            weight: default_weight(),
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn offers(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }
}
