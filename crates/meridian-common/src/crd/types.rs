//! Supporting types for the Installation CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Convergence status returned by every step and by the top-level reconcile.
///
/// `Completed` is the only phase under which a sequence advances. Every
/// other value ends the current invocation so the scheduler re-invokes later.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Work was issued and is still converging
    #[default]
    #[serde(rename = "in progress")]
    InProgress,
    /// Everything this step owns has converged
    #[serde(rename = "completed")]
    Completed,
    /// The step failed for this cycle
    #[serde(rename = "failed")]
    Failed,
    /// Waiting on a dependent resource owned by another controller
    #[serde(rename = "awaiting components")]
    AwaitingComponents,
    /// Dependent components were (re)started and are coming up
    #[serde(rename = "creating components")]
    CreatingComponents,
}

impl Phase {
    /// True only for `Completed`
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// True for phases that end convergence for this cycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::AwaitingComponents => write!(f, "awaiting components"),
            Self::CreatingComponents => write!(f, "creating components"),
        }
    }
}

/// Installation flavour, affects sizing and identity behaviour
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallationType {
    /// Managed installation with restricted administrator access
    #[default]
    Managed,
    /// Workshop installation where every user is an administrator
    Workshop,
}

impl InstallationType {
    /// Open installations grant elevated roles to every synced account
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Workshop)
    }
}

impl std::fmt::Display for InstallationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::Workshop => write!(f, "workshop"),
        }
    }
}

/// Status of a condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition on the Installation status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same type, status, reason and message, ignoring the timestamp
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}
