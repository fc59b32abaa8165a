//! Readiness gating on resources reconciled by other controllers
//!
//! Gates are polled. A dependant that has not converged yields a non-terminal
//! phase, the step returns it, and the scheduler calls back later. Nothing in
//! here sleeps or waits.

use std::sync::Arc;

use kube::api::DynamicObject;
use meridian_common::crd::Phase;
use meridian_common::store::{ListQuery, ManagedResource, ObjectKey, ResourceStore};
use meridian_common::{ReconcileContext, Result};
use serde_json::Value;
use tracing::{debug, info};

/// Where a dependent resource reports its tri-state completion indicator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusConvention {
    /// Field under `status` holding the indicator
    pub phase_field: String,
    /// Value meaning terminal-complete (compared case-insensitively)
    pub complete: String,
    /// Value meaning terminal-failure (compared case-insensitively)
    pub failed: String,
    /// Field under `status` holding the connection/reference payload
    pub reference_field: String,
}

impl Default for StatusConvention {
    fn default() -> Self {
        Self {
            phase_field: "phase".to_string(),
            complete: "complete".to_string(),
            failed: "failed".to_string(),
            reference_field: "secretRef".to_string(),
        }
    }
}

impl StatusConvention {
    /// Convention with custom indicator values and no reference payload
    pub fn new(phase_field: &str, complete: &str, failed: &str) -> Self {
        Self {
            phase_field: phase_field.to_string(),
            complete: complete.to_string(),
            failed: failed.to_string(),
            reference_field: String::new(),
        }
    }
}

/// Gate decision plus the payload downstream steps consume
#[derive(Clone, Debug, PartialEq)]
pub struct Readiness {
    /// Control-flow decision
    pub phase: Phase,
    /// Connection/reference payload, only present once complete
    pub reference: Option<Value>,
}

impl Readiness {
    fn waiting() -> Self {
        Self {
            phase: Phase::AwaitingComponents,
            reference: None,
        }
    }
}

/// Translates observed status into a phase
#[derive(Clone)]
pub struct ReadinessGate {
    store: Arc<dyn ResourceStore>,
    convention: StatusConvention,
}

impl ReadinessGate {
    /// Gate using the default `status.phase` / `status.secretRef` convention
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self::with_convention(store, StatusConvention::default())
    }

    /// Gate using a custom convention
    pub fn with_convention(store: Arc<dyn ResourceStore>, convention: StatusConvention) -> Self {
        Self { store, convention }
    }

    /// Map an object's observed status to a phase
    pub fn check(&self, resource: &impl ManagedResource) -> Phase {
        self.check_with_reference(resource).phase
    }

    /// Map an object's observed status to a phase and reference payload
    ///
    /// Absent or unrecognised status waits; explicit complete or failed values
    /// are terminal.
    pub fn check_with_reference(&self, resource: &impl ManagedResource) -> Readiness {
        let Some(status) = resource.observed_status() else {
            return Readiness::waiting();
        };
        let Some(indicator) = status.get(&self.convention.phase_field).and_then(Value::as_str)
        else {
            return Readiness::waiting();
        };

        if indicator.eq_ignore_ascii_case(&self.convention.complete) {
            let reference = if self.convention.reference_field.is_empty() {
                None
            } else {
                status
                    .get(&self.convention.reference_field)
                    .filter(|v| !v.is_null())
                    .cloned()
            };
            Readiness {
                phase: Phase::Completed,
                reference,
            }
        } else if indicator.eq_ignore_ascii_case(&self.convention.failed) {
            Readiness {
                phase: Phase::Failed,
                reference: None,
            }
        } else {
            Readiness::waiting()
        }
    }

    /// Fetch an object and gate on it; a missing object waits
    pub async fn check_key(&self, ctx: &ReconcileContext, key: &ObjectKey) -> Result<Readiness> {
        match ctx.guard("store.get", self.store.get(key)).await? {
            Some(obj) => {
                let readiness = self.check_with_reference(&obj);
                debug!(object = %key, phase = %readiness.phase, "Readiness checked");
                Ok(readiness)
            }
            None => {
                debug!(object = %key, "Dependent resource not found yet");
                Ok(Readiness::waiting())
            }
        }
    }

    /// `InProgress` while any object matches the query, `Completed` once none do
    pub async fn await_absence(&self, ctx: &ReconcileContext, query: &ListQuery) -> Result<Phase> {
        let remaining = ctx.guard("store.list", self.store.list(query)).await?;
        if remaining.is_empty() {
            return Ok(Phase::Completed);
        }
        info!(
            kind = %query.kind,
            namespace = query.namespace.as_deref().unwrap_or("*"),
            remaining = remaining.len(),
            "Waiting for dependent resources to be removed"
        );
        Ok(Phase::InProgress)
    }
}

/// Rollout state of a workload object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutState {
    /// Every replica is updated and available
    Ready,
    /// A status condition reports `False`; a restart is needed
    Stalled,
    /// Replicas are still coming up
    Progressing,
}

/// Inspect a workload's status conditions and replica counts
pub fn rollout_state(workload: &DynamicObject) -> RolloutState {
    let status = workload.data.get("status");

    let stalled = status
        .and_then(|s| s.get("conditions"))
        .and_then(Value::as_array)
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.get("status").and_then(Value::as_str) == Some("False"))
        });
    if stalled {
        return RolloutState::Stalled;
    }

    let desired = workload
        .data
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let count = |field: &str| {
        status
            .and_then(|s| s.get(field))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    if count("availableReplicas") < desired || count("updatedReplicas") < desired {
        return RolloutState::Progressing;
    }
    RolloutState::Ready
}
