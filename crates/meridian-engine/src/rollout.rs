//! Workload rollouts: restarting stalled components and waiting for replicas

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use meridian_common::crd::Phase;
use meridian_common::store::{ObjectKey, ResourceStore};
use meridian_common::{ReconcileContext, Result};
use tracing::{debug, info};

use crate::applier::ConvergenceApplier;
use crate::readiness::{rollout_state, RolloutState};

/// Pod template annotation bumped to force a new rollout
pub const RESTARTED_AT_ANNOTATION: &str = "meridian.dev/restartedAt";

/// Starts a fresh rollout of a workload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RolloutTrigger: Send + Sync {
    /// Request a new rollout of the workload at `key`
    async fn rollout(&self, ctx: &ReconcileContext, key: &ObjectKey) -> Result<()>;
}

/// Triggers rollouts by stamping the pod template, like `kubectl rollout restart`
pub struct RestartAnnotationTrigger {
    applier: ConvergenceApplier,
}

impl RestartAnnotationTrigger {
    /// Create a trigger writing through the given applier
    pub fn new(applier: ConvergenceApplier) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl RolloutTrigger for RestartAnnotationTrigger {
    async fn rollout(&self, ctx: &ReconcileContext, key: &ObjectKey) -> Result<()> {
        if ctx.guard("store.get", self.applier.store().get(key)).await?.is_none() {
            return Err(key.not_found());
        }
        let now = Utc::now().to_rfc3339();
        self.applier
            .apply_with(ctx, key, move |obj| {
                obj.data["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION] =
                    serde_json::json!(now);
                Ok(())
            })
            .await?;
        info!(workload = %key, "Triggered rollout");
        Ok(())
    }
}

/// Gate on a set of workloads.
///
/// Any stalled workload is restarted and `CreatingComponents` is returned.
/// Otherwise `InProgress` while replicas are still coming up. A workload
/// that does not exist yet is `AwaitingComponents`.
pub async fn await_rollouts(
    ctx: &ReconcileContext,
    store: &Arc<dyn ResourceStore>,
    trigger: &dyn RolloutTrigger,
    workloads: &[ObjectKey],
) -> Result<Phase> {
    let mut states = Vec::with_capacity(workloads.len());
    for key in workloads {
        match ctx.guard("store.get", store.get(key)).await? {
            Some(obj) => states.push((key, rollout_state(&obj))),
            None => {
                debug!(workload = %key, "Workload not found yet");
                return Ok(Phase::AwaitingComponents);
            }
        }
    }

    for (key, state) in &states {
        if *state == RolloutState::Stalled {
            trigger.rollout(ctx, key).await?;
            return Ok(Phase::CreatingComponents);
        }
    }

    if let Some((key, _)) = states
        .iter()
        .find(|(_, state)| *state == RolloutState::Progressing)
    {
        debug!(workload = %key, "Waiting for replicas");
        return Ok(Phase::InProgress);
    }

    Ok(Phase::Completed)
}
