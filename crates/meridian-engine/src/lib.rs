//! Convergence engine for Meridian product controllers
//!
//! Product controllers are composed from a handful of primitives:
//! - [`StepSequencer`] runs named steps in order and stops at the first one
//!   that has not converged
//! - [`ConvergenceApplier`] creates or updates desired objects idempotently
//! - [`ReadinessGate`] maps another controller's status onto a [`Phase`]
//! - [`FinalizerGate`] orders teardown through finalizer markers
//!
//! [`InstallationReconciler`] drives every product for one Installation.
//!
//! [`Phase`]: meridian_common::crd::Phase

#![deny(missing_docs)]

pub mod applier;
pub mod finalizer;
pub mod readiness;
pub mod reconciler;
pub mod rollout;
pub mod step;

use std::sync::Arc;

use meridian_common::store::ResourceStore;

pub use applier::{ApplyOutcome, ConvergenceApplier};
pub use finalizer::FinalizerGate;
pub use readiness::{Readiness, ReadinessGate, RolloutState, StatusConvention};
pub use reconciler::{InstallationReconciler, ProductController};
pub use rollout::{await_rollouts, RestartAnnotationTrigger, RolloutTrigger};
pub use step::{StepError, StepResult, StepSequencer};

/// Engine primitives sharing one Resource Store
#[derive(Clone)]
pub struct Engine {
    /// Idempotent create/update
    pub applier: ConvergenceApplier,
    /// Default `status.phase` readiness gate
    pub readiness: ReadinessGate,
    /// Finalizer marker gate
    pub finalizers: FinalizerGate,
    /// The store everything writes through
    pub store: Arc<dyn ResourceStore>,
}

impl Engine {
    /// Build every primitive over `store`, scoping markers under `domain`
    pub fn new(store: Arc<dyn ResourceStore>, domain: impl Into<String>) -> Self {
        Self {
            applier: ConvergenceApplier::new(store.clone()),
            readiness: ReadinessGate::new(store.clone()),
            finalizers: FinalizerGate::new(store.clone(), domain),
            store,
        }
    }
}
