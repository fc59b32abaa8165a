//! Straight-line step sequencing
//!
//! A product's install is an ordered list of named steps, each returning a
//! [`Phase`]. The sequencer runs them in order and returns the first result
//! that is not `Completed`. Step futures are lazy, so nothing after that step
//! is ever polled; the external scheduler re-invokes the whole sequence and
//! each step's idempotence carries it forward.

use std::future::Future;

use futures::future::BoxFuture;
use meridian_common::crd::Phase;
use meridian_common::error::UNKNOWN_CONTEXT;
use meridian_common::Error;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

/// A failed step: the phase to report plus the underlying error
#[derive(Debug, ThisError)]
#[error("step '{step}' failed ({phase}): {source}")]
pub struct StepError {
    /// Name of the failing step, filled in by the sequencer
    pub step: String,
    /// Phase reported alongside the error
    pub phase: Phase,
    /// The underlying failure, unchanged
    #[source]
    pub source: Error,
}

impl StepError {
    /// A failure reported with phase `Failed`
    pub fn failed(source: Error) -> Self {
        Self::with_phase(Phase::Failed, source)
    }

    /// A failure reported with an explicit phase
    pub fn with_phase(phase: Phase, source: Error) -> Self {
        Self {
            step: UNKNOWN_CONTEXT.to_string(),
            phase,
            source,
        }
    }

    /// Attach the step name unless an inner sequence already did
    pub fn in_step(mut self, step: &str) -> Self {
        if self.step == UNKNOWN_CONTEXT {
            self.step = step.to_string();
        }
        self
    }
}

/// Store conflicts and interrupted calls are reported as still converging;
/// everything else fails the cycle.
impl From<Error> for StepError {
    fn from(source: Error) -> Self {
        let phase = match &source {
            Error::Conflict { .. } | Error::Cancelled { .. } | Error::DeadlineExceeded { .. } => {
                Phase::InProgress
            }
            _ => Phase::Failed,
        };
        Self::with_phase(phase, source)
    }
}

/// Result of a single step or of a whole sequence
pub type StepResult = Result<Phase, StepError>;

/// Ordered list of named steps for one product invocation
pub struct StepSequencer<'a> {
    product: String,
    steps: Vec<(&'static str, BoxFuture<'a, StepResult>)>,
}

impl<'a> StepSequencer<'a> {
    /// Start an empty sequence for a product
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step<F>(mut self, name: &'static str, step: F) -> Self
    where
        F: Future<Output = StepResult> + Send + 'a,
    {
        self.steps.push((name, Box::pin(step)));
        self
    }

    /// Run steps in order, stopping at the first non-`Completed` phase or error
    pub async fn run(self) -> StepResult {
        let product = self.product;
        for (name, step) in self.steps {
            match step.await {
                Ok(Phase::Completed) => {
                    debug!(product = %product, step = name, "Step completed");
                }
                Ok(phase) => {
                    info!(product = %product, step = name, %phase, "Step not yet complete");
                    return Ok(phase);
                }
                Err(e) => {
                    let e = e.in_step(name);
                    warn!(product = %product, step = %e.step, phase = %e.phase, error = %e.source, "Step failed");
                    return Err(e);
                }
            }
        }
        Ok(Phase::Completed)
    }
}
