//! Cancellation and deadline threading for one reconcile invocation
//!
//! A [`ReconcileContext`] is created per invocation and passed by reference
//! to every step. Each external call is wrapped in [`ReconcileContext::guard`]
//! so it aborts with `Cancelled` or `DeadlineExceeded` instead of blocking.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Per-invocation cancellation token and optional deadline
#[derive(Clone, Debug)]
pub struct ReconcileContext {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl Default for ReconcileContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileContext {
    /// A context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context whose deadline expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some((Instant::now() + timeout, timeout)),
        }
    }

    /// Derive a context cancelled whenever `parent` is cancelled
    pub fn child_of(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token: parent.child_token(),
            deadline: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    /// Cancel every call guarded by this context
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast if the context is already cancelled or past its deadline
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled {
                context: operation.to_string(),
            });
        }
        if let Some((deadline, timeout)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded {
                    context: operation.to_string(),
                    timeout,
                });
            }
        }
        Ok(())
    }

    /// Run an external call, aborting on cancellation or deadline expiry
    pub async fn guard<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(operation)?;
        match self.deadline {
            Some((deadline, timeout)) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Error::Cancelled {
                        context: operation.to_string(),
                    }),
                    _ = tokio::time::sleep_until(deadline) => Err(Error::DeadlineExceeded {
                        context: operation.to_string(),
                        timeout,
                    }),
                    result = call => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(Error::Cancelled {
                        context: operation.to_string(),
                    }),
                    result = call => result,
                }
            }
        }
    }
}
