//! Per-run record of every directory call and its outcome

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use http::{Method, StatusCode};
use meridian_common::metrics::{self, IdentityActionSample};
use opentelemetry::metrics::ObservableGauge;

/// One attempted call against the target directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    /// Account the call was for
    pub username: String,
    /// Kind of call
    pub method: Method,
    /// What the directory answered, or 503 when it could not be reached
    pub status: StatusCode,
}

type Actions = Arc<Mutex<Vec<Action>>>;

fn lock(actions: &Mutex<Vec<Action>>) -> MutexGuard<'_, Vec<Action>> {
    actions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gauge samples for the current run, one per account and verb
fn samples(actions: &Mutex<Vec<Action>>) -> Vec<IdentityActionSample> {
    lock(actions)
        .iter()
        .map(|a| IdentityActionSample {
            username: a.username.clone(),
            method: a.method.to_string(),
            code: a.status.as_u16(),
        })
        .collect()
}

/// Collects actions for one sync run and exports them as the identity
/// action gauge. A reset clears both.
pub struct ActionRecorder {
    actions: Actions,
    _gauge: ObservableGauge<u64>,
}

impl ActionRecorder {
    /// Create an empty recorder and register its gauge
    pub fn new() -> Self {
        let actions: Actions = Arc::default();
        let observed = Arc::clone(&actions);
        Self {
            _gauge: metrics::observe_identity_actions(move || samples(&observed)),
            actions,
        }
    }

    /// Forget the previous run
    pub fn reset(&self) {
        lock(&self.actions).clear();
    }

    /// Record one call
    pub fn record(&self, username: &str, method: Method, status: StatusCode) {
        lock(&self.actions).push(Action {
            username: username.to_string(),
            method,
            status,
        });
    }

    /// Every call recorded since the last reset, in order
    pub fn actions(&self) -> Vec<Action> {
        lock(&self.actions).clone()
    }

    /// Calls that did not succeed
    pub fn failures(&self) -> Vec<Action> {
        lock(&self.actions)
            .iter()
            .filter(|a| !a.status.is_success())
            .cloned()
            .collect()
    }
}

impl Default for ActionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRecorder")
            .field("actions", &*lock(&self.actions))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_starts_a_fresh_run() {
        let recorder = ActionRecorder::new();
        recorder.record("alice", Method::POST, StatusCode::CREATED);
        recorder.record("bob", Method::DELETE, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(recorder.actions().len(), 2);
        assert_eq!(recorder.failures()[0].username, "bob");

        recorder.reset();
        assert!(recorder.actions().is_empty());
    }

    /// Story: an account refused in one run and gone from the next stops
    /// being exported once the next run starts
    #[test]
    fn story_exported_samples_follow_the_latest_run() {
        let recorder = ActionRecorder::new();
        recorder.record("erin", Method::POST, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            samples(&recorder.actions),
            vec![IdentityActionSample {
                username: "erin".to_string(),
                method: "POST".to_string(),
                code: 422,
            }]
        );

        recorder.reset();
        recorder.record("frank", Method::POST, StatusCode::CREATED);
        let exported = samples(&recorder.actions);
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].username, "frank");
        assert_eq!(exported[0].code, 201);
    }
}
