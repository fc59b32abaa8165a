//! Explicit configuration passed into controllers at construction time

use std::time::Duration;

use crate::crd::{Installation, Phase};

/// Default domain used to build finalizer markers
pub const DEFAULT_DOMAIN: &str = "meridian.dev";

/// Delay before the scheduler re-invokes reconcile, by outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// After every product reported `Completed`
    pub completed: Duration,
    /// After any non-terminal phase
    pub in_progress: Duration,
    /// After `Failed` or an error
    pub failed: Duration,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            completed: Duration::from_secs(60),
            in_progress: Duration::from_secs(10),
            failed: Duration::from_secs(30),
        }
    }
}

impl RequeuePolicy {
    /// Next invocation delay for a phase
    pub fn after(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Completed => self.completed,
            Phase::Failed => self.failed,
            Phase::InProgress | Phase::AwaitingComponents | Phase::CreatingComponents => {
                self.in_progress
            }
        }
    }
}

/// Operator-wide settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Domain suffix for finalizer markers and labels
    pub domain: String,
    /// Budget for one reconcile invocation, `None` for unbounded
    pub reconcile_timeout: Option<Duration>,
    /// Scheduler requeue delays
    pub requeue: RequeuePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            reconcile_timeout: Some(Duration::from_secs(120)),
            requeue: RequeuePolicy::default(),
        }
    }
}

/// Settings for one product controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductConfig {
    /// Namespace the product is installed into
    pub namespace: String,
    /// Namespace the product's own operator runs in
    pub operator_namespace: String,
    /// Product version being installed
    pub version: String,
    /// Version of the product's operator
    pub operator_version: String,
}

impl ProductConfig {
    /// Namespaces derived from the Installation prefix and a product suffix
    pub fn for_installation(
        installation: &Installation,
        suffix: &str,
        version: &str,
        operator_version: &str,
    ) -> Self {
        let namespace = installation.product_namespace(suffix);
        Self {
            operator_namespace: format!("{namespace}-operator"),
            namespace,
            version: version.to_string(),
            operator_version: operator_version.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{InstallationSpec, InstallationType};

    #[test]
    fn requeue_delay_follows_phase() {
        let policy = RequeuePolicy::default();
        assert_eq!(policy.after(Phase::Completed), Duration::from_secs(60));
        assert_eq!(policy.after(Phase::AwaitingComponents), Duration::from_secs(10));
        assert_eq!(policy.after(Phase::Failed), Duration::from_secs(30));
    }

    #[test]
    fn product_namespaces_derive_from_prefix() {
        let inst = Installation::new(
            "rhmi",
            InstallationSpec {
                installation_type: InstallationType::Managed,
                namespace_prefix: "redhat-rhmi-".to_string(),
                smtp_secret: None,
                routing_subdomain: None,
            },
        );
        let cfg = ProductConfig::for_installation(&inst, "3scale", "2.8", "0.5.0");
        assert_eq!(cfg.namespace, "redhat-rhmi-3scale");
        assert_eq!(cfg.operator_namespace, "redhat-rhmi-3scale-operator");
    }
}
