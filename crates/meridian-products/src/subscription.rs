//! Operator subscriptions for product operators

use async_trait::async_trait;
use meridian_common::crd::Phase;
use meridian_common::kube_utils::{INSTALLATION_LABEL, PRODUCT_LABEL};
use meridian_common::store::ObjectKey;
use meridian_common::{ReconcileContext, Result};
use meridian_engine::{ConvergenceApplier, ReadinessGate, StatusConvention};
use tracing::debug;

/// apiVersion of catalog Subscription objects
pub const SUBSCRIPTION_API_VERSION: &str = "operators.coreos.com/v1alpha1";

/// Catalog channel every product follows
pub const DEFAULT_CHANNEL: &str = "rhmi";

/// Catalog source serving the product packages
pub const DEFAULT_CATALOG_SOURCE: &str = "rhmi-registry-cs";

/// What to subscribe to and where
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionTarget {
    /// Package name in the catalog
    pub package: String,
    /// Channel to follow
    pub channel: String,
    /// Namespace the product operator is installed into
    pub namespace: String,
    /// Product the subscription belongs to
    pub product: String,
    /// Installation the subscription belongs to
    pub installation: String,
}

impl SubscriptionTarget {
    /// Target on the default channel
    pub fn new(
        product: impl Into<String>,
        package: impl Into<String>,
        namespace: impl Into<String>,
        installation: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            namespace: namespace.into(),
            product: product.into(),
            installation: installation.into(),
        }
    }

    /// Name of the Subscription object
    pub fn name(&self) -> String {
        format!("rhmi-{}", self.product)
    }

    /// Store key of the Subscription object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(
            SUBSCRIPTION_API_VERSION,
            "Subscription",
            self.namespace.clone(),
            self.name(),
        )
    }
}

/// Installs a product operator from the catalog
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionInstaller: Send + Sync {
    /// Ensure the subscription exists and report how far the install got
    async fn install(&self, ctx: &ReconcileContext, target: &SubscriptionTarget) -> Result<Phase>;
}

/// Applies a Subscription object and gates on its reported state
pub struct StoreSubscriptionInstaller {
    applier: ConvergenceApplier,
    gate: ReadinessGate,
    catalog_source: String,
    catalog_namespace: String,
}

impl StoreSubscriptionInstaller {
    /// Installer pulling packages from `catalog_namespace`
    pub fn new(applier: ConvergenceApplier, catalog_namespace: impl Into<String>) -> Self {
        let gate = ReadinessGate::with_convention(
            applier.store().clone(),
            StatusConvention::new("state", "AtLatestKnown", "Failed"),
        );
        Self {
            applier,
            gate,
            catalog_source: DEFAULT_CATALOG_SOURCE.to_string(),
            catalog_namespace: catalog_namespace.into(),
        }
    }
}

#[async_trait]
impl SubscriptionInstaller for StoreSubscriptionInstaller {
    async fn install(&self, ctx: &ReconcileContext, target: &SubscriptionTarget) -> Result<Phase> {
        let key = target.key();
        let source = self.catalog_source.clone();
        let source_namespace = self.catalog_namespace.clone();
        self.applier
            .apply_with(ctx, &key, |sub| {
                let labels = sub.metadata.labels.get_or_insert_with(Default::default);
                labels.insert(INSTALLATION_LABEL.to_string(), target.installation.clone());
                labels.insert(PRODUCT_LABEL.to_string(), target.product.clone());
                sub.data["spec"] = serde_json::json!({
                    "name": target.package,
                    "channel": target.channel,
                    "source": source,
                    "sourceNamespace": source_namespace,
                    "installPlanApproval": "Automatic",
                });
                Ok(())
            })
            .await?;

        let phase = self.gate.check_key(ctx, &key).await?.phase;
        debug!(subscription = %key, %phase, "Subscription checked");
        Ok(phase)
    }
}
