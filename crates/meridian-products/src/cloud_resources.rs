//! Cloud resources: the operator that fulfils data-store claims for the
//! other products

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use meridian_common::config::ProductConfig;
use meridian_common::crd::{Installation, Phase};
use meridian_common::ReconcileContext;
use meridian_engine::{Engine, ProductController, StepResult, StepSequencer};
use tracing::info;

use crate::claims::{await_claims_removed, reconcile_claim, Claim, ClaimKind};
use crate::namespace_labels;
use crate::subscription::{SubscriptionInstaller, SubscriptionTarget};

/// Product name and namespace suffix
pub const PRODUCT: &str = "cloud-resources";
const PACKAGE: &str = "integreatly-cloud-resources";
const VERSION: &str = "0.23.0";
const OPERATOR_VERSION: &str = "0.23.0";
const BACKUP_CLAIM_PREFIX: &str = "backups-blobstorage-";

/// Installs the cloud resources operator and owns claim teardown
pub struct CloudResources {
    engine: Engine,
    subscriptions: Arc<dyn SubscriptionInstaller>,
}

impl CloudResources {
    /// Controller over the shared engine
    pub fn new(engine: Engine, subscriptions: Arc<dyn SubscriptionInstaller>) -> Self {
        Self {
            engine,
            subscriptions,
        }
    }

    fn config(installation: &Installation) -> ProductConfig {
        ProductConfig::for_installation(installation, PRODUCT, VERSION, OPERATOR_VERSION)
    }

    /// Every claim has to be gone before the operator that fulfils them is
    /// removed, or cloud resources would be orphaned
    async fn teardown(&self, ctx: &ReconcileContext, installation: &Installation) -> StepResult {
        let claims_namespace = installation.namespace().unwrap_or_default();
        let phase = await_claims_removed(ctx, &self.engine, &claims_namespace).await?;
        if !phase.is_completed() {
            return Ok(phase);
        }
        let config = Self::config(installation);
        Ok(self.engine.applier.remove_namespace(ctx, &config.namespace).await?)
    }
}

#[async_trait]
impl ProductController for CloudResources {
    fn name(&self) -> &str {
        PRODUCT
    }

    fn version(&self) -> Option<String> {
        Some(VERSION.to_string())
    }

    async fn reconcile(&self, ctx: &ReconcileContext, installation: &Installation) -> StepResult {
        if installation.is_deleting() {
            return self
                .engine
                .finalizers
                .run_teardown(ctx, installation, PRODUCT, || self.teardown(ctx, installation))
                .await;
        }

        let config = Self::config(installation);
        let labels = namespace_labels(installation, PRODUCT);
        let target = SubscriptionTarget::new(
            PRODUCT,
            PACKAGE,
            config.namespace.clone(),
            installation.name_any(),
        );
        let backups = Claim::for_installation(ClaimKind::BlobStorage, BACKUP_CLAIM_PREFIX, PRODUCT, installation);

        let phase = StepSequencer::new(PRODUCT)
            .step("namespace", async {
                Ok(self.engine.applier.ensure_namespace(ctx, &config.namespace, &labels).await?)
            })
            .step("subscription", async {
                Ok(self.subscriptions.install(ctx, &target).await?)
            })
            .step("backup storage", async {
                Ok(reconcile_claim(ctx, &self.engine, installation, &backups).await?.phase)
            })
            .run()
            .await?;

        if phase.is_completed() {
            info!(product = PRODUCT, "Reconciled successfully");
        }
        Ok(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::MockSubscriptionInstaller;
    use crate::testing::installation;
    use meridian_common::crd::InstallationType;
    use meridian_common::kube_utils::empty_object;
    use meridian_common::store::{MemoryStore, ObjectKey, ResourceStore};

    fn controller(store: Arc<MemoryStore>, subscription_phase: Phase) -> CloudResources {
        let mut subs = MockSubscriptionInstaller::new();
        subs.expect_install()
            .returning(move |_, _| Ok(subscription_phase));
        CloudResources::new(Engine::new(store, "meridian.dev"), Arc::new(subs))
    }

    fn seed_installation(store: &MemoryStore) -> ObjectKey {
        let inst = installation(InstallationType::Managed);
        store.seed(inst.to_dynamic().expect("encode")).expect("seed");
        inst.key()
    }

    async fn load(store: &MemoryStore, key: &ObjectKey) -> Installation {
        Installation::from_dynamic(&store.object(key).expect("installation")).expect("decode")
    }

    #[tokio::test]
    async fn story_install_waits_for_subscription_then_backup_claim() {
        let store = Arc::new(MemoryStore::new());
        let key = seed_installation(&store);
        let ctx = ReconcileContext::new();

        let pending = controller(store.clone(), Phase::AwaitingComponents);
        let phase = pending.reconcile(&ctx, &load(&store, &key).await).await.expect("reconcile");
        assert_eq!(phase, Phase::AwaitingComponents);
        assert!(store.contains(&ObjectKey::namespace("redhat-rhmi-cloud-resources")));

        let ready = controller(store.clone(), Phase::Completed);
        let phase = ready.reconcile(&ctx, &load(&store, &key).await).await.expect("reconcile");
        assert_eq!(phase, Phase::AwaitingComponents);
        let claim = ObjectKey::namespaced(
            "integreatly.org/v1alpha1",
            "BlobStorage",
            "redhat-rhmi-operator",
            "backups-blobstorage-rhmi",
        );
        assert!(store.contains(&claim));

        store
            .set_status(&claim, serde_json::json!({"phase": "complete"}))
            .expect("status");
        let phase = ready.reconcile(&ctx, &load(&store, &key).await).await.expect("reconcile");
        assert_eq!(phase, Phase::Completed);
    }

    /// Story: the namespace is only removed once every claim is gone
    #[tokio::test]
    async fn story_teardown_waits_for_claims() {
        let store = Arc::new(MemoryStore::new());
        let key = seed_installation(&store);
        let ctx = ReconcileContext::new();
        let cr = controller(store.clone(), Phase::Completed);
        cr.engine
            .finalizers
            .register(&ctx, &load(&store, &key).await, PRODUCT)
            .await
            .expect("register");
        cr.engine
            .applier
            .ensure_namespace(&ctx, "redhat-rhmi-cloud-resources", &Default::default())
            .await
            .expect("namespace");
        let redis = empty_object(
            "integreatly.org/v1alpha1",
            "Redis",
            Some("redhat-rhmi-operator"),
            "threescale-redis-rhmi",
        );
        let redis_key = ObjectKey::of(&redis).expect("key");
        store.seed(redis).expect("seed");
        store.delete(&key).await.expect("request teardown");

        let phase = cr.reconcile(&ctx, &load(&store, &key).await).await.expect("teardown");
        assert_eq!(phase, Phase::InProgress);
        assert!(store.contains(&ObjectKey::namespace("redhat-rhmi-cloud-resources")));

        store.purge(&redis_key);
        let phase = cr.reconcile(&ctx, &load(&store, &key).await).await.expect("teardown");
        assert_eq!(phase, Phase::InProgress, "namespace deletion requested");
        assert!(!store.contains(&ObjectKey::namespace("redhat-rhmi-cloud-resources")));

        let phase = cr.reconcile(&ctx, &load(&store, &key).await).await.expect("teardown");
        assert_eq!(phase, Phase::Completed);
        assert!(!store.contains(&key));
    }
}
