//! Idempotent create-or-mutate primitive used by every step

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use meridian_common::crd::Phase;
use meridian_common::kube_utils::empty_object;
use meridian_common::store::{ObjectKey, ResourceStore};
use meridian_common::{Error, ReconcileContext, Result};
use tracing::{debug, info};

/// What [`ConvergenceApplier::apply_with`] did to the stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object did not exist and was created
    Created,
    /// The mutation changed the object and it was written back
    Updated,
    /// The mutation produced the object already stored; nothing was written
    Unchanged,
}

impl ApplyOutcome {
    /// True if any field differed from the prior object
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Create-or-mutate against the Resource Store.
///
/// Only the desired-spec fragment and metadata are ever written. The
/// observed-status fragment of a fetched object is carried through untouched.
#[derive(Clone)]
pub struct ConvergenceApplier {
    store: Arc<dyn ResourceStore>,
}

fn strip_status(obj: &mut DynamicObject) {
    if let Some(map) = obj.data.as_object_mut() {
        map.remove("status");
    }
}

impl ConvergenceApplier {
    /// Create an applier over a store
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Create `obj` if it does not exist.
    ///
    /// Returns `true` when created and `false` when an object with the same
    /// identity already exists. Any other store error is returned unchanged.
    pub async fn apply(&self, ctx: &ReconcileContext, obj: &DynamicObject) -> Result<bool> {
        let key = ObjectKey::of(obj)?;
        let mut desired = obj.clone();
        strip_status(&mut desired);
        match ctx.guard("store.create", self.store.create(&desired)).await {
            Ok(_) => {
                info!(object = %key, "Created object");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                debug!(object = %key, "Object already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch-or-initialize the object at `key`, apply `mutate`, and write the
    /// result back only if it differs from what is stored.
    pub async fn apply_with<F>(
        &self,
        ctx: &ReconcileContext,
        key: &ObjectKey,
        mutate: F,
    ) -> Result<ApplyOutcome>
    where
        F: FnOnce(&mut DynamicObject) -> Result<()> + Send,
    {
        let current = ctx.guard("store.get", self.store.get(key)).await?;

        let Some(current) = current else {
            let mut desired = empty_object(
                &key.api_version,
                &key.kind,
                key.namespace.as_deref(),
                &key.name,
            );
            mutate(&mut desired)?;
            strip_status(&mut desired);
            return match ctx.guard("store.create", self.store.create(&desired)).await {
                Ok(_) => {
                    info!(object = %key, "Created object");
                    Ok(ApplyOutcome::Created)
                }
                // Someone else created it between our read and write.
                Err(e) if e.is_already_exists() => Err(Error::conflict(
                    &key.kind,
                    key.namespaced_name(),
                    "created concurrently",
                )),
                Err(e) => Err(e),
            };
        };

        let mut desired = current.clone();
        mutate(&mut desired)?;

        // Identity, version and observed status are not the mutation's to change.
        desired.types = current.types.clone();
        desired.metadata.name = current.metadata.name.clone();
        desired.metadata.namespace = current.metadata.namespace.clone();
        desired.metadata.resource_version = current.metadata.resource_version.clone();
        match current.data.get("status") {
            Some(status) => desired.data["status"] = status.clone(),
            None => strip_status(&mut desired),
        }

        if desired.metadata == current.metadata && desired.data == current.data {
            debug!(object = %key, "Object unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        ctx.guard("store.update", self.store.update(&desired)).await?;
        info!(object = %key, "Updated object");
        Ok(ApplyOutcome::Updated)
    }

    /// Ensure a namespace exists and carries `labels`.
    ///
    /// A namespace that is still terminating from an earlier teardown reports
    /// `InProgress` until it is gone.
    pub async fn ensure_namespace(
        &self,
        ctx: &ReconcileContext,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Phase> {
        let key = ObjectKey::namespace(name);
        if let Some(existing) = ctx.guard("store.get", self.store.get(&key)).await? {
            if is_terminating(&existing) {
                info!(namespace = %name, "Namespace is terminating, waiting");
                return Ok(Phase::InProgress);
            }
        }

        self.apply_with(ctx, &key, |ns| {
            let current = ns.labels_mut();
            for (k, v) in labels {
                current.insert(k.clone(), v.clone());
            }
            Ok(())
        })
        .await?;
        Ok(Phase::Completed)
    }

    /// Delete a namespace and wait for it to disappear.
    ///
    /// `InProgress` while it exists or terminates, `Completed` once gone.
    pub async fn remove_namespace(&self, ctx: &ReconcileContext, name: &str) -> Result<Phase> {
        let key = ObjectKey::namespace(name);
        let Some(existing) = ctx.guard("store.get", self.store.get(&key)).await? else {
            return Ok(Phase::Completed);
        };
        if is_terminating(&existing) {
            debug!(namespace = %name, "Namespace still terminating");
            return Ok(Phase::InProgress);
        }
        match ctx.guard("store.delete", self.store.delete(&key)).await {
            Ok(()) => {
                info!(namespace = %name, "Deleting namespace");
                Ok(Phase::InProgress)
            }
            Err(e) if e.is_not_found() => Ok(Phase::Completed),
            Err(e) => Err(e),
        }
    }

    /// Copy the payload of a secret to another location.
    ///
    /// Returns `false` without writing when the source does not exist.
    pub async fn copy_secret(
        &self,
        ctx: &ReconcileContext,
        from: &ObjectKey,
        to: &ObjectKey,
    ) -> Result<bool> {
        let Some(source) = ctx.guard("store.get", self.store.get(from)).await? else {
            debug!(secret = %from, "Secret to copy not found");
            return Ok(false);
        };
        let data = source.data.get("data").cloned().unwrap_or_default();
        let type_ = source.data.get("type").cloned();
        self.apply_with(ctx, to, move |secret| {
            secret.data["data"] = data;
            if let Some(t) = type_ {
                secret.data["type"] = t;
            }
            Ok(())
        })
        .await?;
        Ok(true)
    }
}

/// Deletion requested or the namespace reports `Terminating`
fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
        || obj
            .data
            .pointer("/status/phase")
            .and_then(|p| p.as_str())
            .is_some_and(|p| p == "Terminating")
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::store::{ListQuery, MemoryStore, MutationKind};
    use mockall::mock;

    mock! {
        pub Store {}

        #[async_trait::async_trait]
        impl ResourceStore for Store {
            async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;
            async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>>;
            async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;
            async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;
            async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject>;
            async fn delete(&self, key: &ObjectKey) -> Result<()>;
        }
    }

    fn memory() -> (Arc<MemoryStore>, ConvergenceApplier) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ConvergenceApplier::new(store))
    }

    fn address_plan() -> DynamicObject {
        let mut obj = empty_object(
            "admin.enmasse.io/v1beta2",
            "AddressPlan",
            Some("redhat-rhmi-amq-online"),
            "standard-small-queue",
        );
        obj.data["spec"] = serde_json::json!({"addressType": "queue", "resources": {"broker": 0.01}});
        obj
    }

    fn smtp_key() -> ObjectKey {
        ObjectKey::secret("redhat-rhmi-3scale", "system-smtp")
    }

    fn set_host(host: &'static str) -> impl FnOnce(&mut DynamicObject) -> Result<()> + Send {
        move |secret| {
            secret.data["stringData"] = serde_json::json!({"address": host, "port": "587"});
            Ok(())
        }
    }

    // ==========================================================================
    // Story Tests: create-only apply
    // ==========================================================================

    /// Story: applying the same object twice is a no-op the second time
    #[tokio::test]
    async fn story_apply_twice_creates_once() {
        let (store, applier) = memory();
        let ctx = ReconcileContext::new();

        assert!(applier.apply(&ctx, &address_plan()).await.expect("first"));
        assert!(!applier.apply(&ctx, &address_plan()).await.expect("second"));
        assert_eq!(store.mutation_count(), 1);
    }

    /// Story: store failures other than "already exists" surface unchanged
    #[tokio::test]
    async fn story_other_store_errors_surface_unchanged() {
        let mut mock = MockStore::new();
        mock.expect_create()
            .returning(|_| Err(Error::internal_with_context("store", "etcd unavailable")));
        let applier = ConvergenceApplier::new(Arc::new(mock));

        let err = applier
            .apply(&ReconcileContext::new(), &address_plan())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { ref message, .. } if message == "etcd unavailable"));
    }

    // ==========================================================================
    // Story Tests: mutate-in-place apply
    // ==========================================================================

    /// Story: first apply creates, second identical apply writes nothing,
    /// and a changed input reports `changed` so dependants can roll out
    #[tokio::test]
    async fn story_mutation_reports_changes_only_when_fields_differ() {
        let (store, applier) = memory();
        let ctx = ReconcileContext::new();

        let outcome = applier.apply_with(&ctx, &smtp_key(), set_host("smtp.example.com")).await;
        assert_eq!(outcome.expect("create"), ApplyOutcome::Created);

        let outcome = applier.apply_with(&ctx, &smtp_key(), set_host("smtp.example.com")).await;
        assert_eq!(outcome.expect("noop"), ApplyOutcome::Unchanged);
        assert!(!ApplyOutcome::Unchanged.changed());

        let outcome = applier.apply_with(&ctx, &smtp_key(), set_host("smtp.other.com")).await;
        assert_eq!(outcome.expect("update"), ApplyOutcome::Updated);

        let kinds: Vec<_> = store.mutations().into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Update]);
    }

    /// Story: a mutation that scribbles on status never reaches the store
    #[tokio::test]
    async fn story_mutations_cannot_write_observed_status() {
        let (store, applier) = memory();
        let ctx = ReconcileContext::new();
        let key = ObjectKey::namespaced(
            "integreatly.org/v1alpha1",
            "BlobStorage",
            "redhat-rhmi-operator",
            "threescale-blobstorage-rhmi",
        );
        let mut claim = empty_object(&key.api_version, &key.kind, key.namespace.as_deref(), &key.name);
        claim.data["spec"] = serde_json::json!({"tier": "production"});
        claim.data["status"] = serde_json::json!({"phase": "in progress"});
        store.seed(claim).expect("seed");

        let outcome = applier
            .apply_with(&ctx, &key, |obj| {
                obj.data["status"] = serde_json::json!({"phase": "complete"});
                Ok(())
            })
            .await
            .expect("apply");

        assert_eq!(outcome, ApplyOutcome::Unchanged);
        let stored = store.object(&key).expect("exists");
        assert_eq!(stored.data["status"]["phase"], "in progress");
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn mutation_errors_abort_without_writing() {
        let (store, applier) = memory();
        let err = applier
            .apply_with(&ReconcileContext::new(), &smtp_key(), |_| {
                Err(Error::configuration("3scale", "smtp secret has no host"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert_eq!(store.mutation_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_aborts_before_store_call() {
        let mut mock = MockStore::new();
        mock.expect_get().never();
        let applier = ConvergenceApplier::new(Arc::new(mock));
        let ctx = ReconcileContext::new();
        ctx.cancel();

        let err = applier
            .apply_with(&ctx, &smtp_key(), set_host("smtp.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    // ==========================================================================
    // Namespaces and secrets
    // ==========================================================================

    #[tokio::test]
    async fn story_namespace_lifecycle() {
        let (store, applier) = memory();
        let ctx = ReconcileContext::new();
        let labels = BTreeMap::from([(
            "meridian.dev/installation".to_string(),
            "rhmi".to_string(),
        )]);

        let phase = applier
            .ensure_namespace(&ctx, "redhat-rhmi-3scale", &labels)
            .await
            .expect("ensure");
        assert_eq!(phase, Phase::Completed);
        let ns = store.object(&ObjectKey::namespace("redhat-rhmi-3scale")).expect("ns");
        assert_eq!(ns.labels().get("meridian.dev/installation").map(String::as_str), Some("rhmi"));

        // Remove issues the delete, then reports completion once it is gone
        let phase = applier.remove_namespace(&ctx, "redhat-rhmi-3scale").await.expect("remove");
        assert_eq!(phase, Phase::InProgress);
        let phase = applier.remove_namespace(&ctx, "redhat-rhmi-3scale").await.expect("gone");
        assert_eq!(phase, Phase::Completed);
    }

    #[tokio::test]
    async fn terminating_namespace_blocks_ensure_and_remove() {
        let (store, applier) = memory();
        let ctx = ReconcileContext::new();
        let mut ns = empty_object("v1", "Namespace", None, "redhat-rhmi-amq-online");
        ns.metadata.finalizers = Some(vec!["kubernetes".to_string()]);
        store.seed(ns).expect("seed");
        store
            .delete(&ObjectKey::namespace("redhat-rhmi-amq-online"))
            .await
            .expect("mark terminating");

        let phase = applier
            .ensure_namespace(&ctx, "redhat-rhmi-amq-online", &BTreeMap::new())
            .await
            .expect("ensure");
        assert_eq!(phase, Phase::InProgress);
        let phase = applier
            .remove_namespace(&ctx, "redhat-rhmi-amq-online")
            .await
            .expect("remove");
        assert_eq!(phase, Phase::InProgress);
    }

    #[tokio::test]
    async fn copy_secret_skips_missing_source() {
        let (store, applier) = memory();
        let ctx = ReconcileContext::new();
        let from = ObjectKey::secret("redhat-rhmi-operator", "system-seed");
        let to = ObjectKey::secret("redhat-rhmi-3scale", "system-seed");

        assert!(!applier.copy_secret(&ctx, &from, &to).await.expect("copy"));
        assert_eq!(store.mutation_count(), 0);

        let mut seed = empty_object("v1", "Secret", Some("redhat-rhmi-operator"), "system-seed");
        seed.data["data"] = serde_json::json!({"ADMIN_USER": "YWRtaW4="});
        seed.data["type"] = serde_json::json!("Opaque");
        store.seed(seed).expect("seed");

        assert!(applier.copy_secret(&ctx, &from, &to).await.expect("copy"));
        let copied = store.object(&to).expect("copied");
        assert_eq!(copied.data["data"]["ADMIN_USER"], "YWRtaW4=");
        assert_eq!(copied.data["type"], "Opaque");
    }
}
