//! Top-level Installation reconcile
//!
//! Runs every product controller in order, records each product's phase in
//! the Installation status, and returns the first phase that is not
//! `Completed`. During teardown every product gets a chance to run its
//! cleanup in the same invocation, since their markers are independent.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use meridian_common::config::EngineConfig;
use meridian_common::crd::{
    Condition, ConditionStatus, Installation, InstallationStatus, Phase, ProductStatus,
};
use meridian_common::events::{actions, reasons, EventPublisher};
use meridian_common::kube_utils::CONDITION_READY;
use meridian_common::metrics;
use meridian_common::store::{ObjectKey, ResourceStore};
use meridian_common::ReconcileContext;
use tracing::{info, instrument, warn};

use crate::finalizer::FinalizerGate;
use crate::step::{StepError, StepResult};

/// One managed product composed from the engine primitives
#[async_trait]
pub trait ProductController: Send + Sync {
    /// Stable product name, used for the finalizer marker and status key
    fn name(&self) -> &str;

    /// Version the controller installs
    fn version(&self) -> Option<String> {
        None
    }

    /// Externally reachable host, once the product has published one
    fn host(&self) -> Option<String> {
        None
    }

    /// Converge the product for this Installation.
    ///
    /// While the Installation is being deleted this runs the product's
    /// teardown instead of its install steps.
    async fn reconcile(&self, ctx: &ReconcileContext, installation: &Installation) -> StepResult;
}

/// Drives every product for an Installation and records the outcome
pub struct InstallationReconciler {
    store: Arc<dyn ResourceStore>,
    finalizers: FinalizerGate,
    products: Vec<Arc<dyn ProductController>>,
    events: Arc<dyn EventPublisher>,
    config: EngineConfig,
}

impl InstallationReconciler {
    /// Create a reconciler running `products` in the given order
    pub fn new(
        store: Arc<dyn ResourceStore>,
        products: Vec<Arc<dyn ProductController>>,
        events: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            finalizers: FinalizerGate::new(store.clone(), config.domain.clone()),
            store,
            products,
            events,
            config,
        }
    }

    /// Engine-wide configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reconcile the Installation at `key`.
    ///
    /// An Installation that no longer exists is `Completed`.
    #[instrument(skip(self, ctx), fields(installation = %key.namespaced_name()))]
    pub async fn reconcile(&self, ctx: &ReconcileContext, key: &ObjectKey) -> StepResult {
        let started = Instant::now();
        let Some(obj) = ctx.guard("store.get", self.store.get(key)).await? else {
            info!("Installation not found, nothing to do");
            return Ok(Phase::Completed);
        };
        let installation = Installation::from_dynamic(&obj)?;
        let previous = installation.status.clone().unwrap_or_default();
        let deleting = installation.is_deleting();

        if deleting && previous.message.as_deref() != Some(TEARDOWN_MESSAGE) {
            self.publish(
                &installation,
                EventType::Normal,
                reasons::TEARDOWN_STARTED,
                actions::TEARDOWN,
                None,
            )
            .await;
        }

        let mut status = previous.clone();
        let mut outcome: StepResult = Ok(Phase::Completed);

        for product in &self.products {
            if !deleting {
                self.finalizers
                    .register(ctx, &installation, product.name())
                    .await?;
            }

            let result = product.reconcile(ctx, &installation).await;
            let phase = match &result {
                Ok(phase) => *phase,
                Err(e) => e.phase,
            };
            metrics::record_product_phase(product.name(), phase);
            self.record_product(&installation, &previous, &mut status, product.as_ref(), &result)
                .await;

            if outcome_is_settled(&outcome) {
                outcome = result;
            }
            // Install stages gate on each other; teardown visits every product.
            if !deleting && !outcome_is_settled(&outcome) {
                break;
            }
        }

        let phase = match &outcome {
            Ok(phase) => *phase,
            Err(e) => e.phase,
        };
        status.phase = phase;
        status.message = Some(status_message(deleting, &outcome));
        status.observed_generation = installation.metadata.generation;
        set_ready_condition(&mut status, phase, &outcome);

        if deleting && phase.is_completed() {
            // Markers are gone and the record is being removed by the API server.
            metrics::record_reconcile(&installation.name_any(), phase, started.elapsed().as_secs_f64());
            return outcome;
        }

        if status != previous {
            self.write_status(ctx, &installation, status).await?;
            if phase.is_completed() && !previous.phase.is_completed() {
                self.publish(
                    &installation,
                    EventType::Normal,
                    reasons::INSTALLATION_READY,
                    actions::RECONCILE,
                    None,
                )
                .await;
            }
        }

        metrics::record_reconcile(&installation.name_any(), phase, started.elapsed().as_secs_f64());
        outcome
    }

    async fn record_product(
        &self,
        installation: &Installation,
        previous: &InstallationStatus,
        status: &mut InstallationStatus,
        product: &dyn ProductController,
        result: &StepResult,
    ) {
        let name = product.name().to_string();
        let prior = previous.products.get(&name);
        let phase = match result {
            Ok(phase) => *phase,
            Err(e) => e.phase,
        };
        status.products.insert(
            name.clone(),
            ProductStatus {
                phase,
                version: product.version(),
                host: product.host().or_else(|| prior.and_then(|p| p.host.clone())),
            },
        );

        match result {
            Err(e) => {
                metrics::record_step_failure(&name, &e.step);
                self.publish(
                    installation,
                    EventType::Warning,
                    reasons::PRODUCT_FAILED,
                    actions::RECONCILE,
                    Some(format!("{name}: {e}")),
                )
                .await;
            }
            Ok(Phase::Completed) if prior.map(|p| p.phase) != Some(Phase::Completed) => {
                self.publish(
                    installation,
                    EventType::Normal,
                    reasons::PRODUCT_COMPLETED,
                    actions::RECONCILE,
                    Some(format!("{name} is ready")),
                )
                .await;
            }
            Ok(_) => {}
        }
    }

    async fn write_status(
        &self,
        ctx: &ReconcileContext,
        installation: &Installation,
        status: InstallationStatus,
    ) -> Result<(), StepError> {
        let mut updated = installation.clone();
        updated.status = Some(status);
        let obj = updated.to_dynamic()?;
        ctx.guard("store.update_status", self.store.update_status(&obj))
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        installation: &Installation,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let reference = installation.object_ref(&());
        self.events
            .publish(&reference, type_, reason, action, note)
            .await;
    }
}

const TEARDOWN_MESSAGE: &str = "teardown in progress";

/// `Ok(Completed)` means nothing has stopped the run yet
fn outcome_is_settled(outcome: &StepResult) -> bool {
    matches!(outcome, Ok(Phase::Completed))
}

fn status_message(deleting: bool, outcome: &StepResult) -> String {
    match (deleting, outcome) {
        (_, Err(e)) => e.to_string(),
        (true, _) => TEARDOWN_MESSAGE.to_string(),
        (false, Ok(Phase::Completed)) => "all products converged".to_string(),
        (false, Ok(phase)) => format!("installation {phase}"),
    }
}

/// Replace the Ready condition, keeping its timestamp when nothing changed
fn set_ready_condition(status: &mut InstallationStatus, phase: Phase, outcome: &StepResult) {
    let (cond_status, reason) = match outcome {
        Ok(Phase::Completed) => (ConditionStatus::True, "Converged"),
        Ok(_) => (ConditionStatus::False, "Converging"),
        Err(_) => (ConditionStatus::False, "StepFailed"),
    };
    let message = match outcome {
        Err(e) => e.to_string(),
        Ok(_) => format!("phase {phase}"),
    };
    let condition = Condition::new(CONDITION_READY, cond_status, reason, message);

    match status
        .conditions
        .iter_mut()
        .find(|c| c.type_ == CONDITION_READY)
    {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => *existing = condition,
        None => status.conditions.push(condition),
    }
}

impl std::fmt::Debug for InstallationReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.products.iter().map(|p| p.name()).collect();
        f.debug_struct("InstallationReconciler")
            .field("products", &names)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::ConvergenceApplier;
    use crate::step::StepSequencer;
    use meridian_common::crd::{InstallationSpec, InstallationType};
    use meridian_common::events::NoopEventPublisher;
    use meridian_common::store::{MemoryStore, MutationKind};
    use meridian_common::Error;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Product that converges one namespace and one secret, gated on a
    /// claim another controller completes
    struct FakeProduct {
        name: &'static str,
        applier: ConvergenceApplier,
        finalizers: FinalizerGate,
        calls: AtomicUsize,
        fail_with: Mutex<Option<Error>>,
    }

    impl FakeProduct {
        fn new(name: &'static str, store: Arc<dyn ResourceStore>) -> Self {
            Self {
                name,
                applier: ConvergenceApplier::new(store.clone()),
                finalizers: FinalizerGate::new(store, "meridian.dev"),
                calls: AtomicUsize::new(0),
                fail_with: Mutex::new(None),
            }
        }

        fn namespace(&self) -> String {
            format!("redhat-rhmi-{}", self.name)
        }

        async fn ensure_secret(&self, ctx: &ReconcileContext) -> StepResult {
            let injected = self.fail_with.lock().expect("mutex should not be poisoned").take();
            if let Some(err) = injected {
                return Err(StepError::failed(err));
            }
            let key = ObjectKey::secret(self.namespace(), "config");
            self.applier
                .apply_with(ctx, &key, |s| {
                    s.data["stringData"] = serde_json::json!({"mode": "managed"});
                    Ok(())
                })
                .await?;
            Ok(Phase::Completed)
        }
    }

    #[async_trait]
    impl ProductController for FakeProduct {
        fn name(&self) -> &str {
            self.name
        }

        fn version(&self) -> Option<String> {
            Some("1.0".to_string())
        }

        async fn reconcile(&self, ctx: &ReconcileContext, installation: &Installation) -> StepResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if installation.is_deleting() {
                let ns = self.namespace();
                return self
                    .finalizers
                    .run_teardown(ctx, installation, self.name, || async move {
                        Ok(self.applier.remove_namespace(ctx, &ns).await?)
                    })
                    .await;
            }
            let ns = self.namespace();
            StepSequencer::new(self.name)
                .step("namespace", async move {
                    Ok(self.applier.ensure_namespace(ctx, &ns, &BTreeMap::new()).await?)
                })
                .step("secret", self.ensure_secret(ctx))
                .run()
                .await
        }
    }

    fn installation() -> Installation {
        let mut inst = Installation::new(
            "rhmi",
            InstallationSpec {
                installation_type: InstallationType::Managed,
                namespace_prefix: "redhat-rhmi-".to_string(),
                smtp_secret: None,
                routing_subdomain: None,
            },
        );
        inst.metadata.namespace = Some("redhat-rhmi-operator".to_string());
        inst
    }

    struct Harness {
        store: Arc<MemoryStore>,
        products: Vec<Arc<FakeProduct>>,
        reconciler: InstallationReconciler,
        key: ObjectKey,
    }

    fn harness(names: &[&'static str]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let inst = installation();
        store.seed(inst.to_dynamic().expect("encode")).expect("seed");
        let products: Vec<Arc<FakeProduct>> = names
            .iter()
            .map(|n| Arc::new(FakeProduct::new(*n, store.clone())))
            .collect();
        let reconciler = InstallationReconciler::new(
            store.clone(),
            products
                .iter()
                .map(|p| p.clone() as Arc<dyn ProductController>)
                .collect(),
            Arc::new(NoopEventPublisher),
            EngineConfig::default(),
        );
        Harness {
            store,
            products,
            reconciler,
            key: inst.key(),
        }
    }

    fn status(h: &Harness) -> InstallationStatus {
        let obj = h.store.object(&h.key).expect("installation");
        Installation::from_dynamic(&obj)
            .expect("decode")
            .status
            .unwrap_or_default()
    }

    // ==========================================================================
    // Story Tests: Installation lifecycle
    // ==========================================================================

    /// Story: repeated reconciles converge once and then write nothing
    #[tokio::test]
    async fn story_reconcile_is_idempotent() {
        let h = harness(&["amq-online", "3scale"]);
        let ctx = ReconcileContext::new();

        let phase = h.reconciler.reconcile(&ctx, &h.key).await.expect("first");
        assert_eq!(phase, Phase::Completed);
        assert_eq!(status(&h).phase, Phase::Completed);
        assert_eq!(status(&h).products["3scale"].phase, Phase::Completed);
        assert_eq!(status(&h).products["3scale"].version.as_deref(), Some("1.0"));

        h.store.clear_journal();
        for _ in 0..3 {
            let phase = h.reconciler.reconcile(&ctx, &h.key).await.expect("again");
            assert_eq!(phase, Phase::Completed);
        }
        assert!(h.store.mutations().is_empty(), "no writes after convergence");
    }

    /// Story: a failing product stops later products and is reported with
    /// its step, then recovers on a later invocation
    #[tokio::test]
    async fn story_failed_product_blocks_later_stages() {
        let h = harness(&["amq-online", "3scale"]);
        let ctx = ReconcileContext::new();
        *h.products[0].fail_with.lock().expect("mutex should not be poisoned") =
            Some(Error::configuration("amq-online", "console service has no host"));

        let err = h.reconciler.reconcile(&ctx, &h.key).await.unwrap_err();
        assert_eq!(err.step, "secret");
        assert_eq!(err.phase, Phase::Failed);
        assert_eq!(h.products[1].calls.load(Ordering::SeqCst), 0);
        let st = status(&h);
        assert_eq!(st.phase, Phase::Failed);
        assert!(st.message.expect("message").contains("console service has no host"));
        assert_eq!(st.conditions[0].status, ConditionStatus::False);

        let phase = h.reconciler.reconcile(&ctx, &h.key).await.expect("recovered");
        assert_eq!(phase, Phase::Completed);
        assert_eq!(h.products[1].calls.load(Ordering::SeqCst), 1);
    }

    /// Story: teardown visits every product, keeps the record until every
    /// namespace is gone, then lets it be removed
    #[tokio::test]
    async fn story_teardown_runs_every_product_then_releases_installation() {
        let h = harness(&["amq-online", "3scale"]);
        let ctx = ReconcileContext::new();
        h.reconciler.reconcile(&ctx, &h.key).await.expect("install");
        h.store.delete(&h.key).await.expect("request teardown");

        let phase = h.reconciler.reconcile(&ctx, &h.key).await.expect("teardown");
        assert_eq!(phase, Phase::InProgress);
        assert_eq!(h.products[1].calls.load(Ordering::SeqCst), 2, "both products visited");
        assert!(h.store.contains(&h.key));
        assert_eq!(status(&h).message.as_deref(), Some(TEARDOWN_MESSAGE));

        let phase = h.reconciler.reconcile(&ctx, &h.key).await.expect("teardown done");
        assert_eq!(phase, Phase::Completed);
        assert!(!h.store.contains(&h.key));
        assert!(!h.store.contains(&ObjectKey::namespace("redhat-rhmi-3scale")));

        let phase = h.reconciler.reconcile(&ctx, &h.key).await.expect("gone");
        assert_eq!(phase, Phase::Completed);
    }

    #[tokio::test]
    async fn finalizers_registered_for_every_product() {
        let h = harness(&["amq-online", "3scale"]);
        h.reconciler
            .reconcile(&ReconcileContext::new(), &h.key)
            .await
            .expect("install");
        let inst = Installation::from_dynamic(&h.store.object(&h.key).expect("inst")).expect("decode");
        assert!(inst.has_finalizer("finalizer.amq-online.meridian.dev"));
        assert!(inst.has_finalizer("finalizer.3scale.meridian.dev"));
        let status_writes = h
            .store
            .mutations()
            .into_iter()
            .filter(|m| m.kind == MutationKind::UpdateStatus)
            .count();
        assert_eq!(status_writes, 1);
    }

    #[tokio::test]
    async fn missing_installation_is_completed() {
        let h = harness(&[]);
        let missing = ObjectKey::namespaced(
            meridian_common::crd::INSTALLATION_API_VERSION,
            meridian_common::crd::INSTALLATION_KIND,
            "redhat-rhmi-operator",
            "other",
        );
        let phase = h
            .reconciler
            .reconcile(&ReconcileContext::new(), &missing)
            .await
            .expect("reconcile");
        assert_eq!(phase, Phase::Completed);
    }

    #[tokio::test]
    async fn waiting_products_report_their_phase() {
        struct Waiting;
        #[async_trait]
        impl ProductController for Waiting {
            fn name(&self) -> &str {
                "cloud-resources"
            }
            async fn reconcile(&self, _: &ReconcileContext, _: &Installation) -> StepResult {
                Ok(Phase::AwaitingComponents)
            }
        }

        let store = Arc::new(MemoryStore::new());
        let inst = installation();
        store.seed(inst.to_dynamic().expect("encode")).expect("seed");
        let reconciler = InstallationReconciler::new(
            store.clone(),
            vec![Arc::new(Waiting)],
            Arc::new(NoopEventPublisher),
            EngineConfig::default(),
        );

        let phase = reconciler
            .reconcile(&ReconcileContext::new(), &inst.key())
            .await
            .expect("reconcile");
        assert_eq!(phase, Phase::AwaitingComponents);
        assert_eq!(
            reconciler.config().requeue.after(phase),
            std::time::Duration::from_secs(10)
        );
    }
}
