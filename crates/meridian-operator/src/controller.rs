//! Installation controller: the kube-runtime watch loop around
//! [`InstallationReconciler`]

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use meridian_common::config::EngineConfig;
use meridian_common::crd::{Installation, Phase};
use meridian_common::events::{EventPublisher, KubeEventPublisher};
use meridian_common::store::{KubeStore, ResourceStore};
use meridian_common::ReconcileContext;
use meridian_engine::{
    Engine, InstallationReconciler, ProductController, RestartAnnotationTrigger, StepError,
};
use meridian_identity::{SourceDirectory, TargetDirectory};
use meridian_products::{ApiManagement, CloudResources, Messaging, StoreSubscriptionInstaller};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Name events and field managers report as
pub const CONTROLLER_NAME: &str = "meridian-operator";

/// Watcher timeout (seconds), kept below the client read timeout so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Settings for the running operator
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Engine-wide settings
    pub engine: EngineConfig,
    /// Only watch Installations in this namespace
    pub watch_namespace: Option<String>,
    /// Namespace holding the operator catalog source
    pub catalog_namespace: String,
    /// Identity-provider group whose members become API management admins
    pub privileged_group: String,
}

/// Directories the API management product mirrors accounts between
#[derive(Clone)]
pub struct IdentityDirectories {
    /// Authoritative accounts
    pub source: Arc<dyn SourceDirectory>,
    /// Accounts kept in step with `source`
    pub target: Arc<dyn TargetDirectory>,
}

/// Shared controller state
pub struct Context {
    /// Drives every product for one Installation
    pub reconciler: InstallationReconciler,
    /// Cancelled once the watch loop stops
    pub shutdown: CancellationToken,
}

impl Context {
    /// Context around a reconciler
    pub fn new(reconciler: InstallationReconciler) -> Self {
        Self {
            reconciler,
            shutdown: CancellationToken::new(),
        }
    }
}

/// A reconcile that ended in a failed step
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A product step failed
    #[error(transparent)]
    Step(#[from] StepError),
}

impl ReconcileError {
    /// Phase the failure was reported with
    pub fn phase(&self) -> Phase {
        match self {
            Self::Step(e) => e.phase,
        }
    }
}

/// Product controllers in install order. Cloud resources comes first since
/// the others claim data stores from it.
pub fn build_products(
    engine: &Engine,
    config: &OperatorConfig,
    identity: Option<IdentityDirectories>,
) -> Vec<Arc<dyn ProductController>> {
    let subscriptions = Arc::new(StoreSubscriptionInstaller::new(
        engine.applier.clone(),
        config.catalog_namespace.clone(),
    ));
    let rollouts = Arc::new(RestartAnnotationTrigger::new(engine.applier.clone()));

    let mut api_management = ApiManagement::new(engine.clone(), subscriptions.clone(), rollouts);
    if let Some(identity) = identity {
        api_management =
            api_management.with_identity_sync(identity.source, identity.target, config.privileged_group.clone());
    }

    vec![
        Arc::new(CloudResources::new(engine.clone(), subscriptions.clone())),
        Arc::new(Messaging::new(engine.clone(), subscriptions)),
        Arc::new(api_management),
    ]
}

/// Reconcile one Installation and requeue according to its phase
pub async fn reconcile(installation: Arc<Installation>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let config = ctx.reconciler.config();
    let rctx = ReconcileContext::child_of(&ctx.shutdown, config.reconcile_timeout);
    let phase = ctx.reconciler.reconcile(&rctx, &installation.key()).await?;
    debug!(installation = %installation.name_any(), %phase, "Reconcile finished");
    Ok(Action::requeue(config.requeue.after(phase)))
}

/// Requeue a failed reconcile after the delay for its reported phase
pub fn error_policy(installation: Arc<Installation>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    error!(
        installation = %installation.name_any(),
        %error,
        "Reconciliation failed"
    );
    Action::requeue(ctx.reconciler.config().requeue.after(error.phase()))
}

/// Watch Installations until a shutdown signal arrives
pub async fn run(client: Client, config: OperatorConfig, identity: Option<IdentityDirectories>) {
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
    let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
    let engine = Engine::new(store.clone(), config.engine.domain.clone());
    let products = build_products(&engine, &config, identity);
    let ctx = Arc::new(Context::new(InstallationReconciler::new(
        store,
        products,
        events,
        config.engine.clone(),
    )));

    let installations: Api<Installation> = match &config.watch_namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        domain = %config.engine.domain,
        "Starting Installation controller"
    );

    Controller::new(installations, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| {
            match result {
                Ok((obj, action)) => debug!(installation = %obj.name, ?action, "Reconciled"),
                Err(e) => error!(error = %e, "Controller error"),
            }
            futures::future::ready(())
        })
        .await;

    ctx.shutdown.cancel();
    info!("Installation controller stopped");
}
