//! Teardown ordering through per-product finalizer markers on the Installation
//!
//! Each product registers `finalizer.<product>.<domain>` on the Installation
//! the first time its steps run. When teardown is requested the product's
//! cleanup runs until it reports `Completed`, and only then is the marker
//! removed. Kubernetes deletes the Installation once every marker is gone.

use std::future::Future;
use std::sync::Arc;

use kube::ResourceExt;
use meridian_common::crd::{Installation, Phase};
use meridian_common::store::ResourceStore;
use meridian_common::{ReconcileContext, Result};
use tracing::{debug, info};

use crate::step::StepResult;

/// Adds and removes product finalizer markers
#[derive(Clone)]
pub struct FinalizerGate {
    store: Arc<dyn ResourceStore>,
    domain: String,
}

impl FinalizerGate {
    /// Create a gate writing markers under `domain`
    pub fn new(store: Arc<dyn ResourceStore>, domain: impl Into<String>) -> Self {
        Self {
            store,
            domain: domain.into(),
        }
    }

    /// Marker for a product, e.g. `finalizer.3scale.meridian.dev`
    pub fn marker(&self, product: &str) -> String {
        format!("finalizer.{}.{}", product, self.domain)
    }

    /// Add the product's marker unless teardown has started or it is present.
    ///
    /// Returns `true` if the marker was written. The write is conditional on
    /// the freshly read resourceVersion.
    pub async fn register(
        &self,
        ctx: &ReconcileContext,
        installation: &Installation,
        product: &str,
    ) -> Result<bool> {
        let marker = self.marker(product);
        if installation.is_deleting() || installation.has_finalizer(&marker) {
            return Ok(false);
        }

        let key = installation.key();
        let Some(mut current) = ctx.guard("store.get", self.store.get(&key)).await? else {
            return Ok(false);
        };
        if current.metadata.deletion_timestamp.is_some()
            || current.finalizers().iter().any(|f| f == &marker)
        {
            return Ok(false);
        }

        current.finalizers_mut().push(marker.clone());
        ctx.guard("store.update", self.store.update(&current)).await?;
        info!(installation = %key.name, %marker, "Registered finalizer");
        Ok(true)
    }

    /// Run `cleanup` for a product once teardown has been requested.
    ///
    /// - deletion not requested: `Completed`, cleanup not invoked
    /// - marker absent: `Completed`, nothing to do
    /// - cleanup returns `Completed`: marker removed, `Completed`
    /// - anything else from cleanup is returned as-is and the marker stays
    pub async fn run_teardown<F, Fut>(
        &self,
        ctx: &ReconcileContext,
        installation: &Installation,
        product: &str,
        cleanup: F,
    ) -> StepResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StepResult>,
    {
        if !installation.is_deleting() {
            return Ok(Phase::Completed);
        }
        let marker = self.marker(product);
        if !installation.has_finalizer(&marker) {
            debug!(product, "No finalizer marker, nothing to tear down");
            return Ok(Phase::Completed);
        }

        let phase = cleanup().await?;
        if !phase.is_completed() {
            info!(product, %phase, "Teardown still in progress");
            return Ok(phase);
        }

        self.remove_marker(ctx, installation, &marker).await?;
        info!(product, %marker, "Teardown complete, finalizer removed");
        Ok(Phase::Completed)
    }

    async fn remove_marker(
        &self,
        ctx: &ReconcileContext,
        installation: &Installation,
        marker: &str,
    ) -> Result<()> {
        let key = installation.key();
        let Some(mut current) = ctx.guard("store.get", self.store.get(&key)).await? else {
            return Ok(());
        };
        let before = current.finalizers().len();
        current.finalizers_mut().retain(|f| f != marker);
        if current.finalizers().len() == before {
            return Ok(());
        }
        ctx.guard("store.update", self.store.update(&current)).await?;
        Ok(())
    }
}
