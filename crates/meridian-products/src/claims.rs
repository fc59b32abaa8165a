//! Managed data-store claims fulfilled by the cloud resources operator
//!
//! A claim names the tier and installation type it is for and where the
//! connection secret should be written. The cloud resources operator reports
//! `status.phase` and, once complete, `status.secretRef`.

use std::collections::BTreeMap;

use kube::ResourceExt;
use meridian_common::crd::{Installation, Phase};
use meridian_common::kube_utils::{secret_data, INSTALLATION_LABEL, PRODUCT_LABEL};
use meridian_common::store::{ListQuery, ObjectKey};
use meridian_common::{Error, ReconcileContext, Result};
use meridian_engine::Engine;
use serde_json::Value;
use tracing::debug;

/// apiVersion of every claim kind
pub const CLAIM_API_VERSION: &str = "integreatly.org/v1alpha1";

/// Tier requested for product data stores
pub const TIER_PRODUCTION: &str = "production";

/// Kinds of claim the cloud resources operator fulfils
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimKind {
    /// Relational database
    Postgres,
    /// Key-value cache
    Redis,
    /// Object storage bucket
    BlobStorage,
    /// Outgoing mail credentials
    SmtpCredentialSet,
}

impl ClaimKind {
    /// Every kind, in teardown order
    pub const ALL: [ClaimKind; 4] = [
        ClaimKind::Postgres,
        ClaimKind::Redis,
        ClaimKind::BlobStorage,
        ClaimKind::SmtpCredentialSet,
    ];

    /// Kubernetes kind name
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimKind::Postgres => "Postgres",
            ClaimKind::Redis => "Redis",
            ClaimKind::BlobStorage => "BlobStorage",
            ClaimKind::SmtpCredentialSet => "SMTPCredentialSet",
        }
    }

    /// Query matching every claim of this kind in a namespace
    pub fn query(&self, namespace: &str) -> ListQuery {
        ListQuery::in_namespace(CLAIM_API_VERSION, self.kind(), namespace)
    }
}

/// One claim to converge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    /// Kind of data store
    pub kind: ClaimKind,
    /// Claim name, also used for the connection secret
    pub name: String,
    /// Product asking for it
    pub product: String,
}

impl Claim {
    /// Claim named `<prefix><installation name>`
    pub fn for_installation(kind: ClaimKind, prefix: &str, product: &str, installation: &Installation) -> Self {
        Self {
            kind,
            name: format!("{prefix}{}", installation.name_any()),
            product: product.to_string(),
        }
    }

    /// Store key of the claim, which lives next to the Installation
    pub fn key(&self, installation: &Installation) -> ObjectKey {
        ObjectKey::namespaced(
            CLAIM_API_VERSION,
            self.kind.kind(),
            installation.namespace().unwrap_or_default(),
            self.name.clone(),
        )
    }
}

/// Outcome of converging a claim
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimState {
    /// Gate decision
    pub phase: Phase,
    /// Connection secret the claim reported, once complete
    pub secret: Option<ObjectKey>,
}

/// Apply a claim and report whether it has been fulfilled
pub async fn reconcile_claim(
    ctx: &ReconcileContext,
    engine: &Engine,
    installation: &Installation,
    claim: &Claim,
) -> Result<ClaimState> {
    let key = claim.key(installation);
    let installation_type = installation.spec.installation_type.to_string();
    let namespace = key.namespace.clone().unwrap_or_default();
    let installation_name = installation.name_any();
    engine
        .applier
        .apply_with(ctx, &key, |obj| {
            let labels = obj.metadata.labels.get_or_insert_with(Default::default);
            labels.insert(INSTALLATION_LABEL.to_string(), installation_name);
            labels.insert(PRODUCT_LABEL.to_string(), claim.product.clone());
            obj.data["spec"] = serde_json::json!({
                "type": installation_type,
                "tier": TIER_PRODUCTION,
                "secretRef": {"name": claim.name, "namespace": namespace},
            });
            Ok(())
        })
        .await?;

    let readiness = engine.readiness.check_key(ctx, &key).await?;
    if readiness.phase != Phase::Completed {
        debug!(claim = %key, phase = %readiness.phase, "Claim not fulfilled yet");
    }
    let secret = readiness.reference.as_ref().and_then(|reference| {
        let field = |name: &str| reference.get(name).and_then(Value::as_str);
        Some(ObjectKey::secret(field("namespace")?, field("name")?))
    });
    Ok(ClaimState {
        phase: readiness.phase,
        secret,
    })
}

/// Decoded connection secret of a fulfilled claim.
///
/// A fulfilled claim without a readable secret is a configuration error.
pub async fn read_credentials(
    ctx: &ReconcileContext,
    engine: &Engine,
    claim: &Claim,
    state: &ClaimState,
) -> Result<BTreeMap<String, String>> {
    let Some(secret_key) = &state.secret else {
        return Err(Error::configuration(
            &claim.product,
            format!("{} {} is complete but has no secretRef", claim.kind.kind(), claim.name),
        ));
    };
    let Some(secret) = ctx.guard("store.get", engine.store.get(secret_key)).await? else {
        return Err(Error::configuration(
            &claim.product,
            format!("connection secret {secret_key} for {} {} not found", claim.kind.kind(), claim.name),
        ));
    };
    secret_data(&secret)
}

/// `InProgress` while any claim of any kind remains in `namespace`
pub async fn await_claims_removed(
    ctx: &ReconcileContext,
    engine: &Engine,
    namespace: &str,
) -> Result<Phase> {
    for kind in ClaimKind::ALL {
        let phase = engine.readiness.await_absence(ctx, &kind.query(namespace)).await?;
        if phase != Phase::Completed {
            return Ok(phase);
        }
    }
    Ok(Phase::Completed)
}
