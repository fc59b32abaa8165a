//! Installation Custom Resource Definition
//!
//! An Installation is the root entity for one managed deployment. It is
//! created by a process outside the operator, carries one finalizer marker
//! per product while that product's teardown is pending, and is only removed
//! by Kubernetes once every marker has been cleared.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, InstallationType, Phase};
use crate::store::ObjectKey;
use crate::{Error, Result};

/// API group served by the operator
pub const API_GROUP: &str = "meridian.dev";

/// apiVersion of the Installation CRD
pub const INSTALLATION_API_VERSION: &str = "meridian.dev/v1alpha1";

/// Kind of the Installation CRD
pub const INSTALLATION_KIND: &str = "Installation";

/// Specification for an Installation
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "meridian.dev",
    version = "v1alpha1",
    kind = "Installation",
    plural = "installations",
    shortname = "inst",
    namespaced,
    status = "InstallationStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Prefix","type":"string","jsonPath":".spec.namespacePrefix"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    /// Installation flavour
    #[serde(rename = "type", default)]
    pub installation_type: InstallationType,

    /// Prefix applied to every product namespace (e.g. "redhat-rhmi-")
    pub namespace_prefix: String,

    /// Name of the secret in the installation namespace holding SMTP settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_secret: Option<String>,

    /// Routing subdomain used to build product hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_subdomain: Option<String>,
}

/// Observed state of one product within the Installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProductStatus {
    /// Last phase reported by the product controller
    pub phase: Phase,
    /// Version the controller installs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Externally reachable host, once discovered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Status for an Installation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    /// Overall phase of the last reconcile
    #[serde(default)]
    pub phase: Phase,

    /// Human-readable summary of the last reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Per-product status keyed by product name
    #[serde(default)]
    pub products: BTreeMap<String, ProductStatus>,

    /// Conditions describing the Installation
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Metadata generation observed by the last reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Installation {
    /// True once teardown has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if the given finalizer marker is present
    pub fn has_finalizer(&self, marker: &str) -> bool {
        self.finalizers().iter().any(|f| f == marker)
    }

    /// Store key addressing this Installation
    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(
            INSTALLATION_API_VERSION,
            INSTALLATION_KIND,
            self.namespace().unwrap_or_default(),
            self.name_any(),
        )
    }

    /// Namespace for a product: the configured prefix plus the product suffix
    pub fn product_namespace(&self, suffix: &str) -> String {
        format!("{}{}", self.spec.namespace_prefix, suffix)
    }

    /// Decode an Installation from a generic store object
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self> {
        let value = serde_json::to_value(obj)?;
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(INSTALLATION_KIND, e.to_string()))
    }

    /// Encode this Installation as a generic store object
    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        let mut value = serde_json::to_value(self)?;
        value["apiVersion"] = serde_json::json!(INSTALLATION_API_VERSION);
        value["kind"] = serde_json::json!(INSTALLATION_KIND);
        serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind(INSTALLATION_KIND, e.to_string()))
    }
}
