//! Helpers for addressing arbitrary Kubernetes kinds through `DynamicObject`

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ApiResource, DynamicObject};
use kube::core::TypeMeta;

use crate::{Error, Result};

/// Condition type reporting overall readiness
pub const CONDITION_READY: &str = "Ready";

/// Label applied to every object the operator creates for an Installation
pub const INSTALLATION_LABEL: &str = "meridian.dev/installation";

/// Label naming the product that owns an object
pub const PRODUCT_LABEL: &str = "meridian.dev/product";

/// Kinds whose plural is not derivable by the simple English rules below
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("smtpcredentialset", "smtpcredentialsets"),
    ("blobstorage", "blobstorages"),
    ("postgres", "postgres"),
    ("redis", "redis"),
    ("apimanager", "apimanagers"),
    ("keycloakuser", "keycloakusers"),
    ("deploymentconfig", "deploymentconfigs"),
];

/// Split an apiVersion into (group, version). Core kinds have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an `ApiResource` from apiVersion and kind without API discovery
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// An empty object of the given kind, ready to be filled in by a mutation
pub fn empty_object(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &build_api_resource(api_version, kind));
    obj.types = Some(TypeMeta {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
    });
    obj.metadata.namespace = namespace.map(str::to_string);
    obj.data = serde_json::json!({});
    obj
}

/// Decoded `data` of a Secret held as a `DynamicObject`.
///
/// Values that are not valid UTF-8 are skipped.
pub fn secret_data(obj: &DynamicObject) -> Result<BTreeMap<String, String>> {
    let secret: Secret = serde_json::from_value(serde_json::to_value(obj)?)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;
    Ok(secret
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| String::from_utf8(v.0).ok().map(|v| (k, v)))
        .collect())
}

/// Replace the `data` of a Secret held as a `DynamicObject`
pub fn set_secret_data(obj: &mut DynamicObject, data: &BTreeMap<String, String>) -> Result<()> {
    let encoded: BTreeMap<String, ByteString> = data
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
        .collect();
    obj.data["data"] = serde_json::to_value(encoded)?;
    Ok(())
}
