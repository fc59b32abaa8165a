//! Resource Store boundary
//!
//! Every external object the engine touches goes through [`ResourceStore`].
//! Objects are `DynamicObject`s so product controllers can address kinds the
//! operator has no generated types for. Two implementations exist:
//! [`KubeStore`] backed by the Kubernetes API and [`MemoryStore`] for tests
//! and dry runs.

mod kubernetes;
mod memory;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

pub use self::kubernetes::KubeStore;
pub use self::memory::{MemoryStore, Mutation, MutationKind};

use crate::{Error, Result};

/// Identity of a stored object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// apiVersion, e.g. "v1" or "integreatly.org/v1alpha1"
    pub api_version: String,
    /// Kind, e.g. "Secret"
    pub kind: String,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a Namespace
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::cluster_scoped("v1", "Namespace", name)
    }

    /// Key of a Secret
    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::namespaced("v1", "Secret", namespace, name)
    }

    /// Derive the key of an object from its type and metadata
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| Error::validation("object has no apiVersion/kind"))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::validation(format!("{} has no name", types.kind)))?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.namespace(),
            name,
        })
    }

    /// "namespace/name" or "name" for cluster-scoped objects
    pub fn namespaced_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    /// Build a not-found error for this key
    pub fn not_found(&self) -> Error {
        Error::not_found(&self.kind, self.namespaced_name())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.namespaced_name())
    }
}

/// Selects objects of one kind for [`ResourceStore::list`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// apiVersion of the listed kind
    pub api_version: String,
    /// Kind to list
    pub kind: String,
    /// Restrict to one namespace, all namespaces when `None`
    pub namespace: Option<String>,
    /// Equality-based label selector, e.g. "app=system,tier!=db"
    pub label_selector: Option<String>,
}

impl ListQuery {
    /// List all objects of a kind in a namespace
    pub fn in_namespace(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: Some(namespace.into()),
            label_selector: None,
        }
    }

    /// Narrow the query with a label selector
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// Abstract key-addressed store of resource objects
///
/// Implementations report "already exists", "not found" and write conflicts
/// as the distinguishable [`Error`] variants so callers can branch on them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects matching the query
    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>>;

    /// Create an object. Fails with `AlreadyExists` if the identity is taken.
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object's metadata and spec.
    ///
    /// The write is conditional on `metadata.resourceVersion` when set and
    /// fails with `Conflict` if the stored object moved on. The observed
    /// status of the stored object is never overwritten.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace only the status fragment of an object
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete an object. Fails with `NotFound` if it does not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Any externally-provisioned object the engine converges
///
/// The engine owns the desired-spec fragment; the observed-status fragment
/// belongs to whichever controller reconciles the object.
pub trait ManagedResource {
    /// Identity of the object
    fn key(&self) -> Result<ObjectKey>;

    /// Desired-spec fragment owned by this engine
    fn desired_spec(&self) -> Option<&Value>;

    /// Observed-status fragment owned by the external controller
    fn observed_status(&self) -> Option<&Value>;
}

impl ManagedResource for DynamicObject {
    fn key(&self) -> Result<ObjectKey> {
        ObjectKey::of(self)
    }

    fn desired_spec(&self) -> Option<&Value> {
        self.data.get("spec").filter(|v| !v.is_null())
    }

    fn observed_status(&self) -> Option<&Value> {
        self.data.get("status").filter(|v| !v.is_null())
    }
}
