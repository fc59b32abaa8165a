//! Kubernetes-backed Resource Store

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

use super::{ListQuery, ObjectKey, ResourceStore};
use crate::kube_utils::build_api_resource;
use crate::retry::{retry_when, RetryConfig};
use crate::{Error, Result};

/// Resource Store talking to the Kubernetes API through `DynamicObject`
///
/// Transport failures are retried with bounded backoff; API-level outcomes
/// (404, 409) are mapped to the store's distinguishable errors on the first
/// attempt.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    retry: RetryConfig,
}

impl KubeStore {
    /// Create a store with the default retry policy
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
        }
    }

    fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.api(&key.api_version, &key.kind, key.namespace.as_deref())
    }
}

/// Translate API status codes into store outcomes
fn map_kube_error(err: kube::Error, key: &ObjectKey) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => key.not_found(),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(&key.kind, key.namespaced_name())
        }
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(&key.kind, key.namespaced_name(), ae.message.clone())
        }
        _ => Error::from(err),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        let api = self.api_for(key);
        retry_when(&self.retry, "store.get", Error::is_transport, || async {
            api.get_opt(&key.name)
                .await
                .map_err(|e| map_kube_error(e, key))
        })
        .await
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>> {
        let api = self.api(&query.api_version, &query.kind, query.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(selector) = &query.label_selector {
            params = params.labels(selector);
        }
        let list = retry_when(&self.retry, "store.list", Error::is_transport, || async {
            api.list(&params).await.map_err(Error::from)
        })
        .await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let api = self.api_for(&key);
        debug!(object = %key, "creating object");
        retry_when(&self.retry, "store.create", Error::is_transport, || async {
            api.create(&PostParams::default(), obj)
                .await
                .map_err(|e| map_kube_error(e, &key))
        })
        .await
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let api = self.api_for(&key);
        debug!(object = %key, "replacing object");
        retry_when(&self.retry, "store.update", Error::is_transport, || async {
            api.replace(&key.name, &PostParams::default(), obj)
                .await
                .map_err(|e| map_kube_error(e, &key))
        })
        .await
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let api = self.api_for(&key);
        let patch = serde_json::json!({ "status": obj.data.get("status") });
        retry_when(&self.retry, "store.update_status", Error::is_transport, || async {
            api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| map_kube_error(e, &key))
        })
        .await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let api = self.api_for(key);
        debug!(object = %key, "deleting object");
        retry_when(&self.retry, "store.delete", Error::is_transport, || async {
            api.delete(&key.name, &DeleteParams::background())
                .await
                .map(|_| ())
                .map_err(|e| map_kube_error(e, key))
        })
        .await
    }
}
