//! In-process Resource Store
//!
//! Mirrors the API server semantics the engine relies on: resourceVersion
//! bumps on every write, conditional updates, status kept apart from spec,
//! and finalizer-aware deletion. Every mutation is journaled so callers can
//! assert exactly which writes a reconcile issued.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::ResourceExt;

use super::{ListQuery, ObjectKey, ResourceStore};
use crate::{Error, Result};

/// Kind of write recorded in the journal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    /// Object created
    Create,
    /// Metadata/spec replaced
    Update,
    /// Status replaced
    UpdateStatus,
    /// Object removed, or marked for deletion while finalizers remain
    Delete,
}

/// One journaled write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    /// What happened
    pub kind: MutationKind,
    /// Which object it happened to
    pub key: ObjectKey,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    version: u64,
    journal: Vec<Mutation>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn record(&mut self, kind: MutationKind, key: &ObjectKey) {
        self.journal.push(Mutation {
            kind,
            key: key.clone(),
        });
    }
}

/// Resource Store kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite an object as-is, bypassing the journal.
    ///
    /// Stands in for objects that other controllers own, including their
    /// observed status.
    pub fn seed(&self, mut obj: DynamicObject) -> Result<()> {
        let key = ObjectKey::of(&obj)?;
        let mut state = self.state();
        obj.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key, obj);
        Ok(())
    }

    /// Replace an object's status as its owning controller would, bypassing
    /// the journal
    pub fn set_status(&self, key: &ObjectKey, status: serde_json::Value) -> Result<()> {
        let mut state = self.state();
        let version = state.next_version();
        let obj = state.objects.get_mut(key).ok_or_else(|| key.not_found())?;
        obj.data["status"] = status;
        obj.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Remove an object immediately, as a garbage collector would
    pub fn purge(&self, key: &ObjectKey) -> bool {
        self.state().objects.remove(key).is_some()
    }

    /// Snapshot of one object
    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.state().objects.get(key).cloned()
    }

    /// True if the object exists
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.state().objects.contains_key(key)
    }

    /// Every write since creation or the last [`MemoryStore::clear_journal`]
    pub fn mutations(&self) -> Vec<Mutation> {
        self.state().journal.clone()
    }

    /// Number of journaled writes
    pub fn mutation_count(&self) -> usize {
        self.state().journal.len()
    }

    /// Forget journaled writes
    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }
}

/// Match labels against an equality-based selector ("a=b,c!=d,e,!f")
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else if let Some(k) = term.strip_prefix('!') {
                !labels.contains_key(k.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

fn is_terminating_without_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some() && obj.finalizers().is_empty()
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self.state().objects.get(key).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>> {
        let state = self.state();
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.api_version == query.api_version && key.kind == query.kind)
            .filter(|(key, _)| match &query.namespace {
                Some(ns) => key.namespace.as_deref() == Some(ns.as_str()),
                None => true,
            })
            .filter(|(_, obj)| match &query.label_selector {
                Some(selector) => matches_selector(obj.labels(), selector),
                None => true,
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.state();
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(&key.kind, key.namespaced_name()));
        }
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.deletion_timestamp = None;
        state.objects.insert(key.clone(), stored.clone());
        state.record(MutationKind::Create, &key);
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.state();
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| key.not_found())?;

        if let Some(expected) = obj.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(Error::conflict(
                    &key.kind,
                    key.namespaced_name(),
                    format!(
                        "resourceVersion {} does not match stored {}",
                        expected,
                        current.metadata.resource_version.as_deref().unwrap_or("<none>")
                    ),
                ));
            }
        }

        let mut stored = obj.clone();
        match current.data.get("status") {
            Some(status) => stored.data["status"] = status.clone(),
            None => {
                if let Some(map) = stored.data.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.record(MutationKind::Update, &key);

        if is_terminating_without_finalizers(&stored) {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::of(obj)?;
        let mut state = self.state();
        let version = state.next_version();
        let stored = {
            let current = state.objects.get_mut(&key).ok_or_else(|| key.not_found())?;
            current.data["status"] = obj.data.get("status").cloned().unwrap_or_default();
            current.metadata.resource_version = Some(version);
            current.clone()
        };
        state.record(MutationKind::UpdateStatus, &key);
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state();
        let version = state.next_version();
        let current = state.objects.get_mut(key).ok_or_else(|| key.not_found())?;
        if current.finalizers().is_empty() {
            state.objects.remove(key);
        } else if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Time(Utc::now()));
            current.metadata.resource_version = Some(version);
        }
        state.record(MutationKind::Delete, key);
        Ok(())
    }
}
