//! Source directory backed by generated KeycloakUser records
//!
//! The identity provider operator writes one KeycloakUser per cluster user.
//! The target id of the account created for it is kept in the user's
//! attributes so a rename can be told apart from a delete plus an add.
//! Every listing refreshes an index from username to record, so a sync run
//! lists the records a fixed number of times however many accounts it
//! stamps.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use kube::api::DynamicObject;
use meridian_common::store::{ListQuery, ObjectKey, ResourceStore};
use meridian_common::{ReconcileContext, Result};
use meridian_engine::ConvergenceApplier;
use meridian_identity::{normalize, DirectoryAccount, SourceDirectory};
use serde_json::{json, Value};
use tracing::debug;

/// apiVersion of KeycloakUser records
pub const KEYCLOAK_API_VERSION: &str = "keycloak.org/v1alpha1";

/// Attribute holding the target account id
pub const TARGET_ID_ATTRIBUTE: &str = "3scale_user_id";

/// Attribute marking that a target account was created
pub const TARGET_CREATED_ATTRIBUTE: &str = "3scale_user_created";

/// Label selector matching the generated records
pub const GENERATED_USER_SELECTOR: &str = "sso=integreatly";

const GROUP_API_VERSION: &str = "user.openshift.io/v1";

/// KeycloakUser records in one namespace, with cluster groups for membership
pub struct KeycloakUserDirectory {
    store: Arc<dyn ResourceStore>,
    applier: ConvergenceApplier,
    namespace: String,
    /// Normalized username to record, as of the last listing
    index: Mutex<BTreeMap<String, ObjectKey>>,
}

impl KeycloakUserDirectory {
    /// Directory over the records in `namespace`
    pub fn new(store: Arc<dyn ResourceStore>, namespace: impl Into<String>) -> Self {
        Self {
            applier: ConvergenceApplier::new(store.clone()),
            store,
            namespace: namespace.into(),
            index: Mutex::new(BTreeMap::new()),
        }
    }

    /// List the generated records and refresh the username index
    async fn records(&self) -> Result<Vec<DynamicObject>> {
        let query = ListQuery::in_namespace(KEYCLOAK_API_VERSION, "KeycloakUser", &self.namespace)
            .with_labels(GENERATED_USER_SELECTOR);
        let records = self.store.list(&query).await?;
        let index = records
            .iter()
            .filter_map(|r| Some((normalize(username_of(r)?), ObjectKey::of(r).ok()?)))
            .collect();
        *self.index.lock().unwrap_or_else(PoisonError::into_inner) = index;
        Ok(records)
    }

    fn indexed(&self, username: &str) -> Option<ObjectKey> {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .cloned()
    }

    /// Record key for an account, listing only when the index misses
    async fn record_key(&self, account: &DirectoryAccount) -> Result<Option<ObjectKey>> {
        let wanted = account.normalized_username();
        if let Some(key) = self.indexed(&wanted) {
            return Ok(Some(key));
        }
        self.records().await?;
        Ok(self.indexed(&wanted))
    }
}

fn username_of(record: &DynamicObject) -> Option<&str> {
    record.data.pointer("/spec/user/username").and_then(Value::as_str)
}

fn target_id_of(record: &DynamicObject) -> Option<&str> {
    record
        .data
        .pointer(&format!("/spec/user/attributes/{TARGET_ID_ATTRIBUTE}/0"))
        .and_then(Value::as_str)
}

fn account_of(record: &DynamicObject) -> Option<DirectoryAccount> {
    let user = record.data.pointer("/spec/user")?;
    Some(DirectoryAccount {
        username: user.get("username")?.as_str()?.to_string(),
        email: user
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        groups: user
            .get("groups")
            .and_then(Value::as_array)
            .map(|gs| gs.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

#[async_trait]
impl SourceDirectory for KeycloakUserDirectory {
    async fn list_accounts(&self) -> Result<Vec<DirectoryAccount>> {
        Ok(self.records().await?.iter().filter_map(account_of).collect())
    }

    async fn back_references(&self, accounts: &[DirectoryAccount]) -> Result<BTreeMap<String, String>> {
        let by_name: BTreeMap<String, String> = self
            .records()
            .await?
            .iter()
            .filter_map(|r| Some((normalize(username_of(r)?), target_id_of(r)?.to_string())))
            .collect();
        Ok(accounts
            .iter()
            .filter_map(|a| {
                let name = a.normalized_username();
                let id = by_name.get(&name)?.clone();
                Some((name, id))
            })
            .collect())
    }

    async fn record_back_reference(
        &self,
        ctx: &ReconcileContext,
        account: &DirectoryAccount,
        target_id: &str,
    ) -> Result<()> {
        let Some(key) = self.record_key(account).await? else {
            debug!(username = %account.username, "No generated record to stamp");
            return Ok(());
        };
        self.applier
            .apply_with(ctx, &key, |obj| {
                let attributes = &mut obj.data["spec"]["user"]["attributes"];
                attributes[TARGET_CREATED_ATTRIBUTE] = json!(["true"]);
                attributes[TARGET_ID_ATTRIBUTE] = json!([target_id]);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Members of the cluster group; a missing group has no members
    async fn group_members(&self, group: &str) -> Result<Vec<String>> {
        let key = ObjectKey::cluster_scoped(GROUP_API_VERSION, "Group", group);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|g| g.data.get("users").and_then(Value::as_array).cloned())
            .map(|users| users.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }
}
