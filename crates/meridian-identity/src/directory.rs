//! Account directories on both sides of the sync

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use http::StatusCode;
use meridian_common::{ReconcileContext, Result};
use serde::{Deserialize, Serialize};

/// Account in the authoritative source directory
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryAccount {
    /// Login name as the source directory reports it
    pub username: String,
    /// Contact address
    pub email: String,
    /// Source groups the account belongs to
    #[serde(default)]
    pub groups: Vec<String>,
}

impl DirectoryAccount {
    /// Username as matched against the target directory
    pub fn normalized_username(&self) -> String {
        normalize(&self.username)
    }

    /// True if the account is in `group`, ignoring case
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }
}

/// Role an account holds in the target directory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular account
    #[default]
    Member,
    /// Elevated account
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Member => write!(f, "member"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

/// Account in the dependent target directory
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAccount {
    /// Target-assigned identifier, the value back-references point at
    pub id: String,
    /// Login name
    pub username: String,
    /// Contact address
    pub email: String,
    /// Current role
    #[serde(default)]
    pub role: Role,
}

impl TargetAccount {
    /// Username as matched against the source directory
    pub fn normalized_username(&self) -> String {
        normalize(&self.username)
    }
}

/// Usernames and emails are matched case-insensitively
pub fn normalize(value: &str) -> String {
    value.to_lowercase()
}

/// The authoritative account source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceDirectory: Send + Sync {
    /// Every account the target should mirror
    async fn list_accounts(&self) -> Result<Vec<DirectoryAccount>>;

    /// Target ids recorded on the accounts' generated identity records,
    /// keyed by normalized username. Accounts without one are left out.
    async fn back_references(&self, accounts: &[DirectoryAccount]) -> Result<BTreeMap<String, String>>;

    /// Record the target id on the account's generated identity record
    async fn record_back_reference(
        &self,
        ctx: &ReconcileContext,
        account: &DirectoryAccount,
        target_id: &str,
    ) -> Result<()>;

    /// Usernames of the accounts in `group`
    async fn group_members(&self, group: &str) -> Result<Vec<String>> {
        Ok(self
            .list_accounts()
            .await?
            .into_iter()
            .filter(|a| a.in_group(group))
            .map(|a| a.username)
            .collect())
    }
}

/// The dependent account store.
///
/// Mutating calls return the status code the directory answered with; an
/// `Err` means the directory could not be reached at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    /// Every account currently in the target
    async fn list_accounts(&self) -> Result<Vec<TargetAccount>>;

    /// Look up one account by username
    async fn find_account(&self, username: &str) -> Result<Option<TargetAccount>>;

    /// Create an account
    async fn create_account(&self, username: &str, email: &str) -> Result<StatusCode>;

    /// Change an existing account's username and email
    async fn update_account(&self, id: &str, username: &str, email: &str) -> Result<StatusCode>;

    /// Remove an account
    async fn delete_account(&self, id: &str) -> Result<StatusCode>;

    /// Change an account's role
    async fn set_role(&self, id: &str, role: Role) -> Result<StatusCode>;
}
