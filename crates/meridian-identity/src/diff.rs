//! Edit set between the source and target directories

use std::collections::{BTreeMap, HashSet};

use crate::directory::{normalize, DirectoryAccount, TargetAccount};

/// What has to change in the target to mirror the source
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountDiff {
    /// Source accounts with no target account yet
    pub added: Vec<DirectoryAccount>,
    /// Target accounts whose source account was renamed or re-emailed
    pub updated: Vec<(TargetAccount, DirectoryAccount)>,
    /// Target accounts with no source account left
    pub deleted: Vec<TargetAccount>,
    /// Additions that lost a username or email collision to an earlier one
    pub collisions: Vec<DirectoryAccount>,
}

impl AccountDiff {
    /// True when the target already mirrors the source
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.collisions.is_empty()
    }
}

/// Compute the edit set.
///
/// `back_references` maps a source account's normalized username to the
/// target id recorded on its generated identity record. A target account
/// with no username match whose id is referenced by a source account is an
/// update, not a delete plus an add. The `system_account` never shows up in
/// any part of the result.
pub fn diff_accounts(
    source: &[DirectoryAccount],
    target: &[TargetAccount],
    back_references: &BTreeMap<String, String>,
    system_account: &str,
) -> AccountDiff {
    let system = normalize(system_account);
    let source: Vec<&DirectoryAccount> = source
        .iter()
        .filter(|a| a.normalized_username() != system)
        .collect();
    let target: Vec<&TargetAccount> = target
        .iter()
        .filter(|t| t.normalized_username() != system)
        .collect();

    let target_names: HashSet<String> = target.iter().map(|t| t.normalized_username()).collect();
    let source_names: HashSet<String> = source.iter().map(|a| a.normalized_username()).collect();

    let mut added: Vec<&DirectoryAccount> = source
        .iter()
        .copied()
        .filter(|a| !target_names.contains(&a.normalized_username()))
        .collect();

    let mut diff = AccountDiff::default();
    for t in target
        .iter()
        .filter(|t| !source_names.contains(&t.normalized_username()))
    {
        let renamed = source.iter().find(|a| {
            back_references
                .get(&a.normalized_username())
                .is_some_and(|id| id == &t.id)
        });
        match renamed {
            Some(account) => {
                added.retain(|a| a.normalized_username() != account.normalized_username());
                diff.updated.push(((*t).clone(), (*account).clone()));
            }
            None => diff.deleted.push((*t).clone()),
        }
    }

    // First writer wins on username or email within one run.
    let mut names = HashSet::new();
    let mut emails = HashSet::new();
    for account in added {
        let name = account.normalized_username();
        let email = normalize(&account.email);
        let email_taken = !email.is_empty() && emails.contains(&email);
        if names.contains(&name) || email_taken {
            diff.collisions.push(account.clone());
            continue;
        }
        names.insert(name);
        if !email.is_empty() {
            emails.insert(email);
        }
        diff.added.push(account.clone());
    }

    diff
}
