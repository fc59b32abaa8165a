//! Applying the account diff to the target directory
//!
//! Order matters: deletes free usernames and emails, updates follow renames,
//! and adds go last so an account moving between source providers never
//! collides with its own stale copy. Failures of single calls are recorded
//! and skipped; the next run retries them. Every call runs under the
//! reconcile's token and deadline, and an interrupted call ends the run.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use http::{Method, StatusCode};
use meridian_common::{ReconcileContext, Result};
use tracing::{debug, info, instrument, warn};

use crate::diff::diff_accounts;
use crate::directory::{normalize, DirectoryAccount, Role, SourceDirectory, TargetAccount, TargetDirectory};
use crate::recorder::{Action, ActionRecorder};

/// Behaviour switches for one sync
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentitySyncConfig {
    /// Account never deleted, renamed, or re-roled
    pub system_account: String,
    /// Source group whose members are promoted in the target
    pub privileged_group: String,
    /// Promote every synced account regardless of group
    pub open_mode: bool,
}

impl Default for IdentitySyncConfig {
    fn default() -> Self {
        Self {
            system_account: "admin".to_string(),
            privileged_group: "dedicated-admins".to_string(),
            open_mode: false,
        }
    }
}

/// Counts from one sync run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Accounts created
    pub added: usize,
    /// Accounts renamed or re-emailed
    pub updated: usize,
    /// Accounts removed
    pub deleted: usize,
    /// Accounts promoted
    pub promoted: usize,
    /// Calls that failed or were refused
    pub failed: usize,
}

/// Keeps a target directory mirroring a source directory
pub struct IdentityDiffSync {
    source: Arc<dyn SourceDirectory>,
    target: Arc<dyn TargetDirectory>,
    config: IdentitySyncConfig,
    recorder: Arc<ActionRecorder>,
}

impl IdentityDiffSync {
    /// Create a sync between two directories
    pub fn new(
        source: Arc<dyn SourceDirectory>,
        target: Arc<dyn TargetDirectory>,
        config: IdentitySyncConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
            recorder: Arc::new(ActionRecorder::new()),
        }
    }

    /// Record calls into a recorder that outlives this sync
    pub fn with_recorder(mut self, recorder: Arc<ActionRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Calls issued by the most recent run
    pub fn actions(&self) -> Vec<Action> {
        self.recorder.actions()
    }

    /// Run one full sync.
    ///
    /// Listing either directory, cancellation and an expired deadline are
    /// the only failures that abort the run.
    #[instrument(skip(self, ctx))]
    pub async fn sync(&self, ctx: &ReconcileContext) -> Result<SyncReport> {
        self.recorder.reset();
        let mut report = SyncReport::default();

        let source = ctx.guard("source.list_accounts", self.source.list_accounts()).await?;
        let target = ctx.guard("target.list_accounts", self.target.list_accounts()).await?;
        let back_references = ctx
            .guard("source.back_references", self.source.back_references(&source))
            .await?;
        let diff = diff_accounts(&source, &target, &back_references, &self.config.system_account);
        debug!(
            added = diff.added.len(),
            updated = diff.updated.len(),
            deleted = diff.deleted.len(),
            collisions = diff.collisions.len(),
            "Computed account diff"
        );

        for account in &diff.deleted {
            let ok = self
                .call(
                    ctx,
                    "target.delete_account",
                    &account.username,
                    Method::DELETE,
                    self.target.delete_account(&account.id),
                )
                .await?;
            tally(&mut report.deleted, &mut report.failed, ok);
        }

        for (existing, account) in &diff.updated {
            let username = normalize(&account.username);
            let email = normalize(&account.email);
            let ok = self
                .call(
                    ctx,
                    "target.update_account",
                    &username,
                    Method::PUT,
                    self.target.update_account(&existing.id, &username, &email),
                )
                .await?;
            tally(&mut report.updated, &mut report.failed, ok);
        }

        for account in &diff.collisions {
            warn!(
                username = %account.username,
                email = %account.email,
                "Account collides with an earlier addition in this run, skipping"
            );
            self.recorder
                .record(&account.username, Method::POST, StatusCode::CONFLICT);
            report.failed += 1;
        }

        for account in &diff.added {
            let username = normalize(&account.username);
            match ctx
                .guard("target.find_account", self.target.find_account(&username))
                .await
            {
                Ok(Some(_)) => {
                    debug!(%username, "Account already present, skipping add");
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(%username, error = %e, "Account lookup failed, skipping add");
                    self.recorder
                        .record(&username, Method::GET, StatusCode::SERVICE_UNAVAILABLE);
                    report.failed += 1;
                    continue;
                }
            }
            let email = normalize(&account.email);
            let ok = self
                .call(
                    ctx,
                    "target.create_account",
                    &username,
                    Method::POST,
                    self.target.create_account(&username, &email),
                )
                .await?;
            tally(&mut report.added, &mut report.failed, ok);
        }

        let current = ctx.guard("target.list_accounts", self.target.list_accounts()).await?;
        self.stamp_back_references(ctx, &source, &current, &back_references)
            .await?;
        self.sync_membership(ctx, &source, &current, &mut report).await?;

        info!(
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            promoted = report.promoted,
            failed = report.failed,
            "Identity sync finished"
        );
        Ok(report)
    }

    /// Point every source account's identity record at its target account
    async fn stamp_back_references(
        &self,
        ctx: &ReconcileContext,
        source: &[DirectoryAccount],
        current: &[TargetAccount],
        known: &BTreeMap<String, String>,
    ) -> Result<()> {
        let system = normalize(&self.config.system_account);
        for account in source {
            let name = account.normalized_username();
            if name == system {
                continue;
            }
            let Some(target) = current.iter().find(|t| t.normalized_username() == name) else {
                continue;
            };
            if known.get(&name) == Some(&target.id) {
                continue;
            }
            let stamped = ctx
                .guard(
                    "source.record_back_reference",
                    self.source.record_back_reference(ctx, account, &target.id),
                )
                .await;
            match stamped {
                Ok(()) => {}
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(username = %account.username, error = %e, "Failed to record back-reference");
                }
            }
        }
        Ok(())
    }

    /// Promote accounts whose source account is privileged. Never demotes.
    async fn sync_membership(
        &self,
        ctx: &ReconcileContext,
        source: &[DirectoryAccount],
        current: &[TargetAccount],
        report: &mut SyncReport,
    ) -> Result<()> {
        let privileged: HashSet<String> = if self.config.open_mode {
            HashSet::new()
        } else {
            ctx.guard(
                "source.group_members",
                self.source.group_members(&self.config.privileged_group),
            )
            .await?
            .iter()
            .map(|u| normalize(u))
            .collect()
        };
        let synced: HashSet<String> = source.iter().map(|a| a.normalized_username()).collect();
        let system = normalize(&self.config.system_account);

        for account in current {
            let name = account.normalized_username();
            if name == system || !synced.contains(&name) {
                continue;
            }
            let desired = if self.config.open_mode || privileged.contains(&name) {
                Role::Admin
            } else {
                Role::Member
            };
            if desired != Role::Admin || account.role == Role::Admin {
                continue;
            }
            let ok = self
                .call(
                    ctx,
                    "target.set_role",
                    &account.username,
                    Method::PATCH,
                    self.target.set_role(&account.id, Role::Admin),
                )
                .await?;
            tally(&mut report.promoted, &mut report.failed, ok);
        }
        Ok(())
    }

    /// Issue one guarded directory call and record its outcome.
    ///
    /// Returns `Ok(true)` on a success status and `Ok(false)` when the call
    /// was refused or the directory was unreachable. Cancellation and an
    /// expired deadline are returned as errors.
    async fn call<F>(
        &self,
        ctx: &ReconcileContext,
        operation: &str,
        username: &str,
        method: Method,
        call: F,
    ) -> Result<bool>
    where
        F: Future<Output = Result<StatusCode>>,
    {
        match ctx.guard(operation, call).await {
            Ok(status) if status.is_success() => {
                debug!(%username, %method, %status, "Directory call succeeded");
                self.recorder.record(username, method, status);
                Ok(true)
            }
            Ok(status) => {
                warn!(%username, %method, %status, "Directory refused call");
                self.recorder.record(username, method, status);
                Ok(false)
            }
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                warn!(%username, %method, error = %e, "Directory unreachable");
                self.recorder
                    .record(username, method, StatusCode::SERVICE_UNAVAILABLE);
                Ok(false)
            }
        }
    }
}

fn tally(succeeded: &mut usize, failed: &mut usize, ok: bool) {
    if ok {
        *succeeded += 1;
    } else {
        *failed += 1;
    }
}
