//! Account synchronization between an authoritative source directory and a
//! dependent target directory
//!
//! [`diff_accounts`] computes the edit set; [`IdentityDiffSync`] applies it
//! deletes first, then updates, then adds, and finishes with a promote-only
//! membership pass.

#![deny(missing_docs)]

pub mod diff;
pub mod directory;
pub mod recorder;
pub mod sync;

pub use diff::{diff_accounts, AccountDiff};
pub use directory::{normalize, DirectoryAccount, Role, SourceDirectory, TargetAccount, TargetDirectory};
pub use recorder::{Action, ActionRecorder};
pub use sync::{IdentityDiffSync, IdentitySyncConfig, SyncReport};
