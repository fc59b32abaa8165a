//! Common types for Meridian: the Installation CRD, phases, errors, and the
//! Resource Store boundary every controller converges through.

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod store;

pub use context::ReconcileContext;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
