//! Meridian operator: watches Installations and drives every product
//! controller towards the desired state

#![deny(missing_docs)]

pub mod controller;
pub mod telemetry;

pub use controller::{build_products, error_policy, reconcile, Context, OperatorConfig, ReconcileError};
