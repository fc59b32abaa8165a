//! Metrics registry for Meridian observability
//!
//! Instruments are registered lazily on the global meter. Exporter wiring
//! belongs to the binary; without one these are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, ObservableGauge};
use opentelemetry::KeyValue;

use crate::crd::Phase;

/// Global meter for Meridian metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("meridian"));

/// Histogram of Installation reconcile duration
///
/// Labels:
/// - `installation`: Installation name
/// - `phase`: overall phase returned
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("meridian_reconcile_duration_seconds")
        .with_description("Duration of Installation reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed product steps
///
/// Labels:
/// - `product`: product name
/// - `step`: failing step
pub static STEP_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("meridian_step_failures_total")
        .with_description("Total number of failed reconcile steps")
        .with_unit("{failures}")
        .build()
});

/// Gauge of the last phase reported per product (0 = completed)
///
/// Labels:
/// - `product`: product name
pub static PRODUCT_PHASE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("meridian_product_phase")
        .with_description("Last phase reported by each product controller")
        .with_unit("{phase}")
        .build()
});

/// One exported identity action: the account, the verb and the answer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityActionSample {
    /// Target account
    pub username: String,
    /// HTTP-style verb of the action
    pub method: String,
    /// Status code the directory answered with
    pub code: u16,
}

/// Export the identity action gauge from a snapshot source
///
/// The gauge is observed, not recorded: each collection reports exactly what
/// `snapshot` returns, so accounts missing from the latest sync run drop out
/// of the export.
///
/// Labels:
/// - `username`: target account
/// - `method`: HTTP-style verb of the action
pub fn observe_identity_actions<F>(snapshot: F) -> ObservableGauge<u64>
where
    F: Fn() -> Vec<IdentityActionSample> + Send + Sync + 'static,
{
    METER
        .u64_observable_gauge("meridian_identity_user_action")
        .with_description("Status code of the last identity sync action per account")
        .with_unit("{code}")
        .with_callback(move |observer| {
            for sample in snapshot() {
                observer.observe(
                    u64::from(sample.code),
                    &[
                        KeyValue::new("username", sample.username),
                        KeyValue::new("method", sample.method),
                    ],
                );
            }
        })
        .build()
}

/// Stable numeric encoding of a phase for the phase gauge
pub fn phase_value(phase: Phase) -> i64 {
    match phase {
        Phase::Completed => 0,
        Phase::InProgress => 1,
        Phase::AwaitingComponents => 2,
        Phase::CreatingComponents => 3,
        Phase::Failed => 4,
    }
}

/// Record the outcome of one reconcile
pub fn record_reconcile(installation: &str, phase: Phase, seconds: f64) {
    RECONCILE_DURATION.record(
        seconds,
        &[
            KeyValue::new("installation", installation.to_string()),
            KeyValue::new("phase", phase.to_string()),
        ],
    );
}

/// Record the phase a product reported
pub fn record_product_phase(product: &str, phase: Phase) {
    PRODUCT_PHASE.record(
        phase_value(phase),
        &[KeyValue::new("product", product.to_string())],
    );
}

/// Count a failed step
pub fn record_step_failure(product: &str, step: &str) {
    STEP_FAILURES.add(
        1,
        &[
            KeyValue::new("product", product.to_string()),
            KeyValue::new("step", step.to_string()),
        ],
    );
}
