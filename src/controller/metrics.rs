//! Prometheus metrics for the Habana AI operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// How a reconcile tick ended
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Conflict,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub namespace: String,
    pub reason: String,
}

/// Reconcile ticks per namespace and outcome
pub static RECONCILE_TOTAL: Lazy<Family<ReconcileLabels, Counter>> = Lazy::new(Family::default);

/// Sub-reconciler failures per condition reason
pub static STAGE_FAILURES: Lazy<Family<StageLabels, Counter>> = Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "habana_deviceconfig_reconcile",
        "DeviceConfig reconcile ticks by outcome",
        RECONCILE_TOTAL.clone(),
    );
    registry.register(
        "habana_deviceconfig_stage_failures",
        "DeviceConfig sub-reconciler failures by reason",
        STAGE_FAILURES.clone(),
    );
    registry
});

pub fn record_reconcile(namespace: &str, outcome: Outcome) {
    RECONCILE_TOTAL
        .get_or_create(&ReconcileLabels {
            namespace: namespace.to_string(),
            outcome,
        })
        .inc();
}

pub fn record_stage_failure(namespace: &str, reason: &str) {
    STAGE_FAILURES
        .get_or_create(&StageLabels {
            namespace: namespace.to_string(),
            reason: reason.to_string(),
        })
        .inc();
}
