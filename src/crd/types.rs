//! Shared types for the operator's CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported when the last tick reconciled every child
pub const CONDITION_READY: &str = "Ready";

/// Condition type reported when the last tick failed
pub const CONDITION_ERRORED: &str = "Errored";

/// Condition reasons
pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_MODULE_FAILED: &str = "ModuleFailed";
pub const REASON_NODE_LABELER_FAILED: &str = "NodeLabelerFailed";
pub const REASON_NODE_METRICS_FAILED: &str = "NodeMetricsFailed";
pub const REASON_NODE_SELECTOR_CONFLICT: &str = "NodeSelectorConflictErrored";
pub const REASON_READY_UPDATE_FAILED: &str = "ReadyUpdateFailed";

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition ("Ready" or "Errored")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Generation of the DeviceConfig the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self::new(CONDITION_READY, status, reason, message)
    }

    /// Create a new Errored condition
    pub fn errored(status: bool, reason: &str, message: &str) -> Self {
        Self::new(CONDITION_ERRORED, status, reason, message)
    }

    fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Stamp the generation the condition describes
    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Upsert `condition` into `conditions`, keyed by type.
///
/// Other condition types are left untouched. The transition time of an
/// existing entry is kept when its status does not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
