//! DeviceConfig Custom Resource Definition
//!
//! A DeviceConfig declares which nodes carry Habana Gaudi accelerators and
//! which driver image and version they should run.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Label set by Node Feature Discovery on nodes with a Habana PCI device
pub const DEFAULT_NODE_SELECTOR_KEY: &str = "feature.node.kubernetes.io/pci-1da3.present";

/// The only device type handled by this revision
pub const DEVICE_TYPE: &str = "gaudi";

/// The DeviceConfig CRD describes the accelerator setup of a set of nodes.
///
/// # Example
///
/// ```yaml
/// apiVersion: hlai.habana.ai/v1alpha1
/// kind: DeviceConfig
/// metadata:
///   name: gaudi
///   namespace: habana-ai-operator
/// spec:
///   driverImage: vault.habana.ai/habana-ai-operator/driver
///   driverVersion: "1.7.0-665"
///   nodeSelector:
///     node-role.kubernetes.io/hpu: ""
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hlai.habana.ai",
    version = "v1alpha1",
    kind = "DeviceConfig",
    namespaced,
    status = "DeviceConfigStatus",
    shortname = "dc",
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driverImage"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.driverVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigSpec {
    /// Container image registry path of the driver (without tag)
    #[serde(default)]
    pub driver_image: String,

    /// Driver version, used as tag prefix; `-${KERNEL_FULL_VERSION}` is appended at use
    #[serde(default)]
    pub driver_version: String,

    /// Labels a node must carry (all of them) to be managed by this DeviceConfig
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl DeviceConfigSpec {
    /// Effective node selector. An empty selector falls back to the PCI
    /// presence label of Habana devices instead of matching every node.
    pub fn effective_node_selector(&self) -> BTreeMap<String, String> {
        if self.node_selector.is_empty() {
            BTreeMap::from([(DEFAULT_NODE_SELECTOR_KEY.to_string(), "true".to_string())])
        } else {
            self.node_selector.clone()
        }
    }
}

/// Status subresource for DeviceConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigStatus {
    /// Ready / Errored conditions following Kubernetes conventions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl DeviceConfig {
    /// Namespace of the DeviceConfig, "default" when unset
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// `namespace/name`, used in logs and conflict messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name_any())
    }

    /// Whether `self` and `other` denote the same object
    pub fn same_identity(&self, other: &DeviceConfig) -> bool {
        self.name_any() == other.name_any()
            && self.namespace_or_default() == other.namespace_or_default()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the node's labels satisfy every pair of the effective selector
    pub fn selects(&self, node: &Node) -> bool {
        selector_matches(&self.spec.effective_node_selector(), node.labels())
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

/// Equality-based label selector match: every pair must be present
pub fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}
