//! Projection of DeviceConfig labels onto the nodes it selects
//!
//! Only the managed keys below are ever written. Each node gets its own
//! merge patch on `metadata.labels`, so labels owned by other actors are
//! preserved without reading them back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch};
use kube::{Client, ResourceExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::apply::write_params;
use crate::crd::DeviceConfig;
use crate::error::Result;

pub const DEVICE_CONFIG_LABEL: &str = "habana.ai/device-config";
pub const DEVICE_CONFIG_NAMESPACE_LABEL: &str = "habana.ai/device-config-namespace";
pub const DRIVER_VERSION_LABEL: &str = "habana.ai/driver-version";

const MANAGED_LABELS: [&str; 3] = [
    DEVICE_CONFIG_LABEL,
    DEVICE_CONFIG_NAMESPACE_LABEL,
    DRIVER_VERSION_LABEL,
];

const MAX_LABEL_VALUE_LEN: usize = 63;
const NAME_HASH_LEN: usize = 8;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLabelerReconciler: Send + Sync {
    async fn reconcile_node_labeler(&self, dc: &DeviceConfig) -> Result<()>;

    async fn remove_node_labels(&self, dc: &DeviceConfig) -> Result<()>;
}

/// Turn `value` into a valid label value.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, the result is cut to 63
/// characters and non-alphanumeric ends are trimmed.
pub fn sanitize_label_value(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();

    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Label value identifying an object called `name`.
///
/// Names that fit a label value are used as they are. Longer names keep a
/// prefix and get a short sha256 suffix, so distinct names stay distinct.
pub fn name_label_value(name: &str) -> String {
    if name.len() <= MAX_LABEL_VALUE_LEN {
        return name.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let prefix: String = name
        .chars()
        .take(MAX_LABEL_VALUE_LEN - NAME_HASH_LEN - 1)
        .collect();
    let prefix = prefix.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());

    format!("{}-{}", prefix, &digest[..NAME_HASH_LEN])
}

/// Managed labels a node selected by `dc` must carry
pub fn desired_labels(dc: &DeviceConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        (DEVICE_CONFIG_LABEL.to_string(), name_label_value(&dc.name_any())),
        (
            DEVICE_CONFIG_NAMESPACE_LABEL.to_string(),
            dc.namespace_or_default(),
        ),
        (
            DRIVER_VERSION_LABEL.to_string(),
            sanitize_label_value(&dc.spec.driver_version),
        ),
    ])
}

/// Whether `labels` name `dc` as the DeviceConfig managing the node
pub fn carries_identity(labels: &BTreeMap<String, String>, dc: &DeviceConfig) -> bool {
    labels.get(DEVICE_CONFIG_LABEL) == Some(&name_label_value(&dc.name_any()))
        && labels.get(DEVICE_CONFIG_NAMESPACE_LABEL) == Some(&dc.namespace_or_default())
}

/// Label patch for one node: values to set and keys to remove
#[derive(Clone, Debug, PartialEq)]
pub struct NodeLabelPatch {
    pub node: String,
    pub labels: BTreeMap<String, Option<String>>,
}

impl NodeLabelPatch {
    fn to_merge_patch(&self) -> Value {
        let labels: Map<String, Value> = self
            .labels
            .iter()
            .map(|(key, value)| {
                let value = value.clone().map(Value::String).unwrap_or(Value::Null);
                (key.clone(), value)
            })
            .collect();
        serde_json::json!({ "metadata": { "labels": labels } })
    }
}

/// Patches bringing `nodes` in line with `dc`.
///
/// Selected nodes get the desired labels; nodes that still carry this
/// DeviceConfig's identity but are no longer selected lose the managed keys.
/// Nodes already in the desired state are skipped.
pub fn plan_label_patches(dc: &DeviceConfig, nodes: &[Node]) -> Vec<NodeLabelPatch> {
    let desired = desired_labels(dc);

    nodes
        .iter()
        .filter_map(|node| {
            let labels = node.labels();
            let changes: BTreeMap<String, Option<String>> = if dc.selects(node) {
                desired
                    .iter()
                    .filter(|(key, value)| labels.get(key.as_str()) != Some(*value))
                    .map(|(key, value)| (key.clone(), Some(value.clone())))
                    .collect()
            } else if carries_identity(labels, dc) {
                removal(labels)
            } else {
                BTreeMap::new()
            };

            (!changes.is_empty()).then(|| NodeLabelPatch {
                node: node.name_any(),
                labels: changes,
            })
        })
        .collect()
}

/// Patches removing the managed keys from nodes carrying `dc`'s identity
pub fn plan_label_removal(dc: &DeviceConfig, nodes: &[Node]) -> Vec<NodeLabelPatch> {
    nodes
        .iter()
        .filter(|node| carries_identity(node.labels(), dc))
        .map(|node| NodeLabelPatch {
            node: node.name_any(),
            labels: removal(node.labels()),
        })
        .collect()
}

fn removal(labels: &BTreeMap<String, String>) -> BTreeMap<String, Option<String>> {
    MANAGED_LABELS
        .iter()
        .filter(|key| labels.contains_key(**key))
        .map(|key| (key.to_string(), None))
        .collect()
}

pub struct KubeNodeLabeler {
    client: Client,
}

impl KubeNodeLabeler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply(&self, patches: Vec<NodeLabelPatch>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = write_params();

        for patch in patches {
            debug!("Patching labels of node {}: {:?}", patch.node, patch.labels);
            api.patch(&patch.node, &params, &Patch::Merge(&patch.to_merge_patch()))
                .await?;
        }
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl NodeLabelerReconciler for KubeNodeLabeler {
    #[instrument(skip(self, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
    async fn reconcile_node_labeler(&self, dc: &DeviceConfig) -> Result<()> {
        let nodes = self.list_nodes().await?;
        let patches = plan_label_patches(dc, &nodes);
        if !patches.is_empty() {
            info!("Updating labels on {} node(s) for {}", patches.len(), dc.key());
        }
        self.apply(patches).await
    }

    #[instrument(skip(self, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
    async fn remove_node_labels(&self, dc: &DeviceConfig) -> Result<()> {
        let nodes = self.list_nodes().await?;
        let patches = plan_label_removal(dc, &nodes);
        if !patches.is_empty() {
            info!("Removing labels from {} node(s) for {}", patches.len(), dc.key());
        }
        self.apply(patches).await
    }
}
