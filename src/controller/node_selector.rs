//! Detection of DeviceConfigs whose node selectors overlap
//!
//! A node may be managed by at most one DeviceConfig. All DeviceConfigs and
//! nodes are listed once per check and every selector is evaluated in memory.

use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::crd::DeviceConfig;
use crate::error::{Error, Result};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeSelectorValidator: Send + Sync {
    /// `Err(Error::NodeSelectorConflict)` when another DeviceConfig selects
    /// a node `dc` selects; any other error means the check could not run.
    async fn check_for_conflicts(&self, dc: &DeviceConfig) -> Result<()>;
}

/// Names of the nodes selected by `dc`
pub fn selected_node_names(dc: &DeviceConfig, nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|node| dc.selects(node))
        .map(|node| node.name_any())
        .collect()
}

/// Whether any value occurs more than once
pub fn contains_duplicates(values: &[String]) -> bool {
    let mut seen = HashSet::with_capacity(values.len());
    values.iter().any(|v| !seen.insert(v))
}

/// One DeviceConfig sharing nodes with the candidate
#[derive(Clone, Debug, PartialEq)]
pub struct Conflict {
    pub device_config: String,
    pub nodes: Vec<String>,
}

/// Every DeviceConfig other than `candidate` that selects a node `candidate` selects
pub fn find_conflicts(candidate: &DeviceConfig, others: &[DeviceConfig], nodes: &[Node]) -> Vec<Conflict> {
    let selected = selected_node_names(candidate, nodes);
    if selected.is_empty() {
        return Vec::new();
    }

    others
        .iter()
        .filter(|other| !other.same_identity(candidate))
        .filter_map(|other| {
            let other_selected = selected_node_names(other, nodes);
            let mut gathered = selected.clone();
            gathered.extend(other_selected.iter().cloned());
            if !contains_duplicates(&gathered) {
                return None;
            }

            let shared = other_selected
                .into_iter()
                .filter(|name| selected.contains(name))
                .collect();
            Some(Conflict {
                device_config: other.key(),
                nodes: shared,
            })
        })
        .collect()
}

fn conflict_error(candidate: &DeviceConfig, conflicts: &[Conflict]) -> Error {
    let details = conflicts
        .iter()
        .map(|c| format!("{} on nodes [{}]", c.device_config, c.nodes.join(", ")))
        .collect::<Vec<_>>()
        .join("; ");
    Error::NodeSelectorConflict {
        name: candidate.key(),
        details,
    }
}

/// Validator reading DeviceConfigs and nodes from the API server
pub struct KubeNodeSelectorValidator {
    client: Client,
}

impl KubeNodeSelectorValidator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeSelectorValidator for KubeNodeSelectorValidator {
    #[instrument(skip(self, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
    async fn check_for_conflicts(&self, dc: &DeviceConfig) -> Result<()> {
        let device_configs: Api<DeviceConfig> = Api::all(self.client.clone());
        let nodes: Api<Node> = Api::all(self.client.clone());

        let device_configs = device_configs.list(&ListParams::default()).await?.items;
        let nodes = nodes.list(&ListParams::default()).await?.items;

        let conflicts = find_conflicts(dc, &device_configs, &nodes);
        if conflicts.is_empty() {
            debug!("No node selector conflicts for {}", dc.key());
            return Ok(());
        }
        Err(conflict_error(dc, &conflicts))
    }
}
