//! Metrics exporter DaemonSet derived from a DeviceConfig
//!
//! The DaemonSet runs on the nodes served by the Module, so its pods land
//! only where the driver is loaded.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::Api;
use kube::{Client, ResourceExt};
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use super::apply::{create_or_patch, set_controller_reference, FIELD_MANAGER};
use super::module::{owner_reference, resource_list, served_node_selector};
use super::node_labeler::name_label_value;
use crate::config::Settings;
use crate::crd::DeviceConfig;
use crate::error::Result;

const NODE_METRICS_SUFFIX: &str = "node-metrics";
const APP_NAME: &str = "habana-node-metrics";
const CONTAINER_NAME: &str = "node-metrics";
const SERVICE_ACCOUNT: &str = "metric-exporter";
const METRICS_PORT_NAME: &str = "metrics";
const METRICS_PORT: i32 = 41611;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeMetricsReconciler: Send + Sync {
    async fn reconcile_node_metrics(&self, dc: &DeviceConfig) -> Result<()>;
}

/// Name of the metrics DaemonSet derived from `dc`
pub fn node_metrics_name(dc: &DeviceConfig) -> String {
    format!("{}-{}", dc.name_any(), NODE_METRICS_SUFFIX)
}

fn standard_labels(dc: &DeviceConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
        (
            "app.kubernetes.io/instance".to_string(),
            name_label_value(&dc.name_any()),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Overwrite the operator-owned fields of `ds` with the state derived from `dc`.
///
/// Fields defaulted by the API server are left alone so an unchanged
/// DeviceConfig produces no patch. The label selector is immutable and is
/// only written when the DaemonSet has none yet.
pub fn set_desired_node_metrics(ds: &mut DaemonSet, dc: &DeviceConfig, image: &str) {
    let labels = standard_labels(dc);
    ds.labels_mut().extend(labels.clone());
    set_controller_reference(&mut ds.metadata, owner_reference(dc));

    let spec = ds.spec.get_or_insert_with(DaemonSetSpec::default);
    if spec.selector.match_labels.is_none() && spec.selector.match_expressions.is_none() {
        spec.selector = LabelSelector {
            match_labels: Some(labels.clone()),
            ..Default::default()
        };
    }

    let template = &mut spec.template;
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels);

    let pod = template.spec.get_or_insert_with(PodSpec::default);
    pod.node_selector = Some(served_node_selector(dc));
    pod.service_account_name = Some(SERVICE_ACCOUNT.to_string());

    match pod.containers.iter_mut().find(|c| c.name == CONTAINER_NAME) {
        Some(container) => set_desired_container(container, image),
        None => {
            let mut container = Container {
                name: CONTAINER_NAME.to_string(),
                ..Default::default()
            };
            set_desired_container(&mut container, image);
            pod.containers.push(container);
        }
    }
}

fn set_desired_container(container: &mut Container, image: &str) {
    container.image = Some(image.to_string());

    let ports = container.ports.get_or_insert_with(Vec::new);
    match ports.iter_mut().find(|p| p.name.as_deref() == Some(METRICS_PORT_NAME)) {
        Some(port) => {
            port.container_port = METRICS_PORT;
            port.protocol = Some("TCP".to_string());
        }
        None => ports.push(ContainerPort {
            name: Some(METRICS_PORT_NAME.to_string()),
            container_port: METRICS_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }),
    }

    container
        .security_context
        .get_or_insert_with(SecurityContext::default)
        .privileged = Some(true);

    let resources = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    resources.requests = Some(resource_list("100m", "50Mi"));
    resources.limits = Some(resource_list("200m", "100Mi"));
}

pub struct KubeNodeMetricsReconciler {
    client: Client,
    settings: Arc<Settings>,
}

impl KubeNodeMetricsReconciler {
    pub fn new(client: Client, settings: Arc<Settings>) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl NodeMetricsReconciler for KubeNodeMetricsReconciler {
    #[instrument(skip(self, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
    async fn reconcile_node_metrics(&self, dc: &DeviceConfig) -> Result<()> {
        let namespace = dc.namespace_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);

        let template = DaemonSet {
            metadata: ObjectMeta {
                name: Some(node_metrics_name(dc)),
                namespace: Some(namespace),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                template: PodTemplateSpec::default(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let image = self.settings.node_metrics_image.as_str();

        let result = create_or_patch(&api, template, |ds| {
            set_desired_node_metrics(ds, dc, image);
            Ok(())
        })
        .await?;

        info!("Reconciled DaemonSet {}: {}", node_metrics_name(dc), result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::controller::apply::merge_patch;
    use crate::crd::DeviceConfigSpec;

    fn test_device_config() -> DeviceConfig {
        let mut dc = DeviceConfig::new(
            "gaudi",
            DeviceConfigSpec {
                driver_image: "driver".to_string(),
                driver_version: "1.7.0".to_string(),
                node_selector: BTreeMap::from([("role".to_string(), "hpu".to_string())]),
            },
        );
        dc.metadata.namespace = Some("habana".to_string());
        dc.metadata.uid = Some("uid-1".to_string());
        dc
    }

    fn desired(dc: &DeviceConfig) -> DaemonSet {
        let mut ds = DaemonSet {
            metadata: ObjectMeta {
                name: Some(node_metrics_name(dc)),
                namespace: dc.namespace(),
                ..Default::default()
            },
            ..Default::default()
        };
        set_desired_node_metrics(&mut ds, dc, "metrics:1");
        ds
    }

    #[test]
    fn test_daemonset_shape() {
        let dc = test_device_config();
        let ds = desired(&dc);

        assert_eq!(ds.name_any(), "gaudi-node-metrics");
        assert_eq!(ds.labels()["app.kubernetes.io/name"], "habana-node-metrics");
        assert_eq!(ds.labels()["app.kubernetes.io/instance"], "gaudi");
        assert_eq!(ds.owner_references()[0].uid, "uid-1");

        let spec = ds.spec.unwrap();
        assert_eq!(spec.selector.match_labels, Some(standard_labels(&dc)));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("metric-exporter"));
        let selector = pod.node_selector.unwrap();
        assert_eq!(selector["role"], "hpu");
        assert_eq!(selector["habana.ai/hpu.gaudi.present"], "true");

        let container = &pod.containers[0];
        assert_eq!(container.name, "node-metrics");
        assert_eq!(container.image.as_deref(), Some("metrics:1"));
        let port = &container.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 41611);
        assert_eq!(port.name.as_deref(), Some("metrics"));
        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits.as_ref().unwrap()["memory"],
            Quantity("100Mi".to_string())
        );
    }

    #[test]
    fn test_long_name_labels_fit() {
        let mut dc = test_device_config();
        dc.metadata.name = Some(format!("{}.gaudi", "a".repeat(64)));
        let ds = desired(&dc);

        assert!(ds.labels().values().all(|v| v.len() <= 63));
        let spec = ds.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        assert!(selector.values().all(|v| v.len() <= 63));
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert!(template_labels.values().all(|v| v.len() <= 63));
        assert_eq!(
            selector["app.kubernetes.io/instance"],
            template_labels["app.kubernetes.io/instance"]
        );
    }

    #[test]
    fn test_unchanged_config_needs_no_patch() {
        let dc = test_device_config();
        let mut stored = desired(&dc);
        // fields defaulted by the API server survive the mutation
        stored.spec.as_mut().unwrap().revision_history_limit = Some(10);
        let before = serde_json::to_value(&stored).unwrap();

        set_desired_node_metrics(&mut stored, &dc, "metrics:1");
        let after = serde_json::to_value(&stored).unwrap();

        assert_eq!(merge_patch(&before, &after), None);
    }

    #[test]
    fn test_selector_is_not_rewritten() {
        let dc = test_device_config();
        let mut stored = desired(&dc);
        let original = stored.spec.as_ref().unwrap().selector.clone();

        let mut renamed = dc.clone();
        renamed.spec.node_selector = BTreeMap::from([("zone".to_string(), "a".to_string())]);
        set_desired_node_metrics(&mut stored, &renamed, "metrics:2");

        let spec = stored.spec.unwrap();
        assert_eq!(spec.selector, original);
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].image.as_deref(), Some("metrics:2"));
        assert_eq!(pod.node_selector.unwrap().get("zone"), Some(&"a".to_string()));
    }
}
