//! Maps node changes to the DeviceConfigs that care about them

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::reflector::ObjectRef;

use super::node_labeler::carries_identity;
use crate::crd::{selector_matches, DeviceConfig};

/// DeviceConfigs whose selector matches a node with `labels` or whose
/// identity labels it carries.
///
/// The latter catches nodes that just stopped matching and still need
/// their managed labels removed.
pub fn device_configs_for_node(
    labels: &BTreeMap<String, String>,
    device_configs: &[Arc<DeviceConfig>],
) -> Vec<ObjectRef<DeviceConfig>> {
    device_configs
        .iter()
        .filter(|dc| {
            selector_matches(&dc.spec.effective_node_selector(), labels)
                || carries_identity(labels, dc)
        })
        .map(|dc| ObjectRef::from_obj(&**dc))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::node_labeler::{desired_labels, DEVICE_CONFIG_LABEL, DEVICE_CONFIG_NAMESPACE_LABEL};
    use crate::crd::DeviceConfigSpec;

    fn device_config(name: &str, selector: &[(&str, &str)]) -> Arc<DeviceConfig> {
        let mut dc = DeviceConfig::new(
            name,
            DeviceConfigSpec {
                node_selector: selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
                ..Default::default()
            },
        );
        dc.metadata.namespace = Some("habana".to_string());
        Arc::new(dc)
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_matching_device_config_is_enqueued() {
        let dcs = vec![
            device_config("hpu", &[("role", "hpu")]),
            device_config("cpu", &[("role", "cpu")]),
        ];

        let refs = device_configs_for_node(&labels(&[("role", "hpu")]), &dcs);

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "hpu");
        assert_eq!(refs[0].namespace.as_deref(), Some("habana"));
    }

    #[test]
    fn test_previous_owner_is_enqueued() {
        let dcs = vec![device_config("hpu", &[("role", "hpu")])];
        let relabelled = labels(&[
            ("role", "cpu"),
            (DEVICE_CONFIG_LABEL, "hpu"),
            (DEVICE_CONFIG_NAMESPACE_LABEL, "habana"),
        ]);

        let refs = device_configs_for_node(&relabelled, &dcs);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_previous_owner_with_long_name_is_enqueued() {
        let long = format!("{}.gaudi", "a".repeat(64));
        let dc = device_config(&long, &[("role", "hpu")]);
        let mut relabelled = desired_labels(&dc);
        relabelled.insert("role".to_string(), "cpu".to_string());

        let refs = device_configs_for_node(&relabelled, &[dc]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, long);
    }

    #[test]
    fn test_unrelated_node_enqueues_nothing() {
        let dcs = vec![device_config("hpu", &[("role", "hpu")])];
        assert!(device_configs_for_node(&BTreeMap::new(), &dcs).is_empty());
    }
}
