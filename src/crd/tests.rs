//! Unit tests for the DeviceConfig and Module resource types

mod device_config_spec {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;

    use crate::crd::{DeviceConfig, DeviceConfigSpec, DEFAULT_NODE_SELECTOR_KEY};

    fn node_with_labels(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("test-node".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn device_config(selector: &[(&str, &str)]) -> DeviceConfig {
        DeviceConfig::new(
            "test",
            DeviceConfigSpec {
                driver_image: "drv".to_string(),
                driver_version: "v1".to_string(),
                node_selector: selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        )
    }

    #[test]
    fn test_empty_selector_falls_back_to_pci_label() {
        let spec = DeviceConfigSpec::default();
        let selector = spec.effective_node_selector();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.get(DEFAULT_NODE_SELECTOR_KEY), Some(&"true".to_string()));
    }

    #[test]
    fn test_explicit_selector_is_used_verbatim() {
        let dc = device_config(&[("role", "hpu")]);
        assert_eq!(
            dc.spec.effective_node_selector(),
            BTreeMap::from([("role".to_string(), "hpu".to_string())])
        );
    }

    #[test]
    fn test_selects_requires_all_pairs() {
        let dc = device_config(&[("role", "hpu"), ("zone", "a")]);
        assert!(dc.selects(&node_with_labels(&[("role", "hpu"), ("zone", "a"), ("x", "y")])));
        assert!(!dc.selects(&node_with_labels(&[("role", "hpu")])));
        assert!(!dc.selects(&node_with_labels(&[("role", "hpu"), ("zone", "b")])));
    }

    #[test]
    fn test_empty_selector_does_not_select_unlabelled_nodes() {
        let dc = device_config(&[]);
        assert!(!dc.selects(&node_with_labels(&[("matching", "label")])));
        assert!(dc.selects(&node_with_labels(&[(DEFAULT_NODE_SELECTOR_KEY, "true")])));
    }

    #[test]
    fn test_identity_defaults_namespace() {
        let a = device_config(&[]);
        let mut b = device_config(&[]);
        assert!(a.same_identity(&b));
        assert_eq!(a.key(), "default/test");

        b.metadata.namespace = Some("other".to_string());
        assert!(!a.same_identity(&b));
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let dc = device_config(&[("role", "hpu")]);
        let value = serde_json::to_value(&dc.spec).unwrap();
        assert_eq!(value["driverImage"], "drv");
        assert_eq!(value["driverVersion"], "v1");
        assert_eq!(value["nodeSelector"]["role"], "hpu");
    }

    #[test]
    fn test_crd_metadata() {
        use kube::CustomResourceExt;

        let crd = DeviceConfig::crd();
        assert_eq!(crd.spec.group, "hlai.habana.ai");
        assert_eq!(crd.spec.names.kind, "DeviceConfig");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}

mod conditions {
    use crate::crd::{
        find_condition, set_condition, Condition, CONDITION_ERRORED, CONDITION_READY,
    };

    #[test]
    fn test_set_condition_appends_new_type() {
        let mut conditions = vec![Condition::ready(true, "Reconciled", "ok")];
        set_condition(&mut conditions, Condition::errored(false, "Reconciled", "ok"));

        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, CONDITION_READY).is_some());
        assert!(find_condition(&conditions, CONDITION_ERRORED).is_some());
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut original = Condition::ready(true, "Reconciled", "generation 1");
        original.last_transition_time = "2022-01-01T00:00:00+00:00".to_string();
        let mut conditions = vec![original];

        set_condition(&mut conditions, Condition::ready(true, "Reconciled", "generation 2"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, "2022-01-01T00:00:00+00:00");
        assert_eq!(conditions[0].message, "generation 2");
    }

    #[test]
    fn test_transition_time_changes_with_status() {
        let mut original = Condition::ready(true, "Reconciled", "ok");
        original.last_transition_time = "2022-01-01T00:00:00+00:00".to_string();
        let mut conditions = vec![original];

        set_condition(&mut conditions, Condition::ready(false, "ModuleFailed", "boom"));

        assert_ne!(conditions[0].last_transition_time, "2022-01-01T00:00:00+00:00");
        assert!(!conditions[0].is_true());
        assert_eq!(conditions[0].reason, "ModuleFailed");
    }

    #[test]
    fn test_unrelated_conditions_preserved() {
        let custom = Condition {
            type_: "DriverLoaded".to_string(),
            status: "True".to_string(),
            last_transition_time: "2022-01-01T00:00:00+00:00".to_string(),
            reason: "Loaded".to_string(),
            message: String::new(),
            observed_generation: Some(3),
        };
        let mut conditions = vec![custom.clone()];

        set_condition(&mut conditions, Condition::errored(true, "ModuleFailed", "boom"));

        assert_eq!(conditions[0], custom);
    }

    #[test]
    fn test_condition_serializes_type_field() {
        let condition = Condition::errored(true, "ModuleFailed", "boom").with_observed_generation(Some(4));
        let value = serde_json::to_value(&condition).unwrap();
        assert_eq!(value["type"], "Errored");
        assert_eq!(value["status"], "True");
        assert_eq!(value["observedGeneration"], 4);
        assert!(value.get("lastTransitionTime").is_some());
    }
}

mod module_resource {
    use crate::crd::{KernelMapping, Module, ModuleSpec};

    #[test]
    fn test_module_serializes_kmm_field_names() {
        let mut spec = ModuleSpec::default();
        spec.module_loader.container.modprobe.module_name = "habanalabs".to_string();
        spec.module_loader.container.kernel_mappings = vec![KernelMapping {
            container_image: Some("drv:v1-${KERNEL_FULL_VERSION}".to_string()),
            literal: None,
            regexp: Some("^.*$".to_string()),
        }];
        let module = Module::new("test-module", spec);

        let value = serde_json::to_value(&module).unwrap();
        assert_eq!(value["apiVersion"], "kmm.sigs.x-k8s.io/v1beta1");
        assert_eq!(value["kind"], "Module");
        let container = &value["spec"]["moduleLoader"]["container"];
        assert_eq!(container["modprobe"]["moduleName"], "habanalabs");
        assert_eq!(
            container["kernelMappings"][0]["containerImage"],
            "drv:v1-${KERNEL_FULL_VERSION}"
        );
        assert!(container["kernelMappings"][0].get("literal").is_none());
    }
}
