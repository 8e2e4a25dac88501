//! Kernel Module Management `Module` derived from a DeviceConfig
//!
//! The Module tells KMM which driver image to load on which nodes and
//! which device plugin to run once the `habanalabs` module is loaded.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::apply::{create_or_patch, set_controller_reference};
use crate::config::Settings;
use crate::crd::{
    DeviceConfig, DevicePluginContainerSpec, DevicePluginSpec, KernelMapping, ModprobeSpec,
    Module, ModuleLoaderContainerSpec, ModuleLoaderSpec, ModuleSpec, DEVICE_TYPE,
};
use crate::error::{Error, Result};

const MODULE_SUFFIX: &str = "module";

const KERNEL_MODULE_NAME: &str = "habanalabs";
const FIRMWARE_PATH: &str = "/opt/lib/firmware/habanalabs";
const KERNEL_VERSION_REGEXP: &str = r"^.*\.el\d_?\d?\..*$";
const DRIVER_SERVICE_ACCOUNT: &str = "driver-habana";

const DEVICE_PLUGIN_COMMAND: &str = "habanalabs-device-plugin";
const DEVICE_PLUGIN_SERVICE_ACCOUNT: &str = "device-plugin";
const DEVICE_PLUGIN_REQUESTS_CPU: &str = "100m";
const DEVICE_PLUGIN_REQUESTS_MEMORY: &str = "50Mi";
const DEVICE_PLUGIN_LIMITS_CPU: &str = "200m";
const DEVICE_PLUGIN_LIMITS_MEMORY: &str = "100Mi";

const PULL_ALWAYS: &str = "Always";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModuleReconciler: Send + Sync {
    async fn reconcile_module(&self, dc: &DeviceConfig) -> Result<()>;

    async fn delete_module(&self, dc: &DeviceConfig) -> Result<()>;
}

/// Name of the Module derived from `dc`
pub fn module_name(dc: &DeviceConfig) -> String {
    format!("{}-{}", dc.name_any(), MODULE_SUFFIX)
}

/// Label announcing that a node carries a device of `device_type`
pub fn device_present_label(device_type: &str) -> String {
    format!("habana.ai/hpu.{}.present", device_type)
}

/// Nodes served by `dc`: its effective selector plus the device presence label
pub fn served_node_selector(dc: &DeviceConfig) -> BTreeMap<String, String> {
    let mut selector = dc.spec.effective_node_selector();
    selector.insert(device_present_label(DEVICE_TYPE), "true".to_string());
    selector
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(dc: &DeviceConfig) -> OwnerReference {
    OwnerReference {
        api_version: DeviceConfig::api_version(&()).to_string(),
        kind: DeviceConfig::kind(&()).to_string(),
        name: dc.name_any(),
        uid: dc.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Desired spec of the Module derived from `dc`
pub fn desired_module_spec(dc: &DeviceConfig, device_plugin_image: &str) -> ModuleSpec {
    ModuleSpec {
        device_plugin: Some(make_device_plugin(device_plugin_image, DEVICE_TYPE)),
        module_loader: make_module_loader(dc),
        selector: served_node_selector(dc),
    }
}

/// Overwrite `module` with the state derived from `dc`.
///
/// The module must already carry the identity derived from `dc`.
pub fn set_desired_module(module: &mut Module, dc: &DeviceConfig, device_plugin_image: &str) -> Result<()> {
    let expected = module_name(dc);
    if module.name_any() != expected || module.namespace() != dc.namespace() {
        return Err(Error::InvalidObject(format!(
            "module {}/{} does not belong to DeviceConfig {} (expected {})",
            module.namespace().unwrap_or_default(),
            module.name_any(),
            dc.key(),
            expected
        )));
    }

    module.spec = desired_module_spec(dc, device_plugin_image);
    set_controller_reference(&mut module.metadata, owner_reference(dc));
    Ok(())
}

fn make_module_loader(dc: &DeviceConfig) -> ModuleLoaderSpec {
    ModuleLoaderSpec {
        container: ModuleLoaderContainerSpec {
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            kernel_mappings: make_kernel_mappings(dc),
            modprobe: ModprobeSpec {
                module_name: KERNEL_MODULE_NAME.to_string(),
                firmware_path: Some(FIRMWARE_PATH.to_string()),
            },
        },
        service_account_name: Some(DRIVER_SERVICE_ACCOUNT.to_string()),
    }
}

fn make_kernel_mappings(dc: &DeviceConfig) -> Vec<KernelMapping> {
    // ${KERNEL_FULL_VERSION} is expanded by KMM on each node
    vec![KernelMapping {
        container_image: Some(format!(
            "{}:{}-${{KERNEL_FULL_VERSION}}",
            dc.spec.driver_image, dc.spec.driver_version
        )),
        literal: None,
        regexp: Some(KERNEL_VERSION_REGEXP.to_string()),
    }]
}

fn make_device_plugin(image: &str, device_type: &str) -> DevicePluginSpec {
    DevicePluginSpec {
        container: DevicePluginContainerSpec {
            args: vec!["--dev_type".to_string(), device_type.to_string()],
            command: vec![DEVICE_PLUGIN_COMMAND.to_string()],
            image: image.to_string(),
            image_pull_policy: Some(PULL_ALWAYS.to_string()),
            resources: Some(ResourceRequirements {
                limits: Some(resource_list(DEVICE_PLUGIN_LIMITS_CPU, DEVICE_PLUGIN_LIMITS_MEMORY)),
                requests: Some(resource_list(
                    DEVICE_PLUGIN_REQUESTS_CPU,
                    DEVICE_PLUGIN_REQUESTS_MEMORY,
                )),
                ..Default::default()
            }),
        },
        service_account_name: Some(DEVICE_PLUGIN_SERVICE_ACCOUNT.to_string()),
    }
}

pub(crate) fn resource_list(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

pub struct KubeModuleReconciler {
    client: Client,
    settings: Arc<Settings>,
}

impl KubeModuleReconciler {
    pub fn new(client: Client, settings: Arc<Settings>) -> Self {
        Self { client, settings }
    }

    fn api(&self, dc: &DeviceConfig) -> Api<Module> {
        Api::namespaced(self.client.clone(), &dc.namespace_or_default())
    }
}

#[async_trait]
impl ModuleReconciler for KubeModuleReconciler {
    #[instrument(skip(self, dc), fields(name = %dc.name_any(), namespace = dc.namespace()))]
    async fn reconcile_module(&self, dc: &DeviceConfig) -> Result<()> {
        let mut template = Module::new(&module_name(dc), ModuleSpec::default());
        template.metadata.namespace = Some(dc.namespace_or_default());
        let image = self.settings.device_plugin_image.as_str();

        // The template is namespaced like the DC, including the defaulted namespace
        let mut owner = dc.clone();
        owner.metadata.namespace = Some(dc.namespace_or_default());

        let result = create_or_patch(&self.api(dc), template, |module| {
            set_desired_module(module, &owner, image)
        })
        .await?;

        info!("Reconciled Module {}: {}", module_name(dc), result);
        Ok(())
    }

    async fn delete_module(&self, dc: &DeviceConfig) -> Result<()> {
        let name = module_name(dc);

        match self.api(dc).delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted Module {}", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!("Module {} not found, already deleted", name);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }
}
