//! Custom Resource Definitions for the Habana AI operator
//!
//! `DeviceConfig` is owned by this operator; `Module` belongs to Kernel
//! Module Management and is only written as a child resource.

mod device_config;
mod module;
#[cfg(test)]
mod tests;
mod types;

pub use device_config::{
    selector_matches, DeviceConfig, DeviceConfigSpec, DeviceConfigStatus,
    DEFAULT_NODE_SELECTOR_KEY, DEVICE_TYPE,
};
pub use module::{
    DevicePluginContainerSpec, DevicePluginSpec, KernelMapping, ModprobeSpec, Module,
    ModuleLoaderContainerSpec, ModuleLoaderSpec, ModuleSpec,
};
pub use types::*;
