//! Controller module for DeviceConfig reconciliation
//!
//! This module contains the main controller loop, the reconciliation
//! orchestrator and the sub-reconcilers for the resources derived from a
//! DeviceConfig.

mod apply;
mod backoff;
mod conditions;
mod events;
mod finalizers;
mod mapper;
pub mod metrics;
mod module;
mod node_labeler;
mod node_metrics;
mod node_selector;
mod reconciler;
mod store;
#[cfg(test)]
mod test_support;

pub use apply::FIELD_MANAGER;
pub use finalizers::DEVICE_CONFIG_FINALIZER;
pub use node_labeler::{DEVICE_CONFIG_LABEL, DEVICE_CONFIG_NAMESPACE_LABEL, DRIVER_VERSION_LABEL};
pub use reconciler::{run_controller, ControllerState};
