//! Habana AI operator
//!
//! Reconciles `DeviceConfig` resources into a Kernel Module Management
//! `Module`, node labels and a metrics exporter DaemonSet for nodes carrying
//! Habana Gaudi accelerators.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;

pub use error::{Error, Result};
