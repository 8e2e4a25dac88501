//! Process-wide settings
//!
//! Read once at startup from flags or environment variables and shared with
//! every reconcile through an `Arc`.

use std::net::SocketAddr;

use clap::{Parser, ValueEnum};

/// Default image of the Habana metric exporter
pub const DEFAULT_NODE_METRICS_IMAGE: &str =
    "vault.habana.ai/gaudi-metric-exporter/metric-exporter:latest";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "habana-ai-operator")]
#[command(about = "Reconciles Habana Gaudi DeviceConfig resources", long_about = None)]
#[command(version)]
pub struct Settings {
    /// Image of the Habana device plugin run by KMM
    #[arg(long, env = "DEVICE_PLUGIN_IMAGE")]
    pub device_plugin_image: String,

    /// Image of the per-node metric exporter
    #[arg(long, env = "NODE_METRICS_IMAGE", default_value = DEFAULT_NODE_METRICS_IMAGE)]
    pub node_metrics_image: String,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: SocketAddr,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}
