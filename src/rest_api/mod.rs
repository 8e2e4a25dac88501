//! Health and metrics HTTP endpoint
//!
//! Serves `/healthz` for probes and `/metrics` for Prometheus scraping.

mod server;

pub use server::run_server;
