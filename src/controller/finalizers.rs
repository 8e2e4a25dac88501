//! Deletion finalizer of DeviceConfig resources
//!
//! The finalizer is a published claim on cleanup work, not a lock: it is
//! added before any child exists and removed once cleanup has finished.

use async_trait::async_trait;
use kube::api::{Api, Patch};
use kube::{Client, ResourceExt};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use super::apply::write_params;
use super::store::{retry_on_conflict, CONFLICT_RETRIES};
use crate::crd::DeviceConfig;
use crate::error::{Error, Result};

/// Finalizer registered by this operator on every DeviceConfig
pub const DEVICE_CONFIG_FINALIZER: &str = "habana.ai/deletion";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FinalizerUpdater: Send + Sync {
    fn contains_deletion_finalizer(&self, dc: &DeviceConfig) -> bool;

    async fn add_deletion_finalizer(&self, dc: &DeviceConfig) -> Result<()>;

    async fn remove_deletion_finalizer(&self, dc: &DeviceConfig) -> Result<()>;
}

/// `finalizers` with `finalizer` appended, or `None` when already present
pub fn with_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    if finalizers.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut updated = finalizers.to_vec();
    updated.push(finalizer.to_string());
    Some(updated)
}

/// `finalizers` without any occurrence of `finalizer`, or `None` when absent
pub fn without_finalizer(finalizers: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !finalizers.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        finalizers
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

pub struct KubeFinalizerUpdater {
    client: Client,
}

impl KubeFinalizerUpdater {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, dc: &DeviceConfig) -> Api<DeviceConfig> {
        Api::namespaced(self.client.clone(), &dc.namespace_or_default())
    }

    /// Refetch, recompute and patch the finalizer list once
    async fn update_finalizers<F>(&self, dc: &DeviceConfig, compute: F) -> Result<()>
    where
        F: Fn(&[String]) -> Option<Vec<String>>,
    {
        let api = self.api(dc);
        let latest = api.get(&dc.name_any()).await?;

        let Some(finalizers) = compute(latest.finalizers()) else {
            return Ok(());
        };

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": latest.resource_version(),
                "finalizers": finalizers
            }
        });
        api.patch(
            &dc.name_any(),
            &write_params(),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FinalizerUpdater for KubeFinalizerUpdater {
    fn contains_deletion_finalizer(&self, dc: &DeviceConfig) -> bool {
        dc.finalizers().iter().any(|f| f == DEVICE_CONFIG_FINALIZER)
    }

    async fn add_deletion_finalizer(&self, dc: &DeviceConfig) -> Result<()> {
        if dc.is_being_deleted() {
            return Err(Error::FinalizerError(format!(
                "refusing to add finalizer to {} which is being deleted",
                dc.key()
            )));
        }

        retry_on_conflict(CONFLICT_RETRIES, move || {
            self.update_finalizers(dc, |current| {
                with_finalizer(current, DEVICE_CONFIG_FINALIZER)
            })
        })
        .await?;

        info!("Added finalizer {} to {}", DEVICE_CONFIG_FINALIZER, dc.key());
        Ok(())
    }

    async fn remove_deletion_finalizer(&self, dc: &DeviceConfig) -> Result<()> {
        retry_on_conflict(CONFLICT_RETRIES, move || {
            self.update_finalizers(dc, |current| {
                without_finalizer(current, DEVICE_CONFIG_FINALIZER)
            })
        })
        .await?;

        info!("Removed finalizer {} from {}", DEVICE_CONFIG_FINALIZER, dc.key());
        Ok(())
    }
}
