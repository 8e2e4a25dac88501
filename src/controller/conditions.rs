//! Ready / Errored status conditions of DeviceConfig resources
//!
//! Each call writes both condition types in a single status patch so a tick
//! never leaves Ready and Errored true at the same time.

use async_trait::async_trait;
use kube::api::{Api, Patch};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::apply::write_params;
use super::store::{retry_on_conflict, CONFLICT_RETRIES};
use crate::crd::{set_condition, Condition, DeviceConfig};
use crate::error::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConditionsUpdater: Send + Sync {
    async fn set_conditions_ready(&self, dc: &DeviceConfig, reason: &str, message: &str) -> Result<()>;

    async fn set_conditions_errored(&self, dc: &DeviceConfig, reason: &str, message: &str) -> Result<()>;
}

/// Conditions after a successful tick: Ready=True, Errored=False
pub fn ready_conditions(
    current: &[Condition],
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> Vec<Condition> {
    let mut conditions = current.to_vec();
    set_condition(
        &mut conditions,
        Condition::ready(true, reason, message).with_observed_generation(generation),
    );
    set_condition(
        &mut conditions,
        Condition::errored(false, reason, message).with_observed_generation(generation),
    );
    conditions
}

/// Conditions after a failed tick: Errored=True, Ready=False
pub fn errored_conditions(
    current: &[Condition],
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> Vec<Condition> {
    let mut conditions = current.to_vec();
    set_condition(
        &mut conditions,
        Condition::errored(true, reason, message).with_observed_generation(generation),
    );
    set_condition(
        &mut conditions,
        Condition::ready(false, reason, message).with_observed_generation(generation),
    );
    conditions
}

pub struct KubeConditionsUpdater {
    client: Client,
}

impl KubeConditionsUpdater {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Read-modify-write of `.status.conditions` against the latest object
    async fn update<F>(&self, dc: &DeviceConfig, compute: F) -> Result<()>
    where
        F: Fn(&[Condition], Option<i64>) -> Vec<Condition>,
    {
        let api: Api<DeviceConfig> = Api::namespaced(self.client.clone(), &dc.namespace_or_default());
        let latest = api.get(&dc.name_any()).await?;
        let conditions = compute(latest.conditions(), latest.metadata.generation);

        if conditions.as_slice() == latest.conditions() {
            debug!("Conditions of {} already up to date", dc.key());
            return Ok(());
        }

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": latest.resource_version() },
            "status": { "conditions": conditions }
        });
        api.patch_status(
            &dc.name_any(),
            &write_params(),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ConditionsUpdater for KubeConditionsUpdater {
    async fn set_conditions_ready(&self, dc: &DeviceConfig, reason: &str, message: &str) -> Result<()> {
        retry_on_conflict(CONFLICT_RETRIES, move || {
            self.update(dc, |current, generation| {
                ready_conditions(current, generation, reason, message)
            })
        })
        .await
    }

    async fn set_conditions_errored(&self, dc: &DeviceConfig, reason: &str, message: &str) -> Result<()> {
        retry_on_conflict(CONFLICT_RETRIES, move || {
            self.update(dc, |current, generation| {
                errored_conditions(current, generation, reason, message)
            })
        })
        .await
    }
}
