//! Kubernetes events recorded against DeviceConfigs

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::DeviceConfig;
use crate::error::Result;

pub const EVENT_TYPE_WARNING: &str = "Warning";
pub const EVENT_REASON_NODE_SELECTOR_CONFLICT: &str = "NodeSelectorConflict";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn warning(&self, dc: &DeviceConfig, reason: &str, message: &str) -> Result<()>;
}

/// Event describing `dc`, named after it with a generated suffix
pub fn build_event(dc: &DeviceConfig, event_type: &str, reason: &str, message: &str) -> Event {
    let time = Time(chrono::Utc::now());
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-event-", dc.name_any())),
            namespace: Some(dc.namespace_or_default()),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: dc.object_ref(&()),
        first_timestamp: Some(time.clone()),
        last_timestamp: Some(time),
        count: Some(1),
        ..Default::default()
    }
}

pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn warning(&self, dc: &DeviceConfig, reason: &str, message: &str) -> Result<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &dc.namespace_or_default());
        let event = build_event(dc, EVENT_TYPE_WARNING, reason, message);
        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
