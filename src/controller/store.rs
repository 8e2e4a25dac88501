//! Access to the primary resource in the object store

use std::future::Future;

use async_trait::async_trait;
use kube::{api::Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::DeviceConfig;
use crate::error::Result;

/// Number of attempts for writes that lose an optimistic concurrency race
pub const CONFLICT_RETRIES: usize = 3;

/// Reads DeviceConfigs from the API server.
///
/// Every tick goes through this trait; nothing is cached between ticks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceConfigStore: Send + Sync {
    /// Fetch a DeviceConfig by identity; a missing object is an API 404 error
    async fn get(&self, namespace: &str, name: &str) -> Result<DeviceConfig>;
}

pub struct KubeDeviceConfigStore {
    client: Client,
}

impl KubeDeviceConfigStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceConfigStore for KubeDeviceConfigStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<DeviceConfig> {
        let api: Api<DeviceConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}

/// Run `op` again while it fails with an HTTP 409, up to `attempts` times.
///
/// `op` must refetch the object it writes so every attempt carries a fresh
/// resourceVersion.
pub async fn retry_on_conflict<T, F, Fut>(attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!("write conflict on attempt {}, refetching: {}", attempt, e);
                attempt += 1;
            }
            result => return result,
        }
    }
}
