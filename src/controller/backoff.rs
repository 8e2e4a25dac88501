//! Per-DeviceConfig retry delays for failed ticks
//!
//! Each consecutive failure of the same object doubles its requeue delay up
//! to a cap. A successful tick forgets the object again.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use kube::runtime::reflector::ObjectRef;

use crate::crd::DeviceConfig;

const RETRIABLE_BASE_DELAY_SECS: u64 = 5;
const PERMANENT_BASE_DELAY_SECS: u64 = 30;
const MAX_DELAY_SECS: u64 = 300;
const MAX_EXPONENT: u32 = 6;

/// Delay before retrying after `failures` consecutive failures (1-indexed)
pub fn backoff_delay(failures: u32, retriable: bool) -> Duration {
    let base = if retriable {
        RETRIABLE_BASE_DELAY_SECS
    } else {
        PERMANENT_BASE_DELAY_SECS
    };
    let exponent = failures.saturating_sub(1).min(MAX_EXPONENT);
    let delay_secs = base.saturating_mul(2_u64.saturating_pow(exponent));

    Duration::from_secs(delay_secs.min(MAX_DELAY_SECS))
}

/// Consecutive failure counts keyed by DeviceConfig
#[derive(Debug, Default)]
pub struct RetryBackoff {
    failures: Mutex<HashMap<ObjectRef<DeviceConfig>, u32>>,
}

impl RetryBackoff {
    /// Count one more failure for `obj` and return its requeue delay
    pub fn next_delay(&self, obj: &ObjectRef<DeviceConfig>, retriable: bool) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(obj.clone()).or_insert(0);
        *count = count.saturating_add(1);
        backoff_delay(*count, retriable)
    }

    /// Forget the failures of `obj` after a successful tick
    pub fn reset(&self, obj: &ObjectRef<DeviceConfig>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(obj);
    }
}
