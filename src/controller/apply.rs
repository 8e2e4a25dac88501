//! Create-or-patch primitive shared by the child sub-reconcilers
//!
//! The stored object is mutated in memory, diffed against its stored form and
//! the difference is sent as a JSON merge patch guarded by the
//! resourceVersion that was read. An empty difference issues no write.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;

/// Field manager recorded on every write of this operator
pub const FIELD_MANAGER: &str = "habana-ai-operator";

/// Parameters of the merge patches sent by this operator
pub fn write_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// What `create_or_patch` did to the stored object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for OperationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationResult::Created => "created",
            OperationResult::Updated => "updated",
            OperationResult::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Create `template` (after `mutate`) if no object named like it exists,
/// otherwise apply `mutate` to the stored object and patch the difference.
pub async fn create_or_patch<K, F>(api: &Api<K>, template: K, mutate: F) -> Result<OperationResult>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    F: FnOnce(&mut K) -> Result<()>,
{
    let name = template.name_any();

    let Some(existing) = api.get_opt(&name).await? else {
        let mut object = template;
        mutate(&mut object)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, &object).await?;
        return Ok(OperationResult::Created);
    };

    let resource_version = existing.resource_version();
    let before = serde_json::to_value(&existing)?;
    let mut desired = existing;
    mutate(&mut desired)?;
    let after = serde_json::to_value(&desired)?;

    let Some(mut patch) = merge_patch(&before, &after) else {
        debug!("{} is up to date", name);
        return Ok(OperationResult::Unchanged);
    };
    if let Value::Object(fields) = &mut patch {
        fields.remove("status");
    }
    if let Some(rv) = resource_version {
        patch["metadata"]["resourceVersion"] = Value::String(rv);
    }

    api.patch(&name, &write_params(), &Patch::Merge(&patch)).await?;
    Ok(OperationResult::Updated)
}

/// Compute the JSON merge patch (RFC 7386) turning `before` into `after`.
///
/// Returns `None` when both documents are equal. Keys missing from `after`
/// are nulled; arrays and scalars are replaced wholesale.
pub fn merge_patch(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) => {
                        if let Some(nested) = merge_patch(old_value, new_value) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}

/// Install `owner` as the controller reference, replacing a stale entry
/// for the same owner uid and keeping foreign references.
pub fn set_controller_reference(meta: &mut ObjectMeta, owner: OwnerReference) {
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner,
        None => refs.push(owner),
    }
}
