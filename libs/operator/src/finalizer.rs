//! Generic finalizer add/remove helpers shared by every cascade-deleting
//! reconciler (`Bundle`, `GitRepo`, `Cluster`, `Content`).
//!
//! Cascade deletion needs to hold a finalizer across many reconciles while it waits for a
//! lower layer to report clean removal. `kube::runtime::finalizer::finalizer`
//! removes the finalizer unconditionally once its closure returns `Ok`, which
//! does not compose with "wait, not done yet", so cascades here use these
//! plain JSON-patch helpers directly instead of the wrapper.

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::Result;

/// Adds `finalizer_name` to `object`'s metadata if it is not already present.
/// A no-op (returns the object unchanged, no API call) when already present.
pub async fn add<K>(api: &Api<K>, name: &str, finalizer_name: &str) -> Result<K>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    let patch: Value = json!({
        "metadata": {
            "finalizers": [finalizer_name]
        }
    });
    let patch = Patch::Merge(&patch);
    api.patch(name, &PatchParams::default(), &patch)
        .await
        .map_err(Into::into)
}

/// Removes `finalizer_name` from `object`'s metadata, preserving any other
/// finalizers. A no-op if it was already absent.
pub async fn remove<K>(api: &Api<K>, object: &K, finalizer_name: &str) -> Result<K>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    let remaining: Vec<&String> = object
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer_name)
        .collect();
    let patch: Value = json!({
        "metadata": {
            "finalizers": remaining
        }
    });
    let patch = Patch::Merge(&patch);
    api.patch(object.name_any().as_str(), &PatchParams::default(), &patch)
        .await
        .map_err(Into::into)
}

pub fn has(object: &impl Resource, finalizer_name: &str) -> bool {
    object.finalizers().iter().any(|f| f == finalizer_name)
}

pub fn is_deleting(object: &impl Resource) -> bool {
    object.meta().deletion_timestamp.is_some()
}
