use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An immutable, content-addressed blob of bundle resources. `Content` is cluster-scoped: its name (`s-<12-hex>`) is the only
/// identity it needs, and it is referenced by `BundleDeployment`s across
/// namespaces.
///
/// The only mutable field after creation is `finalizers`, which doubles as a
/// reference count: each entry is the name of a `BundleDeployment` currently
/// pinning this content. When the list drains to empty the object becomes
/// eligible for garbage collection.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "Content",
    status = "ContentStatus",
    printcolumn = r#"{"name":"Refs", "type":"integer", "jsonPath":".status.referenceCount"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    /// The decoded resources making up this content.
    pub resources: Vec<ContentResource>,
}

/// One resource record in a `Content` payload.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentResource {
    /// Canonical name used both for sort-before-hash ordering and for
    /// locating the resource inside the payload.
    pub name: String,
    /// Raw content, base64-encoded when `encoding == Base64`.
    pub content: String,
    pub encoding: ResourceEncoding,
}

impl ContentResource {
    /// Returns `content` as raw bytes, decoding it first when `encoding ==
    /// Base64`. A malformed base64 payload is a terminal-spec error: the
    /// object will never become valid through retrying.
    pub fn decoded_bytes(&self) -> Result<Vec<u8>> {
        match self.encoding {
            ResourceEncoding::Plain => Ok(self.content.clone().into_bytes()),
            ResourceEncoding::Base64 => BASE64.decode(&self.content).map_err(|e| {
                Error::ResourceDecodeError(format!("resource {}: {e}", self.name))
            }),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceEncoding {
    #[default]
    Plain,
    Base64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentStatus {
    pub reference_count: i64,
}

impl Content {
    /// Derived, not persisted on status: recomputed from `metadata.finalizers`
    /// on every read so it is never allowed to drift from the ground truth.
    pub fn reference_count(&self) -> usize {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.len())
            .unwrap_or(0)
    }

    pub fn is_referenced_by(&self, bundle_deployment_name: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|n| n == bundle_deployment_name))
    }
}
