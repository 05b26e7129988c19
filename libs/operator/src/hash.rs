//! Deterministic content addressing.
//!
//! A `Bundle`'s resource set and a `BundleDeployment`'s merged options are
//! both hashed the same way: canonicalize (sort, stable encoding), marshal
//! deterministically, hash with SHA-256. Reordering the input never changes
//! the digest.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crd::content::ContentResource;
use crate::error::{Error, Result};

/// A resource reduced to its name and decoded bytes (hex-encoded so the
/// preimage is stable regardless of the source `encoding`). `Base64` and
/// `Plain` resources carrying the same decoded bytes hash identically.
#[derive(Serialize)]
struct CanonicalResource<'a> {
    name: &'a str,
    content: String,
}

/// Sorts a resource list by name, decodes each resource's content, and
/// returns the canonical JSON encoding used as the hash preimage. Two
/// resource lists that differ only in order, or only in which `encoding`
/// was used to represent the same bytes, produce byte-identical output.
pub fn canonicalize_resources(resources: &[ContentResource]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&ContentResource> = resources.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let canonical: Vec<CanonicalResource> = sorted
        .into_iter()
        .map(|r| {
            r.decoded_bytes().map(|bytes| CanonicalResource {
                name: &r.name,
                content: hex::encode(bytes),
            })
        })
        .collect::<Result<_>>()?;
    serde_json::to_vec(&canonical).map_err(Error::SerdeError)
}

/// SHA-256 digest of the canonical resource set, hex-encoded.
pub fn resources_sha256(resources: &[ContentResource]) -> Result<String> {
    let canonical = canonicalize_resources(resources)?;
    Ok(hex_digest(&canonical))
}

/// Content object name: `s-<first-12-hex-of-digest>`. The
/// truncation is deliberate; collision risk is negligible at the expected
/// cardinality of distinct bundle resource sets.
pub fn content_id(resources: &[ContentResource]) -> Result<String> {
    let digest = resources_sha256(resources)?;
    Ok(format!("s-{}", &digest[..12]))
}

/// Hashes an arbitrary canonical byte buffer (used for the options hash half
/// of a `deploymentID`, and for env/affinity/resources/tolerations change
/// detection on `Cluster.status`).
pub fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `deploymentID` is `"<contentsID>:<optionsHash>"`.
pub fn deployment_id(content_id: &str, options_hash: &str) -> String {
    format!("{content_id}:{options_hash}")
}

/// Splits a `deploymentID` back into its content id and options hash halves.
pub fn split_deployment_id(deployment_id: &str) -> Option<(&str, &str)> {
    deployment_id.split_once(':')
}
