use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crd::condition::Condition;
use crate::crd::content::ContentResource;

/// A controller-side unit of deployment produced by applying one path in a
/// `GitRepo`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "Bundle",
    namespaced,
    status = "BundleStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.summary.ready"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.summary.desiredReady"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    pub source: BundleSource,
    #[serde(default)]
    pub targets: Vec<BundleTarget>,
    /// Allowlist intersected with `targets`.
    #[serde(default)]
    pub target_restrictions: Vec<BundleTarget>,
    #[serde(default)]
    pub rollout_strategy: RolloutStrategy,
    /// Names of other `Bundle`s that must be ready in the same `Cluster`
    /// before this bundle's targets there are allowed to advance.
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub helm: Option<HelmOptions>,
    pub namespace: Option<String>,
    pub values_hash: Option<String>,
    pub helm_op_options: Option<HelmOpOptions>,
    /// Base options merged with each target's overlay before hashing
    ///.
    #[serde(default)]
    pub default_options: BundleDeploymentOptions,
}

/// Tagged variant of where a `Bundle`'s resources come from.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum BundleSource {
    /// Resources are embedded directly in the spec.
    Inline { resources: Vec<ContentResource> },
    /// Resources already materialized as a `Content` object.
    Content { contents_id: String },
    /// A Helm chart fetched over HTTP(S).
    HelmRepo {
        repo: String,
        chart: String,
        version: Option<String>,
    },
    /// A Helm chart or raw manifest fetched from an OCI registry.
    Oci {
        reference: String,
        secret_name: Option<String>,
    },
}

/// One targeting rule: a cluster selector / group / group-selector / name,
/// plus an optional overlay of `BundleDeploymentOptions`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleTarget {
    #[serde(default)]
    pub name: String,
    pub cluster_selector: Option<LabelSelector>,
    pub cluster_group: Option<String>,
    pub cluster_group_selector: Option<LabelSelector>,
    pub cluster_name: Option<String>,
    pub custom: Option<BundleDeploymentOptions>,
}

/// Fully materialized options later copied verbatim onto a
/// `BundleDeployment.spec.options`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentOptions {
    pub default_namespace: Option<String>,
    #[serde(default)]
    pub namespace_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub namespace_annotations: BTreeMap<String, String>,
    pub helm: Option<HelmOptions>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub force_sync_generation: i64,
    #[serde(default)]
    pub correct_drift: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmOptions {
    pub release_name: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    pub version: Option<String>,
    #[serde(default)]
    pub take_ownership: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmOpOptions {
    pub target_namespace: Option<String>,
}

/// Availability-budget and partitioning configuration for the rollout engine
///.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Integer count or a percentage string like `"25%"`.
    pub max_unavailable: Option<IntOrString>,
    pub max_unavailable_partitions: Option<IntOrString>,
    pub auto_partition_size: Option<i64>,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    Str(String),
}

impl Default for IntOrString {
    fn default() -> Self {
        IntOrString::Int(1)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub name: String,
    pub cluster_selector: Option<LabelSelector>,
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    pub summary: crate::crd::cluster::BundleDeploymentSummary,
    pub resources_sha256_sum: Option<String>,
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bundle_source_inline_round_trips() {
        let src = BundleSource::Inline {
            resources: vec![ContentResource {
                name: "a.yaml".into(),
                content: "hi".into(),
                encoding: crate::crd::content::ResourceEncoding::Plain,
            }],
        };
        let json = serde_json::to_string(&src).unwrap();
        let back: BundleSource = serde_json::from_str(&json).unwrap();
        match back {
            BundleSource::Inline { resources } => assert_eq!(resources.len(), 1),
            _ => panic!("wrong variant"),
        }
    }
}
