use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::cluster::BundleDeploymentSummary;
use crate::crd::condition::Condition;

/// A named cluster selector. Owns no clusters;
/// membership is computed fresh on every reconcile from `selector`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "ClusterGroup",
    namespaced,
    status = "ClusterGroupStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.summary.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupSpec {
    pub selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupStatus {
    pub summary: BundleDeploymentSummary,
    pub cluster_count: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub observed_generation: i64,
}
