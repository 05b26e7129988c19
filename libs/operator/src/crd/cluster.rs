use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::condition::Condition;

/// A registered downstream Kubernetes cluster, represented upstream
///.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.summary.ready"}"#,
    printcolumn = r#"{"name":"Namespace", "type":"string", "jsonPath":".status.namespace"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stable unique identifier. Derived from the downstream `kube-system`
    /// namespace UID when the cluster registered itself; user-supplied for
    /// imported clusters.
    pub client_id: Option<String>,
    /// Reference to an upstream-stored credential for imported clusters.
    /// Absent for agent-initiated registration.
    pub kube_config_secret: Option<String>,
    /// Labels used for target matching by `Bundle.targets`.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Namespace the agent Deployment runs in on the downstream cluster.
    pub agent_namespace: Option<String>,
    pub private_repo_url: Option<String>,
    #[serde(default)]
    pub agent_env_vars: Vec<EnvVar>,
    pub agent_affinity: Option<Affinity>,
    pub agent_resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub agent_tolerations: Vec<Toleration>,
    /// Monotonic trigger: bumping this forces the agent to redeploy even if
    /// nothing else about the cluster changed.
    #[serde(default)]
    pub redeploy_agent_generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Deterministic per-cluster registration namespace
    /// (`cluster-<namespace>-<name>-<hash>`); never changes once computed.
    pub namespace: Option<String>,
    pub agent: AgentStatus,
    pub summary: BundleDeploymentSummary,
    /// Hashes of env/affinity/resources/tolerations last applied to the
    /// agent, used to detect when a redeploy is needed.
    pub agent_env_vars_hash: Option<String>,
    pub agent_affinity_hash: Option<String>,
    pub agent_resources_hash: Option<String>,
    pub agent_tolerations_hash: Option<String>,
    pub agent_migrated: bool,
    pub cattle_namespace_migrated: bool,
    pub agent_namespace_migrated: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub observed_generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    pub ready_node_count: i64,
    pub non_ready_node_count: i64,
}

/// Rollup of `BundleDeployment` state, reused verbatim on `Cluster`,
/// `ClusterGroup` and `GitRepo` status.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSummary {
    pub ready: i64,
    pub desired_ready: i64,
    pub wait_applied: i64,
    pub err_applied: i64,
    pub out_of_sync: i64,
    pub modified: i64,
    pub pending: i64,
    #[serde(default)]
    pub non_ready_messages: Vec<String>,
}

impl BundleDeploymentSummary {
    pub fn is_ready(&self) -> bool {
        self.ready == self.desired_ready
    }

    /// Folds another summary into this one, field-by-field. Used by every
    /// aggregator in the status propagation chain.
    pub fn merge(&mut self, other: &BundleDeploymentSummary) {
        self.ready += other.ready;
        self.desired_ready += other.desired_ready;
        self.wait_applied += other.wait_applied;
        self.err_applied += other.err_applied;
        self.out_of_sync += other.out_of_sync;
        self.modified += other.modified;
        self.pending += other.pending;
        const MAX_MESSAGES: usize = 10;
        for m in &other.non_ready_messages {
            if self.non_ready_messages.len() >= MAX_MESSAGES {
                break;
            }
            self.non_ready_messages.push(m.clone());
        }
    }
}

/// Deterministic per-cluster registration namespace name.
///
/// `"cluster-<cluster.namespace>-<cluster.name>-<short-hash>"`, where the
/// hash is over `"<namespace>::<name>"`. Pure function of its inputs: never
/// recomputed differently once a cluster exists.
pub fn registration_namespace(namespace: &str, name: &str) -> String {
    let preimage = format!("{namespace}::{name}");
    let hash = crate::hash::hex_digest(preimage.as_bytes());
    format!("cluster-{namespace}-{name}-{}", &hash[..8])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registration_namespace_is_deterministic() {
        let a = registration_namespace("fleet-default", "cluster-a");
        let b = registration_namespace("fleet-default", "cluster-a");
        assert_eq!(a, b);
        assert!(a.starts_with("cluster-fleet-default-cluster-a-"));
    }

    #[test]
    fn registration_namespace_differs_per_cluster() {
        let a = registration_namespace("fleet-default", "cluster-a");
        let b = registration_namespace("fleet-default", "cluster-b");
        assert_ne!(a, b);
    }

    #[test]
    fn summary_merge_sums_counts() {
        let mut total = BundleDeploymentSummary::default();
        total.merge(&BundleDeploymentSummary {
            ready: 1,
            desired_ready: 1,
            ..Default::default()
        });
        total.merge(&BundleDeploymentSummary {
            ready: 0,
            desired_ready: 1,
            ..Default::default()
        });
        assert_eq!(total.ready, 1);
        assert_eq!(total.desired_ready, 2);
        assert!(!total.is_ready());
    }
}
