use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::bundle::BundleDeploymentOptions;
use crate::crd::condition::Condition;

/// The per-cluster realization of a `Bundle`, placed in that cluster's
/// registration namespace. This is the
/// sole object the downstream agent reads to decide what to apply.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "BundleDeployment",
    namespaced,
    status = "BundleDeploymentStatus",
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Deployment", "type":"string", "jsonPath":".spec.deploymentID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    /// `"<contentsID>:<optionsHash>"`, the target state the agent must
    /// converge to.
    pub deployment_id: String,
    /// Next pending version during a gated rollout; unset once advanced.
    pub staged_deployment_id: Option<String>,
    /// Bundle defaults merged with the target overlay.
    pub options: BundleDeploymentOptions,
    /// Names of other `BundleDeployment`s (by `deploymentID` prefix/bundle
    /// name) that must report ready in this same cluster first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub correct_drift: bool,
    pub oci_contents: Option<bool>,
    pub helm_chart_options: Option<crate::crd::bundle::HelmOptions>,
    /// Incremented only when at least one downstream-cloned secret/configmap
    /// was actually created or updated, so the agent knows to refetch.
    #[serde(default)]
    pub downstream_resources_generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    /// Agent-reported: the `deploymentID` actually applied downstream.
    pub applied_deployment_id: Option<String>,
    pub ready: bool,
    #[serde(default)]
    pub non_ready_status: Vec<String>,
    #[serde(default)]
    pub modified_status: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub display: BundleDeploymentDisplay,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentDisplay {
    pub state: String,
}

/// Coarse deployment state derived from status, used by the Cluster
/// aggregator's per-state counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Ready,
    NotReady,
    WaitApplied,
    ErrApplied,
    Modified,
    OutOfSync,
    Pending,
    Unknown,
}

impl BundleDeployment {
    /// Invariant: `appliedDeploymentID != deploymentID ⇒
    /// status.ready == false`. Used both to assert the invariant in tests
    /// and to compute availability in the rollout engine.
    pub fn is_converged(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.applied_deployment_id.as_deref())
            == Some(self.spec.deployment_id.as_str())
    }

    pub fn is_available(&self) -> bool {
        self.is_converged() && self.status.as_ref().is_some_and(|s| s.ready)
    }

    pub fn deployment_state(&self) -> DeploymentState {
        let Some(status) = &self.status else {
            return DeploymentState::Pending;
        };
        if !self.is_converged() {
            return DeploymentState::OutOfSync;
        }
        if !status.modified_status.is_empty() {
            return DeploymentState::Modified;
        }
        if status
            .conditions
            .iter()
            .any(|c| c.type_ == "ErrApplied" && c.is_true())
        {
            return DeploymentState::ErrApplied;
        }
        if !status.ready {
            if status
                .conditions
                .iter()
                .any(|c| c.type_ == "WaitApplied" && c.is_true())
            {
                return DeploymentState::WaitApplied;
            }
            return DeploymentState::NotReady;
        }
        DeploymentState::Ready
    }
}
