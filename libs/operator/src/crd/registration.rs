use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::condition::Condition;

/// A credential issuer: grants a bearer token scoped to creating
/// `ClusterRegistration` objects in one namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "ClusterRegistrationToken",
    namespaced,
    status = "ClusterRegistrationTokenStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    /// How long the issued secret's bearer token remains valid for.
    pub ttl_seconds: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenStatus {
    /// Name of the secret holding the bearer token, once issued.
    pub secret_name: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// An agent's request to join the fleet.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "ClusterRegistration",
    namespaced,
    status = "ClusterRegistrationStatus",
    printcolumn = r#"{"name":"Granted", "type":"boolean", "jsonPath":".status.granted"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationSpec {
    pub client_id: String,
    pub client_random: String,
    #[serde(default)]
    pub cluster_labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationStatus {
    pub granted: bool,
    /// Name of the matched or created `Cluster`.
    pub cluster_name: Option<String>,
    /// Name of the one-shot secret containing the long-lived kubeconfig.
    pub secret_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
