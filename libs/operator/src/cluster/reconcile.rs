//! Cluster reconciler: owns the per-cluster registration
//! namespace and rolls up `BundleDeployment` status living in it.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, instrument, warn, Span};

use crate::controller::Context;
use crate::crd::bundledeployment::{BundleDeployment, DeploymentState};
use crate::crd::cluster::{self, BundleDeploymentSummary, Cluster, ClusterStatus};
use crate::crd::condition::{self, Condition};
use crate::crd::registration::ClusterRegistration;
use crate::error::{ignore_not_found, Error, Result};
use crate::labels;

pub const CLUSTER_FINALIZER: &str = "fleet.cattle.io/cluster-cleanup";

const NORMAL_REQUEUE: Duration = Duration::from_secs(30);
const MAX_NON_READY_MESSAGES: usize = 10;

#[instrument(skip(cluster, ctx), fields(trace_id))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _measure = ctx
        .metrics
        .for_controller(crate::controller::CLUSTER)
        .count_and_measure(&trace_id);
    ctx.record_event(crate::controller::CLUSTER).await;

    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::UserInputError("Cluster must be namespaced".to_owned()))?;
    let name = cluster.name_any();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);

    if crate::finalizer::is_deleting(cluster.as_ref()) {
        return cleanup(&api, &cluster, &name, &ctx).await;
    }

    if !crate::finalizer::has(cluster.as_ref(), CLUSTER_FINALIZER) {
        crate::finalizer::add(&api, &name, CLUSTER_FINALIZER)
            .await
            .map_err(|e| e.in_step("add cluster-cleanup finalizer"))?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let status = apply(&cluster, &namespace, &name, &ctx).await?;
    write_status(&api, &name, status).await?;
    Ok(Action::requeue(NORMAL_REQUEUE))
}

pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(cluster = cluster.name_any(), "cluster reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::CLUSTER)
        .set_failure(cluster.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

/// Cluster deletion: enqueue the registration namespace for
/// removal, sweep orphaned `ClusterRegistration`s across all namespaces, then
/// drop the finalizer.
async fn cleanup(
    api: &Api<Cluster>,
    cluster: &Cluster,
    name: &str,
    ctx: &Context,
) -> Result<Action> {
    if let Some(reg_namespace) = cluster.status.as_ref().and_then(|s| s.namespace.clone()) {
        let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
        ignore_not_found(ns_api.delete(&reg_namespace, &Default::default()).await)
            .map_err(|e| e.in_step("delete cluster registration namespace"))?;
    }

    let reg_api: Api<ClusterRegistration> = Api::all(ctx.client.clone());
    let orphans = reg_api.list(&ListParams::default()).await.map_err(Error::KubeError)?;
    for reg in orphans.items.iter().filter(|r| {
        r.status.as_ref().and_then(|s| s.cluster_name.as_deref()) == Some(name)
    }) {
        let Some(reg_ns) = reg.namespace() else { continue };
        let reg_ns_api: Api<ClusterRegistration> = Api::namespaced(ctx.client.clone(), &reg_ns);
        ignore_not_found(reg_ns_api.delete(&reg.name_any(), &Default::default()).await)
            .map_err(|e| e.in_step("delete orphaned ClusterRegistration"))?;
    }

    if crate::finalizer::has(cluster, CLUSTER_FINALIZER) {
        crate::finalizer::remove(api, cluster, CLUSTER_FINALIZER)
            .await
            .map_err(|e| e.in_step("remove cluster-cleanup finalizer"))?;
    }
    Ok(Action::await_change())
}

async fn apply(cluster: &Cluster, namespace: &str, name: &str, ctx: &Context) -> Result<ClusterStatus> {
    let reg_namespace = cluster::registration_namespace(namespace, name);
    ensure_registration_namespace(&reg_namespace, namespace, name, ctx).await?;

    let mut status = cluster.status.clone().unwrap_or_default();
    status.namespace = Some(reg_namespace.clone());
    status.observed_generation = cluster.meta().generation.unwrap_or(0);

    let bd_api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &reg_namespace);
    let bds = bd_api.list(&ListParams::default()).await.map_err(Error::KubeError)?;

    let mut summary = BundleDeploymentSummary::default();
    for bd in &bds.items {
        let state = bd.deployment_state();
        match state {
            DeploymentState::Ready => summary.ready += 1,
            DeploymentState::NotReady | DeploymentState::Unknown => {}
            DeploymentState::WaitApplied => summary.wait_applied += 1,
            DeploymentState::ErrApplied => summary.err_applied += 1,
            DeploymentState::Modified => summary.modified += 1,
            DeploymentState::OutOfSync => summary.out_of_sync += 1,
            DeploymentState::Pending => summary.pending += 1,
        }
        summary.desired_ready += 1;
        if state != DeploymentState::Ready && summary.non_ready_messages.len() < MAX_NON_READY_MESSAGES {
            if let Some(bd_status) = &bd.status {
                for msg in bd_status.non_ready_status.iter().chain(bd_status.modified_status.iter()) {
                    if summary.non_ready_messages.len() >= MAX_NON_READY_MESSAGES {
                        break;
                    }
                    summary.non_ready_messages.push(format!("{}: {msg}", bd.name_any()));
                }
            }
        }
    }
    status.summary = summary.clone();

    condition::upsert(
        &mut status.conditions,
        Condition::ready(summary.is_ready(), format!("{}/{} ready", summary.ready, summary.desired_ready)),
    );

    Ok(status)
}

/// Creates the deterministic per-cluster namespace if it does not already
/// exist. Idempotent: tolerates a
/// concurrent create by ignoring `AlreadyExists`.
async fn ensure_registration_namespace(reg_namespace: &str, cluster_namespace: &str, cluster_name: &str, ctx: &Context) -> Result<()> {
    let ns_api: Api<Namespace> = Api::all(ctx.client.clone());
    if ns_api.get_opt(reg_namespace).await.map_err(Error::KubeError)?.is_some() {
        return Ok(());
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(labels::ANNOTATION_CLUSTER_NAMESPACE.to_owned(), cluster_namespace.to_owned());
    annotations.insert(labels::ANNOTATION_CLUSTER.to_owned(), cluster_name.to_owned());

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(reg_namespace.to_owned()),
            labels: Some(BTreeMap::from([(labels::MANAGED.to_owned(), "true".to_owned())])),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    };
    match ns_api.create(&kube::api::PostParams::default(), &ns).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

async fn write_status(api: &Api<Cluster>, name: &str, status: ClusterStatus) -> Result<()> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registration_namespace_matches_cluster_helper() {
        assert_eq!(
            cluster::registration_namespace("fleet-default", "a"),
            cluster::registration_namespace("fleet-default", "a"),
        );
    }
}
