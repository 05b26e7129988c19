//! ClusterGroup reconciler: recomputes membership from
//! `selector` on every reconcile and rolls up member `Cluster` summaries.

use std::sync::Arc;

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, instrument, warn, Span};

use crate::controller::Context;
use crate::crd::cluster::{BundleDeploymentSummary, Cluster};
use crate::crd::clustergroup::{ClusterGroup, ClusterGroupStatus};
use crate::crd::condition::{self, Condition};
use crate::error::{Error, Result};
use crate::target;

const NORMAL_REQUEUE: Duration = Duration::from_secs(30);

#[instrument(skip(clustergroup, ctx), fields(trace_id))]
pub async fn reconcile(clustergroup: Arc<ClusterGroup>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _measure = ctx
        .metrics
        .for_controller(crate::controller::CLUSTERGROUP)
        .count_and_measure(&trace_id);
    ctx.record_event(crate::controller::CLUSTERGROUP).await;

    let namespace = clustergroup
        .namespace()
        .ok_or_else(|| Error::UserInputError("ClusterGroup must be namespaced".to_owned()))?;
    let name = clustergroup.name_any();
    let api: Api<ClusterGroup> = Api::namespaced(ctx.client.clone(), &namespace);

    let status = apply(&clustergroup, &namespace, &ctx).await?;
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(Action::requeue(NORMAL_REQUEUE))
}

pub fn error_policy(clustergroup: Arc<ClusterGroup>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(clustergroup = clustergroup.name_any(), "clustergroup reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::CLUSTERGROUP)
        .set_failure(clustergroup.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

async fn apply(clustergroup: &ClusterGroup, namespace: &str, ctx: &Context) -> Result<ClusterGroupStatus> {
    let cluster_api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);
    let clusters = cluster_api.list(&ListParams::default()).await.map_err(Error::KubeError)?;

    let members: Vec<&Cluster> = match &clustergroup.spec.selector {
        Some(selector) => clusters
            .items
            .iter()
            .filter(|c| target::selector_matches(selector, &c.spec.labels))
            .collect(),
        None => vec![],
    };

    let mut summary = BundleDeploymentSummary::default();
    for member in &members {
        if let Some(member_status) = &member.status {
            summary.merge(&member_status.summary);
        }
    }

    let mut status = clustergroup.status.clone().unwrap_or_default();
    status.cluster_count = members.len() as i64;
    status.summary = summary.clone();
    status.observed_generation = clustergroup.meta().generation.unwrap_or(0);
    condition::upsert(
        &mut status.conditions,
        Condition::ready(summary.is_ready(), format!("{}/{} ready", summary.ready, summary.desired_ready)),
    );
    Ok(status)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::cluster::ClusterSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster(name: &str, labels: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: ClusterSpec {
                client_id: None,
                kube_config_secret: None,
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                agent_namespace: None,
                private_repo_url: None,
                agent_env_vars: vec![],
                agent_affinity: None,
                agent_resources: None,
                agent_tolerations: vec![],
                redeploy_agent_generation: 0,
            },
            status: None,
        }
    }

    #[test]
    fn selector_filters_members_by_label() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("env".to_owned(), "prod".to_owned())])),
            match_expressions: None,
        };
        let members = [cluster("a", &[("env", "prod")]), cluster("b", &[("env", "dev")])];
        let matched: Vec<_> = members
            .iter()
            .filter(|c| target::selector_matches(&selector, &c.spec.labels))
            .collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name_any(), "a");
    }
}
