//! GitRepo reconciler: manages the clone-and-apply `Job` for
//! one repo and folds its progress, plus the Bundles it produced, back onto
//! `GitRepo.status`.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta as K8sObjectMeta, OwnerReference};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, info, instrument, warn, Span};

use crate::controller::Context;
use crate::crd::bundle::Bundle;
use crate::crd::bundledeployment::BundleDeployment;
use crate::crd::condition::{self, Condition};
use crate::crd::gitrepo::{AggregatedRestriction, GitRepo, GitRepoDisplay, GitRepoRestriction, GitRepoStatus, ResourceCounts};
use crate::error::{ignore_not_found, Error, Result};
use crate::labels;

pub const GITREPO_FINALIZER: &str = "fleet.cattle.io/gitrepo-cleanup";

#[instrument(skip(gitrepo, ctx), fields(trace_id))]
pub async fn reconcile(gitrepo: Arc<GitRepo>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _measure = ctx
        .metrics
        .for_controller(crate::controller::GITREPO)
        .count_and_measure(&trace_id);
    ctx.record_event(crate::controller::GITREPO).await;

    let namespace = gitrepo
        .namespace()
        .ok_or_else(|| Error::UserInputError("GitRepo must be namespaced".to_owned()))?;
    let name = gitrepo.name_any();
    let api: Api<GitRepo> = Api::namespaced(ctx.client.clone(), &namespace);

    if crate::finalizer::is_deleting(gitrepo.as_ref()) {
        return cleanup(&api, &gitrepo, &namespace, &name, &ctx).await;
    }

    if !crate::finalizer::has(gitrepo.as_ref(), GITREPO_FINALIZER) {
        crate::finalizer::add(&api, &name, GITREPO_FINALIZER)
            .await
            .map_err(|e| e.in_step("add gitrepo-cleanup finalizer"))?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match apply(&gitrepo, &namespace, &name, &ctx).await {
        Ok(status) => {
            let requeue = polling_interval(&gitrepo, &ctx);
            write_status(&api, &name, status).await?;
            Ok(Action::requeue(requeue))
        }
        Err(e) if e.category() == crate::error::ErrorCategory::TerminalSpec => {
            let mut status = gitrepo.status.clone().unwrap_or_default();
            condition::upsert(&mut status.conditions, Condition::ready(false, e.to_string()));
            write_status(&api, &name, status).await?;
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

pub fn error_policy(gitrepo: Arc<GitRepo>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(gitrepo = gitrepo.name_any(), "gitrepo reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::GITREPO)
        .set_failure(gitrepo.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

/// Cascade delete: delete every `Bundle` labeled with
/// this repo, wait until none remain, then drop the finalizer.
async fn cleanup(
    api: &Api<GitRepo>,
    gitrepo: &GitRepo,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action> {
    let bundle_api: Api<Bundle> = Api::namespaced(ctx.client.clone(), namespace);
    let selector = format!("{}={name}", labels::REPO_NAME);
    let bundles = bundle_api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?;

    if bundles.items.is_empty() {
        let job_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
        ignore_not_found(job_api.delete(&job_name(name), &Default::default()).await)
            .map_err(|e| e.in_step("delete GitRepo clone job"))?;
        if crate::finalizer::has(gitrepo, GITREPO_FINALIZER) {
            crate::finalizer::remove(api, gitrepo, GITREPO_FINALIZER)
                .await
                .map_err(|e| e.in_step("remove gitrepo-cleanup finalizer"))?;
        }
        return Ok(Action::await_change());
    }

    for bundle in &bundles.items {
        ignore_not_found(bundle_api.delete(&bundle.name_any(), &Default::default()).await)
            .map_err(|e| e.in_step("delete owned Bundle"))?;
    }
    Ok(Action::requeue(Duration::from_secs(5)))
}

async fn apply(gitrepo: &GitRepo, namespace: &str, name: &str, ctx: &Context) -> Result<GitRepoStatus> {
    validate_against_restrictions(gitrepo, namespace, ctx).await?;

    reconcile_job(gitrepo, namespace, name, ctx).await?;
    let job_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let job = job_api.get_opt(&job_name(name)).await.map_err(Error::KubeError)?;

    let mut status = gitrepo.status.clone().unwrap_or_default();
    if let Some(job) = &job {
        apply_job_status(&mut status, job);
    }

    let selector = format!("{}={name}", labels::REPO_NAME);
    let bundle_api: Api<Bundle> = Api::namespaced(ctx.client.clone(), namespace);
    let bundles = bundle_api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?;

    let bd_api: Api<BundleDeployment> = Api::all(ctx.client.clone());
    let mut summary = crate::crd::cluster::BundleDeploymentSummary::default();
    let mut ready_clusters: Option<i64> = None;
    for bundle in &bundles.items {
        let bundle_selector = format!(
            "{}={},{}={namespace}",
            labels::BUNDLE_NAME,
            bundle.name_any(),
            labels::BUNDLE_NAMESPACE,
        );
        let bds = bd_api
            .list(&ListParams::default().labels(&bundle_selector))
            .await
            .map_err(Error::KubeError)?;
        let desired = bds.items.len() as i64;
        let ready = bds.items.iter().filter(|bd| bd.is_available()).count() as i64;
        summary.merge(&crate::crd::cluster::BundleDeploymentSummary {
            ready,
            desired_ready: desired,
            ..Default::default()
        });
        if desired > 0 {
            ready_clusters = Some(ready_clusters.map_or(ready, |min| min.min(ready)));
        }
    }

    status.summary = summary.clone();
    status.ready_clusters = ready_clusters.unwrap_or(0);
    status.resource_counts = ResourceCounts {
        desired_ready: summary.desired_ready,
        ready: summary.ready,
    };
    status.observed_generation = gitrepo.meta().generation.unwrap_or(0);
    status.display = GitRepoDisplay {
        state: if summary.is_ready() {
            "Ready".to_owned()
        } else if status.commit.is_none() {
            "GitUpdating".to_owned()
        } else {
            "NotReady".to_owned()
        },
    };
    condition::upsert(
        &mut status.conditions,
        Condition::ready(summary.is_ready(), format!("{}/{} ready", summary.ready, summary.desired_ready)),
    );

    Ok(status)
}

async fn validate_against_restrictions(gitrepo: &GitRepo, namespace: &str, ctx: &Context) -> Result<()> {
    let api: Api<GitRepoRestriction> = Api::namespaced(ctx.client.clone(), namespace);
    let list = api.list(&ListParams::default()).await.map_err(Error::KubeError)?;
    if list.items.is_empty() {
        return Ok(());
    }
    let specs: Vec<_> = list.items.iter().map(|r| r.spec.clone()).collect();
    let aggregated = AggregatedRestriction::aggregate(&specs);
    aggregated.validate_repo(&gitrepo.spec.repo)?;
    aggregated.validate_service_account(gitrepo.spec.service_account.as_deref())?;
    aggregated.validate_client_secret_name(gitrepo.spec.client_secret_name.as_deref())?;
    Ok(())
}

fn job_name(gitrepo_name: &str) -> String {
    format!("{gitrepo_name}-clone")
}

/// Re-sync cadence: `pollingIntervalSeconds == 0`
/// falls back to the operator-wide default from `OperatorConfig`.
fn polling_interval(gitrepo: &GitRepo, ctx: &Context) -> Duration {
    let seconds = if gitrepo.spec.polling_interval_seconds > 0 {
        gitrepo.spec.polling_interval_seconds
    } else {
        ctx.config.current().default_polling_interval_seconds
    };
    Duration::from_secs(seconds.max(1) as u64)
}

/// Reconciles the managed clone-and-apply `Job`. The
/// Job and the GitRepo share a namespace, so ownership uses a normal
/// `ownerReferences` entry rather than the label-based scheme cross-namespace
/// cascades need.
async fn reconcile_job(gitrepo: &GitRepo, namespace: &str, name: &str, ctx: &Context) -> Result<()> {
    let job_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let existing = job_api.get_opt(&job_name(name)).await.map_err(Error::KubeError)?;

    let desired_args: Vec<String> = std::iter::once(gitrepo.spec.repo.clone())
        .chain(gitrepo.spec.paths.iter().cloned())
        .collect();
    let generation_marker = format!(
        "{}-{}",
        gitrepo.spec.revision.as_deref().unwrap_or(gitrepo.spec.branch.as_deref().unwrap_or("main")),
        gitrepo.spec.force_sync_generation,
    );

    if let Some(job) = &existing {
        let current_marker = job
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get("fleet.cattle.io/sync-marker"))
            .cloned()
            .unwrap_or_default();
        if current_marker == generation_marker {
            return Ok(());
        }
        // Revision or forceSyncGeneration changed: Jobs are immutable once
        // created, so replace it to trigger a fresh clone.
        ignore_not_found(job_api.delete(&job_name(name), &Default::default()).await)
            .map_err(|e| e.in_step("delete stale GitRepo clone job"))?;
    }

    let agent_image = ctx.config.current().agent_image;
    let mut env = vec![
        EnvVar {
            name: "FLEET_REPO".to_owned(),
            value: Some(gitrepo.spec.repo.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "FLEET_PATHS".to_owned(),
            value: Some(gitrepo.spec.paths.join(",")),
            ..Default::default()
        },
    ];
    if let Some(branch) = &gitrepo.spec.branch {
        env.push(EnvVar { name: "FLEET_BRANCH".to_owned(), value: Some(branch.clone()), ..Default::default() });
    }
    if let Some(revision) = &gitrepo.spec.revision {
        env.push(EnvVar { name: "FLEET_REVISION".to_owned(), value: Some(revision.clone()), ..Default::default() });
    }

    let (volumes, mounts) = match &gitrepo.spec.client_secret_name {
        Some(secret) => (
            vec![Volume {
                name: "git-credentials".to_owned(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            vec![VolumeMount {
                name: "git-credentials".to_owned(),
                mount_path: "/etc/fleet/git-credentials".to_owned(),
                read_only: Some(true),
                ..Default::default()
            }],
        ),
        None => (vec![], vec![]),
    };

    let owner_ref = OwnerReference {
        api_version: GitRepo::api_version(&()).into_owned(),
        kind: GitRepo::kind(&()).into_owned(),
        name: name.to_owned(),
        uid: gitrepo.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let mut annotations = BTreeMap::new();
    annotations.insert("fleet.cattle.io/sync-marker".to_owned(), generation_marker);

    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name(name)),
            namespace: Some(namespace.to_owned()),
            owner_references: Some(vec![owner_ref]),
            labels: Some(BTreeMap::from([
                (labels::REPO_NAME.to_owned(), name.to_owned()),
                (labels::MANAGED.to_owned(), "true".to_owned()),
            ])),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: Some(K8sObjectMeta::default()),
                spec: Some(PodSpec {
                    service_account_name: gitrepo.spec.service_account.clone(),
                    restart_policy: Some("Never".to_owned()),
                    containers: vec![Container {
                        name: "fleet-apply".to_owned(),
                        image: Some(agent_image),
                        args: Some(desired_args),
                        env: Some(env),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    };

    match job_api.create(&PostParams::default(), &job).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 409 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }
    info!(gitrepo = name, "launched GitRepo clone job");
    Ok(())
}

fn apply_job_status(status: &mut GitRepoStatus, job: &Job) {
    if let Some(JobStatus { succeeded: Some(n), .. }) = &job.status {
        if *n > 0 {
            if let Some(commit) = job
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("fleet.cattle.io/observed-commit"))
            {
                status.commit = Some(commit.clone());
            }
        }
    }
}

async fn write_status(api: &Api<GitRepo>, name: &str, status: GitRepoStatus) -> Result<()> {
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
    fn job_name_is_derived_from_gitrepo_name() {
        assert_eq!(job_name("infra"), "infra-clone");
    }

    #[test]
    fn ready_clusters_ignores_bundles_with_no_targets() {
        // Mirrors the fold in `apply`: a bundle with desiredReady == 0
        // (no matching clusters yet) must not drag readyClusters to 0.
        let mut ready_clusters: Option<i64> = None;
        for (desired, ready) in [(0i64, 0i64), (2, 2), (3, 1)] {
            if desired > 0 {
                ready_clusters = Some(ready_clusters.map_or(ready, |min| min.min(ready)));
            }
        }
        assert_eq!(ready_clusters, Some(1));
    }
}
