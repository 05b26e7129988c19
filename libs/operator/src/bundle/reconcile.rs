//! Bundle reconciler: resolve targets, materialize a
//! `Content`, and create/update exactly one `BundleDeployment` per target.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use kube::runtime::controller::Action;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::controller::Context;
use crate::crd::bundle::{Bundle, BundleDeploymentOptions, BundleSource};
use crate::crd::bundledeployment::{BundleDeployment, BundleDeploymentSpec};
use crate::crd::cluster::{BundleDeploymentSummary, Cluster};
use crate::crd::clustergroup::ClusterGroup;
use crate::crd::condition::{self, Condition};
use crate::crd::content::ResourceEncoding;
use crate::crd::gitrepo::{AggregatedRestriction, GitRepoRestriction};
use crate::error::{ignore_not_found, Error, Result};
use crate::labels;
use crate::rollout::{self, GateDecision, TargetState};
use crate::target::{self, ResolvedTarget};

/// Bundle-cleanup finalizer gate.
pub const BUNDLE_FINALIZER: &str = "fleet.cattle.io/bundle-cleanup";

const NORMAL_REQUEUE: Duration = Duration::from_secs(30);
const CLEANUP_REQUEUE: Duration = Duration::from_secs(5);

#[instrument(skip(bundle, ctx), fields(trace_id))]
pub async fn reconcile(bundle: Arc<Bundle>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = crate::telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _measure = ctx.metrics.for_controller(crate::controller::BUNDLE).count_and_measure(&trace_id);

    ctx.record_event(crate::controller::BUNDLE).await;
    let namespace = bundle
        .namespace()
        .ok_or_else(|| Error::UserInputError("Bundle must be namespaced".to_owned()))?;
    let name = bundle.name_any();
    let api: Api<Bundle> = Api::namespaced(ctx.client.clone(), &namespace);

    if crate::finalizer::is_deleting(bundle.as_ref()) {
        return cleanup(&api, &bundle, &namespace, &name, &ctx).await;
    }

    if !crate::finalizer::has(bundle.as_ref(), BUNDLE_FINALIZER) {
        crate::finalizer::add(&api, &name, BUNDLE_FINALIZER)
            .await
            .map_err(|e| e.in_step("add bundle-cleanup finalizer"))?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    match apply(&bundle, &namespace, &name, &ctx).await {
        Ok((summary, resources_sha256_sum)) => {
            write_status(&api, &bundle, &name, summary, resources_sha256_sum, None).await?;
            Ok(Action::requeue(NORMAL_REQUEUE))
        }
        Err(e) if e.category() == crate::error::ErrorCategory::TerminalSpec => {
            write_status(
                &api,
                &bundle,
                &name,
                BundleDeploymentSummary::default(),
                None,
                Some(e.to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

pub fn error_policy(bundle: Arc<Bundle>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(bundle = bundle.name_any(), "bundle reconcile failed: {error:?}");
    ctx.metrics
        .for_controller(crate::controller::BUNDLE)
        .set_failure(bundle.as_ref(), error);
    Action::requeue(Duration::from_secs(60))
}

/// Cascade delete: purge every `BundleDeployment`
/// owned by this bundle (by label), wait until none remain, then drop the
/// finalizer so the API server can finish deleting the `Bundle`.
async fn cleanup(
    api: &Api<Bundle>,
    bundle: &Bundle,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action> {
    let owned = list_owned_bundle_deployments(ctx, namespace, name).await?;
    if owned.is_empty() {
        if crate::finalizer::has(bundle, BUNDLE_FINALIZER) {
            crate::finalizer::remove(api, bundle, BUNDLE_FINALIZER)
                .await
                .map_err(|e| e.in_step("remove bundle-cleanup finalizer"))?;
        }
        return Ok(Action::await_change());
    }

    for bd in &owned {
        let bd_namespace = bd.namespace().unwrap_or_default();
        let bd_name = bd.name_any();
        let bd_api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &bd_namespace);
        if crate::finalizer::has(bd, BUNDLE_FINALIZER) {
            crate::finalizer::remove(&bd_api, bd, BUNDLE_FINALIZER)
                .await
                .map_err(|e| e.in_step("remove finalizer from owned BundleDeployment"))?;
        }
        if let Some((content_id, _)) = crate::hash::split_deployment_id(&bd.spec.deployment_id) {
            ctx.content_store
                .remove_reference(content_id, &bd_name)
                .await
                .map_err(|e| e.in_step("release content reference during cascade delete"))?;
        }
        ignore_not_found(bd_api.delete(&bd_name, &Default::default()).await)
            .map_err(|e| e.in_step("delete owned BundleDeployment"))?;
    }

    Ok(Action::requeue(CLEANUP_REQUEUE))
}

async fn list_owned_bundle_deployments(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Vec<BundleDeployment>> {
    let api: Api<BundleDeployment> = Api::all(ctx.client.clone());
    let selector = format!(
        "{}={name},{}={namespace}",
        labels::BUNDLE_NAME,
        labels::BUNDLE_NAMESPACE,
    );
    let list = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?;
    Ok(list.items)
}

/// Resolves targets, content, and rollout gating, run when the bundle is not being deleted.
async fn apply(
    bundle: &Bundle,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<(BundleDeploymentSummary, Option<String>)> {
    validate_against_restrictions(bundle, namespace, ctx).await?;

    if bundle.spec.helm_op_options.is_some() && !ctx.feature_flags.helm_ops {
        return Err(Error::UserInputError(
            "helmOpOptions requires EXPERIMENTAL_HELM_OPS=true".to_owned(),
        ));
    }

    let content_id = resolve_content(bundle, ctx)
        .await
        .map_err(|e| e.in_step("resolve bundle content"))?;

    let clusters = list_clusters(ctx, namespace).await?;
    let cluster_groups = list_cluster_groups(ctx, namespace).await?;

    let mut resolved = target::resolve_targets(bundle, &clusters, &cluster_groups);
    if let Some(size) = bundle.spec.rollout_strategy.auto_partition_size {
        target::auto_partition(&mut resolved, size);
    }

    if resolved.is_empty() {
        return Ok((BundleDeploymentSummary::default(), Some(content_id)));
    }

    let existing = list_owned_bundle_deployments(ctx, namespace, name).await?;
    let by_cluster: BTreeMap<String, &BundleDeployment> = existing
        .iter()
        .filter_map(|bd| {
            bd.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(labels::CLUSTER))
                .map(|c| (c.clone(), bd))
        })
        .collect();

    let mut decided = Vec::with_capacity(resolved.len());
    for target in &resolved {
        let options_hash = crate::hash::hex_digest(&encode_for_options_hash(&target.options)?);
        let new_id = crate::hash::deployment_id(&content_id, &options_hash);
        let existing_bd = by_cluster.get(&target.cluster_name).copied();
        decided.push((target, new_id, existing_bd));
    }

    // Rollout gating is computed per distinct new deployment id (there is
    // exactly one per reconcile unless options differ per target, which the
    // overlay mechanism allows - rollout budgets are per Bundle though, so
    // we gate against the most common new id across targets).
    let new_id_counts: BTreeMap<&str, usize> =
        decided.iter().fold(BTreeMap::new(), |mut acc, (_, id, _)| {
            *acc.entry(id.as_str()).or_default() += 1;
            acc
        });
    let dominant_new_id = new_id_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(id, _)| id.to_owned())
        .unwrap_or_default();

    let states: Vec<TargetState> = decided
        .iter()
        .map(|(target, new_id, existing_bd)| TargetState {
            cluster_name: target.cluster_name.clone(),
            partition: target.partition.clone(),
            applied_deployment_id: existing_bd
                .and_then(|bd| bd.status.as_ref())
                .and_then(|s| s.applied_deployment_id.clone()),
            current_deployment_id: existing_bd
                .map(|bd| bd.spec.deployment_id.clone())
                .or_else(|| Some(new_id.clone())),
            ready: existing_bd.is_some_and(|bd| bd.is_available()),
        })
        .collect();

    let mut decisions = rollout::gate_rollout(&bundle.spec.rollout_strategy, &states, &dominant_new_id);

    if !bundle.spec.depends_on.is_empty() {
        let graph = list_bundle_depends_on_graph(ctx, namespace).await?;
        for target in &resolved {
            let mut ready_cache: BTreeMap<String, bool> = BTreeMap::new();
            for dep in &bundle.spec.depends_on {
                if !ready_cache.contains_key(dep) {
                    let ready =
                        dependency_ready_in_cluster(ctx, namespace, dep, &target.cluster_namespace).await?;
                    ready_cache.insert(dep.clone(), ready);
                }
            }
            let satisfied = rollout::dependencies_satisfied(name, &graph, &|d: &str| {
                ready_cache.get(d).copied().unwrap_or(false)
            });
            if !satisfied {
                decisions.insert(target.cluster_name.clone(), GateDecision::Hold);
            }
        }
    }

    let mut seen_clusters = std::collections::HashSet::new();
    for (target, new_id, existing_bd) in &decided {
        seen_clusters.insert(target.cluster_name.clone());
        upsert_bundle_deployment(
            ctx,
            bundle,
            namespace,
            name,
            target,
            new_id,
            *existing_bd,
            decisions.get(&target.cluster_name).copied(),
        )
        .await?;
    }

    // Targets that matched previously but no longer do: tear down.
    for bd in existing.iter() {
        let cluster = bd
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(labels::CLUSTER))
            .cloned()
            .unwrap_or_default();
        if seen_clusters.contains(&cluster) {
            continue;
        }
        let bd_namespace = bd.namespace().unwrap_or_default();
        let bd_name = bd.name_any();
        let bd_api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &bd_namespace);
        if let Some((cid, _)) = crate::hash::split_deployment_id(&bd.spec.deployment_id) {
            ctx.content_store
                .remove_reference(cid, &bd_name)
                .await
                .map_err(|e| e.in_step("release content reference for unmatched target"))?;
        }
        ignore_not_found(bd_api.delete(&bd_name, &Default::default()).await)
            .map_err(|e| e.in_step("delete BundleDeployment for unmatched target"))?;
    }

    let summary = aggregate_status(ctx, namespace, name).await?;
    Ok((summary, Some(content_id)))
}

async fn validate_against_restrictions(bundle: &Bundle, namespace: &str, ctx: &Context) -> Result<()> {
    let api: Api<GitRepoRestriction> = Api::namespaced(ctx.client.clone(), namespace);
    let list = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;
    if list.items.is_empty() {
        return Ok(());
    }
    let specs: Vec<_> = list.items.iter().map(|r| r.spec.clone()).collect();
    let aggregated = AggregatedRestriction::aggregate(&specs);
    aggregated.validate_service_account(bundle.spec.default_options.service_account.as_deref())
}

/// Content resolution: inline resources are hashed
/// and upserted into the content store; other source kinds resolve to a
/// deterministic content id without a stored `Content` object.
async fn resolve_content(bundle: &Bundle, ctx: &Context) -> Result<String> {
    match &bundle.spec.source {
        BundleSource::Inline { resources } => ctx.content_store.store(resources.clone()).await,
        BundleSource::Content { contents_id } => Ok(contents_id.clone()),
        BundleSource::HelmRepo { repo, chart, version } => {
            let preimage = format!("{repo}::{chart}::{}", version.as_deref().unwrap_or(""));
            Ok(format!("s-{}", &crate::hash::hex_digest(preimage.as_bytes())[..12]))
        }
        BundleSource::Oci { reference, secret_name } => {
            resolve_oci_reference(reference, secret_name.as_deref(), ctx).await
        }
    }
}

/// OCI reference resolution. The
/// actual registry pull is out of scope; this resolves a
/// reference to a deterministic content id the way the real dispatcher would
/// after fetching, and applies the same retryable/terminal split as the
/// credential-secret read it fronts.
async fn resolve_oci_reference(
    reference: &str,
    secret_name: Option<&str>,
    ctx: &Context,
) -> Result<String> {
    if !ctx.feature_flags.oci_storage {
        return Err(Error::UserInputError(
            "OCI content source requires EXPERIMENTAL_OCI_STORAGE=true".to_owned(),
        ));
    }
    if let Some(secret) = secret_name {
        // A missing secret is retryable (it may simply not have synced yet);
        // a present-but-malformed secret is terminal. We only have the name
        // here, so the existence check is
        // the retryable half; content validation happens once read.
        if secret.trim().is_empty() {
            return Err(Error::OciResolutionError(
                "empty secretName on OCI bundle source".to_owned(),
            ));
        }
    }
    if reference.trim().is_empty() || !reference.contains('/') {
        return Err(Error::OciResolutionError(format!(
            "malformed OCI reference: {reference:?}"
        )));
    }
    Ok(format!(
        "s-{}",
        &crate::hash::hex_digest(reference.as_bytes())[..12]
    ))
}

async fn list_clusters(ctx: &Context, namespace: &str) -> Result<Vec<Cluster>> {
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await.map_err(Error::KubeError)?.items)
}

async fn list_cluster_groups(ctx: &Context, namespace: &str) -> Result<Vec<ClusterGroup>> {
    let api: Api<ClusterGroup> = Api::namespaced(ctx.client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await.map_err(Error::KubeError)?.items)
}

/// Builds the `dependsOn` graph for every `Bundle` in the namespace, used for
/// cycle detection across bundles rather than just this one's own list.
async fn list_bundle_depends_on_graph(ctx: &Context, namespace: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let api: Api<Bundle> = Api::namespaced(ctx.client.clone(), namespace);
    let list = api.list(&ListParams::default()).await.map_err(Error::KubeError)?;
    Ok(list.items.into_iter().map(|b| (b.name_any(), b.spec.depends_on)).collect())
}

/// Whether any `BundleDeployment` owned by `dep_bundle_name` in
/// `cluster_namespace` is ready: the dependency-gating readiness check for
/// one target.
async fn dependency_ready_in_cluster(
    ctx: &Context,
    namespace: &str,
    dep_bundle_name: &str,
    cluster_namespace: &str,
) -> Result<bool> {
    let api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), cluster_namespace);
    let selector = format!(
        "{}={dep_bundle_name},{}={namespace}",
        labels::BUNDLE_NAME,
        labels::BUNDLE_NAMESPACE,
    );
    let list = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?;
    Ok(list.items.iter().any(|bd| bd.is_available()))
}

#[allow(clippy::too_many_arguments)]
async fn upsert_bundle_deployment(
    ctx: &Context,
    bundle: &Bundle,
    bundle_namespace: &str,
    bundle_name: &str,
    target: &ResolvedTarget,
    new_id: &str,
    existing: Option<&BundleDeployment>,
    decision: Option<GateDecision>,
) -> Result<()> {
    let (deployment_id, staged_deployment_id) = match decision {
        Some(GateDecision::Advance) | None => (new_id.to_owned(), None),
        Some(GateDecision::Hold) => match existing {
            Some(bd) => (bd.spec.deployment_id.clone(), Some(new_id.to_owned())),
            // A genuinely new target has nothing to hold to; create it at
            // the new id rather than stall forever (budget gates *advancing
            // existing* targets, not creating new ones).
            None => (new_id.to_owned(), None),
        },
    };

    let bd_name = format!("{bundle_name}-{}", target.cluster_name);
    let api: Api<BundleDeployment> = Api::namespaced(ctx.client.clone(), &target.cluster_namespace);

    let mut bd_labels = BTreeMap::from([
        (labels::BUNDLE_NAME.to_owned(), bundle_name.to_owned()),
        (labels::BUNDLE_NAMESPACE.to_owned(), bundle_namespace.to_owned()),
        (labels::CLUSTER.to_owned(), target.cluster_name.clone()),
        (labels::CLUSTER_NAMESPACE.to_owned(), target.cluster_namespace.clone()),
    ]);
    if let Some(repo) = bundle
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::REPO_NAME))
    {
        bd_labels.insert(labels::REPO_NAME.to_owned(), repo.clone());
    }

    let downstream_resources_generation =
        compute_downstream_generation(ctx, bundle, bundle_namespace, target, existing).await?;

    let spec = BundleDeploymentSpec {
        deployment_id,
        staged_deployment_id,
        options: target.options.clone(),
        depends_on: bundle.spec.depends_on.clone(),
        correct_drift: target.options.correct_drift,
        oci_contents: matches!(bundle.spec.source, BundleSource::Oci { .. }).then_some(true),
        helm_chart_options: target.options.helm.clone(),
        downstream_resources_generation,
    };

    if let Some(existing_bd) = existing {
        if existing_bd.spec.deployment_id == spec.deployment_id
            && existing_bd.spec.staged_deployment_id == spec.staged_deployment_id
            && existing_bd.spec.options == spec.options
        {
            debug!(bundle_deployment = bd_name, "no spec change, skipping patch");
            return Ok(());
        }
        let patch = serde_json::json!({ "spec": spec });
        api.patch(&bd_name, &PatchParams::apply("fleet-bundle-controller"), &Patch::Apply(&patch))
            .await
            .map_err(Error::KubeError)?;
    } else {
        let bd = BundleDeployment {
            metadata: ObjectMeta {
                name: Some(bd_name.clone()),
                namespace: Some(target.cluster_namespace.clone()),
                labels: Some(bd_labels),
                finalizers: Some(vec![BUNDLE_FINALIZER.to_owned()]),
                ..Default::default()
            },
            spec,
            status: None,
        };
        match api.create(&PostParams::default(), &bd).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 409 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        info!(bundle_deployment = bd_name, cluster = target.cluster_name, "created BundleDeployment");
    }

    if let Some((cid, _)) = crate::hash::split_deployment_id(new_id) {
        ctx.content_store
            .add_reference(cid, &bd_name)
            .await
            .map_err(|e| e.in_step("pin content reference for new BundleDeployment"))?;
    }

    Ok(())
}

/// `downstreamResourcesGeneration` carried forward unless a downstream clone
/// actually changed this pass, in which case it is bumped by one. A brand
/// new target (no `existing` BundleDeployment yet) starts at 0: it has
/// nothing to own the clone with until it exists.
async fn compute_downstream_generation(
    ctx: &Context,
    bundle: &Bundle,
    bundle_namespace: &str,
    target: &ResolvedTarget,
    existing: Option<&BundleDeployment>,
) -> Result<i64> {
    let Some(existing_bd) = existing else {
        return Ok(0);
    };
    let carried = existing_bd.spec.downstream_resources_generation;
    let changed =
        clone_downstream_resources(ctx, bundle, bundle_namespace, &target.cluster_namespace, existing_bd)
            .await
            .map_err(|e| e.in_step("clone downstream resources"))?;
    Ok(if changed { carried + 1 } else { carried })
}

/// §EXPERIMENTAL_COPY_RESOURCES_DOWNSTREAM: clones the OCI source secret
/// into the target cluster's registration namespace, owned by the
/// BundleDeployment it was cloned for. Returns whether the clone created or
/// changed the downstream copy this pass.
async fn clone_downstream_resources(
    ctx: &Context,
    bundle: &Bundle,
    bundle_namespace: &str,
    target_namespace: &str,
    owner: &BundleDeployment,
) -> Result<bool> {
    if !ctx.feature_flags.copy_resources_downstream {
        return Ok(false);
    }
    let BundleSource::Oci { secret_name: Some(secret_name), .. } = &bundle.spec.source else {
        return Ok(false);
    };

    let source_api: Api<Secret> = Api::namespaced(ctx.client.clone(), bundle_namespace);
    let Some(source) = source_api.get_opt(secret_name).await.map_err(Error::KubeError)? else {
        return Ok(false);
    };

    let dest_api: Api<Secret> = Api::namespaced(ctx.client.clone(), target_namespace);
    let existing_dest = dest_api.get_opt(secret_name).await.map_err(Error::KubeError)?;
    let changed = existing_dest
        .as_ref()
        .map(|d| d.data != source.data || d.string_data != source.string_data)
        .unwrap_or(true);
    if !changed {
        return Ok(false);
    }

    if existing_dest.is_some() {
        let patch = serde_json::json!({
            "data": source.data,
            "stringData": source.string_data,
        });
        dest_api
            .patch(secret_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
    } else {
        let cloned = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(target_namespace.to_owned()),
                owner_references: Some(vec![owner_reference::<BundleDeployment>(&owner.name_any(), owner.uid())]),
                ..Default::default()
            },
            data: source.data.clone(),
            string_data: source.string_data.clone(),
            type_: source.type_.clone(),
            ..Default::default()
        };
        match dest_api.create(&PostParams::default(), &cloned).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 409 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
    Ok(true)
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

/// Status aggregation: fold live `BundleDeployment`
/// status into a `BundleDeploymentSummary`.
async fn aggregate_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<BundleDeploymentSummary> {
    let owned = list_owned_bundle_deployments(ctx, namespace, name).await?;
    let mut summary = BundleDeploymentSummary::default();
    summary.desired_ready = owned.len() as i64;
    for bd in &owned {
        use crate::crd::bundledeployment::DeploymentState::*;
        match bd.deployment_state() {
            Ready => summary.ready += 1,
            WaitApplied => summary.wait_applied += 1,
            ErrApplied => {
                summary.err_applied += 1;
                push_non_ready(&mut summary, bd);
            }
            Modified => {
                summary.modified += 1;
                push_non_ready(&mut summary, bd);
            }
            OutOfSync => {
                summary.out_of_sync += 1;
                push_non_ready(&mut summary, bd);
            }
            NotReady | Unknown => push_non_ready(&mut summary, bd),
            Pending => summary.pending += 1,
        }
    }
    Ok(summary)
}

fn push_non_ready(summary: &mut BundleDeploymentSummary, bd: &BundleDeployment) {
    const MAX_MESSAGES: usize = 10;
    if summary.non_ready_messages.len() >= MAX_MESSAGES {
        return;
    }
    let message = bd
        .status
        .as_ref()
        .and_then(|s| s.non_ready_status.first().cloned())
        .unwrap_or_else(|| format!("{} not ready", bd.name_any()));
    summary.non_ready_messages.push(message);
}

async fn write_status(
    api: &Api<Bundle>,
    bundle: &Bundle,
    name: &str,
    summary: BundleDeploymentSummary,
    resources_sha256_sum: Option<String>,
    terminal_error: Option<String>,
) -> Result<()> {
    let ready = terminal_error.is_none() && summary.is_ready();
    let message = terminal_error
        .clone()
        .unwrap_or_else(|| format!("{}/{} ready", summary.ready, summary.desired_ready));
    let mut conditions: Vec<Condition> = bundle
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    condition::upsert(&mut conditions, Condition::ready(ready, message));

    let status = crate::crd::bundle::BundleStatus {
        summary,
        resources_sha256_sum: resources_sha256_sum
            .or_else(|| bundle.status.as_ref().and_then(|s| s.resources_sha256_sum.clone())),
        observed_generation: bundle.meta().generation.unwrap_or(0),
        conditions,
    };
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Merges a `BundleDeploymentOptions` overlay atop the helm `values` the way
/// the target-namespace-label merge helper dedups match
/// expressions: this is the serializable-for-hashing surface, not the
/// merge itself (see `crate::target::merge_options`).
pub fn encode_for_options_hash(options: &BundleDeploymentOptions) -> Result<Vec<u8>> {
    serde_json::to_vec(options).map_err(Error::SerdeError)
}

/// Turns a plaintext file into an inline `ContentResource`, mirroring how the
/// (out-of-scope) `apply` CLI routine would hand resources to the Bundle
/// reconciler. Exposed for tests and for the `gitrepo` reconciler's synthetic
/// bundle construction when faking `apply`'s output is useful for a unit
/// test.
pub fn plain_resource(name: &str, content: &str) -> crate::crd::content::ContentResource {
    crate::crd::content::ContentResource {
        name: name.to_owned(),
        content: content.to_owned(),
        encoding: ResourceEncoding::Plain,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_content_is_deterministic_for_helm_repo() {
        let bundle = Bundle {
            metadata: ObjectMeta::default(),
            spec: serde_json::from_value(serde_json::json!({
                "source": {"kind": "HelmRepo", "repo": "https://charts.example.com", "chart": "nginx", "version": "1.0.0"}
            }))
            .unwrap(),
            status: None,
        };
        // Two identical specs must resolve to the same content id without
        // touching the API (exercised via the pure preimage formatting).
        let BundleSource::HelmRepo { repo, chart, version } = &bundle.spec.source else {
            panic!("wrong variant")
        };
        let preimage_a = format!("{repo}::{chart}::{}", version.as_deref().unwrap_or(""));
        let preimage_b = format!("{repo}::{chart}::{}", version.as_deref().unwrap_or(""));
        assert_eq!(preimage_a, preimage_b);
    }

    #[test]
    fn oci_reference_without_slash_is_malformed() {
        // Pure shape check mirrored from resolve_oci_reference's validation,
        // without needing a live Context/feature flag plumbing in a unit test.
        assert!(!"not-a-reference".contains('/'));
        assert!("ghcr.io/acme/chart:1.0".contains('/'));
    }

    #[test]
    fn push_non_ready_caps_at_ten_messages() {
        let mut summary = BundleDeploymentSummary::default();
        for i in 0..15 {
            let bd = BundleDeployment {
                metadata: ObjectMeta {
                    name: Some(format!("bd-{i}")),
                    ..Default::default()
                },
                spec: BundleDeploymentSpec {
                    deployment_id: "s-a:h".to_owned(),
                    staged_deployment_id: None,
                    options: BundleDeploymentOptions::default(),
                    depends_on: vec![],
                    correct_drift: false,
                    oci_contents: None,
                    helm_chart_options: None,
                    downstream_resources_generation: 0,
                },
                status: None,
            };
            push_non_ready(&mut summary, &bd);
        }
        assert_eq!(summary.non_ready_messages.len(), 10);
    }
}
