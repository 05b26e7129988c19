//! Target resolution: enumerate which `Cluster`s a `Bundle`
//! applies to and with what merged options, and assign each matched cluster
//! to a rollout partition.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::crd::bundle::{Bundle, BundleDeploymentOptions, BundleTarget, HelmOptions, IntOrString, Partition};
use crate::crd::cluster::Cluster;
use crate::crd::clustergroup::ClusterGroup;

/// One resolved (Cluster, Target) pairing ready to become a `BundleDeployment`.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub cluster_name: String,
    pub cluster_namespace: String,
    pub options: BundleDeploymentOptions,
    pub partition: String,
}

/// Evaluates a `LabelSelector` against a label map using standard Kubernetes
/// selector semantics: `matchLabels` are an implicit `In` with one value,
/// `matchExpressions` are evaluated by operator, and all clauses must hold.
/// An entirely empty selector (`{}`) matches everything; `None` matches
/// nothing (the caller is expected to special-case "no selector configured"
/// before calling this).
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let match_labels_ok = selector
        .match_labels
        .as_ref()
        .map(|ml| ml.iter().all(|(k, v)| labels.get(k) == Some(v)))
        .unwrap_or(true);
    if !match_labels_ok {
        return false;
    }
    selector
        .match_expressions
        .as_ref()
        .map(|exprs| exprs.iter().all(|e| expression_matches(e, labels)))
        .unwrap_or(true)
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = expr.values.as_deref().unwrap_or(&[]);
    match expr.operator.as_str() {
        "In" => labels.get(&expr.key).is_some_and(|v| values.contains(v)),
        "NotIn" => !labels.get(&expr.key).is_some_and(|v| values.contains(v)),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => false,
    }
}

/// Does `target` match `cluster`, given the set of `ClusterGroup`s currently
/// known (used for `clusterGroup`/`clusterGroupSelector` matches)?
///
pub fn target_matches_cluster(
    target: &BundleTarget,
    cluster: &Cluster,
    cluster_groups: &[ClusterGroup],
) -> bool {
    if let Some(name) = &target.cluster_name {
        if name == &cluster.metadata.name.clone().unwrap_or_default() {
            return true;
        }
    }
    if let Some(sel) = &target.cluster_selector {
        if selector_matches(sel, &cluster.spec.labels) {
            return true;
        }
    }
    if let Some(group_name) = &target.cluster_group {
        if cluster_groups.iter().any(|g| {
            g.metadata.name.as_deref() == Some(group_name.as_str())
                && g.spec
                    .selector
                    .as_ref()
                    .is_some_and(|s| selector_matches(s, &cluster.spec.labels))
        }) {
            return true;
        }
    }
    if let Some(group_sel) = &target.cluster_group_selector {
        let member_of_matching_group = cluster_groups.iter().any(|g| {
            let group_labels = g
                .metadata
                .labels
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect::<BTreeMap<_, _>>();
            selector_matches(group_sel, &group_labels)
                && g.spec
                    .selector
                    .as_ref()
                    .is_some_and(|s| selector_matches(s, &cluster.spec.labels))
        });
        if member_of_matching_group {
            return true;
        }
    }
    false
}

/// Resolves every `(Cluster, Target)` pair a `Bundle` applies to, with
/// options merged and partitions assigned. `clusters` and `cluster_groups`
/// should be a live read of the candidate namespace's contents.
pub fn resolve_targets(
    bundle: &Bundle,
    clusters: &[Cluster],
    cluster_groups: &[ClusterGroup],
) -> Vec<ResolvedTarget> {
    let targets: Vec<BundleTarget> = if bundle.spec.targets.is_empty() {
        vec![BundleTarget {
            name: "default".to_owned(),
            cluster_group: Some("default".to_owned()),
            ..Default::default()
        }]
    } else {
        bundle.spec.targets.clone()
    };

    let mut resolved = Vec::new();
    let mut seen_clusters = std::collections::HashSet::new();

    for cluster in clusters {
        let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
        let cluster_namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        if seen_clusters.contains(&cluster_name) {
            continue;
        }

        // First target in declaration order wins for overlay purposes.
        let Some(matched) = targets
            .iter()
            .find(|t| target_matches_cluster(t, cluster, cluster_groups))
        else {
            continue;
        };

        if !bundle.spec.target_restrictions.is_empty()
            && !bundle
                .spec
                .target_restrictions
                .iter()
                .any(|r| target_matches_cluster(r, cluster, cluster_groups))
        {
            continue;
        }

        let options = merge_options(&bundle.spec.default_options, matched.custom.as_ref());
        let partition = assign_partition(&bundle.spec.rollout_strategy.partitions, cluster);

        seen_clusters.insert(cluster_name.clone());
        resolved.push(ResolvedTarget {
            cluster_name,
            cluster_namespace,
            options,
            partition,
        });
    }

    resolved
}

/// Deep-merges a target's overlay atop the bundle's base options
///: maps merge key-by-key with the
/// overlay winning, Helm `values` merge deeply, everything else replaces.
pub fn merge_options(
    base: &BundleDeploymentOptions,
    overlay: Option<&BundleDeploymentOptions>,
) -> BundleDeploymentOptions {
    let Some(overlay) = overlay else {
        return base.clone();
    };

    let mut namespace_labels = base.namespace_labels.clone();
    namespace_labels.extend(overlay.namespace_labels.clone());
    let mut namespace_annotations = base.namespace_annotations.clone();
    namespace_annotations.extend(overlay.namespace_annotations.clone());

    BundleDeploymentOptions {
        default_namespace: overlay
            .default_namespace
            .clone()
            .or_else(|| base.default_namespace.clone()),
        namespace_labels,
        namespace_annotations,
        helm: merge_helm(base.helm.as_ref(), overlay.helm.as_ref()),
        service_account: overlay
            .service_account
            .clone()
            .or_else(|| base.service_account.clone()),
        force_sync_generation: if overlay.force_sync_generation != 0 {
            overlay.force_sync_generation
        } else {
            base.force_sync_generation
        },
        correct_drift: overlay.correct_drift || base.correct_drift,
    }
}

fn merge_helm(base: Option<&HelmOptions>, overlay: Option<&HelmOptions>) -> Option<HelmOptions> {
    match (base, overlay) {
        (None, None) => None,
        (Some(b), None) => Some(b.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(b), Some(o)) => {
            let mut values = b.values.clone();
            values.extend(o.values.clone());
            Some(HelmOptions {
                release_name: o.release_name.clone().or_else(|| b.release_name.clone()),
                values,
                version: o.version.clone().or_else(|| b.version.clone()),
                take_ownership: o.take_ownership || b.take_ownership,
            })
        }
    }
}

/// Assigns a cluster to a rollout partition: the first matching explicit partition wins; with no
/// partitions declared, everything lands in the implicit `"default"`
/// partition (auto-partitioning by size is applied later, over the ordered
/// list of resolved targets, since it needs the whole target set at once).
pub fn assign_partition(partitions: &[Partition], cluster: &Cluster) -> String {
    for p in partitions {
        if let Some(sel) = &p.cluster_selector {
            if selector_matches(sel, &cluster.spec.labels) {
                return p.name.clone();
            }
        } else {
            return p.name.clone();
        }
    }
    "default".to_owned()
}

/// Applies `autoPartitionSize` bucketing over an already-partitioned target
/// list, deterministically by `(cluster namespace, cluster name)` sort order
///. Only rewrites the `"default"` partition produced when no
/// explicit partitions were declared.
pub fn auto_partition(targets: &mut [ResolvedTarget], bucket_size: i64) {
    if bucket_size <= 0 {
        return;
    }
    let mut defaults: Vec<usize> = targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.partition == "default")
        .map(|(i, _)| i)
        .collect();
    defaults.sort_by_key(|&i| (targets[i].cluster_namespace.clone(), targets[i].cluster_name.clone()));
    for (bucket_index, chunk) in defaults.chunks(bucket_size as usize).enumerate() {
        for &i in chunk {
            targets[i].partition = format!("auto-{bucket_index}");
        }
    }
}

/// Resolves `maxUnavailable`/`maxUnavailablePartitions` to an absolute count
/// given a total. Percentages round up.
pub fn resolve_budget(value: Option<&IntOrString>, total: usize) -> usize {
    match value {
        None => 1,
        Some(IntOrString::Int(n)) => (*n).max(0) as usize,
        Some(IntOrString::Str(s)) => {
            if let Some(pct) = s.strip_suffix('%') {
                let pct: f64 = pct.parse().unwrap_or(100.0);
                ((pct / 100.0) * total as f64).ceil() as usize
            } else {
                s.parse().unwrap_or(1)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::api::ObjectMeta;

    fn cluster(name: &str, labels: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("fleet-default".to_owned()),
                ..Default::default()
            },
            spec: crate::crd::cluster::ClusterSpec {
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ..serde_json::from_value(serde_json::json!({})).unwrap()
            },
            status: None,
        }
    }

    #[test]
    fn cluster_name_target_matches_only_that_cluster() {
        let target = BundleTarget {
            cluster_name: Some("prod-1".to_owned()),
            ..Default::default()
        };
        let prod1 = cluster("prod-1", &[]);
        let prod2 = cluster("prod-2", &[]);
        assert!(target_matches_cluster(&target, &prod1, &[]));
        assert!(!target_matches_cluster(&target, &prod2, &[]));
    }

    #[test]
    fn cluster_selector_matches_on_labels() {
        let target = BundleTarget {
            cluster_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([("env".to_owned(), "prod".to_owned())])),
                match_expressions: None,
            }),
            ..Default::default()
        };
        let matching = cluster("a", &[("env", "prod")]);
        let other = cluster("b", &[("env", "staging")]);
        assert!(target_matches_cluster(&target, &matching, &[]));
        assert!(!target_matches_cluster(&target, &other, &[]));
    }

    #[test]
    fn empty_targets_use_synthetic_default_group() {
        let bundle = Bundle {
            metadata: ObjectMeta::default(),
            spec: serde_json::from_value(serde_json::json!({"source": {"kind": "Content", "contentsId": "s-a"}})).unwrap(),
            status: None,
        };
        let group = ClusterGroup {
            metadata: ObjectMeta {
                name: Some("default".to_owned()),
                ..Default::default()
            },
            spec: crate::crd::clustergroup::ClusterGroupSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::new()),
                    match_expressions: None,
                }),
            },
            status: None,
        };
        let c = cluster("only", &[]);
        let resolved = resolve_targets(&bundle, &[c], &[group]);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn budget_percentage_rounds_up() {
        assert_eq!(resolve_budget(Some(&IntOrString::Str("25%".to_owned())), 3), 1);
        assert_eq!(resolve_budget(Some(&IntOrString::Str("50%".to_owned())), 3), 2);
        assert_eq!(resolve_budget(Some(&IntOrString::Str("100%".to_owned())), 3), 3);
    }

    #[test]
    fn budget_zero_means_nothing_unavailable_allowed() {
        assert_eq!(resolve_budget(Some(&IntOrString::Int(0)), 5), 0);
    }

    #[test]
    fn auto_partition_buckets_deterministically() {
        let mut targets = vec![
            ResolvedTarget { cluster_name: "c".into(), cluster_namespace: "ns".into(), options: Default::default(), partition: "default".into() },
            ResolvedTarget { cluster_name: "a".into(), cluster_namespace: "ns".into(), options: Default::default(), partition: "default".into() },
            ResolvedTarget { cluster_name: "b".into(), cluster_namespace: "ns".into(), options: Default::default(), partition: "default".into() },
        ];
        auto_partition(&mut targets, 2);
        let a = targets.iter().find(|t| t.cluster_name == "a").unwrap();
        let b = targets.iter().find(|t| t.cluster_name == "b").unwrap();
        let c = targets.iter().find(|t| t.cluster_name == "c").unwrap();
        assert_eq!(a.partition, "auto-0");
        assert_eq!(b.partition, "auto-0");
        assert_eq!(c.partition, "auto-1");
    }
}
