//! Rollout engine: enforces `maxUnavailable` /
//! `maxUnavailablePartitions` gates across targets and partitions, and
//! `dependsOn` ordering, deciding for each target whether to advance
//! `deploymentID` directly or stage it behind `stagedDeploymentID`.

use std::collections::{BTreeMap, HashSet};

use crate::crd::bundle::RolloutStrategy;
use crate::target::resolve_budget;

/// One target's current state as seen by the rollout engine, independent of
/// whether it is backed by a live `BundleDeployment` yet.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub cluster_name: String,
    pub partition: String,
    /// `None` when no `BundleDeployment` exists for this target yet.
    pub applied_deployment_id: Option<String>,
    pub current_deployment_id: Option<String>,
    pub ready: bool,
}

impl TargetState {
    /// A target is "unavailable" if its BundleDeployment is not ready OR
    /// `appliedDeploymentID != deploymentID`.
    pub fn is_unavailable(&self) -> bool {
        !self.ready || self.applied_deployment_id != self.current_deployment_id
    }
}

/// What the rollout engine decided for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Advance: set `spec.deploymentID` to the new value.
    Advance,
    /// Hold: set `spec.stagedDeploymentID` only; `spec.deploymentID` is
    /// unchanged (or unset, for a brand new target, it is created at the
    /// old id until budget allows).
    Hold,
}

/// Decides, for every target, whether it may advance to `new_deployment_id`
/// this reconcile. `states` must reflect the live BundleDeployments prior to
/// this decision (i.e. before any of them get the new id applied).
///
/// Ordering within a partition is by cluster name, for determinism
///: once budget allows more than one target to advance,
/// the earliest-named held target advances first.
pub fn gate_rollout(
    strategy: &RolloutStrategy,
    states: &[TargetState],
    new_deployment_id: &str,
) -> BTreeMap<String, GateDecision> {
    let mut decisions = BTreeMap::new();

    let partitions: Vec<String> = {
        let mut seen = HashSet::new();
        states
            .iter()
            .map(|t| t.partition.clone())
            .filter(|p| seen.insert(p.clone()))
            .collect()
    };

    let max_unavailable_partitions = strategy
        .max_unavailable_partitions
        .as_ref()
        .map(|v| resolve_budget(Some(v), partitions.len()))
        .unwrap_or(partitions.len().max(1));

    // A partition is "mid-rollout" if any of its targets have not yet
    // converged to new_deployment_id.
    let mut mid_rollout_count = 0usize;
    let mut partitions_in_order: Vec<&String> = partitions.iter().collect();
    partitions_in_order.sort();

    for partition in partitions_in_order {
        let partition_targets: Vec<&TargetState> =
            states.iter().filter(|t| &t.partition == partition).collect();
        let partition_size = partition_targets.len();

        let already_mid_rollout = partition_targets
            .iter()
            .any(|t| t.current_deployment_id.as_deref() == Some(new_deployment_id));

        let partition_budget = strategy
            .partitions
            .iter()
            .find(|p| &p.name == partition)
            .and_then(|p| p.max_unavailable.as_ref())
            .or(strategy.max_unavailable.as_ref());
        let max_unavailable = resolve_budget(partition_budget, partition_size);

        let would_start_new_partition = !already_mid_rollout;
        if would_start_new_partition && mid_rollout_count >= max_unavailable_partitions {
            for t in &partition_targets {
                decisions.insert(t.cluster_name.clone(), GateDecision::Hold);
            }
            continue;
        }
        if would_start_new_partition {
            mid_rollout_count += 1;
        }

        let mut ordered: Vec<&TargetState> = partition_targets.clone();
        ordered.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));

        let unavailable_count = ordered.iter().filter(|t| t.is_unavailable()).count();
        let mut budget_remaining = max_unavailable.saturating_sub(unavailable_count);

        for t in ordered {
            let already_advancing = t.current_deployment_id.as_deref() == Some(new_deployment_id);
            if already_advancing {
                decisions.insert(t.cluster_name.clone(), GateDecision::Advance);
                continue;
            }
            if budget_remaining > 0 {
                decisions.insert(t.cluster_name.clone(), GateDecision::Advance);
                budget_remaining -= 1;
            } else {
                decisions.insert(t.cluster_name.clone(), GateDecision::Hold);
            }
        }
    }

    decisions
}

/// Cycle-safe dependency gating: a target is held until
/// every bundle it `dependsOn` is ready in the same cluster. A cycle among
/// `dependsOn` names means "never satisfied" rather than panicking or
/// looping. It is detected up front and surfaces as a held target.
pub fn dependencies_satisfied(
    bundle_name: &str,
    depends_on: &BTreeMap<String, Vec<String>>,
    ready_in_cluster: &dyn Fn(&str) -> bool,
) -> bool {
    if has_cycle(bundle_name, depends_on) {
        return false;
    }
    let Some(deps) = depends_on.get(bundle_name) else {
        return true;
    };
    deps.iter().all(|d| ready_in_cluster(d))
}

fn has_cycle(start: &str, graph: &BTreeMap<String, Vec<String>>) -> bool {
    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<String, Vec<String>>,
        visiting: &mut HashSet<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> bool {
        if visiting.contains(node) {
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visiting.insert(node);
        if let Some(deps) = graph.get(node) {
            for d in deps {
                if visit(d, graph, visiting, visited) {
                    return true;
                }
            }
        }
        visiting.remove(node);
        visited.insert(node);
        false
    }
    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    visit(start, graph, &mut visiting, &mut visited)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::bundle::IntOrString;

    fn state(name: &str, partition: &str, applied: Option<&str>, current: Option<&str>, ready: bool) -> TargetState {
        TargetState {
            cluster_name: name.to_owned(),
            partition: partition.to_owned(),
            applied_deployment_id: applied.map(str::to_owned),
            current_deployment_id: current.map(str::to_owned),
            ready,
        }
    }

    #[test]
    fn max_unavailable_one_advances_one_cluster_at_a_time() {
        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(1)),
            ..Default::default()
        };
        let states = vec![
            state("c1", "default", Some("old"), Some("old"), true),
            state("c2", "default", Some("old"), Some("old"), true),
            state("c3", "default", Some("old"), Some("old"), true),
        ];
        let decisions = gate_rollout(&strategy, &states, "new");
        let advancing = decisions.values().filter(|d| **d == GateDecision::Advance).count();
        assert_eq!(advancing, 1);
    }

    #[test]
    fn already_unavailable_target_consumes_budget() {
        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(1)),
            ..Default::default()
        };
        // c1 is already unavailable (not ready) at the old id: budget is consumed,
        // so no *new* target should advance.
        let states = vec![
            state("c1", "default", Some("old"), Some("old"), false),
            state("c2", "default", Some("old"), Some("old"), true),
        ];
        let decisions = gate_rollout(&strategy, &states, "new");
        assert_eq!(decisions.get("c2"), Some(&GateDecision::Hold));
    }

    #[test]
    fn hundred_percent_advances_everyone() {
        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Str("100%".to_owned())),
            ..Default::default()
        };
        let states = vec![
            state("c1", "default", Some("old"), Some("old"), true),
            state("c2", "default", Some("old"), Some("old"), true),
            state("c3", "default", Some("old"), Some("old"), true),
        ];
        let decisions = gate_rollout(&strategy, &states, "new");
        assert!(decisions.values().all(|d| *d == GateDecision::Advance));
    }

    #[test]
    fn already_advancing_targets_stay_advanced_even_over_budget() {
        let strategy = RolloutStrategy {
            max_unavailable: Some(IntOrString::Int(1)),
            ..Default::default()
        };
        // c1 already advanced to "new" last reconcile and is still converging.
        let states = vec![
            state("c1", "default", Some("old"), Some("new"), false),
            state("c2", "default", Some("old"), Some("old"), true),
        ];
        let decisions = gate_rollout(&strategy, &states, "new");
        assert_eq!(decisions.get("c1"), Some(&GateDecision::Advance));
        assert_eq!(decisions.get("c2"), Some(&GateDecision::Hold));
    }

    #[test]
    fn self_dependency_cycle_never_satisfied() {
        let mut graph = BTreeMap::new();
        graph.insert("b".to_owned(), vec!["a".to_owned()]);
        graph.insert("a".to_owned(), vec!["b".to_owned()]);
        assert!(!dependencies_satisfied("b", &graph, &|_| true));
    }

    #[test]
    fn no_dependency_is_trivially_satisfied() {
        let graph = BTreeMap::new();
        assert!(dependencies_satisfied("b", &graph, &|_| false));
    }
}
