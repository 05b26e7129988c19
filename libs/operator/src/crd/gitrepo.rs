use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::bundle::BundleTarget;
use crate::crd::cluster::BundleDeploymentSummary;
use crate::crd::condition::Condition;

/// A Git source reference that produces a `Bundle` per configured `path`
///.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "GitRepo",
    namespaced,
    status = "GitRepoStatus",
    printcolumn = r#"{"name":"Repo", "type":"string", "jsonPath":".spec.repo"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".status.commit"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.display.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoSpec {
    pub repo: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
    /// Subdirectories within `repo`, each producing one `Bundle`.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub targets: Vec<BundleTarget>,
    pub target_namespace: Option<String>,
    pub service_account: Option<String>,
    /// Credential secret (SSH key, basic-auth password, or OAuth token,
    /// depending on the secret's type).
    pub client_secret_name: Option<String>,
    /// Re-clone cadence in seconds; `0` disables polling.
    #[serde(default)]
    pub polling_interval_seconds: i64,
    /// Monotonic counter the user can bump to force an immediate re-sync
    /// regardless of `pollingIntervalSeconds`.
    #[serde(default)]
    pub force_sync_generation: i64,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    pub ca_bundle: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoStatus {
    pub commit: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub summary: BundleDeploymentSummary,
    pub display: GitRepoDisplay,
    pub resource_counts: ResourceCounts,
    /// Minimum `ready` count across bundles with a positive `desiredReady`.
    pub ready_clusters: i64,
    pub observed_generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoDisplay {
    pub state: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounts {
    pub desired_ready: i64,
    pub ready: i64,
}

/// A namespace-scoped policy restricting what a `GitRepo`/`Bundle` in that
/// namespace may declare. Multiple restrictions in a
/// namespace are aggregated by intersection.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "fleet.cattle.io",
    version = "v1alpha1",
    kind = "GitRepoRestriction",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepoRestrictionSpec {
    #[serde(default)]
    pub allowed_service_accounts: Vec<String>,
    pub default_service_account: Option<String>,
    #[serde(default)]
    pub allowed_repo_patterns: Vec<String>,
    #[serde(default)]
    pub allowed_client_secret_names: Vec<String>,
}

/// Aggregates a set of `GitRepoRestriction`s found in a namespace into one
/// effective policy by intersecting their allowlists (empty allowlist on a
/// restriction means "no restriction from this object" for that field).
#[derive(Debug, Default, Clone)]
pub struct AggregatedRestriction {
    pub allowed_service_accounts: Option<Vec<String>>,
    pub default_service_account: Option<String>,
    pub allowed_repo_patterns: Option<Vec<String>>,
    pub allowed_client_secret_names: Option<Vec<String>>,
}

impl AggregatedRestriction {
    pub fn aggregate(restrictions: &[GitRepoRestrictionSpec]) -> Self {
        let mut agg = AggregatedRestriction::default();
        for r in restrictions {
            intersect(&mut agg.allowed_service_accounts, &r.allowed_service_accounts);
            intersect(&mut agg.allowed_repo_patterns, &r.allowed_repo_patterns);
            intersect(
                &mut agg.allowed_client_secret_names,
                &r.allowed_client_secret_names,
            );
            if agg.default_service_account.is_none() {
                agg.default_service_account = r.default_service_account.clone();
            }
        }
        agg
    }

    /// Validates a `GitRepo.spec.serviceAccount` value, if any restriction
    /// declared an allowlist for it.
    pub fn validate_service_account(&self, value: Option<&str>) -> crate::error::Result<()> {
        validate_allowlist(
            &self.allowed_service_accounts,
            value,
            "serviceAccount not permitted by GitRepoRestriction",
        )
    }

    pub fn validate_client_secret_name(&self, value: Option<&str>) -> crate::error::Result<()> {
        validate_allowlist(
            &self.allowed_client_secret_names,
            value,
            "clientSecretName not permitted by GitRepoRestriction",
        )
    }

    /// Validates a repo URL against the aggregated set of allowed regex
    /// patterns, if any were declared.
    pub fn validate_repo(&self, repo: &str) -> crate::error::Result<()> {
        let Some(patterns) = &self.allowed_repo_patterns else {
            return Ok(());
        };
        if patterns.is_empty() {
            return Ok(());
        }
        let ok = patterns.iter().any(|p| {
            regex::Regex::new(p)
                .map(|re| re.is_match(repo))
                .unwrap_or(false)
        });
        if ok {
            Ok(())
        } else {
            Err(crate::error::Error::RestrictionViolation(format!(
                "repo {repo} not permitted by GitRepoRestriction"
            )))
        }
    }
}

fn intersect(acc: &mut Option<Vec<String>>, next: &[String]) {
    if next.is_empty() {
        return;
    }
    match acc {
        None => *acc = Some(next.to_vec()),
        Some(existing) => existing.retain(|v| next.contains(v)),
    }
}

fn validate_allowlist(
    allowlist: &Option<Vec<String>>,
    value: Option<&str>,
    message: &str,
) -> crate::error::Result<()> {
    let Some(allowed) = allowlist else {
        return Ok(());
    };
    match value {
        None => Ok(()),
        Some(v) if allowed.iter().any(|a| a == v) => Ok(()),
        Some(_) => Err(crate::error::Error::RestrictionViolation(message.to_owned())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn restriction(sas: &[&str]) -> GitRepoRestrictionSpec {
        GitRepoRestrictionSpec {
            allowed_service_accounts: sas.iter().map(|s| s.to_string()).collect(),
            default_service_account: None,
            allowed_repo_patterns: vec![],
            allowed_client_secret_names: vec![],
        }
    }

    #[test]
    fn intersection_of_two_restrictions_narrows() {
        let agg = AggregatedRestriction::aggregate(&[
            restriction(&["a", "b"]),
            restriction(&["b", "c"]),
        ]);
        assert!(agg.validate_service_account(Some("b")).is_ok());
        assert!(agg.validate_service_account(Some("a")).is_err());
    }

    #[test]
    fn no_restrictions_allows_anything() {
        let agg = AggregatedRestriction::aggregate(&[]);
        assert!(agg.validate_service_account(Some("whatever")).is_ok());
    }

    #[test]
    fn repo_pattern_must_match() {
        let mut r = restriction(&[]);
        r.allowed_repo_patterns = vec!["^https://github.com/acme/.*$".to_owned()];
        let agg = AggregatedRestriction::aggregate(&[r]);
        assert!(agg.validate_repo("https://github.com/acme/infra").is_ok());
        assert!(agg.validate_repo("https://evil.example/infra").is_err());
    }
}
