//! Label and annotation conventions shared by every reconciler.

/// Name of the `Bundle` a `BundleDeployment` was created from.
pub const BUNDLE_NAME: &str = "fleet.cattle.io/bundle-name";
/// Namespace of the `Bundle` a `BundleDeployment` was created from.
pub const BUNDLE_NAMESPACE: &str = "fleet.cattle.io/bundle-namespace";
/// Name of the target `Cluster` a `BundleDeployment` is placed for.
pub const CLUSTER: &str = "fleet.cattle.io/cluster";
/// Namespace of the target `Cluster` a `BundleDeployment` is placed for.
pub const CLUSTER_NAMESPACE: &str = "fleet.cattle.io/cluster-namespace";
/// Name of the `GitRepo` a `Bundle` was produced from, used to cascade deletes
/// and to aggregate status back up to the `GitRepo`.
pub const REPO_NAME: &str = "fleet.cattle.io/repo-name";
/// Marks namespaces and other objects created and owned by this operator.
pub const MANAGED: &str = "fleet.cattle.io/managed";
/// Optional shard selector; a controller instance only reconciles objects
/// whose value here matches its own configured shard id.
pub const SHARDING_REF: &str = "fleet.cattle.io/sharding-ref";

/// Annotation carrying the `Cluster`'s registration namespace.
pub const ANNOTATION_CLUSTER_NAMESPACE: &str = "fleet.cattle.io/cluster-namespace";
/// Annotation carrying the `Cluster` name a namespace/object belongs to.
pub const ANNOTATION_CLUSTER: &str = "fleet.cattle.io/cluster";
/// Annotation mirroring the `managed` label for tooling that only reads annotations.
pub const ANNOTATION_MANAGED: &str = "fleet.cattle.io/managed";
/// Annotation carrying the one-shot bootstrap token name issued at registration.
pub const ANNOTATION_BOOTSTRAP_TOKEN: &str = "fleet.cattle.io/bootstrap-token";

/// The cleanup finalizer shared by `Bundle`, `BundleDeployment`, `GitRepo` and
/// `Cluster`: presence blocks API-server deletion until owned children are gone.
pub const CLEANUP_FINALIZER: &str = "fleet.cattle.io/cleanup";
