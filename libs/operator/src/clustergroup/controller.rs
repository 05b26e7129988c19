//! Wires the `ClusterGroup` reconciler into a `kube::runtime::Controller`.
//!
//! Membership is selector-driven rather than owned, so there is no single
//! child kind to `.owns()`/`.watches()`: any `Cluster` in the namespace can
//! enter or leave a group's membership. Rather than re-deriving which groups
//! a changed `Cluster` affects, this controller relies on its periodic
//! requeue to converge.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use tracing::{error, info, trace};

use crate::clustergroup::reconcile::{error_policy, reconcile};
use crate::controller::Context;
use crate::crd::clustergroup::ClusterGroup;

pub async fn run(ctx: Arc<Context>) {
    let clustergroups = Api::<ClusterGroup>::all(ctx.client.clone());
    if let Err(e) = clustergroups.list(&ListParams::default().limit(1)).await {
        error!("ClusterGroup CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    trace!("init clustergroup controller");
    Controller::new(clustergroups, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("clustergroup reconciled: {o:?}"),
                Err(e) => error!("clustergroup reconcile failed: {e:?}"),
            }
        })
        .await;
}
