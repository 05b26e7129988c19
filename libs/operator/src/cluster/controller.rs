//! Wires the `Cluster` reconciler into a `kube::runtime::Controller`. The
//! `BundleDeployment`s that drive status aggregation live in the cluster's
//! registration namespace, not the `Cluster` object's own namespace, so
//! ownership is tracked by label rather than by `ownerReferences`.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use tracing::{error, info, trace};

use crate::cluster::reconcile::{error_policy, reconcile};
use crate::controller::Context;
use crate::crd::bundledeployment::BundleDeployment;
use crate::crd::cluster::Cluster;
use crate::labels;

pub async fn run(ctx: Arc<Context>) {
    let clusters = Api::<Cluster>::all(ctx.client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("Cluster CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    let bundle_deployments = Api::<BundleDeployment>::all(ctx.client.clone());

    trace!("init cluster controller");
    Controller::new(clusters, Config::default().any_semantic())
        .watches(bundle_deployments, Config::default().any_semantic(), |bd| {
            let labels = bd.labels();
            match (labels.get(labels::CLUSTER), labels.get(labels::CLUSTER_NAMESPACE)) {
                (Some(name), Some(namespace)) => Some(ObjectRef::<Cluster>::new(name).within(namespace)),
                _ => None,
            }
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("cluster reconciled: {o:?}"),
                Err(e) => error!("cluster reconcile failed: {e:?}"),
            }
        })
        .await;
}
