//! Wires the `Bundle` reconciler into a `kube::runtime::Controller`, watching
//! `BundleDeployment`s it owns so a downstream status change re-triggers the
//! owning bundle.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::ResourceExt;
use tracing::{error, info, trace};

use crate::bundle::reconcile::{error_policy, reconcile};
use crate::controller::Context;
use crate::crd::bundle::Bundle;
use crate::crd::bundledeployment::BundleDeployment;
use crate::labels;

pub async fn run(ctx: Arc<Context>) {
    let bundles = Api::<Bundle>::all(ctx.client.clone());
    if let Err(e) = bundles.list(&ListParams::default().limit(1)).await {
        error!("Bundle CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    // `BundleDeployment`s live in the target cluster's registration namespace,
    // not the owning Bundle's namespace, so ownership is tracked by label
    // rather than by `ownerReferences` (cross-namespace owner refs are not
    // supported by the API server).
    let bundle_deployments = Api::<BundleDeployment>::all(ctx.client.clone());

    trace!("init bundle controller");
    Controller::new(bundles, Config::default().any_semantic())
        .watches(bundle_deployments, Config::default().any_semantic(), |bd| {
            let labels = bd.labels();
            match (
                labels.get(labels::BUNDLE_NAME),
                labels.get(labels::BUNDLE_NAMESPACE),
            ) {
                (Some(name), Some(namespace)) => {
                    Some(ObjectRef::<Bundle>::new(name).within(namespace))
                }
                _ => None,
            }
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("bundle reconciled: {o:?}"),
                Err(e) => error!("bundle reconcile failed: {e:?}"),
            }
        })
        .await;
}
