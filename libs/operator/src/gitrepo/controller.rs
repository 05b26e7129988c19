//! Wires the `GitRepo` reconciler into a `kube::runtime::Controller`, watching
//! the clone-and-apply `Job` it owns. Unlike the Bundle
//! controller's `BundleDeployment` watch, the `Job` lives in the same
//! namespace as its `GitRepo`, so a real Kubernetes owner reference and
//! `Controller::owns()` apply here.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use tracing::{error, info, trace};

use crate::controller::Context;
use crate::crd::gitrepo::GitRepo;
use crate::gitrepo::reconcile::{error_policy, reconcile};

pub async fn run(ctx: Arc<Context>) {
    let gitrepos = Api::<GitRepo>::all(ctx.client.clone());
    if let Err(e) = gitrepos.list(&ListParams::default().limit(1)).await {
        error!("GitRepo CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    let jobs = Api::<Job>::all(ctx.client.clone());

    trace!("init gitrepo controller");
    Controller::new(gitrepos, Config::default().any_semantic())
        .owns(jobs, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("gitrepo reconciled: {o:?}"),
                Err(e) => error!("gitrepo reconcile failed: {e:?}"),
            }
        })
        .await;
}
