//! Wires the three `Controller`s that make up registration and import
//!: bootstrap token issuance, agent-initiated registration
//! processing, and Cluster import. All three run concurrently under one
//! `run()` so `controller::run`'s join list only needs a single future for
//! the whole "registration" concern.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::watcher::Config;
use tracing::{error, info, trace};

use crate::controller::Context;
use crate::crd::cluster::Cluster;
use crate::crd::registration::{ClusterRegistration, ClusterRegistrationToken};
use crate::registration::reconcile::{
    import_error_policy, reconcile_import, reconcile_registration, reconcile_token, registration_error_policy,
    token_error_policy,
};

pub async fn run(ctx: Arc<Context>) {
    let tokens = Api::<ClusterRegistrationToken>::all(ctx.client.clone());
    let registrations = Api::<ClusterRegistration>::all(ctx.client.clone());
    let clusters = Api::<Cluster>::all(ctx.client.clone());
    if let Err(e) = registrations.list(&ListParams::default().limit(1)).await {
        error!("ClusterRegistration CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    trace!("init registration controllers");
    let token_ctx = ctx.clone();
    let token_fut = Controller::new(tokens, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_token, token_error_policy, token_ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("clusterregistrationtoken reconciled: {o:?}"),
                Err(e) => error!("clusterregistrationtoken reconcile failed: {e:?}"),
            }
        });

    let registration_ctx = ctx.clone();
    let registration_fut = Controller::new(registrations, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_registration, registration_error_policy, registration_ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("clusterregistration reconciled: {o:?}"),
                Err(e) => error!("clusterregistration reconcile failed: {e:?}"),
            }
        });

    let import_fut = Controller::new(clusters, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_import, import_error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("cluster import reconciled: {o:?}"),
                Err(e) => error!("cluster import reconcile failed: {e:?}"),
            }
        });

    futures::join!(token_fut, registration_fut, import_fut);
}
