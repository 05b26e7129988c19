//! Shared reconciler scaffolding: one `kube::runtime::Controller`
//! per CRD kind, all driven from a single `Context` and a single `State` that
//! the HTTP server exposes over `/metrics` and (per-controller) diagnostics.
//!
//! A single `Context`/`State`/`run()` split is shared across the seven
//! reconcilers this crate runs side by side.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::events::Reporter;
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::OperatorConfig;
use crate::contentstore::ContentStore;
use crate::featureflags::FeatureFlags;
use crate::metrics::Metrics;

/// Low-cardinality id identifying which reconciler a metric/diagnostic
/// belongs to (`"gitrepo"`, `"bundle"`, `"cluster"`, `"clustergroup"`,
/// `"registration"`, `"clusterregistrationtoken"`).
pub type ControllerId = &'static str;

pub const GITREPO: ControllerId = "gitrepo";
pub const BUNDLE: ControllerId = "bundle";
pub const CLUSTER: ControllerId = "cluster";
pub const CLUSTERGROUP: ControllerId = "clustergroup";
pub const REGISTRATION: ControllerId = "registration";
pub const REGISTRATION_TOKEN: ControllerId = "clusterregistrationtoken";
pub const CONTENT_GC: ControllerId = "content-gc";

pub const ALL_CONTROLLERS: &[ControllerId] = &[
    GITREPO,
    BUNDLE,
    CLUSTER,
    CLUSTERGROUP,
    REGISTRATION,
    REGISTRATION_TOKEN,
    CONTENT_GC,
];

/// Context injected into every reconcile call, regardless of CRD kind.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    pub feature_flags: FeatureFlags,
    pub content_store: Arc<ContentStore>,
    pub metrics: Arc<Metrics>,
    diagnostics: Arc<DiagnosticsMap>,
}

impl Context {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        feature_flags: FeatureFlags,
        metrics: Arc<Metrics>,
        diagnostics: Arc<DiagnosticsMap>,
    ) -> Self {
        let content_store = Arc::new(ContentStore::new(client.clone()));
        Self {
            client,
            config,
            feature_flags,
            content_store,
            metrics,
            diagnostics,
        }
    }

    pub async fn record_event(&self, id: ControllerId) {
        if let Some(d) = self.diagnostics.get(id) {
            d.write().await.last_event = Utc::now();
        }
    }
}

/// Diagnostics reported by one reconciler, read by the web server.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    fn new(controller_id: ControllerId) -> Self {
        Self {
            last_event: Utc::now(),
            reporter: format!("fleet-{controller_id}-controller").into(),
        }
    }
}

pub type DiagnosticsMap = HashMap<ControllerId, Arc<RwLock<Diagnostics>>>;

/// State shared between every reconciler and the web server.
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<DiagnosticsMap>,
    metrics: Arc<Metrics>,
}

impl State {
    pub fn new(registry: prometheus_client::registry::Registry, controller_ids: &[ControllerId]) -> Self {
        let diagnostics = controller_ids
            .iter()
            .map(|id| (*id, Arc::new(RwLock::new(Diagnostics::new(id)))))
            .collect();
        Self {
            diagnostics: Arc::new(diagnostics),
            metrics: Arc::new(Metrics::new(controller_ids)),
        }
    }

    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self, id: ControllerId) -> Option<Diagnostics> {
        match self.diagnostics.get(id) {
            Some(d) => Some(d.read().await.clone()),
            None => None,
        }
    }

    pub fn to_context(
        &self,
        client: Client,
        config: Arc<OperatorConfig>,
        feature_flags: FeatureFlags,
    ) -> Context {
        Context::new(
            client,
            config,
            feature_flags,
            self.metrics.clone(),
            self.diagnostics.clone(),
        )
    }
}

/// Runs every reconciler concurrently under the current `tokio` runtime
///. Each future
/// runs until cancellation; the join completes only on shutdown.
pub async fn run(state: State, client: Client, config: Arc<OperatorConfig>) {
    let feature_flags = FeatureFlags::from_env();
    let ctx = Arc::new(state.to_context(client.clone(), config, feature_flags));

    futures::future::join_all(vec![
        Box::pin(crate::gitrepo::controller::run(ctx.clone()))
            as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
        Box::pin(crate::bundle::controller::run(ctx.clone())),
        Box::pin(crate::cluster::controller::run(ctx.clone())),
        Box::pin(crate::clustergroup::controller::run(ctx.clone())),
        Box::pin(crate::registration::controller::run(ctx.clone())),
        Box::pin(crate::content_gc::run(ctx.clone())),
    ])
    .await;
}

/// Shared mocked-client harness for reconciler tests (an `ApiServerVerifier`
/// pattern): every reconciler module builds its own request/response
/// scenarios against the same `Context` shape, so the harness for
/// constructing one lives centrally.
#[cfg(test)]
pub(crate) mod test_support {
    use super::Context;
    use crate::config::{OperatorConfig, OperatorConfigData};
    use crate::featureflags::FeatureFlags;
    use crate::metrics::Metrics;

    use std::sync::Arc;

    use http::{Request, Response};
    use kube::{client::Body, Client};

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    pub fn test_context() -> (Arc<Context>, ApiServerHandle) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let config = Arc::new(OperatorConfig::static_value(OperatorConfigData::default()));
        let metrics = Arc::new(Metrics::new(super::ALL_CONTROLLERS));
        let diagnostics = Arc::new(std::collections::HashMap::new());
        let ctx = Context::new(client, config, FeatureFlags::default(), metrics, diagnostics);
        (Arc::new(ctx), handle)
    }
}
