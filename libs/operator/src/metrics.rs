//! Prometheus metrics shared across every reconciler: a `ReconcileMetrics`
//! family keyed by a `controller` label so one registry can serve all
//! seven reconcilers.

use std::collections::HashMap;
use std::sync::Arc;

use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, exemplar::HistogramWithExemplars, family::Family};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::controller::ControllerId;
use crate::error::Error;

/// Per-process metrics registry plus one `ReconcileMetrics` handle per
/// controller id (`gitrepo`, `bundle`, `cluster`, `clustergroup`,
/// `registration`, ...).
pub struct Metrics {
    pub registry: Registry,
    reconcilers: HashMap<ControllerId, Arc<ReconcileMetrics>>,
}

impl Metrics {
    /// Builds a registry with one set of reconcile metrics registered per
    /// controller id under the `fleet_reconcile` prefix, plus a readiness
    /// gauge flipped once every controller has started its watch loop.
    pub fn new(controller_ids: &[ControllerId]) -> Self {
        let mut registry = Registry::with_prefix("fleet_reconcile");
        let mut reconcilers = HashMap::new();
        for id in controller_ids {
            let sub_registry = registry.sub_registry_with_label(
                (std::borrow::Cow::Borrowed("controller"), std::borrow::Cow::Borrowed(*id)),
            );
            let metrics = ReconcileMetrics::default().register(sub_registry);
            reconcilers.insert(*id, Arc::new(metrics));
        }
        Self {
            registry,
            reconcilers,
        }
    }

    /// Metrics handle for one controller id. Panics if `id` was not passed to
    /// `Metrics::new`; every controller registered at startup must have a
    /// corresponding metrics handle, so this would be a programming error.
    pub fn for_controller(&self, id: ControllerId) -> Arc<ReconcileMetrics> {
        self.reconcilers
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no metrics registered for controller {id}"))
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<(), Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<(), Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10., 30., 60.].into_iter()),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit("duration", "reconcile duration", Unit::Seconds, self.duration.clone());
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure<K: ResourceExt>(&self, obj: &K, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.get_or_create(&()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Relies on `Drop` to calculate duration and register the observation in
/// the histogram, so every early `return`/`?` in a reconcile still records.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
