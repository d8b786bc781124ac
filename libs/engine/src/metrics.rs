use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, exemplar::HistogramWithExemplars, family::Family};
use prometheus_client::registry::{Registry, Unit};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub deploy: DeployMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("graphdeploy");
        let deploy = DeployMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            deploy,
        }
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

/// Deploy-scoped metrics (§2.1): counts and times `deploy`/`rollback` calls, and tracks
/// per-phase failures and readiness-poll attempts.
#[derive(Clone)]
pub struct DeployMetrics {
    pub deploys: Family<(), Counter>,
    pub rollbacks: Family<(), Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub poll_attempts: Family<PollLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for DeployMetrics {
    fn default() -> Self {
        Self {
            deploys: Family::<(), Counter>::default(),
            rollbacks: Family::<(), Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            poll_attempts: Family::<PollLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.5, 1., 5., 10., 30., 60., 120., 300.].into_iter()),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PollLabels {
    pub kind: String,
}

impl DeployMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit("deploy_duration", "time to complete a deploy", Unit::Seconds, self.duration.clone());
        r.register("deploy_failures", "deploys that recorded a fatal error", self.failures.clone());
        r.register("deploys", "deploy calls", self.deploys.clone());
        r.register("rollbacks", "rollback calls", self.rollbacks.clone());
        r.register("readiness_poll_attempts", "readiness poll attempts per kind", self.poll_attempts.clone());
        self
    }

    pub fn set_failure(&self, instance: &str, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: instance.to_owned(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn record_poll_attempt(&self, kind: &str) {
        self.poll_attempts.get_or_create(&PollLabels { kind: kind.to_owned() }).inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> DeployMeasurer {
        self.deploys.get_or_create(&()).inc();
        DeployMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Relies on `Drop` to calculate duration and register the observation in the histogram.
pub struct DeployMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for DeployMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
