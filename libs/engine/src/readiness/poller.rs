//! Readiness poller (C4): runs an evaluator against the API with exponential backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::Api;
use kube::core::DynamicObject;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{is_transient_kube_error, Error, ResourceRef};
use crate::readiness::{EvaluatorRegistry, ReadyVerdict};

/// Delay schedule defaults (§4.4).
#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub error_retry_delay: Duration,
    pub progress_interval: u32,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            error_retry_delay: Duration::from_secs(2),
            progress_interval: 5,
            timeout: Duration::from_secs(300),
        }
    }
}

impl PollConfig {
    /// `min(initialDelay * multiplier^(attempt-1), maxDelay)` (§4.4).
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Progress events emitted during a poll (§6), delivered best-effort and ordered per
/// resource id.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    #[serde(rename = "progress")]
    Progress {
        resource_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "resourceReady")]
    ResourceReady {
        resource_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "error")]
    Error {
        resource_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Emitted once, after a whole `deploy()` call finishes (§6) -- not tied to one resource.
    #[serde(rename = "deploymentComplete")]
    DeploymentComplete {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

pub type ProgressCallback<'a> = dyn Fn(ProgressEvent) + Send + Sync + 'a;

/// Polls `name` via `api` until `evaluator` reports ready or the configured timeout elapses.
/// Transient API errors (404, "not yet visible", 5xx/network) count as an attempt and are
/// retried after `error_retry_delay` rather than aborting the poll.
#[instrument(skip(api, evaluators, config, cancel, on_progress), fields(resource_id = %resource_id))]
pub async fn poll_ready(
    api: &Api<DynamicObject>,
    name: &str,
    resource_id: &str,
    kind: &str,
    namespace: Option<&str>,
    evaluators: &EvaluatorRegistry,
    config: PollConfig,
    cancel: &CancellationToken,
    on_progress: &ProgressCallback<'_>,
) -> Result<ReadyVerdict, Error> {
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::ReadinessTimeout {
                resource: resource_ref(kind, name, namespace, resource_id),
                elapsed: started.elapsed(),
            });
        }
        attempt += 1;

        if attempt == 1 || attempt % config.progress_interval == 0 {
            on_progress(ProgressEvent::Progress {
                resource_id: resource_id.to_owned(),
                message: format!("poll attempt {attempt} for {kind}/{name}"),
                timestamp: Utc::now(),
            });
        }

        let mut delay = config.delay_for_attempt(attempt);

        match api.get_opt(name).await {
            Ok(Some(obj)) => {
                let verdict = evaluators.evaluate(resource_id, &obj);
                if verdict.ready {
                    on_progress(ProgressEvent::ResourceReady {
                        resource_id: resource_id.to_owned(),
                        message: format!("{kind}/{name} is ready"),
                        timestamp: Utc::now(),
                    });
                    return Ok(verdict);
                }
            }
            Ok(None) => {
                // not yet visible: treated the same as a transient error, retry.
                delay = config.error_retry_delay;
            }
            Err(source) => {
                if !is_transient_kube_error(&source) {
                    return Err(Error::KubeError { source });
                }
                on_progress(ProgressEvent::Error {
                    resource_id: resource_id.to_owned(),
                    message: source.to_string(),
                    timestamp: Utc::now(),
                });
                delay = config.error_retry_delay;
            }
        }

        if started.elapsed() >= config.timeout {
            return Err(Error::ReadinessTimeout {
                resource: resource_ref(kind, name, namespace, resource_id),
                elapsed: started.elapsed(),
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

fn resource_ref(kind: &str, name: &str, namespace: Option<&str>, resource_id: &str) -> ResourceRef {
    ResourceRef {
        kind: kind.to_owned(),
        name: name.to_owned(),
        namespace: namespace.map(str::to_owned),
        resource_id: resource_id.to_owned(),
    }
}
