//! Readiness evaluation (C3): a pure predicate over a live cluster object.

pub mod poller;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::core::DynamicObject;
use serde_json::Value as Json;

/// Outcome of a single readiness check.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ReadyVerdict {
    pub ready: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
    /// Structured diagnostics a custom [`ReadyEvaluator`] may attach (§4.3); the kind-based
    /// default table never sets this.
    pub details: Option<Json>,
}

impl ReadyVerdict {
    pub fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
            message: None,
            details: None,
        }
    }

    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
            message: None,
            details: None,
        }
    }

    /// Attaches structured diagnostics to this verdict.
    pub fn with_details(mut self, details: Json) -> Self {
        self.details = Some(details);
        self
    }
}

/// A resource-attached custom evaluator (§4.3 point 1). Always wins over the generic table
/// when present -- there is no flag to prefer the table instead.
pub trait ReadyEvaluator: Send + Sync {
    fn ready(&self, obj: &DynamicObject) -> ReadyVerdict;
}

/// Registry of resource id -> custom evaluator, consulted before the kind-based default.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: BTreeMap<String, Arc<dyn ReadyEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(evaluators: BTreeMap<String, Arc<dyn ReadyEvaluator>>) -> Self {
        Self { evaluators }
    }

    pub fn register(&mut self, resource_id: impl Into<String>, evaluator: Arc<dyn ReadyEvaluator>) {
        self.evaluators.insert(resource_id.into(), evaluator);
    }

    /// Resolves readiness for `resource_id`: the attached evaluator if one is registered,
    /// otherwise the kind-based default table.
    pub fn evaluate(&self, resource_id: &str, obj: &DynamicObject) -> ReadyVerdict {
        match self.evaluators.get(resource_id) {
            Some(evaluator) => evaluator.ready(obj),
            None => default_ready(obj),
        }
    }
}

fn default_replicas(spec: Option<&Json>) -> i64 {
    spec.and_then(|s| s.get("replicas"))
        .and_then(Json::as_i64)
        .unwrap_or(1)
}

fn conditions(obj: &DynamicObject) -> Vec<Condition> {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .cloned()
        .and_then(|c| serde_json::from_value::<Vec<Condition>>(c).ok())
        .unwrap_or_default()
}

fn condition_true(obj: &DynamicObject, condition_type: &str) -> bool {
    conditions(obj)
        .iter()
        .any(|c| c.type_ == condition_type && c.status == "True")
}

/// The kind-based default readiness table (§4.3 point 2), used only when no custom
/// evaluator is attached for a resource.
pub fn default_ready(obj: &DynamicObject) -> ReadyVerdict {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();
    let status = obj.data.get("status");
    let spec = obj.data.get("spec");

    match kind {
        "ConfigMap" | "Secret" | "CronJob" => ReadyVerdict::ready(),
        "Deployment" => {
            let wanted = default_replicas(spec);
            let ready_replicas = status.and_then(|s| s.get("readyReplicas")).and_then(Json::as_i64).unwrap_or(0);
            let available = status.and_then(|s| s.get("availableReplicas")).and_then(Json::as_i64).unwrap_or(0);
            let unavailable = status.and_then(|s| s.get("unavailableReplicas")).and_then(Json::as_i64).unwrap_or(0);
            if ready_replicas == wanted && available == wanted && unavailable == 0 {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready(format!(
                    "readyReplicas={ready_replicas} availableReplicas={available} unavailableReplicas={unavailable}, want {wanted}"
                ))
            }
        }
        "StatefulSet" | "ReplicaSet" => {
            let wanted = default_replicas(spec);
            let ready_replicas = status.and_then(|s| s.get("readyReplicas")).and_then(Json::as_i64).unwrap_or(0);
            if ready_replicas == wanted {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready(format!("readyReplicas={ready_replicas}, want {wanted}"))
            }
        }
        "DaemonSet" => {
            let number_ready = status.and_then(|s| s.get("numberReady")).and_then(Json::as_i64).unwrap_or(0);
            let desired = status.and_then(|s| s.get("desiredNumberScheduled")).and_then(Json::as_i64).unwrap_or(0);
            if desired > 0 && number_ready == desired {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready(format!("numberReady={number_ready}, desiredNumberScheduled={desired}"))
            }
        }
        "Service" => {
            let is_lb = spec.and_then(|s| s.get("type")).and_then(Json::as_str) == Some("LoadBalancer");
            if !is_lb {
                return ReadyVerdict::ready();
            }
            let ingress_nonempty = status
                .and_then(|s| s.get("loadBalancer"))
                .and_then(|lb| lb.get("ingress"))
                .and_then(Json::as_array)
                .is_some_and(|arr| !arr.is_empty());
            if ingress_nonempty {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("loadBalancer.ingress is empty")
            }
        }
        "Pod" => {
            let phase_running = status.and_then(|s| s.get("phase")).and_then(Json::as_str) == Some("Running");
            let all_ready = status
                .and_then(|s| s.get("containerStatuses"))
                .and_then(Json::as_array)
                .is_some_and(|arr| {
                    !arr.is_empty()
                        && arr.iter().all(|c| c.get("ready").and_then(Json::as_bool) == Some(true))
                });
            if phase_running && all_ready {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("pod not Running or not all containers ready")
            }
        }
        "Job" => {
            let completions = spec.and_then(|s| s.get("completions")).and_then(Json::as_i64).unwrap_or(1);
            let succeeded = status.and_then(|s| s.get("succeeded")).and_then(Json::as_i64).unwrap_or(0);
            if succeeded >= completions {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready(format!("succeeded={succeeded}, want >= {completions}"))
            }
        }
        "PersistentVolumeClaim" => {
            let bound = status.and_then(|s| s.get("phase")).and_then(Json::as_str) == Some("Bound");
            if bound {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("not Bound")
            }
        }
        "Ingress" => {
            let ingress_nonempty = status
                .and_then(|s| s.get("loadBalancer"))
                .and_then(|lb| lb.get("ingress"))
                .and_then(Json::as_array)
                .is_some_and(|arr| !arr.is_empty());
            if ingress_nonempty {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("loadBalancer.ingress is empty")
            }
        }
        "HorizontalPodAutoscaler" => {
            if status.and_then(|s| s.get("currentReplicas")).is_some() {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("status.currentReplicas not yet reported")
            }
        }
        "CustomResourceDefinition" => {
            if condition_true(obj, "Established") && condition_true(obj, "NamesAccepted") {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("waiting for Established and NamesAccepted conditions")
            }
        }
        _ => {
            if condition_true(obj, "Ready") || condition_true(obj, "Available") {
                ReadyVerdict::ready()
            } else if status.is_some() {
                ReadyVerdict::ready()
            } else {
                ReadyVerdict::not_ready("no status reported yet")
            }
        }
    }
}
