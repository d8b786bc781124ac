//! Kro Orchestrator (C9): deploys a `ResourceGraphDefinition`, awaits CRD establishment,
//! deploys the per-instance custom resource, and awaits Kro-specific readiness (§4.9).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use kube::Client;
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::engine::{pluralize, DeployOptions, DirectEngine, Mode};
use crate::error::Error;
use crate::factory::{Handle, HandleStatus};
use crate::graph::DependencyGraph;
use crate::hydrator::StatusHydrator;
use crate::readiness::poller::{ProgressCallback, ProgressEvent};
use crate::resource::{DeployedResource, DeployedResourceStatus, DeploymentState, DeploymentStatus, Resource};
use crate::value::{self, Value};

const RGD_TIMEOUT: Duration = Duration::from_secs(60);
const INSTANCE_TIMEOUT: Duration = Duration::from_secs(600);

/// A named pre-RGD closure (§4.9): a side-effecting thunk run before any RGD is created.
pub type PreRgdClosure = Arc<dyn Fn(&Client) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// A Kro-mode graph: the RGD template, the per-instance custom resource template, and any
/// pre-RGD closures declared against it.
#[derive(Clone)]
pub struct KroGraph {
    pub schema_kind: String,
    pub user_version: String,
    pub rgd_manifest: Json,
    pub instance_template: Json,
    pub pre_rgd_closures: BTreeMap<String, PreRgdClosure>,
    /// Status fields declared as static (literal or spec-only expression), evaluated locally.
    pub static_status_fields: BTreeMap<String, Value>,
}

impl KroGraph {
    /// CRD name Kro derives for the schema kind: `{pluralKind}.kro.run`.
    pub fn crd_name(&self) -> String {
        format!("{}.kro.run", pluralize(&self.schema_kind))
    }

    /// Validates every pre-RGD closure's associated references resolve against the spec
    /// alone (strict mode): a reference that would require cluster state is rejected rather
    /// than silently passed through.
    pub fn validate_pre_rgd_references(&self, spec: &Json) -> Result<(), Error> {
        for (name, field_ref) in &self.static_status_fields {
            if let Value::SchemaRef { path } = field_ref {
                if value_path_missing(path, spec) {
                    return Err(Error::ResolveError { path: format!("{name}: {path}") });
                }
            }
        }
        Ok(())
    }
}

fn value_path_missing(path: &str, spec: &Json) -> bool {
    let mut segments = path.split('.');
    if segments.next() != Some("spec") {
        return true;
    }
    let mut current = spec;
    for segment in segments {
        match current.as_object().and_then(|o| o.get(segment)) {
            Some(next) => current = next,
            None => return true,
        }
    }
    false
}

pub struct KroOrchestrator {
    client: Client,
    engine: DirectEngine,
    hydrator: Arc<StatusHydrator>,
}

impl KroOrchestrator {
    pub fn new(client: Client) -> Self {
        Self {
            engine: DirectEngine::new(client.clone(), Mode::Kro),
            hydrator: Arc::new(StatusHydrator::new(client.clone())),
            client,
        }
    }

    /// Runs the full Kro deploy sequence (§4.9 steps 1-5).
    #[instrument(skip(self, graph, spec, options, cancel, on_progress), fields(schema_kind = %graph.schema_kind))]
    pub async fn deploy(
        &self,
        graph: &KroGraph,
        instance_name: &str,
        spec: &Json,
        options: &DeployOptions,
        cancel: &CancellationToken,
        on_progress: &ProgressCallback<'_>,
    ) -> Result<Handle, Error> {
        graph.validate_pre_rgd_references(spec)?;

        for closure in graph.pre_rgd_closures.values() {
            closure(&self.client).await?;
        }

        let rgd_resource = Resource::new("rgd", graph.rgd_manifest.clone());
        let mut rgd_options = options.clone();
        rgd_options.poll.timeout = RGD_TIMEOUT;
        rgd_options.wait_for_ready = true;
        self.engine.deploy_resource(&rgd_resource, &rgd_options, cancel, on_progress).await?;

        let crd_name = graph.crd_name();
        self.engine.wait_for_crd_ready(&crd_name, RGD_TIMEOUT, cancel).await?;

        let mut instance_manifest = graph.instance_template.clone();
        if let Some(obj) = instance_manifest.as_object_mut() {
            obj.insert("spec".to_owned(), spec.clone());
            let metadata = obj.entry("metadata").or_insert_with(|| json!({}));
            if let Some(meta_obj) = metadata.as_object_mut() {
                meta_obj.insert("name".to_owned(), json!(instance_name));
            }
        }

        let instance_resource = Resource::new(instance_name, instance_manifest);
        let mut instance_options = options.clone();
        instance_options.wait_for_ready = false;
        instance_options.poll.timeout = INSTANCE_TIMEOUT;
        let mut deployed = self.engine.deploy_resource(&instance_resource, &instance_options, cancel, on_progress).await?;

        self.await_kro_readiness(graph, &deployed, cancel, on_progress).await?;
        deployed.mark_ready();

        let mut status_fields = self.static_status(graph, spec);
        if options.hydrate_status {
            let namespace = deployed.namespace.clone().unwrap_or_else(|| options.namespace.clone());
            match self.hydrator.hydrate(&instance_resource, &namespace, None).await {
                Ok(result) if result.success => {
                    if let Some(map) = result.status.as_object() {
                        for (k, v) in map {
                            status_fields.insert(k.clone(), v.clone());
                        }
                    }
                }
                Ok(result) => {
                    tracing::warn!(instance = %instance_name, error = ?result.error, "status hydration found no instance object");
                }
                Err(err) => {
                    tracing::warn!(instance = %instance_name, error = %err, "status hydration failed");
                }
            }
        }

        let deployment_id = format!("{}-{}", instance_name, crate::telemetry::get_trace_id());
        let mut deployment = DeploymentState::new(deployment_id, DependencyGraph::new());
        deployment.resources.push(deployed);
        deployment.recompute_status();

        on_progress(ProgressEvent::DeploymentComplete {
            message: format!("deploy of {instance_name} finished with status {:?}", deployment.status),
            timestamp: chrono::Utc::now(),
        });

        let status = match deployment.status {
            DeploymentStatus::Success => HandleStatus::Ready,
            DeploymentStatus::Partial => HandleStatus::Degraded,
            DeploymentStatus::Failed => HandleStatus::Failed,
            DeploymentStatus::Running => {
                if deployment.resources.iter().any(|r| r.status == DeployedResourceStatus::Failed) {
                    HandleStatus::Failed
                } else {
                    HandleStatus::Deployed
                }
            }
        };

        Ok(Handle {
            instance_name: instance_name.to_owned(),
            graph_name: graph.schema_kind.clone(),
            status,
            deployment,
            status_fields,
        })
    }

    /// Kro-specific readiness (§4.9 step 4): ready iff `state == ACTIVE` and
    /// `InstanceSynced == True`, and either the RGD declares no custom status fields or the
    /// instance status has at least one field beyond `{state, conditions}`.
    async fn await_kro_readiness(
        &self,
        graph: &KroGraph,
        deployed: &DeployedResource,
        cancel: &CancellationToken,
        on_progress: &ProgressCallback<'_>,
    ) -> Result<(), Error> {
        let resource = Resource::new(deployed.id.clone(), deployed.manifest.clone());
        struct KroReady {
            has_custom_status_fields: bool,
        }
        impl crate::readiness::ReadyEvaluator for KroReady {
            fn ready(&self, obj: &kube::core::DynamicObject) -> crate::readiness::ReadyVerdict {
                let status = obj.data.get("status");
                let state = status.and_then(|s| s.get("state")).and_then(Json::as_str).unwrap_or("");
                if state.eq_ignore_ascii_case("failed") {
                    let message = status
                        .and_then(|s| s.get("conditions"))
                        .and_then(Json::as_array)
                        .and_then(|conds| conds.iter().find(|c| c.get("status").and_then(Json::as_str) == Some("False")))
                        .and_then(|c| c.get("message"))
                        .and_then(Json::as_str)
                        .unwrap_or("kro reported state=FAILED")
                        .to_owned();
                    return crate::readiness::ReadyVerdict::not_ready(message);
                }
                let synced = status
                    .and_then(|s| s.get("conditions"))
                    .and_then(Json::as_array)
                    .is_some_and(|conds| {
                        conds.iter().any(|c| {
                            c.get("type").and_then(Json::as_str) == Some("InstanceSynced")
                                && c.get("status").and_then(Json::as_str) == Some("True")
                        })
                    });
                let extra_fields = status
                    .and_then(Json::as_object)
                    .is_some_and(|m| m.keys().any(|k| k != "state" && k != "conditions"));
                if state.eq_ignore_ascii_case("active") && synced && (!self.has_custom_status_fields || extra_fields) {
                    crate::readiness::ReadyVerdict::ready()
                } else {
                    crate::readiness::ReadyVerdict::not_ready("waiting for state=ACTIVE and InstanceSynced=True")
                }
            }
        }

        let mut registry = crate::readiness::EvaluatorRegistry::new();
        registry.register(
            resource.id.clone(),
            Arc::new(KroReady {
                has_custom_status_fields: !graph.static_status_fields.is_empty(),
            }),
        );

        let ar = crate::engine::api_resource_for(&resource)?;
        let api: kube::Api<kube::core::DynamicObject> = kube::Api::namespaced_with(self.client.clone(), deployed.namespace.as_deref().unwrap_or("default"), &ar);
        crate::readiness::poller::poll_ready(
            &api,
            &deployed.name,
            &resource.id,
            &resource.kind().unwrap_or_default().to_owned(),
            deployed.namespace.as_deref(),
            &registry,
            crate::readiness::poller::PollConfig {
                timeout: INSTANCE_TIMEOUT,
                ..Default::default()
            },
            cancel,
            on_progress,
        )
        .await
        .map_err(|err| match err {
            Error::ReadinessTimeout { resource, elapsed } => Error::KroReconcileFailure {
                resource,
                message: format!("instance did not reach ACTIVE/InstanceSynced within {elapsed:?}"),
            },
            other => other,
        })?;
        Ok(())
    }

    /// Evaluates the statically-declared status fields (§4.9) against the spec immediately
    /// on deploy; dynamic fields obtained via hydration win on collision with these.
    pub fn static_status(&self, graph: &KroGraph, spec: &Json) -> BTreeMap<String, Json> {
        graph
            .static_status_fields
            .iter()
            .map(|(field, v)| (field.clone(), value::resolve_value(v, spec)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> KroGraph {
        KroGraph {
            schema_kind: "WebService".to_owned(),
            user_version: "v1alpha1".to_owned(),
            rgd_manifest: json!({"apiVersion": "kro.run/v1alpha1", "kind": "ResourceGraphDefinition"}),
            instance_template: json!({"apiVersion": "kro.run/v1alpha1", "kind": "WebService", "metadata": {}}),
            pre_rgd_closures: BTreeMap::new(),
            static_status_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn crd_name_pluralizes_schema_kind() {
        assert_eq!(graph().crd_name(), "webservices.kro.run");
    }

    #[test]
    fn pre_rgd_validation_passes_for_resolvable_spec_paths() {
        let mut g = graph();
        g.static_status_fields.insert("url".to_owned(), Value::SchemaRef { path: "spec.host".to_owned() });
        let spec = json!({"host": "example.com"});
        assert!(g.validate_pre_rgd_references(&spec).is_ok());
    }

    #[test]
    fn pre_rgd_validation_rejects_missing_spec_paths() {
        let mut g = graph();
        g.static_status_fields.insert("url".to_owned(), Value::SchemaRef { path: "spec.missing".to_owned() });
        let spec = json!({"host": "example.com"});
        assert!(g.validate_pre_rgd_references(&spec).is_err());
    }
}
