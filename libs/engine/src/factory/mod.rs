//! Factory (C8): per-graph instance registry, spec resolution, and dispatch to the Direct
//! engine or the Kro orchestrator (§4.8).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kube::Client;
use regex::Regex;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::engine::{DeployOptions, DirectEngine, Mode};
use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::hydrator::StatusHydrator;
use crate::readiness::poller::ProgressCallback;
use crate::resource::{DeployedResourceStatus, DeploymentState, DeploymentStatus, Resource, ResourceGraph, ResourceGraphInstance};
use crate::rollback::{RollbackManager, RollbackStatus};
use crate::value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleStatus {
    Deployed,
    Ready,
    Degraded,
    Failed,
    Destroyed,
}

/// A tracked instance: the engine's deployment state plus a handle the caller can poll.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Handle {
    pub instance_name: String,
    pub graph_name: String,
    pub status: HandleStatus,
    pub deployment: DeploymentState,
    /// Status surfaced to callers per §4.6/scenario 3. For a Direct deploy this is keyed by
    /// resource id, one hydration result per deployed resource; for a Kro deploy it is the
    /// single instance's static fields merged with its hydrated dynamic fields.
    pub status_fields: BTreeMap<String, Json>,
}

/// Converts a graph/spec-derived name into the Kubernetes object name shape required by §4.8:
/// lowercase kebab-case, `[a-z][a-z0-9-]*[a-z0-9]`, at most 253 characters.
pub fn to_kebab_case(raw: &str) -> Result<String, Error> {
    let lowered = raw.to_lowercase().replace(['_', ' ', '.'], "-");
    let pattern = Regex::new(r"^[a-z]([a-z0-9-]*[a-z0-9])?$").expect("static regex is valid");
    if lowered.len() > 253 || !pattern.is_match(&lowered) {
        return Err(Error::ValidationError {
            message: format!("'{raw}' does not convert to a valid kebab-case Kubernetes name"),
        });
    }
    Ok(lowered)
}

fn generate_instance_name(graph_name: &str, spec: &Json) -> Result<String, Error> {
    for field in ["name", "appName", "serviceName", "resourceName"] {
        if let Some(value) = spec.get(field).and_then(Json::as_str) {
            return to_kebab_case(value);
        }
    }
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    to_kebab_case(&format!("{graph_name}-{timestamp}"))
}

/// Collects every string leaf in `manifest` that contains one of `known_ids` as a substring
/// (§3: "resolved references that point to another resource in the same instance").
fn collect_referenced_ids(manifest: &Json, known_ids: &HashSet<String>, out: &mut HashSet<String>) {
    match manifest {
        Json::String(s) => out.extend(value::referenced_ids(s, known_ids)),
        Json::Array(items) => {
            for item in items {
                collect_referenced_ids(item, known_ids, out);
            }
        }
        Json::Object(map) => {
            for v in map.values() {
                collect_referenced_ids(v, known_ids, out);
            }
        }
        _ => {}
    }
}

/// Builds the per-instance dependency graph from both edge sources in §3: (i) references
/// resolved within a resource's own manifest that literally name another resource in the same
/// instance, inferred via [`value::referenced_ids`] over each resource's resolved k8s name, and
/// (ii) manifest-level owner/selector relationships the builder declares explicitly.
fn build_dependency_graph(graph: &ResourceGraph, resources: &[Resource], scoped_ids: &HashMap<String, String>) -> DependencyGraph {
    let mut dep_graph = DependencyGraph::new();

    let mut scoped_by_name: HashMap<String, String> = HashMap::new();
    for resource in resources {
        if let Some(name) = resource.name() {
            scoped_by_name.insert(name.to_owned(), resource.id.clone());
        }
    }
    let known_names: HashSet<String> = scoped_by_name.keys().cloned().collect();

    for (template, resolved) in graph.resources.iter().zip(resources.iter()) {
        let Some(scoped) = scoped_ids.get(&template.id) else { continue };
        dep_graph.add_node(scoped.clone());

        for dependency in graph.explicit_dependencies.get(&template.id).into_iter().flatten() {
            if let Some(dep_scoped) = scoped_ids.get(dependency) {
                dep_graph.add_dependency(scoped.clone(), dep_scoped.clone());
            }
        }

        let mut candidates = known_names.clone();
        if let Some(own_name) = resolved.name() {
            candidates.remove(own_name);
        }
        let mut inferred = HashSet::new();
        collect_referenced_ids(&resolved.manifest, &candidates, &mut inferred);
        for name in inferred {
            if let Some(dep_scoped) = scoped_by_name.get(&name) {
                if dep_scoped != scoped {
                    dep_graph.add_dependency(scoped.clone(), dep_scoped.clone());
                }
            }
        }
    }

    dep_graph
}

/// Resolves a template against a concrete spec into a Resource Graph Instance (C1 + C2).
pub fn resolve_instance(graph: &ResourceGraph, instance_name: &str, spec: &Json) -> Result<ResourceGraphInstance, Error> {
    let mut scoped_ids = HashMap::new();
    let mut resources = Vec::with_capacity(graph.resources.len());

    for (index, resource) in graph.resources.iter().enumerate() {
        let scoped_id = ResourceGraphInstance::scoped_id(instance_name, index, resource);
        scoped_ids.insert(resource.id.clone(), scoped_id.clone());
        let resolved_manifest = value::resolve_json(&resource.manifest, spec)?;
        resources.push(Resource::new(scoped_id, resolved_manifest));
    }

    let dependency_graph = build_dependency_graph(graph, &resources, &scoped_ids);

    let evaluators = graph
        .evaluators
        .iter()
        .filter_map(|(id, evaluator)| scoped_ids.get(id).map(|scoped| (scoped.clone(), Arc::clone(evaluator))))
        .collect();

    Ok(ResourceGraphInstance {
        instance_name: instance_name.to_owned(),
        resources,
        dependency_graph,
        evaluators,
    })
}

/// Direct-mode factory: resolves references locally (C1+C2) and deploys through the
/// in-process engine (§4.8).
pub struct DirectFactory {
    client: Client,
    engine: DirectEngine,
    hydrator: Arc<StatusHydrator>,
    registry: RwLock<HashMap<String, Handle>>,
}

impl DirectFactory {
    pub fn new(client: Client) -> Self {
        Self {
            engine: DirectEngine::new(client.clone(), Mode::Direct),
            hydrator: Arc::new(StatusHydrator::new(client.clone())),
            client,
            registry: RwLock::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, graph, spec, options, on_progress))]
    pub async fn deploy(
        &self,
        graph: &ResourceGraph,
        spec: &Json,
        options: &DeployOptions,
        on_progress: &ProgressCallback<'_>,
    ) -> Result<Handle, Error> {
        if !spec.is_object() {
            return Err(Error::ValidationError {
                message: "spec must be a JSON object".to_owned(),
            });
        }

        let instance_name = generate_instance_name(&graph.name, spec)?;
        if self.registry.read().await.contains_key(&instance_name) {
            return Err(Error::ValidationError {
                message: format!("instance '{instance_name}' already exists; re-entrant deploys of the same name are undefined"),
            });
        }

        let instance = resolve_instance(graph, &instance_name, spec)?;
        let cancel = CancellationToken::new();
        let deployment = self.engine.deploy(&instance, options, &cancel, on_progress).await;

        let mut status_fields = BTreeMap::new();
        if options.hydrate_status {
            let by_id: HashMap<&str, &Resource> = instance.resources.iter().map(|r| (r.id.as_str(), r)).collect();
            for deployed in &deployment.resources {
                if deployed.status == DeployedResourceStatus::Failed {
                    continue;
                }
                let Some(resource) = by_id.get(deployed.id.as_str()) else { continue };
                match self.hydrator.hydrate(resource, &deployed.namespace.clone().unwrap_or_default(), None).await {
                    Ok(result) if result.success => {
                        status_fields.insert(deployed.id.clone(), result.status);
                    }
                    Ok(result) => {
                        warn!(resource = %deployed.id, error = ?result.error, "status hydration found no object");
                    }
                    Err(err) => {
                        warn!(resource = %deployed.id, error = %err, "status hydration failed");
                    }
                }
            }
        }

        let status = status_from_deployment(&deployment);
        let handle = Handle {
            instance_name: instance_name.clone(),
            graph_name: graph.name.clone(),
            status,
            deployment,
            status_fields,
        };

        self.registry.write().await.insert(instance_name, handle.clone());
        Ok(handle)
    }

    pub async fn get_instances(&self) -> Vec<Handle> {
        self.registry.read().await.values().cloned().collect()
    }

    pub async fn delete_instance(&self, name: &str, namespace: &str) -> Result<crate::rollback::RollbackResult, Error> {
        let mut registry = self.registry.write().await;
        let Some(handle) = registry.get_mut(name) else {
            return Err(Error::ValidationError {
                message: format!("no tracked instance named '{name}'"),
            });
        };

        let pairs: Vec<_> = handle
            .deployment
            .resources
            .iter()
            .map(|deployed| {
                (
                    Resource::new(deployed.id.clone(), deployed.manifest.clone()),
                    deployed.clone(),
                )
            })
            .collect();

        let manager = RollbackManager::new(self.client.clone());
        let result = manager.rollback(&pairs, namespace, Some(&handle.deployment.dependency_graph)).await;
        if matches!(result.status, RollbackStatus::Success) {
            handle.status = HandleStatus::Destroyed;
        }
        Ok(result)
    }

    pub async fn rollback_all(&self, namespace: &str) -> Vec<(String, crate::rollback::RollbackResult)> {
        let names: Vec<String> = self.registry.read().await.keys().cloned().collect();
        let mut results = Vec::new();
        for name in names {
            if let Ok(result) = self.delete_instance(&name, namespace).await {
                results.push((name, result));
            }
        }
        results
    }

    /// Emits multi-document YAML for a resolved instance (out of the core per §1, kept as a
    /// thin `serde_yaml` implementation so the contract is not a dangling stub).
    pub fn to_yaml(&self, instance: &ResourceGraphInstance) -> Result<String, Error> {
        let mut docs = Vec::with_capacity(instance.resources.len());
        for resource in &instance.resources {
            let doc = serde_yaml::to_string(&resource.manifest).map_err(|e| Error::ValidationError {
                message: format!("failed to render resource {} as YAML: {e}", resource.id),
            })?;
            docs.push(doc);
        }
        Ok(docs.join("---\n"))
    }

    pub async fn get_status(&self, name: &str) -> Result<HandleStatus, Error> {
        self.registry
            .read()
            .await
            .get(name)
            .map(|h| h.status)
            .ok_or_else(|| Error::ValidationError {
                message: format!("no tracked instance named '{name}'"),
            })
    }
}

fn status_from_deployment(deployment: &DeploymentState) -> HandleStatus {
    match deployment.status {
        DeploymentStatus::Success => HandleStatus::Ready,
        DeploymentStatus::Partial => HandleStatus::Degraded,
        DeploymentStatus::Failed => HandleStatus::Failed,
        DeploymentStatus::Running => {
            let any_failed = deployment.resources.iter().any(|r| r.status == DeployedResourceStatus::Failed);
            if any_failed {
                HandleStatus::Failed
            } else {
                HandleStatus::Deployed
            }
        }
    }
}
