//! Data model shared by the engine, hydrator, rollback manager, and factory (§3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::Error;
use crate::graph::{DependencyGraph, ResourceId};
use crate::value::Value;

/// A manifest in the graph template: `apiVersion`/`kind`/`metadata`/`spec` data plus the
/// reference sites discovered by walking it once at graph-build time (§3.1 -- the manifest
/// stays pure `serde_json::Value`, references live in a side table keyed by JSON pointer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub manifest: Json,
    #[serde(skip)]
    pub references: BTreeMap<String, Value>,
}

impl Resource {
    pub fn new(id: impl Into<ResourceId>, manifest: Json) -> Self {
        let mut resource = Self {
            id: id.into(),
            manifest,
            references: BTreeMap::new(),
        };
        resource.discover_references();
        resource
    }

    /// Walks the manifest once, recording every string that parses as a [`Value::SchemaRef`]
    /// or [`Value::Expr`] at its JSON pointer, so later stages can tell "has a live reference"
    /// from "resolved literal" without re-parsing strings.
    fn discover_references(&mut self) {
        let mut refs = BTreeMap::new();
        walk_references(&self.manifest, String::new(), &mut refs);
        self.references = refs;
    }

    pub fn api_version(&self) -> Option<&str> {
        self.manifest.get("apiVersion").and_then(Json::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.manifest.get("kind").and_then(Json::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.manifest
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Json::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.manifest
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Json::as_str)
    }
}

fn walk_references(value: &Json, pointer: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Json::String(s) => {
            let parsed = Value::parse(s);
            if matches!(parsed, Value::SchemaRef { .. } | Value::Expr { .. }) {
                out.insert(pointer, parsed);
            }
        }
        Json::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk_references(item, format!("{pointer}/{i}"), out);
            }
        }
        Json::Object(map) => {
            for (k, v) in map {
                walk_references(v, format!("{pointer}/{k}"), out);
            }
        }
        _ => {}
    }
}

/// A Resource Graph template: ordered mapping from local key to [`Resource`], plus the
/// parallel evaluator side-table (§3.1) and any declared explicit dependency edges.
#[derive(Clone, Default)]
pub struct ResourceGraph {
    pub name: String,
    pub resources: Vec<Resource>,
    pub explicit_dependencies: BTreeMap<ResourceId, Vec<ResourceId>>,
    pub evaluators: BTreeMap<ResourceId, std::sync::Arc<dyn crate::readiness::ReadyEvaluator>>,
}

impl std::fmt::Debug for ResourceGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGraph")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .field("explicit_dependencies", &self.explicit_dependencies)
            .field("evaluators", &self.evaluators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
            explicit_dependencies: BTreeMap::new(),
            evaluators: BTreeMap::new(),
        }
    }

    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    pub fn depends_on(&mut self, resource: impl Into<ResourceId>, dependency: impl Into<ResourceId>) {
        self.explicit_dependencies
            .entry(resource.into())
            .or_default()
            .push(dependency.into());
    }
}

/// A Resource Graph after resolution against a concrete spec (§3): every reference is now a
/// value, and resources carry instance-scoped ids `{instanceName}-resource-{index}-{kind|id}`.
#[derive(Clone)]
pub struct ResourceGraphInstance {
    pub instance_name: String,
    pub resources: Vec<Resource>,
    pub dependency_graph: DependencyGraph,
    pub evaluators: BTreeMap<ResourceId, std::sync::Arc<dyn crate::readiness::ReadyEvaluator>>,
}

impl std::fmt::Debug for ResourceGraphInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGraphInstance")
            .field("instance_name", &self.instance_name)
            .field("resources", &self.resources)
            .field("dependency_graph", &self.dependency_graph)
            .field("evaluators", &self.evaluators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResourceGraphInstance {
    /// Instance-scoped id per §3: `{instanceName}-resource-{index}-{resourceKind|id}`.
    pub fn scoped_id(instance_name: &str, index: usize, resource: &Resource) -> ResourceId {
        let suffix = resource.kind().unwrap_or(&resource.id);
        format!("{instance_name}-resource-{index}-{suffix}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployedResourceStatus {
    Deployed,
    Ready,
    Failed,
}

/// A live object tracked for one deploy (§3): transitions `deployed -> ready` on readiness,
/// `deployed -> failed` on timeout or fatal API error.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployedResource {
    pub id: ResourceId,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub manifest: Json,
    pub status: DeployedResourceStatus,
    pub deployed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl DeployedResource {
    pub fn mark_ready(&mut self) {
        self.status = DeployedResourceStatus::Ready;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, cause: impl Into<String>) {
        self.status = DeployedResourceStatus::Failed;
        self.last_error = Some(cause.into());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Success,
    Partial,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentError {
    pub resource_id: Option<ResourceId>,
    pub phase: Option<crate::error::Phase>,
    pub message: String,
}

impl From<&Error> for DeploymentError {
    fn from(err: &Error) -> Self {
        Self {
            resource_id: None,
            phase: err.phase(),
            message: err.to_string(),
        }
    }
}

/// Per-deploy-call state (§3): retained by the engine for rollback and health queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentState {
    pub deployment_id: String,
    pub resources: Vec<DeployedResource>,
    #[serde(skip)]
    pub dependency_graph: DependencyGraph,
    pub started_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub errors: Vec<DeploymentError>,
}

impl DeploymentState {
    pub fn new(deployment_id: impl Into<String>, dependency_graph: DependencyGraph) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            resources: Vec::new(),
            dependency_graph,
            started_at: Utc::now(),
            status: DeploymentStatus::Running,
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, resource_id: Option<ResourceId>, err: &Error) {
        self.errors.push(DeploymentError {
            resource_id,
            phase: err.phase(),
            message: err.to_string(),
        });
    }

    /// Recomputes `status` from the current resource set. `deployed` counts as a terminal
    /// success alongside `ready` -- it is what a resource that was never polled (`dry_run` or
    /// `wait_for_ready=false`) settles at, not an in-progress state, since `recompute_status`
    /// only ever runs once a deploy call has fully returned. An apply-time error recorded in
    /// `errors` blocks `success` even when every resource that did get applied shows no
    /// `failed` entry, since an apply failure never gets a tracked `DeployedResource` at all.
    pub fn recompute_status(&mut self) {
        let total = self.resources.len();
        let succeeded = self
            .resources
            .iter()
            .filter(|r| matches!(r.status, DeployedResourceStatus::Ready | DeployedResourceStatus::Deployed))
            .count();
        let failed = self
            .resources
            .iter()
            .filter(|r| r.status == DeployedResourceStatus::Failed)
            .count();
        let has_errors = !self.errors.is_empty();
        self.status = if !has_errors && failed == 0 && succeeded == total && total > 0 {
            DeploymentStatus::Success
        } else if succeeded > 0 && (failed > 0 || has_errors) {
            DeploymentStatus::Partial
        } else if failed > 0 || has_errors {
            DeploymentStatus::Failed
        } else {
            DeploymentStatus::Running
        };
    }
}
