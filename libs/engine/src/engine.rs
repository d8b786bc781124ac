//! Direct Deployment Engine (C5): applies a resource graph instance level-by-level,
//! invoking the readiness poller per level and tracking Deployment State for rollback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{is_transient_kube_error, Error, ResourceRef};
use crate::graph::ResourceId;
use crate::readiness::poller::{poll_ready, PollConfig, ProgressCallback, ProgressEvent};
use crate::readiness::EvaluatorRegistry;
use crate::resource::{DeployedResource, DeployedResourceStatus, DeploymentState, DeploymentStatus, Resource, ResourceGraphInstance};
use crate::telemetry;

const FIELD_MANAGER: &str = "graphdeploy";

/// The engine's write-path mode (§4.5): in `Direct` mode references are expected already
/// resolved; in `Kro` mode, references are re-emitted as Kro CEL placeholders by the caller
/// before the manifest reaches this engine, so the engine itself only ever applies literal
/// JSON either way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Direct,
    Kro,
}

/// Per-resource apply retry policy (§6 configuration options: `retryPolicy`). Applies only to
/// the create/patch call itself; readiness polling has its own independent retry schedule
/// (`PollConfig`).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeployOptions {
    pub namespace: String,
    pub wait_for_ready: bool,
    pub dry_run: bool,
    pub poll: PollConfig,
    pub hydrate_status: bool,
    pub retry: RetryPolicy,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            wait_for_ready: true,
            dry_run: false,
            poll: PollConfig::default(),
            hydrate_status: true,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct DirectEngine {
    client: Client,
    mode: Mode,
}

impl DirectEngine {
    pub fn new(client: Client, mode: Mode) -> Self {
        Self { client, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Applies `instance` level-by-level (§4.5 steps 1-5). Stops scheduling new levels on the
    /// first fatal resource error and returns the accumulated state rather than rolling back.
    #[instrument(skip(self, instance, options, cancel, on_progress), fields(instance = %instance.instance_name))]
    pub async fn deploy(
        &self,
        instance: &ResourceGraphInstance,
        options: &DeployOptions,
        cancel: &CancellationToken,
        on_progress: &ProgressCallback<'_>,
    ) -> DeploymentState {
        let trace_id = telemetry::get_trace_id();
        info!(%trace_id, "deploying resource graph instance {}", instance.instance_name);

        let deployment_id = format!("{}-{}", instance.instance_name, trace_id);
        let mut state = DeploymentState::new(deployment_id, instance.dependency_graph.clone());

        let by_id: HashMap<ResourceId, &Resource> =
            instance.resources.iter().map(|r| (r.id.clone(), r)).collect();

        let levels = match instance.dependency_graph.topological_levels() {
            Ok(levels) => levels,
            Err(err) => {
                state.record_error(None, &err);
                state.status = DeploymentStatus::Failed;
                return state;
            }
        };

        let evaluators = Arc::new(EvaluatorRegistry::from_map(instance.evaluators.clone()));
        let mut index: HashMap<ResourceId, usize> = HashMap::new();
        let mut fatal = false;

        for level in levels {
            if fatal || cancel.is_cancelled() {
                break;
            }

            let mut applies = FuturesUnordered::new();
            for id in &level {
                let Some(resource) = by_id.get(id) else { continue };
                let client = self.client.clone();
                let namespace = options.namespace.clone();
                let dry_run = options.dry_run;
                let retry = options.retry;
                let resource = (*resource).clone();
                applies.push(async move {
                    let result = apply_resource(&client, &resource, &namespace, dry_run, retry).await;
                    (resource, result)
                });
            }

            while let Some((resource, result)) = applies.next().await {
                match result {
                    Ok(applied) => {
                        let deployed = DeployedResource {
                            id: resource.id.clone(),
                            kind: resource.kind().unwrap_or_default().to_owned(),
                            name: applied.metadata.name.clone().unwrap_or_default(),
                            namespace: applied.metadata.namespace.clone(),
                            manifest: resource.manifest.clone(),
                            status: DeployedResourceStatus::Deployed,
                            deployed_at: chrono::Utc::now(),
                            last_error: None,
                        };
                        index.insert(resource.id.clone(), state.resources.len());
                        state.resources.push(deployed);
                    }
                    Err(err) => {
                        warn!(resource = %resource.id, error = %err, "apply failed");
                        state.record_error(Some(resource.id.clone()), &err);
                        fatal = true;
                    }
                }
            }

            if fatal || options.dry_run || !options.wait_for_ready {
                continue;
            }

            let mut polls = FuturesUnordered::new();
            for id in &level {
                let Some(&idx) = index.get(id) else { continue };
                let deployed = &state.resources[idx];
                let Some(resource) = by_id.get(id) else { continue };
                let client = self.client.clone();
                let namespace = options.namespace.clone();
                let evaluators = Arc::clone(&evaluators);
                let config = options.poll;
                let id = id.clone();
                let kind = deployed.kind.clone();
                let name = deployed.name.clone();
                let resource = (*resource).clone();
                polls.push(async move {
                    let result = poll_one(&client, &resource, &namespace, &kind, &name, &id, &evaluators, config, cancel, on_progress).await;
                    (id, result)
                });
            }

            while let Some((id, result)) = polls.next().await {
                if let Some(&idx) = index.get(&id) {
                    match result {
                        Ok(_) => state.resources[idx].mark_ready(),
                        Err(err) => {
                            state.resources[idx].mark_failed(err.to_string());
                            state.record_error(Some(id), &err);
                            fatal = true;
                        }
                    }
                }
            }
        }

        state.recompute_status();
        on_progress(ProgressEvent::DeploymentComplete {
            message: format!("deploy of {} finished with status {:?}", instance.instance_name, state.status),
            timestamp: chrono::Utc::now(),
        });
        state
    }

    /// Single-resource apply+readiness, skipping graph ordering (§4.5) -- used by the Kro path.
    #[instrument(skip(self, resource, options, cancel, on_progress), fields(resource = %resource.id))]
    pub async fn deploy_resource(
        &self,
        resource: &Resource,
        options: &DeployOptions,
        cancel: &CancellationToken,
        on_progress: &ProgressCallback<'_>,
    ) -> Result<DeployedResource, Error> {
        let applied = apply_resource(&self.client, resource, &options.namespace, options.dry_run, options.retry).await?;
        let kind = resource.kind().unwrap_or_default().to_owned();
        let name = applied.metadata.name.clone().unwrap_or_default();
        let namespace = applied.metadata.namespace.clone();

        let mut deployed = DeployedResource {
            id: resource.id.clone(),
            kind: kind.clone(),
            name: name.clone(),
            namespace: namespace.clone(),
            manifest: resource.manifest.clone(),
            status: DeployedResourceStatus::Deployed,
            deployed_at: chrono::Utc::now(),
            last_error: None,
        };

        if options.dry_run || !options.wait_for_ready {
            return Ok(deployed);
        }

        let evaluators = EvaluatorRegistry::new();
        match poll_one(&self.client, resource, &options.namespace, &kind, &name, &resource.id, &evaluators, options.poll, cancel, on_progress).await {
            Ok(_) => {
                deployed.mark_ready();
                Ok(deployed)
            }
            Err(err) => {
                deployed.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Polls a cluster-scoped CRD for `Established`/`NamesAccepted` (§4.5, reused by C9).
    pub async fn wait_for_crd_ready(&self, crd_name: &str, timeout: Duration, cancel: &CancellationToken) -> Result<(), Error> {
        let ar = ApiResource {
            group: "apiextensions.k8s.io".to_owned(),
            version: "v1".to_owned(),
            api_version: "apiextensions.k8s.io/v1".to_owned(),
            kind: "CustomResourceDefinition".to_owned(),
            plural: "customresourcedefinitions".to_owned(),
        };
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let evaluators = EvaluatorRegistry::new();
        let config = PollConfig {
            timeout,
            ..PollConfig::default()
        };
        poll_ready(&api, crd_name, crd_name, "CustomResourceDefinition", None, &evaluators, config, cancel, &|_| {})
            .await
            .map(|_| ())
    }
}

async fn poll_one(
    client: &Client,
    resource: &Resource,
    namespace: &str,
    kind: &str,
    name: &str,
    resource_id: &str,
    evaluators: &EvaluatorRegistry,
    config: PollConfig,
    cancel: &CancellationToken,
    on_progress: &ProgressCallback<'_>,
) -> Result<crate::readiness::ReadyVerdict, Error> {
    let ar = api_resource_for(resource)?;
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    poll_ready(&api, name, resource_id, kind, Some(namespace), evaluators, config, cancel, on_progress).await
}

/// Applies `resource` once, returning the raw `kube::Error` on failure so the caller can tell
/// a transient failure (worth retrying) from a fatal one.
async fn try_apply_once(api: &Api<DynamicObject>, name: &str, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, kube::Error> {
    if dry_run {
        let pp = PatchParams::apply(FIELD_MANAGER).dry_run();
        return api.patch(name, &pp, &Patch::Apply(obj)).await;
    }

    match api.create(&PostParams::default(), obj).await {
        Ok(created) => Ok(created),
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            let pp = PatchParams::apply(FIELD_MANAGER).force();
            api.patch(name, &pp, &Patch::Apply(obj)).await
        }
        Err(source) => Err(source),
    }
}

/// Applies `resource`, retrying transient failures (404/5xx/transport, per
/// [`is_transient_kube_error`]) up to `retry.max_attempts` times with `retry.backoff` between
/// attempts. A fatal (non-transient) error or the last attempt returns `Error::ApplyError`.
async fn apply_resource(client: &Client, resource: &Resource, namespace: &str, dry_run: bool, retry: RetryPolicy) -> Result<DynamicObject, Error> {
    let ar = api_resource_for(resource)?;
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);

    let mut obj: DynamicObject = serde_json::from_value(resource.manifest.clone()).map_err(|e| Error::ApplyError {
        resource: resource_ref(resource, namespace),
        cause: e.to_string(),
    })?;
    obj.metadata.namespace = Some(namespace.to_owned());
    let name = obj.metadata.name.clone().ok_or_else(|| Error::ApplyError {
        resource: resource_ref(resource, namespace),
        cause: "manifest is missing metadata.name".to_owned(),
    })?;

    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_apply_once(&api, &name, &obj, dry_run).await {
            Ok(applied) => return Ok(applied),
            Err(source) if is_transient_kube_error(&source) && attempt < max_attempts => {
                warn!(resource = %resource.id, attempt, error = %source, "transient apply error, retrying");
                tokio::time::sleep(retry.backoff).await;
            }
            Err(source) => {
                return Err(Error::ApplyError {
                    resource: resource_ref(resource, namespace),
                    cause: source.to_string(),
                });
            }
        }
    }
}

fn resource_ref(resource: &Resource, namespace: &str) -> ResourceRef {
    ResourceRef {
        kind: resource.kind().unwrap_or_default().to_owned(),
        name: resource.name().unwrap_or_default().to_owned(),
        namespace: Some(namespace.to_owned()),
        resource_id: resource.id.clone(),
    }
}

/// Builds an erased `ApiResource` for a manifest's `apiVersion`/`kind`, grounded on the
/// `agentsphere-platform` deployer's `api_resource_from_yaml` + `kind_to_plural` fallback.
pub(crate) fn api_resource_for(resource: &Resource) -> Result<ApiResource, Error> {
    let api_version = resource.api_version().ok_or_else(|| Error::ValidationError {
        message: format!("resource {} is missing apiVersion", resource.id),
    })?;
    let kind = resource.kind().ok_or_else(|| Error::ValidationError {
        message: format!("resource {} is missing kind", resource.id),
    })?;
    let (group, version) = parse_api_version(api_version);
    let plural = pluralize(kind);
    Ok(ApiResource {
        group,
        version,
        api_version: api_version.to_owned(),
        kind: kind.to_owned(),
        plural,
    })
}

pub(crate) fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_owned(), version.to_owned()),
        None => (String::new(), api_version.to_owned()),
    }
}

/// Kind -> plural per standard English pluralization rules (§4.9), shared verbatim by the
/// Kro orchestrator's CRD-name derivation so `kindFromPlural . pluralFromKind` round-trips.
pub(crate) fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some(stem) = lower.strip_suffix("fe") {
        return format!("{stem}ves");
    }
    if let Some(stem) = lower.strip_suffix('f') {
        return format!("{stem}ves");
    }
    if lower.len() > 1 && lower.ends_with('y') {
        let prev = lower.as_bytes()[lower.len() - 2] as char;
        if !"aeiou".contains(prev) {
            return format!("{}ies", &lower[..lower.len() - 1]);
        }
    }
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with('z') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('o') {
        return format!("{lower}es");
    }
    format!("{lower}s")
}
