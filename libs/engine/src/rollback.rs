//! Rollback Manager (C7): deletes tracked resources in reverse dependency order with
//! partial-failure accounting (§4.7). No readiness waiting on deletion.

use kube::api::{Api, DeleteParams};
use kube::core::DynamicObject;
use kube::Client;
use tracing::{instrument, warn};

use crate::engine::api_resource_for;
use crate::error::{is_transient_kube_error, Error, ResourceRef};
use crate::graph::{DependencyGraph, ResourceId};
use crate::resource::{DeployedResource, Resource};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct RollbackResult {
    pub status: RollbackStatus,
    pub rolled_back: Vec<ResourceId>,
    pub errors: Vec<String>,
}

pub struct RollbackManager {
    client: Client,
}

impl RollbackManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Deletes `resources` in reverse dependency order when `dependency_graph` is given,
    /// otherwise in reverse of the slice's own order. 404 counts as already rolled back.
    #[instrument(skip(self, resources, dependency_graph))]
    pub async fn rollback(
        &self,
        resources: &[(Resource, DeployedResource)],
        namespace: &str,
        dependency_graph: Option<&DependencyGraph>,
    ) -> RollbackResult {
        let order = match dependency_graph {
            Some(graph) => match graph.reverse_levels() {
                Ok(levels) => levels.into_iter().flatten().collect::<Vec<_>>(),
                Err(_) => resources.iter().rev().map(|(r, _)| r.id.clone()).collect(),
            },
            None => resources.iter().rev().map(|(r, _)| r.id.clone()).collect(),
        };

        let mut rolled_back = Vec::new();
        let mut errors = Vec::new();

        for id in order {
            let Some((resource, _deployed)) = resources.iter().find(|(r, _)| r.id == id) else {
                continue;
            };
            match self.delete_one(resource, namespace).await {
                Ok(()) => rolled_back.push(id),
                Err(err) => {
                    warn!(resource = %id, error = %err, "rollback delete failed");
                    errors.push(err.to_string());
                }
            }
        }

        let status = if errors.is_empty() {
            RollbackStatus::Success
        } else if rolled_back.is_empty() {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Partial
        };

        RollbackResult {
            status,
            rolled_back,
            errors,
        }
    }

    async fn delete_one(&self, resource: &Resource, namespace: &str) -> Result<(), Error> {
        let ar = api_resource_for(resource)?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let name = resource.name().ok_or_else(|| Error::DeleteError {
            resource: resource_ref(resource, namespace),
            cause: "manifest is missing metadata.name".to_owned(),
        })?;

        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(source) if is_transient_kube_error(&source) => Err(Error::DeleteError {
                resource: resource_ref(resource, namespace),
                cause: source.to_string(),
            }),
            Err(source) => Err(Error::DeleteError {
                resource: resource_ref(resource, namespace),
                cause: source.to_string(),
            }),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_success_when_no_errors() {
        let result = RollbackResult {
            status: RollbackStatus::Success,
            rolled_back: vec!["a".into()],
            errors: vec![],
        };
        assert_eq!(result.status, RollbackStatus::Success);
    }

    #[test]
    fn status_is_partial_when_some_rolled_back_and_some_errored() {
        let rolled_back = vec!["a".to_owned()];
        let errors = vec!["boom".to_owned()];
        let status = if errors.is_empty() {
            RollbackStatus::Success
        } else if rolled_back.is_empty() {
            RollbackStatus::Failed
        } else {
            RollbackStatus::Partial
        };
        assert_eq!(status, RollbackStatus::Partial);
    }
}
