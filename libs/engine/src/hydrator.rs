//! Status Hydrator (C6): reads live status back into tracked Deployed Resources, with a
//! short-lived in-memory cache keyed by `apiVersion:kind:namespace:name` (§4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use kube::core::DynamicObject;
use kube::Client;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::instrument;

use crate::engine::api_resource_for;
use crate::resource::Resource;

const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HydrationResult {
    pub success: bool,
    pub fields: Vec<String>,
    pub error: Option<String>,
    /// The live `status` object itself (or `snapshot`, if one was supplied), so callers can
    /// copy it into a typed handle without re-reading the object (§4.6).
    pub status: Json,
}

impl HydrationResult {
    fn not_found() -> Self {
        Self {
            success: false,
            fields: Vec::new(),
            error: Some("NotFound".to_owned()),
            status: Json::Null,
        }
    }
}

struct CacheEntry {
    fetched_at: Instant,
    status: Json,
}

/// Process-wide cache of `apiVersion:kind:namespace:name` -> last-seen status; entries are
/// immutable once written and expire purely by TTL (no invalidation on write elsewhere).
pub struct StatusHydrator {
    client: Client,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl StatusHydrator {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            ttl: DEFAULT_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(client: Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Reads the live object's `status` (or reuses `snapshot` if given, to avoid a second
    /// read) and returns the keys found there. Never fails on individual field problems; it
    /// best-efforts and reports `success=false` only when the object itself is missing.
    #[instrument(skip(self, resource, snapshot), fields(resource = %resource.id))]
    pub async fn hydrate(&self, resource: &Resource, namespace: &str, snapshot: Option<Json>) -> Result<HydrationResult, crate::error::Error> {
        let name = match resource.name() {
            Some(n) => n.to_owned(),
            None => return Ok(HydrationResult::not_found()),
        };
        let kind = resource.kind().unwrap_or_default();
        let cache_key = format!("{}:{}:{}:{}", resource.api_version().unwrap_or_default(), kind, namespace, name);

        let status = if let Some(status) = snapshot {
            status
        } else if let Some(cached) = self.cached(&cache_key).await {
            cached
        } else {
            let ar = api_resource_for(resource)?;
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
            match api.get_opt(&name).await? {
                Some(obj) => {
                    let status = obj.data.get("status").cloned().unwrap_or(Json::Null);
                    self.cache.write().await.insert(
                        cache_key,
                        CacheEntry {
                            fetched_at: Instant::now(),
                            status: status.clone(),
                        },
                    );
                    status
                }
                None => return Ok(HydrationResult::not_found()),
            }
        };

        let fields = match &status {
            Json::Object(map) => map.keys().cloned().collect(),
            Json::Null => Vec::new(),
            _ => Vec::new(),
        };

        Ok(HydrationResult {
            success: true,
            fields,
            error: None,
            status,
        })
    }

    async fn cached(&self, key: &str) -> Option<Json> {
        let cache = self.cache.read().await;
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.status.clone())
        } else {
            None
        }
    }
}

pub type SharedHydrator = Arc<StatusHydrator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_result_reports_failure_with_reason() {
        let result = HydrationResult::not_found();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("NotFound"));
        assert!(result.fields.is_empty());
    }
}
