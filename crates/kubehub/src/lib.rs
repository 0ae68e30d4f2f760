//! Converge kubehub: the resource accessor seam over the cluster API.
//!
//! Apply and ops only ever talk to the cluster through the traits in this
//! crate. `KubeAccessor` backs them with kube-rs dynamic APIs; `MockCluster`
//! is an in-memory stand-in for tests and offline runs.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use converge_core::{AccessError, Json, ResourceRef, TypeInfo};
use serde::{Deserialize, Serialize};

mod kube_accessor;
pub mod mock;

pub use kube_accessor::{get_kube_client, KubeAccessor};
pub use mock::{Call, MockCluster};

/// Generic get/list/create/update/delete over attribute trees, plus type resolution.
#[async_trait]
pub trait Accessor: Send + Sync {
    /// Resolve a kind to its API location. An empty `api_version` resolves by kind alone.
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<TypeInfo, AccessError>;

    /// Currently served kinds as `group/version/Kind` keys. Bypasses any cache.
    async fn registered_kinds(&self) -> Result<Vec<String>, AccessError>;

    /// Drop any resolved-type cache.
    fn invalidate(&self);

    /// Fetch a live object; `Ok(None)` when it does not exist.
    async fn get(&self, r: &ResourceRef) -> Result<Option<Json>, AccessError>;

    /// List objects of a kind. `namespace = None` lists across namespaces.
    async fn list(&self, kind: &str, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Json>, AccessError>;

    async fn create(&self, obj: &Json) -> Result<Json, AccessError>;

    /// Replace; rejected with a conflict when `metadata.resourceVersion` is stale.
    async fn update(&self, obj: &Json) -> Result<Json, AccessError>;

    async fn delete(&self, r: &ResourceRef) -> Result<(), AccessError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a command inside a pod container; non-zero exit is an `AccessError::Exec`.
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(&self, pod: &ResourceRef, container: &str, command: &[String]) -> Result<ExecOutput, AccessError>;
}

/// Disruption-budget-aware pod removal. Returns once the pod is gone or `timeout` elapses.
#[async_trait]
pub trait Evictor: Send + Sync {
    async fn evict(&self, pod: &ResourceRef, timeout: Duration) -> Result<(), AccessError>;
}

/// `group/version/Kind` (or `version/Kind` for the core group).
pub fn gvk_key(api_version: &str, kind: &str) -> String { format!("{}/{}", api_version, kind) }

/// Split `apiVersion` into (group, version); the core group is empty.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(split_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
    }

    #[test]
    fn gvk_key_joins_parts() {
        assert_eq!(gvk_key("apps/v1", "Deployment"), "apps/v1/Deployment");
        assert_eq!(gvk_key("v1", "ConfigMap"), "v1/ConfigMap");
    }
}
