//! kube-rs backed accessor: dynamic APIs resolved through a discovery cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use converge_core::{error::is_type_missing_message, AccessError, Json, ResourceRef, TypeInfo};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, AttachParams, DeleteParams, EvictParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{gvk_key, Accessor, Evictor, ExecOutput, PodExec};

const EVICT_RETRY: Duration = Duration::from_secs(5);
const DELETION_POLL: Duration = Duration::from_secs(1);

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

fn map_kube_err(e: kube::Error) -> AccessError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 if is_type_missing_message(&ae.message) => AccessError::Unregistered(ae.message),
            404 => AccessError::NotFound(ae.message),
            409 if ae.reason == "AlreadyExists" => AccessError::AlreadyExists(ae.message),
            409 if ae.reason == "Conflict" => AccessError::Conflict(ae.message),
            code => AccessError::Api { code, reason: ae.reason, message: ae.message },
        },
        other => AccessError::Transport(other.to_string()),
    }
}

/// A plain 404 is an absent object; a 404 for an unserved type stays an error.
fn absent_as_none<T>(res: Result<T, kube::Error>) -> Result<Option<T>, AccessError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) => match map_kube_err(e) {
            AccessError::NotFound(_) => Ok(None),
            other => Err(other),
        },
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, AccessError> {
    serde_json::to_value(obj).map_err(|e| AccessError::Transport(format!("serializing DynamicObject: {}", e)))
}

fn from_json(v: &Json) -> Result<DynamicObject, AccessError> {
    serde_json::from_value(v.clone()).map_err(|e| AccessError::Transport(format!("decoding object: {}", e)))
}

/// Snapshot of served resources from one discovery run.
struct TypeIndex {
    entries: Vec<(ApiResource, bool)>,
}

impl TypeIndex {
    async fn discover(client: Client) -> Result<Self, AccessError> {
        let started = std::time::Instant::now();
        let discovery = Discovery::new(client).run().await.map_err(map_kube_err)?;
        let mut entries = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                entries.push((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
        histogram!("discovery_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { entries })
    }

    fn find(&self, api_version: &str, kind: &str) -> Option<&(ApiResource, bool)> {
        if !api_version.is_empty() {
            return self.entries.iter().find(|(ar, _)| ar.api_version == api_version && ar.kind == kind);
        }
        let lower = kind.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(ar, _)| ar.kind == kind)
            .or_else(|| self.entries.iter().find(|(ar, _)| ar.kind.eq_ignore_ascii_case(kind) || ar.plural == lower))
    }
}

/// Accessor over a live cluster. The resolved-type cache is shared and swapped
/// atomically; `invalidate` forces the next resolution to rediscover.
pub struct KubeAccessor {
    client: Client,
    types: ArcSwapOption<TypeIndex>,
}

impl KubeAccessor {
    pub fn new(client: Client) -> Self { Self { client, types: ArcSwapOption::empty() } }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    pub fn client(&self) -> Client { self.client.clone() }

    async fn index(&self) -> Result<Arc<TypeIndex>, AccessError> {
        if let Some(idx) = self.types.load_full() {
            return Ok(idx);
        }
        let idx = Arc::new(TypeIndex::discover(self.client.clone()).await?);
        self.types.store(Some(idx.clone()));
        Ok(idx)
    }

    async fn lookup(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), AccessError> {
        let idx = self.index().await?;
        idx.find(api_version, kind)
            .cloned()
            .ok_or_else(|| AccessError::Unregistered(format!("no matches for kind {} in version {}", kind, api_version)))
    }

    /// Namespaced kinds require a namespace unless `allow_all` (cross-namespace list).
    fn api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>, allow_all: bool) -> Result<Api<DynamicObject>, AccessError> {
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), ar));
        }
        match namespace.filter(|n| !n.is_empty()) {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, ar)),
            None if allow_all => Ok(Api::all_with(self.client.clone(), ar)),
            None => Err(AccessError::Transport(format!("namespace required for namespaced kind {}", ar.kind))),
        }
    }

    async fn api_for_tree(&self, obj: &Json) -> Result<(Api<DynamicObject>, String), AccessError> {
        let r = ResourceRef::from_tree(obj)
            .ok_or_else(|| AccessError::Transport("object missing kind or metadata.name".to_string()))?;
        let (ar, namespaced) = self.lookup(&r.api_version, &r.kind).await?;
        let api = self.api(&ar, namespaced, Some(&r.namespace), false)?;
        Ok((api, r.name))
    }
}

#[async_trait]
impl Accessor for KubeAccessor {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<TypeInfo, AccessError> {
        let (ar, namespaced) = self.lookup(api_version, kind).await?;
        Ok(TypeInfo { api_version: ar.api_version, kind: ar.kind, plural: ar.plural, namespaced })
    }

    async fn registered_kinds(&self) -> Result<Vec<String>, AccessError> {
        let idx = TypeIndex::discover(self.client.clone()).await?;
        let mut out: Vec<String> = idx.entries.iter().map(|(ar, _)| gvk_key(&ar.api_version, &ar.kind)).collect();
        out.sort();
        Ok(out)
    }

    fn invalidate(&self) {
        debug!("dropping resolved-type cache");
        self.types.store(None);
    }

    async fn get(&self, r: &ResourceRef) -> Result<Option<Json>, AccessError> {
        let (ar, namespaced) = self.lookup(&r.api_version, &r.kind).await?;
        let api = self.api(&ar, namespaced, Some(&r.namespace), false)?;
        match absent_as_none(api.get(&r.name).await)? {
            Some(obj) => Ok(Some(to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Json>, AccessError> {
        let (ar, namespaced) = self.lookup("", kind).await?;
        let api = self.api(&ar, namespaced, namespace, true)?;
        let mut lp = ListParams::default();
        if let Some(fs) = field_selector {
            lp = lp.fields(fs);
        }
        let list = api.list(&lp).await.map_err(map_kube_err)?;
        // List items carry no TypeMeta; restore it so callers can dispatch on kind.
        list.items
            .iter()
            .map(|o| {
                let mut v = to_json(o)?;
                if let Some(m) = v.as_object_mut() {
                    m.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
                    m.insert("kind".into(), Json::String(ar.kind.clone()));
                }
                Ok(v)
            })
            .collect()
    }

    async fn create(&self, obj: &Json) -> Result<Json, AccessError> {
        let (api, _) = self.api_for_tree(obj).await?;
        let created = api.create(&PostParams::default(), &from_json(obj)?).await.map_err(map_kube_err)?;
        to_json(&created)
    }

    async fn update(&self, obj: &Json) -> Result<Json, AccessError> {
        let (api, name) = self.api_for_tree(obj).await?;
        let updated = api.replace(&name, &PostParams::default(), &from_json(obj)?).await.map_err(map_kube_err)?;
        to_json(&updated)
    }

    async fn delete(&self, r: &ResourceRef) -> Result<(), AccessError> {
        let (ar, namespaced) = self.lookup(&r.api_version, &r.kind).await?;
        let api = self.api(&ar, namespaced, Some(&r.namespace), false)?;
        api.delete(&r.name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        Ok(())
    }
}

#[async_trait]
impl PodExec for KubeAccessor {
    async fn exec(&self, pod: &ResourceRef, container: &str, command: &[String]) -> Result<ExecOutput, AccessError> {
        use tokio::io::AsyncReadExt;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let ap = AttachParams::default().container(container).stdout(true).stderr(true);
        debug!(pod = %pod, container = %container, cmd = ?command, "exec");
        let mut attached = api.exec(&pod.name, command.to_vec(), &ap).await.map_err(map_kube_err)?;

        let status = attached.take_status();
        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let read_out = async move {
            let mut s = String::new();
            if let Some(mut r) = stdout_reader { let _ = r.read_to_string(&mut s).await; }
            s
        };
        let read_err = async move {
            let mut s = String::new();
            if let Some(mut r) = stderr_reader { let _ = r.read_to_string(&mut s).await; }
            s
        };
        let (stdout, stderr) = tokio::join!(read_out, read_err);
        let status = match status { Some(fut) => fut.await, None => None };
        if let Err(e) = attached.join().await {
            warn!(pod = %pod, error = %e, "exec session did not close cleanly");
        }
        match status {
            Some(s) if s.status.as_deref() == Some("Success") => Ok(ExecOutput { stdout, stderr }),
            Some(s) => Err(AccessError::Exec(format!(
                "{} (stdout: {}, stderr: {})",
                s.message.unwrap_or_else(|| "command failed".to_string()),
                stdout.trim(),
                stderr.trim()
            ))),
            None => Err(AccessError::Exec(format!("no exit status (stdout: {}, stderr: {})", stdout.trim(), stderr.trim()))),
        }
    }
}

#[async_trait]
impl Evictor for KubeAccessor {
    async fn evict(&self, pod: &ResourceRef, timeout: Duration) -> Result<(), AccessError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let deadline = Instant::now() + timeout;
        let uid = match api.get_opt(&pod.name).await.map_err(map_kube_err)? {
            Some(p) => p.metadata.uid,
            None => return Ok(()),
        };

        loop {
            match api.evict(&pod.name, &EvictParams::default()).await {
                Ok(_) => break,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 429 => {
                    counter!("evict_blocked_total", 1u64);
                    if Instant::now() >= deadline {
                        return Err(AccessError::Api { code: ae.code, reason: ae.reason, message: ae.message });
                    }
                    warn!(pod = %pod, "eviction blocked by disruption budget (429) - will retry");
                    tokio::time::sleep(EVICT_RETRY).await;
                }
                Err(e) => return Err(map_kube_err(e)),
            }
        }

        loop {
            match api.get_opt(&pod.name).await.map_err(map_kube_err)? {
                None => break,
                Some(p) if p.metadata.uid != uid => break,
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(AccessError::Transport(format!("timed out waiting for {} to be deleted", pod)));
            }
            tokio::time::sleep(DELETION_POLL).await;
        }
        info!(pod = %pod, "evicted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ar(api_version: &str, kind: &str, plural: &str) -> ApiResource {
        let (group, version) = crate::split_api_version(api_version);
        ApiResource { group, version, api_version: api_version.into(), kind: kind.into(), plural: plural.into() }
    }

    #[test]
    fn index_resolves_by_kind_plural_and_version() {
        let idx = TypeIndex {
            entries: vec![
                (ar("apps/v1", "Deployment", "deployments"), true),
                (ar("acid.zalan.do/v1", "postgresql", "postgresqls"), true),
            ],
        };
        assert!(idx.find("apps/v1", "Deployment").is_some());
        assert!(idx.find("apps/v2", "Deployment").is_none());
        assert!(idx.find("", "deployments").is_some());
        assert_eq!(idx.find("", "Postgresql").map(|(a, _)| a.kind.as_str()), Some("postgresql"));
    }

    fn status_404(message: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: "NotFound".into(),
            code: 404,
        })
    }

    #[test]
    fn missing_object_reads_as_absent() {
        let got = absent_as_none::<()>(Err(status_404("configmaps \"cfg\" not found"))).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn unserved_type_on_get_stays_an_error() {
        let err = absent_as_none::<()>(Err(status_404("the server could not find the requested resource"))).unwrap_err();
        assert!(matches!(err, AccessError::Unregistered(_)), "{:?}", err);
    }

    #[test]
    fn other_api_errors_propagate() {
        let forbidden = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(matches!(absent_as_none::<()>(Err(forbidden)), Err(AccessError::Api { code: 403, .. })));
    }
}
