//! Node drain: cordon, then evict the node's pods one at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use converge_apply::{retry_while, RetryPolicy};
use converge_core::{tree, AccessError, ConvergeConfig, Json, ResourceRef};
use converge_kubehub::{Accessor, Evictor, PodExec};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::wait::{poll_until, Poll};

const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";
const STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// Metadata dropped from a claim before it is recreated.
const CLAIM_RESET_FIELDS: &[&str] =
    &["annotations", "finalizers", "selfLink", "resourceVersion", "uid", "creationTimestamp", "generation", "managedFields"];

#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Upper bound for a single pod eviction.
    pub evict_timeout: Duration,
    pub pvc_delete_timeout: Duration,
    pub pvc_poll: Duration,
    /// `(label, value)` marking a database primary that must fail over first.
    pub primary_label: (String, String),
    pub failover_container: String,
    pub failover_url: String,
    /// A claim whose storage class contains any of these is node-local.
    pub local_storage_markers: Vec<String>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            evict_timeout: Duration::from_secs(120),
            pvc_delete_timeout: Duration::from_secs(120),
            pvc_poll: Duration::from_secs(1),
            primary_label: ("spilo-role".into(), "master".into()),
            failover_container: "postgres".into(),
            failover_url: "http://localhost:8008/switchover".into(),
            local_storage_markers: vec!["local".into()],
        }
    }
}

impl DrainConfig {
    pub fn from_config(cfg: &ConvergeConfig) -> Self {
        Self { evict_timeout: cfg.evict_timeout(), pvc_delete_timeout: cfg.pvc_delete_timeout(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Finished,
    Terminating,
    DaemonSet,
    Static,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::Finished => "finished",
            SkipReason::Terminating => "terminating",
            SkipReason::DaemonSet => "daemonset-managed",
            SkipReason::Static => "static",
        })
    }
}

/// Why a pod is left alone by drain, if it is.
pub fn skip_reason(pod: &Json) -> Option<SkipReason> {
    if matches!(tree::str_at(pod, &["status", "phase"]), Some("Succeeded") | Some("Failed")) {
        return Some(SkipReason::Finished);
    }
    if tree::is_terminating(pod) {
        return Some(SkipReason::Terminating);
    }
    if tree::controller_of(pod).and_then(tree::kind) == Some("DaemonSet") {
        return Some(SkipReason::DaemonSet);
    }
    let node_owned = tree::owner_references(pod).iter().any(|o| tree::kind(o) == Some("Node"));
    let mirror = tree::annotations(pod).map(|a| a.contains_key(MIRROR_ANNOTATION)).unwrap_or(false);
    if node_owned || mirror {
        return Some(SkipReason::Static);
    }
    None
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub evicted: Vec<ResourceRef>,
    pub skipped: Vec<(ResourceRef, SkipReason)>,
    pub claims_recreated: Vec<ResourceRef>,
}

fn claim_names(pod: &Json) -> Vec<String> {
    tree::get_path(pod, &["spec", "volumes"])
        .and_then(Json::as_array)
        .map(|vs| {
            vs.iter()
                .filter_map(|v| tree::str_at(v, &["persistentVolumeClaim", "claimName"]))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn storage_class(pvc: &Json) -> Option<&str> {
    tree::str_at(pvc, &["spec", "storageClassName"])
        .or_else(|| tree::annotations(pvc).and_then(|a| a.get(STORAGE_CLASS_ANNOTATION)).and_then(Json::as_str))
}

/// A claim as it should be resubmitted: no server identity, no binding, no status.
pub fn fresh_claim(pvc: &Json) -> Json {
    let mut claim = pvc.clone();
    if let Some(meta) = claim.get_mut("metadata").and_then(Json::as_object_mut) {
        for f in CLAIM_RESET_FIELDS {
            meta.remove(*f);
        }
    }
    tree::remove_path(&mut claim, &["spec", "volumeName"]);
    tree::remove_path(&mut claim, &["status"]);
    claim
}

pub struct Drainer {
    accessor: Arc<dyn Accessor>,
    exec: Arc<dyn PodExec>,
    evictor: Arc<dyn Evictor>,
    cfg: DrainConfig,
    retry: RetryPolicy,
}

impl Drainer {
    pub fn new(accessor: Arc<dyn Accessor>, exec: Arc<dyn PodExec>, evictor: Arc<dyn Evictor>, cfg: &ConvergeConfig) -> Self {
        Self { accessor, exec, evictor, cfg: DrainConfig::from_config(cfg), retry: RetryPolicy::from_config(cfg) }
    }

    pub fn with_config(mut self, cfg: DrainConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn cordon(&self, node: &str) -> Result<()> { self.set_unschedulable(node, true).await }

    pub async fn uncordon(&self, node: &str) -> Result<()> { self.set_unschedulable(node, false).await }

    async fn set_unschedulable(&self, node: &str, on: bool) -> Result<()> {
        let r = ResourceRef::new("Node", "", node).with_api_version("v1");
        let changed = self
            .modify(&r, "cordon", |n| {
                if tree::bool_at(n, &["spec", "unschedulable"]).unwrap_or(false) == on {
                    return false;
                }
                tree::set_path(n, &["spec", "unschedulable"], Json::Bool(on))
            })
            .await
            .with_context(|| format!("setting unschedulable={} on node {}", on, node))?;
        if changed {
            info!(node = %node, unschedulable = on, "node updated");
        } else {
            debug!(node = %node, unschedulable = on, "node already in desired state");
        }
        Ok(())
    }

    /// Get, edit and update `r`, re-reading on conflicts. `edit` returns false
    /// when the live object needs no change; no write is issued then.
    async fn modify<F>(&self, r: &ResourceRef, op: &str, edit: F) -> Result<bool, AccessError>
    where
        F: Fn(&mut Json) -> bool + Send + Sync,
    {
        let edit = &edit;
        retry_while(&self.retry, op, AccessError::is_conflict, move || async move {
            let Some(mut live) = self.accessor.get(r).await? else {
                return Err(AccessError::NotFound(format!("{} not found", r)));
            };
            if !edit(&mut live) {
                return Ok(false);
            }
            self.accessor.update(&live).await?;
            Ok(true)
        })
        .await
    }

    /// Cordon the node, then evict each evictable pod in enumeration order.
    /// The first failure aborts the drain; `timeout` bounds the whole call.
    pub async fn drain(&self, node: &str, timeout: Duration) -> Result<DrainReport> {
        let deadline = Instant::now() + timeout;
        self.cordon(node).await?;
        let selector = format!("spec.nodeName={}", node);
        let pods = self
            .accessor
            .list("Pod", None, Some(&selector))
            .await
            .with_context(|| format!("listing pods on node {}", node))?;
        info!(node = %node, pods = pods.len(), "draining");

        let mut report = DrainReport::default();
        for pod in &pods {
            let Some(r) = ResourceRef::from_tree(pod) else { continue };
            let r = r.with_api_version("v1");
            if let Some(reason) = skip_reason(pod) {
                debug!(pod = %r, reason = %reason, "skipping");
                counter!("drain_skipped", 1u64);
                report.skipped.push((r, reason));
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out draining node {} before evicting {}", node, r);
            }
            let claims = self
                .evict_pod(&r, pod, remaining.min(self.cfg.evict_timeout))
                .await
                .with_context(|| format!("evicting {} from node {}", r, node))?;
            report.evicted.push(r);
            report.claims_recreated.extend(claims);
        }
        info!(node = %node, evicted = report.evicted.len(), skipped = report.skipped.len(), "drained");
        Ok(report)
    }

    async fn evict_pod(&self, r: &ResourceRef, pod: &Json, timeout: Duration) -> Result<Vec<ResourceRef>> {
        let scaled = self.scale_up_sole_replica(pod).await?;
        let evicted = self.failover_then_evict(r, pod, timeout).await;
        if let Some(rs) = scaled {
            self.scale_back(&rs).await;
        }
        evicted?;
        counter!("drain_evictions", 1u64);
        info!(pod = %r, "evicted");

        let mut recreated = Vec::new();
        for claim in claim_names(pod) {
            let c = ResourceRef::new("PersistentVolumeClaim", r.namespace.clone(), claim).with_api_version("v1");
            let Some(pvc) = self.accessor.get(&c).await.with_context(|| format!("fetching {}", c))? else { continue };
            if !self.is_node_local(&pvc) {
                continue;
            }
            self.recreate_claim(&c, &pvc).await?;
            recreated.push(c);
        }
        Ok(recreated)
    }

    async fn failover_then_evict(&self, r: &ResourceRef, pod: &Json, timeout: Duration) -> Result<()> {
        let (label, value) = &self.cfg.primary_label;
        if tree::label(pod, label) == Some(value.as_str()) {
            self.failover(r).await?;
        }
        self.evictor.evict(r, timeout).await.with_context(|| format!("eviction of {}", r))
    }

    async fn failover(&self, r: &ResourceRef) -> Result<()> {
        let body = json!({ "leader": r.name }).to_string();
        let command: Vec<String> =
            vec!["curl".into(), "-s".into(), self.cfg.failover_url.clone(), "-XPOST".into(), "-d".into(), body];
        info!(pod = %r, "primary detected, failing over");
        self.exec
            .exec(r, &self.cfg.failover_container, &command)
            .await
            .with_context(|| format!("failover of primary {} failed, refusing to evict", r))?;
        Ok(())
    }

    /// Scale the owning ReplicaSet from 1 to 2. Returns it when scaled.
    async fn scale_up_sole_replica(&self, pod: &Json) -> Result<Option<ResourceRef>> {
        let Some(owner) = tree::controller_of(pod).filter(|o| tree::kind(o) == Some("ReplicaSet")) else { return Ok(None) };
        let Some(name) = tree::str_at(owner, &["name"]) else { return Ok(None) };
        let rs = ResourceRef::new("ReplicaSet", tree::namespace(pod).unwrap_or_default(), name).with_api_version("apps/v1");
        let scaled = match self.modify(&rs, "scale-up", |o| set_replicas_if(o, 1, 2)).await {
            Ok(scaled) => scaled,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e).with_context(|| format!("scaling up {}", rs)),
        };
        if !scaled {
            return Ok(None);
        }
        info!(replicaset = %rs, "scaled to 2 ahead of eviction");
        Ok(Some(rs))
    }

    async fn scale_back(&self, rs: &ResourceRef) {
        match self.modify(rs, "scale-down", |o| set_replicas_if(o, 2, 1)).await {
            Ok(_) => info!(replicaset = %rs, "scaled back to 1"),
            Err(e) => warn!(replicaset = %rs, error = %e, "failed to scale back"),
        }
    }

    fn is_node_local(&self, pvc: &Json) -> bool {
        storage_class(pvc)
            .map(|sc| self.cfg.local_storage_markers.iter().any(|m| sc.contains(m.as_str())))
            .unwrap_or(false)
    }

    /// Delete the claim, wait for it to disappear, then create it unbound.
    async fn recreate_claim(&self, c: &ResourceRef, pvc: &Json) -> Result<()> {
        info!(claim = %c, "recreating node-local claim");
        match self.accessor.delete(c).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).with_context(|| format!("deleting {}", c)),
        }
        let target = c.to_string();
        let accessor = self.accessor.as_ref();
        poll_until(&target, self.cfg.pvc_delete_timeout, self.cfg.pvc_poll, move || async move {
            match accessor.get(c).await? {
                Some(live) => Ok(Poll::Pending { message: "waiting for claim deletion".into(), last: Some(live) }),
                None => Ok(Poll::Done(())),
            }
        })
        .await
        .with_context(|| format!("{} was not removed", c))?;

        self.accessor.create(&fresh_claim(pvc)).await.with_context(|| format!("recreating {}", c))?;
        counter!("drain_pvc_recreated", 1u64);
        Ok(())
    }
}

fn set_replicas_if(obj: &mut Json, from: i64, to: i64) -> bool {
    if tree::i64_at(obj, &["spec", "replicas"]) != Some(from) {
        return false;
    }
    tree::set_path(obj, &["spec", "replicas"], json!(to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_and_terminating_pods_are_skipped() {
        assert_eq!(skip_reason(&json!({"status": {"phase": "Succeeded"}})), Some(SkipReason::Finished));
        assert_eq!(skip_reason(&json!({"status": {"phase": "Failed"}})), Some(SkipReason::Finished));
        let deleting = json!({"metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"}, "status": {"phase": "Running"}});
        assert_eq!(skip_reason(&deleting), Some(SkipReason::Terminating));
    }

    #[test]
    fn daemon_and_static_pods_are_skipped() {
        let ds = json!({"metadata": {"ownerReferences": [{"kind": "DaemonSet", "name": "agent", "controller": true}]}});
        assert_eq!(skip_reason(&ds), Some(SkipReason::DaemonSet));
        let mirror = json!({"metadata": {"annotations": {"kubernetes.io/config.mirror": "abc"}}});
        assert_eq!(skip_reason(&mirror), Some(SkipReason::Static));
        let node_owned = json!({"metadata": {"ownerReferences": [{"kind": "Node", "name": "n1"}]}});
        assert_eq!(skip_reason(&node_owned), Some(SkipReason::Static));
        let rs = json!({"metadata": {"ownerReferences": [{"kind": "ReplicaSet", "name": "web-1", "controller": true}]},
                        "status": {"phase": "Running"}});
        assert_eq!(skip_reason(&rs), None);
    }

    #[test]
    fn fresh_claim_drops_binding_and_identity() {
        let pvc = json!({
            "apiVersion": "v1", "kind": "PersistentVolumeClaim",
            "metadata": {"name": "data", "namespace": "ns", "uid": "u", "resourceVersion": "9",
                         "finalizers": ["kubernetes.io/pvc-protection"],
                         "annotations": {"pv.kubernetes.io/bind-completed": "yes"}},
            "spec": {"storageClassName": "local-path", "volumeName": "pv-1",
                     "resources": {"requests": {"storage": "1Gi"}}},
            "status": {"phase": "Bound"}
        });
        let fresh = fresh_claim(&pvc);
        assert_eq!(fresh["metadata"], json!({"name": "data", "namespace": "ns"}));
        assert!(tree::get_path(&fresh, &["spec", "volumeName"]).is_none());
        assert!(fresh.get("status").is_none());
        assert_eq!(tree::str_at(&fresh, &["spec", "storageClassName"]), Some("local-path"));
    }

    #[test]
    fn replicas_only_change_from_expected_value() {
        let mut rs = json!({"spec": {"replicas": 1}});
        assert!(set_replicas_if(&mut rs, 1, 2));
        assert_eq!(rs["spec"]["replicas"], 2);
        assert!(!set_replicas_if(&mut rs, 1, 2));
    }
}
