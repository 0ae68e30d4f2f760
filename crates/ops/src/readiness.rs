//! Per-kind readiness predicates.
//!
//! The evaluator dispatches on the lower-cased kind through a registry of
//! `ReadinessCheck`s; kinds without an entry fall back to the conditions rule.
//! Checks only read cluster state, except the probed rule which runs a command
//! inside a pod.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{tree, Json, ResourceRef, Verdict};
use converge_kubehub::{Accessor, PodExec};
use serde_json::json;
use tracing::debug;

use crate::wait::{wait_for_pod_command, POD_COMMAND_POLL};

pub const WAITING: &str = "waiting to become ready";
pub const WAITING_CREATED: &str = "waiting to be created";

#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    async fn check(&self, ev: &Evaluator, obj: &Json) -> Verdict;
}

/// Ready iff `data` is a non-empty map.
pub fn data_verdict(obj: &Json) -> Verdict {
    match obj.get("data").and_then(Json::as_object) {
        Some(d) if !d.is_empty() => Verdict::ready(),
        _ => Verdict::waiting("waiting for data"),
    }
}

/// Ready replicas equal desired (`spec.replicas`, else `status.replicas`).
pub fn workload_verdict(obj: &Json) -> Verdict {
    let desired = tree::i64_at(obj, &["spec", "replicas"]).or_else(|| tree::i64_at(obj, &["status", "replicas"]));
    let Some(desired) = desired else { return Verdict::waiting(WAITING) };
    let ready = tree::i64_at(obj, &["status", "readyReplicas"]).unwrap_or(0);
    if ready == desired {
        Verdict::ready()
    } else {
        Verdict::waiting(format!("waiting for replicas to become ready {}/{}", ready, desired))
    }
}

pub fn daemonset_verdict(obj: &Json) -> Verdict {
    let ready = tree::i64_at(obj, &["status", "numberReady"]).unwrap_or(0);
    if ready >= 1 {
        Verdict::ready()
    } else {
        let desired = tree::i64_at(obj, &["status", "desiredNumberScheduled"]).unwrap_or(0);
        Verdict::waiting(format!("waiting for daemon pods to become ready {}/{}", ready, desired))
    }
}

/// Ready iff a `Ready=True` condition exists and no condition reports anything but `True`.
pub fn conditions_verdict(obj: &Json) -> Verdict {
    let Some(conditions) = tree::conditions(obj).filter(|c| !c.is_empty()) else { return Verdict::waiting(WAITING) };
    let mut saw_ready = false;
    for c in conditions {
        let ty = tree::str_at(c, &["type"]).unwrap_or_default();
        let status = tree::str_at(c, &["status"]).unwrap_or_default();
        if status != "True" {
            let message = tree::str_at(c, &["message"]).unwrap_or_default();
            return Verdict::waiting(format!("waiting for {}/{}: {}", ty, status, message));
        }
        saw_ready |= ty == "Ready";
    }
    if saw_ready { Verdict::ready() } else { Verdict::waiting(WAITING) }
}

/// Running or Succeeded with no condition reporting `False`.
pub fn pod_is_ready(pod: &Json) -> bool {
    let conditions_ok = tree::conditions(pod)
        .map(|cs| cs.iter().all(|c| tree::str_at(c, &["status"]) != Some("False")))
        .unwrap_or(true);
    conditions_ok && matches!(tree::str_at(pod, &["status", "phase"]), Some("Running") | Some("Succeeded"))
}

/// A namespace is ready once it has at least one pod and none are pending.
pub fn namespace_verdict(pods: &[Json]) -> Verdict {
    let ready = pods.iter().filter(|p| pod_is_ready(p)).count();
    let pending = pods.len() - ready;
    if ready > 0 && pending == 0 {
        Verdict::ready()
    } else {
        Verdict::waiting(format!("waiting for ready={}, pending={}", ready, pending))
    }
}

fn latest_image_verdict(obj: &Json) -> Verdict {
    match tree::str_at(obj, &["status", "latestImage"]) {
        Some(img) if !img.is_empty() => Verdict::ready(),
        _ => Verdict::waiting(WAITING),
    }
}

struct DataCheck;

#[async_trait]
impl ReadinessCheck for DataCheck {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict { data_verdict(obj) }
}

struct ServiceCheck;

#[async_trait]
impl ReadinessCheck for ServiceCheck {
    async fn check(&self, ev: &Evaluator, obj: &Json) -> Verdict {
        if tree::str_at(obj, &["spec", "type"]) == Some("LoadBalancer") {
            let assigned = tree::get_path(obj, &["status", "loadBalancer", "ingress"])
                .and_then(Json::as_array)
                .map(|a| !a.is_empty())
                .unwrap_or(false);
            return if assigned { Verdict::ready() } else { Verdict::waiting("waiting for LoadBalancerIP") };
        }
        let endpoints = ResourceRef::new(
            "Endpoints",
            tree::namespace(obj).unwrap_or_default(),
            tree::name(obj).unwrap_or_default(),
        )
        .with_api_version("v1");
        match ev.accessor.get(&endpoints).await {
            Ok(Some(_)) => Verdict::ready(),
            _ => Verdict::waiting("waiting for the corresponding Endpoint"),
        }
    }
}

struct NamespaceCheck;

#[async_trait]
impl ReadinessCheck for NamespaceCheck {
    async fn check(&self, ev: &Evaluator, obj: &Json) -> Verdict {
        let ns = tree::name(obj).unwrap_or_default();
        match ev.accessor.list("Pod", Some(ns), None).await {
            Ok(pods) => namespace_verdict(&pods),
            Err(e) => Verdict::waiting(format!("failed to list pods: {}", e)),
        }
    }
}

struct WorkloadCheck;

#[async_trait]
impl ReadinessCheck for WorkloadCheck {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict { workload_verdict(obj) }
}

struct DaemonSetCheck;

#[async_trait]
impl ReadinessCheck for DaemonSetCheck {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict { daemonset_verdict(obj) }
}

/// A workload generated for the checked resource, named `<prefix><name><suffix>`.
#[derive(Debug, Clone)]
pub struct Owned {
    pub kind: &'static str,
    pub prefix: &'static str,
    pub suffix: &'static str,
}

impl Owned {
    fn reference(&self, obj: &Json) -> ResourceRef {
        let name = format!("{}{}{}", self.prefix, tree::name(obj).unwrap_or_default(), self.suffix);
        ResourceRef::new(self.kind, tree::namespace(obj).unwrap_or_default(), name).with_api_version("apps/v1")
    }
}

/// Delegates to the workload rule for every owned workload; all must be ready.
pub struct OwnedWorkloads(pub Vec<Owned>);

#[async_trait]
impl ReadinessCheck for OwnedWorkloads {
    async fn check(&self, ev: &Evaluator, obj: &Json) -> Verdict {
        let mut messages = Vec::new();
        for owned in &self.0 {
            let r = owned.reference(obj);
            let v = match ev.accessor.get(&r).await {
                Ok(Some(w)) => workload_verdict(&w),
                Ok(None) => Verdict::waiting(format!("waiting for {}", r)),
                Err(e) => Verdict::waiting(format!("failed to get {}: {}", r, e)),
            };
            if !v.ready {
                messages.push(v.message);
            }
        }
        if messages.is_empty() { Verdict::ready() } else { Verdict::waiting(messages.join("; ")) }
    }
}

/// Owned StatefulSet readiness, then a command probe in its first pod.
pub struct ProbedStatefulSet {
    pub prefix: &'static str,
    pub container: String,
    pub command: Vec<String>,
}

#[async_trait]
impl ReadinessCheck for ProbedStatefulSet {
    async fn check(&self, ev: &Evaluator, obj: &Json) -> Verdict {
        let owned = Owned { kind: "StatefulSet", prefix: self.prefix, suffix: "" };
        let sts = owned.reference(obj);
        let workload = match ev.accessor.get(&sts).await {
            Ok(Some(w)) => w,
            _ => return Verdict::waiting("waiting for statefulset"),
        };
        let v = workload_verdict(&workload);
        if !v.ready {
            return v;
        }
        let pod = ResourceRef::new("Pod", sts.namespace.clone(), format!("{}-0", sts.name)).with_api_version("v1");
        match wait_for_pod_command(ev.exec.as_ref(), &pod, &self.container, &self.command, ev.probe_timeout, POD_COMMAND_POLL).await {
            Ok(()) => Verdict::ready(),
            Err(e) => Verdict::waiting(format!("waiting for {} to be running: {}", self.container, e)),
        }
    }
}

/// Ready iff the value at `path` equals `expected`.
pub struct StatusField {
    pub path: &'static [&'static str],
    pub expected: Json,
    pub waiting: &'static str,
}

#[async_trait]
impl ReadinessCheck for StatusField {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict {
        if obj.get("status").map(Json::is_null).unwrap_or(true) {
            return Verdict::waiting(WAITING);
        }
        if tree::get_path(obj, self.path) == Some(&self.expected) {
            Verdict::ready()
        } else {
            Verdict::waiting(self.waiting)
        }
    }
}

/// Ready as soon as any `Ready=True` condition is present.
struct AnyReadyCondition;

#[async_trait]
impl ReadinessCheck for AnyReadyCondition {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict {
        let ready = tree::conditions(obj)
            .map(|cs| cs.iter().any(|c| tree::str_at(c, &["type"]) == Some("Ready") && tree::str_at(c, &["status"]) == Some("True")))
            .unwrap_or(false);
        if ready { Verdict::ready() } else { Verdict::waiting(WAITING) }
    }
}

struct BuilderCheck;

#[async_trait]
impl ReadinessCheck for BuilderCheck {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict {
        let v = conditions_verdict(obj);
        if !v.ready {
            return v;
        }
        latest_image_verdict(obj)
    }
}

struct ImageCheck;

#[async_trait]
impl ReadinessCheck for ImageCheck {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict { latest_image_verdict(obj) }
}

struct ConditionsCheck;

#[async_trait]
impl ReadinessCheck for ConditionsCheck {
    async fn check(&self, _: &Evaluator, obj: &Json) -> Verdict { conditions_verdict(obj) }
}

fn psql_probe(prefix: &'static str) -> ProbedStatefulSet {
    ProbedStatefulSet {
        prefix,
        container: "postgres".into(),
        command: ["su", "postgres", "-c", "psql -c 'SELECT 1;'"].iter().map(|s| s.to_string()).collect(),
    }
}

/// Built-in registry keyed by lower-cased kind.
pub fn default_registry() -> HashMap<String, Arc<dyn ReadinessCheck>> {
    let mut r: HashMap<String, Arc<dyn ReadinessCheck>> = HashMap::new();
    let data: Arc<dyn ReadinessCheck> = Arc::new(DataCheck);
    let workload: Arc<dyn ReadinessCheck> = Arc::new(WorkloadCheck);
    r.insert("configmap".into(), data.clone());
    r.insert("secret".into(), data);
    r.insert("service".into(), Arc::new(ServiceCheck));
    r.insert("namespace".into(), Arc::new(NamespaceCheck));
    r.insert("deployment".into(), workload.clone());
    r.insert("statefulset".into(), workload.clone());
    r.insert("replicaset".into(), workload);
    r.insert("daemonset".into(), Arc::new(DaemonSetCheck));
    r.insert(
        "elasticsearch".into(),
        Arc::new(OwnedWorkloads(vec![Owned { kind: "StatefulSet", prefix: "", suffix: "-es-default" }])),
    );
    r.insert("kibana".into(), Arc::new(OwnedWorkloads(vec![Owned { kind: "Deployment", prefix: "", suffix: "-kb" }])));
    r.insert(
        "redisfailover".into(),
        Arc::new(OwnedWorkloads(vec![
            Owned { kind: "StatefulSet", prefix: "rfr-", suffix: "" },
            Owned { kind: "Deployment", prefix: "rfs-", suffix: "" },
        ])),
    );
    r.insert("postgresql".into(), Arc::new(psql_probe("")));
    r.insert("postgresqldb".into(), Arc::new(psql_probe("postgres-")));
    r.insert(
        "constrainttemplate".into(),
        Arc::new(StatusField { path: &["status", "created"], expected: json!(true), waiting: WAITING_CREATED }),
    );
    r.insert(
        "perconaservermongodb".into(),
        Arc::new(StatusField { path: &["status", "state"], expected: json!("ready"), waiting: WAITING }),
    );
    r.insert("kafka".into(), Arc::new(AnyReadyCondition));
    r.insert("builder".into(), Arc::new(BuilderCheck));
    r.insert("image".into(), Arc::new(ImageCheck));
    r
}

pub struct Evaluator {
    accessor: Arc<dyn Accessor>,
    exec: Arc<dyn PodExec>,
    probe_timeout: Duration,
    registry: HashMap<String, Arc<dyn ReadinessCheck>>,
    fallback: Arc<dyn ReadinessCheck>,
}

impl Evaluator {
    pub fn new(accessor: Arc<dyn Accessor>, exec: Arc<dyn PodExec>, probe_timeout: Duration) -> Self {
        Self { accessor, exec, probe_timeout, registry: default_registry(), fallback: Arc::new(ConditionsCheck) }
    }

    /// Register or replace the check for `kind` (matched case-insensitively).
    pub fn with_check(mut self, kind: &str, check: Arc<dyn ReadinessCheck>) -> Self {
        self.registry.insert(kind.to_ascii_lowercase(), check);
        self
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor> { &self.accessor }

    /// Evaluate a live object; `None` means it does not exist yet.
    pub async fn is_ready(&self, obj: Option<&Json>) -> Verdict {
        let Some(obj) = obj else { return Verdict::waiting(WAITING_CREATED) };
        let kind = tree::kind(obj).unwrap_or_default().to_ascii_lowercase();
        debug!(kind = %kind, name = tree::name(obj).unwrap_or_default(), "checking readiness");
        let check = self.registry.get(&kind).unwrap_or(&self.fallback);
        check.check(self, obj).await
    }
}
