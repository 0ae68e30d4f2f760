//! Deadline-bounded polling loops over live cluster state.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use converge_core::{tree, AccessError, Json, ResourceRef, Verdict};
use converge_kubehub::{Accessor, PodExec};
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::readiness::{namespace_verdict, Evaluator};

pub const TAINT_POLL: Duration = Duration::from_secs(2);
pub const POD_COMMAND_POLL: Duration = Duration::from_secs(5);
/// Cadence for namespace, job, node and label waits.
pub const STATUS_POLL: Duration = Duration::from_secs(2);
pub const POD_PHASE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {waited:?} waiting for {target}: {message}")]
    Timeout { target: String, message: String, waited: Duration, last: Option<Json> },
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl WaitError {
    pub fn is_timeout(&self) -> bool { matches!(self, WaitError::Timeout { .. }) }

    /// Last observed object, when the wait timed out after seeing one.
    pub fn last_seen(&self) -> Option<&Json> {
        match self {
            WaitError::Timeout { last, .. } => last.as_ref(),
            WaitError::Access(_) => None,
        }
    }
}

/// One probe of a polling loop.
pub enum Poll<T> {
    Done(T),
    Pending { message: String, last: Option<Json> },
}

impl<T> Poll<T> {
    pub fn pending(message: impl Into<String>) -> Self { Poll::Pending { message: message.into(), last: None } }
}

/// Probe every `interval` until done or `timeout` elapses. A progress line is
/// logged only when the pending message differs from the previous one.
pub async fn poll_until<T, F, Fut>(target: &str, timeout: Duration, interval: Duration, probe: F) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, WaitError>>,
{
    let progress = |message: &str| info!(target_ref = %target, message = %message, "waiting");
    poll_until_with(target, timeout, interval, progress, probe).await
}

/// [`poll_until`] with the progress sink supplied by the caller. `on_progress`
/// sees each distinct pending message once, in order.
pub async fn poll_until_with<T, P, F, Fut>(
    target: &str,
    timeout: Duration,
    interval: Duration,
    mut on_progress: P,
    mut probe: F,
) -> Result<T, WaitError>
where
    P: FnMut(&str),
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, WaitError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_message: Option<String> = None;
    let mut last_seen: Option<Json> = None;
    loop {
        match probe().await? {
            Poll::Done(v) => {
                histogram!("wait_latency_ms", start.elapsed().as_secs_f64() * 1000.0);
                return Ok(v);
            }
            Poll::Pending { message, last } => {
                if last_message.as_deref() != Some(message.as_str()) {
                    on_progress(&message);
                    last_message = Some(message);
                }
                if last.is_some() {
                    last_seen = last;
                }
            }
        }
        let now = Instant::now();
        if now >= deadline {
            counter!("wait_timeouts", 1u64);
            return Err(WaitError::Timeout {
                target: target.to_string(),
                message: last_message.unwrap_or_default(),
                waited: now - start,
                last: last_seen,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Poll a resource until the evaluator reports it ready. In dry-run mode
/// everything is ready already and `Ok(None)` is returned without any call.
pub async fn wait_for_resource(
    ev: &Evaluator,
    r: &ResourceRef,
    timeout: Duration,
    interval: Duration,
    dry_run: bool,
) -> Result<Option<Json>, WaitError> {
    if dry_run {
        debug!(resource = %r, "[dry-run] assuming ready");
        return Ok(None);
    }
    let target = r.to_string();
    poll_until(&target, timeout, interval, move || async move {
        let live = match ev.accessor().get(r).await {
            Ok(live) => live,
            Err(e) => return Ok(Poll::pending(format!("failed to get {}: {}", r, e))),
        };
        let Verdict { ready, message } = ev.is_ready(live.as_ref()).await;
        match live {
            Some(obj) if ready => Ok(Poll::Done(Some(obj))),
            last => Ok(Poll::Pending { message, last }),
        }
    })
    .await
}

/// Poll a resource until `predicate` accepts it. The predicate also sees
/// `None` while the object does not exist; accepting it returns `Ok(None)`.
pub async fn wait_for_resource_with<F>(
    accessor: &dyn Accessor,
    r: &ResourceRef,
    timeout: Duration,
    interval: Duration,
    dry_run: bool,
    predicate: F,
) -> Result<Option<Json>, WaitError>
where
    F: Fn(Option<&Json>) -> Verdict,
{
    if dry_run {
        debug!(resource = %r, "[dry-run] assuming ready");
        return Ok(None);
    }
    let target = r.to_string();
    let predicate = &predicate;
    poll_until(&target, timeout, interval, move || async move {
        let live = match accessor.get(r).await {
            Ok(live) => live,
            Err(e) => return Ok(Poll::pending(format!("failed to get {}: {}", r, e))),
        };
        let Verdict { ready, message } = predicate(live.as_ref());
        if ready {
            Ok(Poll::Done(live))
        } else {
            Ok(Poll::Pending { message, last: live })
        }
    })
    .await
}

/// Wait until every pod in `namespace` is running or finished, and at least one exists.
pub async fn wait_for_namespace(
    accessor: &dyn Accessor,
    namespace: &str,
    timeout: Duration,
    interval: Duration,
    dry_run: bool,
) -> Result<(), WaitError> {
    if dry_run {
        debug!(namespace = %namespace, "[dry-run] assuming ready");
        return Ok(());
    }
    let target = format!("namespace {}", namespace);
    poll_until(&target, timeout, interval, move || async move {
        let pods = match accessor.list("Pod", Some(namespace), None).await {
            Ok(pods) => pods,
            Err(e) => return Ok(Poll::pending(format!("failed to list pods: {}", e))),
        };
        let v = namespace_verdict(&pods);
        if v.ready {
            Ok(Poll::Done(()))
        } else {
            Ok(Poll::pending(v.message))
        }
    })
    .await
}

fn phase(pod: &Json) -> &str { tree::str_at(pod, &["status", "phase"]).unwrap_or_default() }

/// Wait for the pod to reach one of `phases`. A `Pending` pod always keeps the
/// wait going; a `Failed` pod ends it, and the returned pod carries the phase.
pub async fn wait_for_pod(
    accessor: &dyn Accessor,
    namespace: &str,
    name: &str,
    phases: &[&str],
    timeout: Duration,
    interval: Duration,
) -> Result<Json, WaitError> {
    let r = ResourceRef::new("Pod", namespace, name).with_api_version("v1");
    let target = r.to_string();
    let r = &r;
    poll_until(&target, timeout, interval, move || async move {
        let Some(pod) = accessor.get(r).await? else { return Ok(Poll::pending(format!("pod {} not found", r))) };
        let current = phase(&pod).to_string();
        match current.as_str() {
            "Pending" | "" => Ok(Poll::Pending { message: "waiting for pod to leave Pending".into(), last: Some(pod) }),
            "Failed" => Ok(Poll::Done(pod)),
            p if phases.iter().any(|want| *want == p) => Ok(Poll::Done(pod)),
            p => Ok(Poll::Pending { message: format!("waiting for pod phase {:?}, currently {}", phases, p), last: Some(pod) }),
        }
    })
    .await
}

/// Equality-based label selector: `k=v`, `k==v`, `k!=v`, `k` and `!k`, comma separated.
pub fn selector_matches(obj: &Json, selector: &str) -> bool {
    selector.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| {
        if let Some((k, v)) = term.split_once("!=") {
            tree::label(obj, k.trim()) != Some(v.trim())
        } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
            tree::label(obj, k.trim()) == Some(v.trim())
        } else if let Some(k) = term.strip_prefix('!') {
            tree::label(obj, k.trim()).is_none()
        } else {
            tree::label(obj, term).is_some()
        }
    })
}

/// Wait for a pod matching `selector` to exist, and when `phases` is not empty,
/// to be in one of them. Returns the first match in listing order.
pub async fn wait_for_pod_by_label(
    accessor: &dyn Accessor,
    namespace: &str,
    selector: &str,
    phases: &[&str],
    timeout: Duration,
    interval: Duration,
) -> Result<Json, WaitError> {
    let target = format!("pod {}/{}", namespace, selector);
    poll_until(&target, timeout, interval, move || async move {
        let pods = match accessor.list("Pod", Some(namespace), None).await {
            Ok(pods) => pods,
            Err(e) => return Ok(Poll::pending(format!("failed to list pods: {}", e))),
        };
        let found = pods
            .into_iter()
            .filter(|p| selector_matches(p, selector))
            .find(|p| phases.is_empty() || phases.iter().any(|want| *want == phase(p)));
        match found {
            Some(pod) => Ok(Poll::Done(pod)),
            None => Ok(Poll::pending("waiting for pod")),
        }
    })
    .await
}

fn condition_status<'a>(obj: &'a Json, ty: &str) -> Option<&'a str> {
    tree::conditions(obj)?
        .iter()
        .find(|c| tree::str_at(c, &["type"]) == Some(ty))
        .and_then(|c| tree::str_at(c, &["status"]))
}

/// Wait for the job's `Complete` condition to be `True`.
pub async fn wait_for_job(
    accessor: &dyn Accessor,
    namespace: &str,
    name: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), WaitError> {
    let r = ResourceRef::new("Job", namespace, name).with_api_version("batch/v1");
    let target = r.to_string();
    let r = &r;
    poll_until(&target, timeout, interval, move || async move {
        let job = match accessor.get(r).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(Poll::pending("waiting for job to be created")),
            Err(e) => return Ok(Poll::pending(format!("failed to get {}: {}", r, e))),
        };
        if condition_status(&job, "Complete") == Some("True") {
            return Ok(Poll::Done(()));
        }
        let message = if condition_status(&job, "Failed") == Some("True") {
            "job failed, waiting for it to complete"
        } else {
            "waiting for job to finish"
        };
        Ok(Poll::Pending { message: message.into(), last: Some(job) })
    })
    .await
}

/// Node conditions keyed by type.
pub fn node_conditions(node: &Json) -> BTreeMap<String, String> {
    tree::conditions(node)
        .map(|cs| {
            cs.iter()
                .filter_map(|c| Some((tree::str_at(c, &["type"])?.to_string(), tree::str_at(c, &["status"])?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Wait until the node's `condition` has one of `statuses`; returns every condition seen.
pub async fn wait_for_node(
    accessor: &dyn Accessor,
    node: &str,
    condition: &str,
    statuses: &[&str],
    timeout: Duration,
    interval: Duration,
) -> Result<BTreeMap<String, String>, WaitError> {
    let r = ResourceRef::new("Node", "", node).with_api_version("v1");
    let target = format!("condition {} on {}", condition, r);
    let r = &r;
    poll_until(&target, timeout, interval, move || async move {
        let Some(n) = accessor.get(r).await? else { return Ok(Poll::pending(format!("node {} not found", node))) };
        let conditions = node_conditions(&n);
        match conditions.get(condition).cloned() {
            Some(s) if statuses.iter().any(|want| *want == s) => Ok(Poll::Done(conditions)),
            current => Ok(Poll::Pending {
                message: format!("waiting for {} in {:?}, currently {}", condition, statuses, current.as_deref().unwrap_or("unknown")),
                last: Some(n),
            }),
        }
    })
    .await
}

fn has_taint(node: &Json, key: &str) -> bool {
    tree::get_path(node, &["spec", "taints"])
        .and_then(Json::as_array)
        .map(|ts| ts.iter().any(|t| tree::str_at(t, &["key"]) == Some(key)))
        .unwrap_or(false)
}

/// Wait until no taint with `taint_key` remains on the node.
pub async fn wait_for_taint_removal(
    accessor: &dyn Accessor,
    node: &str,
    taint_key: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<(), WaitError> {
    let r = ResourceRef::new("Node", "", node).with_api_version("v1");
    let target = format!("taint {} on {}", taint_key, r);
    let r = &r;
    poll_until(&target, timeout, interval, move || async move {
        match accessor.get(r).await? {
            None => Ok(Poll::pending(format!("node {} not found", node))),
            Some(n) if has_taint(&n, taint_key) => {
                Ok(Poll::Pending { message: format!("waiting for taint {} to be removed", taint_key), last: Some(n) })
            }
            Some(_) => Ok(Poll::Done(())),
        }
    })
    .await
}

/// Run `command` in the pod until it exits successfully.
pub async fn wait_for_pod_command(
    exec: &dyn PodExec,
    pod: &ResourceRef,
    container: &str,
    command: &[String],
    timeout: Duration,
    interval: Duration,
) -> Result<(), WaitError> {
    let target = format!("{} in {}/{}", command.join(" "), pod, container);
    poll_until(&target, timeout, interval, move || async move {
        match exec.exec(pod, container, command).await {
            Ok(_) => Ok(Poll::Done(())),
            Err(e) => Ok(Poll::pending(e.to_string())),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use converge_kubehub::{Call, MockCluster};
    use serde_json::json;

    fn evaluator(m: &Arc<MockCluster>) -> Evaluator { Evaluator::new(m.clone(), m.clone(), Duration::from_secs(30)) }

    fn sts(ready: i64) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": {"name": "db", "namespace": "ns"},
            "spec": {"replicas": 3},
            "status": {"replicas": 3, "readyReplicas": ready}
        })
    }

    #[tokio::test(start_paused = true)]
    async fn returns_live_object_once_ready() {
        let m = Arc::new(MockCluster::new());
        m.seed(sts(3));
        let r = ResourceRef::new("StatefulSet", "ns", "db").with_api_version("apps/v1");
        let live = wait_for_resource(&evaluator(&m), &r, Duration::from_secs(5), Duration::from_secs(1), false).await.unwrap();
        assert_eq!(live.and_then(|l| tree::i64_at(&l, &["status", "readyReplicas"])), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_last_message_and_object() {
        let m = Arc::new(MockCluster::new());
        m.seed(sts(2));
        let r = ResourceRef::new("StatefulSet", "ns", "db").with_api_version("apps/v1");
        let err = wait_for_resource(&evaluator(&m), &r, Duration::from_secs(5), Duration::from_secs(1), false).await.unwrap_err();
        match &err {
            WaitError::Timeout { message, last, waited, .. } => {
                assert_eq!(message, "waiting for replicas to become ready 2/3");
                assert!(last.is_some());
                assert!(*waited >= Duration::from_secs(5));
            }
            other => panic!("unexpected {:?}", other),
        }
        let gets = m.calls().into_iter().filter(|c| matches!(c, Call::Get(_))).count();
        assert!(gets >= 5, "polled {} times", gets);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_resource_waits_to_be_created() {
        let m = Arc::new(MockCluster::new());
        let r = ResourceRef::new("Deployment", "ns", "web").with_api_version("apps/v1");
        let err = wait_for_resource(&evaluator(&m), &r, Duration::from_secs(2), Duration::from_secs(1), false).await.unwrap_err();
        assert!(err.to_string().contains("waiting to be created"), "{}", err);
        assert!(err.last_seen().is_none());
    }

    #[tokio::test]
    async fn dry_run_never_polls() {
        let m = Arc::new(MockCluster::new());
        let r = ResourceRef::new("Deployment", "ns", "web");
        let live = wait_for_resource(&evaluator(&m), &r, Duration::from_secs(2), Duration::from_secs(1), true).await.unwrap();
        assert!(live.is_none());
        assert!(m.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn taint_wait_times_out_while_tainted() {
        let m = MockCluster::new();
        m.seed(json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n1"},
                      "spec": {"taints": [{"key": "node.kubernetes.io/unschedulable", "effect": "NoSchedule"}]}}));
        let err = wait_for_taint_removal(&m, "n1", "node.kubernetes.io/unschedulable", Duration::from_secs(4), TAINT_POLL)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        wait_for_taint_removal(&m, "n1", "other", Duration::from_secs(4), TAINT_POLL).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pod_command_retried_until_success() {
        let m = MockCluster::new();
        m.push_exec_result(Err(AccessError::Exec("connection refused".into())));
        m.push_exec_result(Err(AccessError::Exec("connection refused".into())));
        let pod = ResourceRef::new("Pod", "ns", "db-0");
        let cmd = vec!["true".to_string()];
        wait_for_pod_command(&m, &pod, "postgres", &cmd, Duration::from_secs(30), POD_COMMAND_POLL).await.unwrap();
        let execs = m.calls().into_iter().filter(|c| matches!(c, Call::Exec { .. })).count();
        assert_eq!(execs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reported_once_per_distinct_message() {
        let step = std::cell::Cell::new(0usize);
        let step = &step;
        let mut seen: Vec<String> = Vec::new();
        let done = poll_until_with(
            "sequence",
            Duration::from_secs(60),
            Duration::from_secs(1),
            |m: &str| seen.push(m.to_string()),
            move || async move {
                let i = step.get();
                step.set(i + 1);
                Ok(match i {
                    0..=2 => Poll::pending("still starting"),
                    3 | 4 => Poll::pending("pulling image"),
                    5 => Poll::pending("still starting"),
                    _ => Poll::Done(i),
                })
            },
        )
        .await
        .unwrap();
        assert_eq!(done, 6);
        assert_eq!(seen, vec!["still starting", "pulling image", "still starting"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_message_is_reported_once_until_timeout() {
        let mut seen = 0usize;
        let err = poll_until_with::<(), _, _, _>(
            "stuck",
            Duration::from_secs(10),
            Duration::from_secs(1),
            |_: &str| seen += 1,
            || async { Ok(Poll::pending("waiting")) },
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(seen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_predicate_decides_readiness() {
        let m = MockCluster::new();
        m.seed(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "flags", "namespace": "ns"}, "data": {"mode": "blue"}}));
        let r = ResourceRef::new("ConfigMap", "ns", "flags").with_api_version("v1");
        let wants = |mode: &'static str| {
            move |obj: Option<&Json>| match obj.and_then(|o| tree::str_at(o, &["data", "mode"])) {
                Some(v) if v == mode => Verdict::ready(),
                other => Verdict::waiting(format!("mode is {:?}", other)),
            }
        };
        let live = wait_for_resource_with(&m, &r, Duration::from_secs(3), Duration::from_secs(1), false, wants("blue")).await.unwrap();
        assert!(live.is_some());

        let err = wait_for_resource_with(&m, &r, Duration::from_secs(3), Duration::from_secs(1), false, wants("green"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mode is Some(\"blue\")"), "{}", err);

        let gone = ResourceRef::new("ConfigMap", "ns", "old").with_api_version("v1");
        let absent = wait_for_resource_with(&m, &gone, Duration::from_secs(3), Duration::from_secs(1), false, |o: Option<&Json>| {
            if o.is_none() { Verdict::ready() } else { Verdict::waiting("still present") }
        })
        .await
        .unwrap();
        assert!(absent.is_none());
    }

    fn pod(ns: &str, name: &str, phase: &str, labels: Json) -> Json {
        let conditions = match phase {
            "Running" => json!([{"type": "Ready", "status": "True"}]),
            "Pending" => json!([{"type": "PodScheduled", "status": "False"}]),
            _ => json!([]),
        };
        json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": ns, "labels": labels},
               "status": {"phase": phase, "conditions": conditions}})
    }

    #[tokio::test(start_paused = true)]
    async fn namespace_waits_for_pending_pods() {
        let m = MockCluster::new();
        m.seed(pod("apps", "a", "Running", json!({})));
        m.seed(pod("apps", "b", "Succeeded", json!({})));
        m.seed(pod("stuck", "c", "Pending", json!({})));
        wait_for_namespace(&m, "apps", Duration::from_secs(4), STATUS_POLL, false).await.unwrap();

        let err = wait_for_namespace(&m, "stuck", Duration::from_secs(4), STATUS_POLL, false).await.unwrap_err();
        assert!(err.to_string().contains("waiting for ready=0, pending=1"), "{}", err);

        let err = wait_for_namespace(&m, "empty", Duration::from_secs(4), STATUS_POLL, false).await.unwrap_err();
        assert!(err.to_string().contains("ready=0, pending=0"), "{}", err);
    }

    #[tokio::test]
    async fn namespace_wait_in_dry_run_makes_no_calls() {
        let m = MockCluster::new();
        wait_for_namespace(&m, "apps", Duration::from_secs(4), STATUS_POLL, true).await.unwrap();
        assert!(m.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pod_phase_wait() {
        let m = MockCluster::new();
        m.seed(pod("ns", "web", "Running", json!({})));
        m.seed(pod("ns", "crashed", "Failed", json!({})));
        m.seed(pod("ns", "queued", "Pending", json!({})));

        let p = wait_for_pod(&m, "ns", "web", &["Running"], Duration::from_secs(10), POD_PHASE_POLL).await.unwrap();
        assert_eq!(tree::name(&p), Some("web"));

        let p = wait_for_pod(&m, "ns", "crashed", &["Running"], Duration::from_secs(10), POD_PHASE_POLL).await.unwrap();
        assert_eq!(tree::str_at(&p, &["status", "phase"]), Some("Failed"));

        let err = wait_for_pod(&m, "ns", "queued", &["Pending"], Duration::from_secs(10), POD_PHASE_POLL).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.last_seen().and_then(tree::name), Some("queued"));

        let err = wait_for_pod(&m, "ns", "web", &["Succeeded"], Duration::from_secs(10), POD_PHASE_POLL).await.unwrap_err();
        assert!(err.to_string().contains("currently Running"), "{}", err);
    }

    #[test]
    fn label_selector_terms() {
        let p = pod("ns", "web-1", "Running", json!({"app": "web", "tier": "front"}));
        assert!(selector_matches(&p, "app=web"));
        assert!(selector_matches(&p, "app==web, tier"));
        assert!(selector_matches(&p, "app=web,tier!=db,!canary"));
        assert!(!selector_matches(&p, "app=api"));
        assert!(!selector_matches(&p, "tier!=front"));
        assert!(!selector_matches(&p, "!tier"));
        assert!(selector_matches(&p, ""));
    }

    #[tokio::test(start_paused = true)]
    async fn pod_by_label_returns_first_match() {
        let m = MockCluster::new();
        m.seed(pod("ns", "db-0", "Running", json!({"app": "db"})));
        m.seed(pod("ns", "web-1", "Running", json!({"app": "web"})));
        m.seed(pod("other", "web-2", "Running", json!({"app": "web"})));

        let p = wait_for_pod_by_label(&m, "ns", "app=web", &[], Duration::from_secs(4), STATUS_POLL).await.unwrap();
        assert_eq!(tree::name(&p), Some("web-1"));

        let err = wait_for_pod_by_label(&m, "ns", "app=web", &["Succeeded"], Duration::from_secs(4), STATUS_POLL).await.unwrap_err();
        assert!(err.to_string().contains("waiting for pod"), "{}", err);
    }

    fn job(conditions: Json) -> Json {
        json!({"apiVersion": "batch/v1", "kind": "Job", "metadata": {"name": "migrate", "namespace": "ns"},
               "status": {"conditions": conditions}})
    }

    #[tokio::test(start_paused = true)]
    async fn job_wait_returns_once_complete() {
        let m = Arc::new(MockCluster::new());
        m.seed(job(json!([])));
        let later = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            later.seed(job(json!([{"type": "Complete", "status": "True"}])));
        });
        wait_for_job(m.as_ref(), "ns", "migrate", Duration::from_secs(30), STATUS_POLL).await.unwrap();
        let gets = m.calls().into_iter().filter(|c| matches!(c, Call::Get(_))).count();
        assert!(gets >= 3, "polled {} times", gets);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_times_out_with_reason() {
        let m = MockCluster::new();
        m.seed(job(json!([{"type": "Failed", "status": "True"}])));
        let err = wait_for_job(&m, "ns", "migrate", Duration::from_secs(4), STATUS_POLL).await.unwrap_err();
        assert!(err.to_string().contains("job failed"), "{}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn node_condition_wait_returns_all_conditions() {
        let m = MockCluster::new();
        m.seed(json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n1"},
                      "status": {"conditions": [{"type": "Ready", "status": "True"}, {"type": "DiskPressure", "status": "False"}]}}));
        m.seed(json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n2"},
                      "status": {"conditions": [{"type": "Ready", "status": "Unknown"}]}}));

        let conditions = wait_for_node(&m, "n1", "Ready", &["True"], Duration::from_secs(4), STATUS_POLL).await.unwrap();
        assert_eq!(conditions.get("DiskPressure").map(String::as_str), Some("False"));
        assert_eq!(conditions.len(), 2);

        let err = wait_for_node(&m, "n2", "Ready", &["True"], Duration::from_secs(4), STATUS_POLL).await.unwrap_err();
        assert!(err.to_string().contains("currently Unknown"), "{}", err);
        wait_for_node(&m, "n2", "Ready", &["True", "Unknown"], Duration::from_secs(4), STATUS_POLL).await.unwrap();
    }
}
