#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{AccessError, Json, Verdict};
use converge_kubehub::{Call, MockCluster};
use converge_ops::{Evaluator, ReadinessCheck};
use serde_json::json;

fn evaluator(m: &Arc<MockCluster>) -> Evaluator { Evaluator::new(m.clone(), m.clone(), Duration::from_secs(12)) }

fn workload(kind: &str, name: &str, ready: i64, desired: i64) -> Json {
    json!({
        "apiVersion": "apps/v1", "kind": kind,
        "metadata": {"name": name, "namespace": "ns"},
        "spec": {"replicas": desired},
        "status": {"replicas": desired, "readyReplicas": ready}
    })
}

#[tokio::test]
async fn missing_object_is_waiting_to_be_created() {
    let m = Arc::new(MockCluster::new());
    let v = evaluator(&m).is_ready(None).await;
    assert_eq!(v, Verdict::waiting("waiting to be created"));
}

#[tokio::test]
async fn workload_dispatch_reports_counts() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    assert_eq!(ev.is_ready(Some(&workload("StatefulSet", "db", 3, 3))).await, Verdict::ready());
    let v = ev.is_ready(Some(&workload("Deployment", "web", 2, 3))).await;
    assert!(!v.ready);
    assert!(v.message.contains('2') && v.message.contains('3'));
}

#[tokio::test]
async fn cluster_ip_service_needs_endpoints() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let svc = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web", "namespace": "ns"},
                     "spec": {"type": "ClusterIP"}});
    assert!(!ev.is_ready(Some(&svc)).await.ready);
    m.seed(json!({"apiVersion": "v1", "kind": "Endpoints", "metadata": {"name": "web", "namespace": "ns"}}));
    assert!(ev.is_ready(Some(&svc)).await.ready);
}

#[tokio::test]
async fn load_balancer_service_needs_ingress() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let mut svc = json!({"kind": "Service", "metadata": {"name": "lb", "namespace": "ns"},
                         "spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {}}});
    assert_eq!(ev.is_ready(Some(&svc)).await.message, "waiting for LoadBalancerIP");
    svc["status"]["loadBalancer"]["ingress"] = json!([{"ip": "10.1.2.3"}]);
    assert!(ev.is_ready(Some(&svc)).await.ready);
}

#[tokio::test]
async fn owned_workloads_must_all_be_ready() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let rf = json!({"apiVersion": "databases.spotahome.com/v1", "kind": "RedisFailover",
                    "metadata": {"name": "cache", "namespace": "ns"}});
    m.seed(workload("StatefulSet", "rfr-cache", 1, 3));
    let v = ev.is_ready(Some(&rf)).await;
    assert!(!v.ready);
    assert!(v.message.contains("1/3") && v.message.contains("; "), "{}", v.message);

    m.seed(workload("Deployment", "rfs-cache", 3, 3));
    let v = ev.is_ready(Some(&rf)).await;
    assert_eq!(v.message, "waiting for replicas to become ready 1/3");
}

#[tokio::test]
async fn elasticsearch_delegates_to_generated_statefulset() {
    let m = Arc::new(MockCluster::new());
    let es = json!({"kind": "Elasticsearch", "metadata": {"name": "logs", "namespace": "ns"}});
    m.seed(workload("StatefulSet", "logs-es-default", 3, 3));
    assert!(evaluator(&m).is_ready(Some(&es)).await.ready);
}

#[tokio::test(start_paused = true)]
async fn postgres_is_probed_after_workload_is_ready() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let pg = json!({"apiVersion": "acid.zalan.do/v1", "kind": "postgresql", "metadata": {"name": "main", "namespace": "ns"}});
    m.seed(workload("StatefulSet", "main", 1, 2));
    assert!(!ev.is_ready(Some(&pg)).await.ready);
    assert!(!m.calls().iter().any(|c| matches!(c, Call::Exec { .. })));

    m.seed(workload("StatefulSet", "main", 2, 2));
    for _ in 0..4 {
        m.push_exec_result(Err(AccessError::Exec("psql: could not connect".into())));
    }
    let v = ev.is_ready(Some(&pg)).await;
    assert!(!v.ready, "probe should time out");

    let v = ev.is_ready(Some(&pg)).await;
    assert!(v.ready, "{}", v.message);
    let Some(Call::Exec { pod, container, command }) = m.calls().into_iter().rev().find(|c| matches!(c, Call::Exec { .. })) else {
        panic!("no exec recorded")
    };
    assert_eq!(pod.name, "main-0");
    assert_eq!(container, "postgres");
    assert_eq!(command.last().map(String::as_str), Some("psql -c 'SELECT 1;'"));
}

#[tokio::test]
async fn status_flag_kinds() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let ct = json!({"kind": "ConstraintTemplate", "metadata": {"name": "deny"}, "status": {"created": true}});
    assert!(ev.is_ready(Some(&ct)).await.ready);
    let pending = json!({"kind": "ConstraintTemplate", "metadata": {"name": "deny"}, "status": {"created": false}});
    assert!(!ev.is_ready(Some(&pending)).await.ready);
    let mongo = json!({"kind": "PerconaServerMongoDB", "metadata": {"name": "m"}, "status": {"state": "ready"}});
    assert!(ev.is_ready(Some(&mongo)).await.ready);
}

#[tokio::test]
async fn unknown_kinds_use_conditions() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let obj = json!({"kind": "Certificate", "metadata": {"name": "c"}});
    assert_eq!(ev.is_ready(Some(&obj)).await.message, "waiting to become ready");
    let ok = json!({"kind": "Certificate", "metadata": {"name": "c"},
                    "status": {"conditions": [{"type": "Ready", "status": "True"}]}});
    assert!(ev.is_ready(Some(&ok)).await.ready);
}

#[tokio::test]
async fn namespace_readiness_follows_its_pods() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m);
    let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "apps"}});
    assert_eq!(ev.is_ready(Some(&ns)).await.message, "waiting for ready=0, pending=0");

    m.seed(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web", "namespace": "apps"},
                  "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}}));
    assert!(ev.is_ready(Some(&ns)).await.ready);

    m.seed(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "worker", "namespace": "apps"},
                  "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]}}));
    assert_eq!(ev.is_ready(Some(&ns)).await.message, "waiting for ready=1, pending=1");
}

struct AlwaysReady;

#[async_trait]
impl ReadinessCheck for AlwaysReady {
    async fn check(&self, _: &Evaluator, _: &Json) -> Verdict { Verdict::ready() }
}

#[tokio::test]
async fn registry_is_extensible_and_case_insensitive() {
    let m = Arc::new(MockCluster::new());
    let ev = evaluator(&m).with_check("Certificate", Arc::new(AlwaysReady));
    let obj = json!({"kind": "certificate", "metadata": {"name": "c"}});
    assert!(ev.is_ready(Some(&obj)).await.ready);
}
