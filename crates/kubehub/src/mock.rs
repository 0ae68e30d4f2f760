//! In-memory cluster for tests and offline runs.
//!
//! Honors optimistic concurrency (stale `resourceVersion` => conflict), treats
//! status as a subresource on update, and records every call so tests can
//! assert on the exact mutation sequence.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use converge_core::{error::CONFLICT_HINT, tree, AccessError, Json, ResourceRef, TypeInfo};

use crate::{gvk_key, Accessor, Evictor, ExecOutput, PodExec};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(ResourceRef),
    List(String),
    Create(Json),
    Update(Json),
    Delete(ResourceRef),
    Exec { pod: ResourceRef, container: String, command: Vec<String> },
    Evict(ResourceRef),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Call::Create(_) | Call::Update(_) | Call::Delete(_) | Call::Evict(_))
    }
}

type Key = (String, String, String);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|e| e.into_inner()) }

/// Built-in kinds served by a fresh mock: (apiVersion, kind, plural, namespaced).
const BUILTIN_KINDS: &[(&str, &str, &str, bool)] = &[
    ("v1", "ConfigMap", "configmaps", true),
    ("v1", "Secret", "secrets", true),
    ("v1", "Service", "services", true),
    ("v1", "Endpoints", "endpoints", true),
    ("v1", "ServiceAccount", "serviceaccounts", true),
    ("v1", "Pod", "pods", true),
    ("v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    ("v1", "Namespace", "namespaces", false),
    ("v1", "Node", "nodes", false),
    ("batch/v1", "Job", "jobs", true),
    ("apps/v1", "Deployment", "deployments", true),
    ("apps/v1", "StatefulSet", "statefulsets", true),
    ("apps/v1", "DaemonSet", "daemonsets", true),
    ("apps/v1", "ReplicaSet", "replicasets", true),
    ("rbac.authorization.k8s.io/v1", "RoleBinding", "rolebindings", true),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", "clusterrolebindings", false),
    ("apiextensions.k8s.io/v1", "CustomResourceDefinition", "customresourcedefinitions", false),
];

pub struct MockCluster {
    objects: Mutex<BTreeMap<Key, Json>>,
    kinds: Mutex<Vec<TypeInfo>>,
    /// Kinds that become served after the given number of `registered_kinds` polls.
    pending_kinds: Mutex<Vec<(u32, TypeInfo)>>,
    update_failures: Mutex<VecDeque<AccessError>>,
    persistent_update_failure: Mutex<Option<AccessError>>,
    delete_failures: Mutex<VecDeque<AccessError>>,
    create_failures: Mutex<VecDeque<AccessError>>,
    get_failures: Mutex<VecDeque<AccessError>>,
    exec_results: Mutex<VecDeque<Result<ExecOutput, AccessError>>>,
    calls: Mutex<Vec<Call>>,
    rv: AtomicU64,
    invalidations: AtomicUsize,
}

impl Default for MockCluster {
    fn default() -> Self { Self::new() }
}

impl MockCluster {
    pub fn new() -> Self {
        let kinds = BUILTIN_KINDS
            .iter()
            .map(|(av, k, p, ns)| TypeInfo { api_version: av.to_string(), kind: k.to_string(), plural: p.to_string(), namespaced: *ns })
            .collect();
        Self {
            objects: Mutex::new(BTreeMap::new()),
            kinds: Mutex::new(kinds),
            pending_kinds: Mutex::new(Vec::new()),
            update_failures: Mutex::new(VecDeque::new()),
            persistent_update_failure: Mutex::new(None),
            delete_failures: Mutex::new(VecDeque::new()),
            create_failures: Mutex::new(VecDeque::new()),
            get_failures: Mutex::new(VecDeque::new()),
            exec_results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            rv: AtomicU64::new(100),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn register_kind(&self, api_version: &str, kind: &str, plural: &str, namespaced: bool) {
        lock(&self.kinds).push(TypeInfo { api_version: api_version.into(), kind: kind.into(), plural: plural.into(), namespaced });
    }

    /// Serve `kind` only after `polls` calls to `registered_kinds`.
    pub fn register_kind_after(&self, polls: u32, api_version: &str, kind: &str, plural: &str, namespaced: bool) {
        lock(&self.pending_kinds).push((polls, TypeInfo { api_version: api_version.into(), kind: kind.into(), plural: plural.into(), namespaced }));
    }

    /// Insert an object as if it already existed; server identity is assigned.
    pub fn seed(&self, obj: Json) -> Json {
        let mut obj = obj;
        self.stamp_new(&mut obj);
        if let Some(key) = self.key_of_tree(&obj) {
            lock(&self.objects).insert(key, obj.clone());
        }
        obj
    }

    pub fn object(&self, r: &ResourceRef) -> Option<Json> {
        let key = self.key_of_ref(r)?;
        lock(&self.objects).get(&key).cloned()
    }

    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }

    pub fn mutations(&self) -> Vec<Call> { self.calls().into_iter().filter(Call::is_mutation).collect() }

    pub fn clear_calls(&self) { lock(&self.calls).clear(); }

    pub fn invalidations(&self) -> usize { self.invalidations.load(Ordering::SeqCst) }

    /// Fail the next `n` updates with `err`.
    pub fn fail_next_updates(&self, err: AccessError, n: usize) {
        let mut q = lock(&self.update_failures);
        for _ in 0..n {
            q.push_back(err.clone());
        }
    }

    pub fn fail_updates_always(&self, err: AccessError) { *lock(&self.persistent_update_failure) = Some(err); }

    pub fn fail_next_delete(&self, err: AccessError) { lock(&self.delete_failures).push_back(err); }

    pub fn fail_next_create(&self, err: AccessError) { lock(&self.create_failures).push_back(err); }

    /// Fail the next `get` with `err`, after recording the call.
    pub fn fail_next_get(&self, err: AccessError) { lock(&self.get_failures).push_back(err); }

    /// Queue an exec result; exec succeeds with empty output when the queue is empty.
    pub fn push_exec_result(&self, r: Result<ExecOutput, AccessError>) { lock(&self.exec_results).push_back(r); }

    fn record(&self, c: Call) { lock(&self.calls).push(c); }

    fn next_rv(&self) -> String { self.rv.fetch_add(1, Ordering::SeqCst).saturating_add(1).to_string() }

    fn stamp_new(&self, obj: &mut Json) {
        tree::set_path(obj, &["metadata", "uid"], Json::String(uuid::Uuid::new_v4().to_string()));
        tree::set_path(obj, &["metadata", "resourceVersion"], Json::String(self.next_rv()));
        tree::set_path(obj, &["metadata", "creationTimestamp"], Json::String(chrono::Utc::now().to_rfc3339()));
        tree::set_path(obj, &["metadata", "generation"], Json::from(1));
    }

    fn find_kind(&self, api_version: &str, kind: &str) -> Option<TypeInfo> {
        let lower = kind.to_ascii_lowercase();
        lock(&self.kinds)
            .iter()
            .find(|t| {
                (api_version.is_empty() || t.api_version == api_version)
                    && (t.kind == kind || t.kind.eq_ignore_ascii_case(kind) || t.plural == lower)
            })
            .cloned()
    }

    fn key_of_ref(&self, r: &ResourceRef) -> Option<Key> {
        let t = self.find_kind(&r.api_version, &r.kind)?;
        let ns = if t.namespaced { r.namespace.clone() } else { String::new() };
        Some((t.kind, ns, r.name.clone()))
    }

    fn key_of_tree(&self, obj: &Json) -> Option<Key> { self.key_of_ref(&ResourceRef::from_tree(obj)?) }

    fn require_key(&self, obj: &Json) -> Result<Key, AccessError> {
        let r = ResourceRef::from_tree(obj).ok_or_else(|| AccessError::Transport("object missing kind or metadata.name".into()))?;
        self.key_of_ref(&r).ok_or_else(|| AccessError::Unregistered(format!("no matches for kind {}", r.kind)))
    }
}

/// Comparable view of an object: identity and status dropped.
fn content(obj: &Json) -> Json {
    let mut v = obj.clone();
    tree::strip_identifiers(&mut v);
    tree::remove_path(&mut v, &["status"]);
    v
}

fn field_selector_matches(obj: &Json, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
        Some((path, want)) => {
            let segs: Vec<&str> = path.split('.').collect();
            tree::str_at(obj, &segs) == Some(want)
        }
        None => true,
    })
}

#[async_trait]
impl Accessor for MockCluster {
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<TypeInfo, AccessError> {
        self.find_kind(api_version, kind)
            .ok_or_else(|| AccessError::Unregistered(format!("no matches for kind {} in version {}", kind, api_version)))
    }

    async fn registered_kinds(&self) -> Result<Vec<String>, AccessError> {
        {
            let mut pending = lock(&self.pending_kinds);
            let mut ready = Vec::new();
            pending.retain_mut(|(polls, t)| {
                *polls = polls.saturating_sub(1);
                if *polls == 0 {
                    ready.push(t.clone());
                    false
                } else {
                    true
                }
            });
            lock(&self.kinds).extend(ready);
        }
        let mut out: Vec<String> = lock(&self.kinds).iter().map(|t| gvk_key(&t.api_version, &t.kind)).collect();
        out.sort();
        Ok(out)
    }

    fn invalidate(&self) { self.invalidations.fetch_add(1, Ordering::SeqCst); }

    async fn get(&self, r: &ResourceRef) -> Result<Option<Json>, AccessError> {
        self.record(Call::Get(r.clone()));
        if let Some(e) = lock(&self.get_failures).pop_front() {
            return Err(e);
        }
        let key = self.key_of_ref(r).ok_or_else(|| AccessError::Unregistered(format!("no matches for kind {}", r.kind)))?;
        Ok(lock(&self.objects).get(&key).cloned())
    }

    async fn list(&self, kind: &str, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Json>, AccessError> {
        self.record(Call::List(kind.to_string()));
        let t = self.find_kind("", kind).ok_or_else(|| AccessError::Unregistered(format!("no matches for kind {}", kind)))?;
        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .filter(|((k, ns, _), _)| *k == t.kind && namespace.map(|want| want == ns).unwrap_or(true))
            .filter(|(_, obj)| field_selector.map(|s| field_selector_matches(obj, s)).unwrap_or(true))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &Json) -> Result<Json, AccessError> {
        self.record(Call::Create(obj.clone()));
        if let Some(e) = lock(&self.create_failures).pop_front() {
            return Err(e);
        }
        let key = self.require_key(obj)?;
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(AccessError::AlreadyExists(format!("{} \"{}\" already exists", key.0, key.2)));
        }
        let mut stored = obj.clone();
        self.stamp_new(&mut stored);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &Json) -> Result<Json, AccessError> {
        self.record(Call::Update(obj.clone()));
        if let Some(e) = lock(&self.update_failures).pop_front() {
            return Err(e);
        }
        if let Some(e) = lock(&self.persistent_update_failure).clone() {
            return Err(e);
        }
        let key = self.require_key(obj)?;
        let mut objects = lock(&self.objects);
        let existing = objects.get(&key).cloned().ok_or_else(|| AccessError::NotFound(format!("{} \"{}\" not found", key.0, key.2)))?;
        if tree::resource_version(obj) != tree::resource_version(&existing) {
            return Err(AccessError::Conflict(format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified; {}",
                key.0, key.2, CONFLICT_HINT
            )));
        }
        if content(obj) == content(&existing) {
            return Ok(existing);
        }
        let mut stored = obj.clone();
        for f in ["uid", "creationTimestamp"] {
            if let Some(v) = tree::get_path(&existing, &["metadata", f]) {
                tree::set_path(&mut stored, &["metadata", f], v.clone());
            }
        }
        let generation = tree::i64_at(&existing, &["metadata", "generation"]).unwrap_or(0).saturating_add(1);
        tree::set_path(&mut stored, &["metadata", "generation"], Json::from(generation));
        tree::set_path(&mut stored, &["metadata", "resourceVersion"], Json::String(self.next_rv()));
        match existing.get("status") {
            Some(s) => { tree::set_path(&mut stored, &["status"], s.clone()); }
            None => { tree::remove_path(&mut stored, &["status"]); }
        }
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, r: &ResourceRef) -> Result<(), AccessError> {
        self.record(Call::Delete(r.clone()));
        if let Some(e) = lock(&self.delete_failures).pop_front() {
            return Err(e);
        }
        let key = self.key_of_ref(r).ok_or_else(|| AccessError::Unregistered(format!("no matches for kind {}", r.kind)))?;
        match lock(&self.objects).remove(&key) {
            Some(_) => Ok(()),
            None => Err(AccessError::NotFound(format!("{} not found", r))),
        }
    }
}

#[async_trait]
impl PodExec for MockCluster {
    async fn exec(&self, pod: &ResourceRef, container: &str, command: &[String]) -> Result<ExecOutput, AccessError> {
        self.record(Call::Exec { pod: pod.clone(), container: container.to_string(), command: command.to_vec() });
        lock(&self.exec_results).pop_front().unwrap_or_else(|| Ok(ExecOutput::default()))
    }
}

#[async_trait]
impl Evictor for MockCluster {
    async fn evict(&self, pod: &ResourceRef, _timeout: Duration) -> Result<(), AccessError> {
        self.record(Call::Evict(pod.clone()));
        if let Some(key) = self.key_of_ref(pod) {
            lock(&self.objects).remove(&key);
        }
        Ok(())
    }
}
