//! Desired-state normalizer.
//!
//! Strips server bookkeeping from a manifest and fills in the values the API
//! server would default anyway, so comparing against live state does not flag
//! fields the user never wrote. Every defaulter only fills absent fields, which
//! keeps `normalize` idempotent.

use std::collections::HashMap;

use converge_core::{tree, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Metadata fields owned by the server, removed from every manifest.
pub const BOOKKEEPING_FIELDS: &[&str] =
    &["creationTimestamp", "managedFields", "ownerReferences", "generation", "uid", "selfLink", "resourceVersion"];

/// Annotations controllers bump on their own.
pub const NOISY_ANNOTATIONS: &[&str] =
    &["deprecated.daemonset.template.generation", "template-operator-owner-ref", "deployment.kubernetes.io/revision"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeDefaults {
    pub failure_threshold: i64,
    pub period_seconds: i64,
    pub success_threshold: i64,
    pub timeout_seconds: i64,
    pub http_scheme: String,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self { failure_threshold: 3, period_seconds: 10, success_threshold: 1, timeout_seconds: 1, http_scheme: "HTTP".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodDefaults {
    pub termination_grace_period_seconds: i64,
    pub dns_policy: String,
    pub restart_policy: String,
    pub scheduler_name: String,
    pub image_pull_policy: String,
    pub termination_message_policy: String,
    pub termination_message_path: String,
    pub volume_default_mode: i64,
    pub field_ref_api_version: String,
    pub probe: ProbeDefaults,
}

impl Default for PodDefaults {
    fn default() -> Self {
        Self {
            termination_grace_period_seconds: 30,
            dns_policy: "ClusterFirst".into(),
            restart_policy: "Always".into(),
            scheduler_name: "default-scheduler".into(),
            image_pull_policy: "IfNotPresent".into(),
            termination_message_policy: "File".into(),
            termination_message_path: "/dev/termination-log".into(),
            volume_default_mode: 420,
            field_ref_api_version: "v1".into(),
            probe: ProbeDefaults::default(),
        }
    }
}

/// Canonical default values, passed to the normalizer at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    pub protocol: String,
    pub revision_history_limit: i64,
    pub progress_deadline_seconds: i64,
    pub max_unavailable: String,
    pub max_surge: String,
    pub daemonset_max_unavailable: i64,
    pub pod_management_policy: String,
    pub rbac_api_group: String,
    pub pod: PodDefaults,
    pub noisy_annotations: Vec<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            protocol: "TCP".into(),
            revision_history_limit: 10,
            progress_deadline_seconds: 600,
            max_unavailable: "25%".into(),
            max_surge: "25%".into(),
            daemonset_max_unavailable: 1,
            pod_management_policy: "OrderedReady".into(),
            rbac_api_group: "rbac.authorization.k8s.io".into(),
            pod: PodDefaults::default(),
            noisy_annotations: NOISY_ANNOTATIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Kind-specific defaulting strategy.
pub type Defaulter = fn(&Defaults, &mut Json);

pub struct Normalizer {
    defaults: Defaults,
    defaulters: HashMap<String, Defaulter>,
}

impl Default for Normalizer {
    fn default() -> Self { Self::new(Defaults::default()) }
}

impl Normalizer {
    pub fn new(defaults: Defaults) -> Self {
        let mut defaulters: HashMap<String, Defaulter> = HashMap::new();
        defaulters.insert("Service".into(), default_service);
        defaulters.insert("Deployment".into(), default_deployment);
        defaulters.insert("DaemonSet".into(), default_daemonset);
        defaulters.insert("StatefulSet".into(), default_statefulset);
        defaulters.insert("RoleBinding".into(), default_binding);
        defaulters.insert("ClusterRoleBinding".into(), default_binding);
        defaulters.insert("CustomResourceDefinition".into(), default_crd);
        Self { defaults, defaulters }
    }

    /// Register or override the defaulter for `kind`.
    pub fn with_defaulter(mut self, kind: impl Into<String>, f: Defaulter) -> Self {
        self.defaulters.insert(kind.into(), f);
        self
    }

    pub fn defaults(&self) -> &Defaults { &self.defaults }

    pub fn noisy_annotations(&self) -> &[String] { &self.defaults.noisy_annotations }

    /// Pure: returns a normalized copy. `null` normalizes to `null`.
    pub fn normalize(&self, manifest: &Json) -> Json {
        let mut out = manifest.clone();
        if !out.is_object() {
            return out;
        }
        strip_bookkeeping(&mut out, &self.defaults.noisy_annotations);
        tree::remove_path(&mut out, &["spec", "template", "metadata", "creationTimestamp"]);
        if let Some(f) = tree::kind(&out).and_then(|k| self.defaulters.get(k)).copied() {
            f(&self.defaults, &mut out);
        }
        out
    }
}

/// Remove server bookkeeping and the noisy annotations; drops an emptied annotation map.
pub fn strip_bookkeeping(v: &mut Json, noisy: &[String]) {
    let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
    for f in BOOKKEEPING_FIELDS {
        meta.remove(*f);
    }
    let empty = match meta.get_mut("annotations") {
        Some(Json::Object(annotations)) => {
            for a in noisy {
                annotations.remove(a);
            }
            annotations.is_empty()
        }
        Some(Json::Null) => true,
        _ => false,
    };
    if empty {
        meta.remove("annotations");
    }
}

fn each_in_array(v: &mut Json, path: &[&str], mut f: impl FnMut(&mut Json)) {
    if let Some(items) = tree::get_path_mut(v, path).and_then(|a| a.as_array_mut()) {
        items.iter_mut().filter(|i| i.is_object()).for_each(&mut f);
    }
}

fn default_ports(v: &mut Json, path: &[&str], protocol: &str) {
    each_in_array(v, path, |port| tree::set_default(port, &["protocol"], json!(protocol)));
}

fn default_service(d: &Defaults, v: &mut Json) { default_ports(v, &["spec", "ports"], &d.protocol); }

fn default_probe(p: &ProbeDefaults, probe: &mut Json) {
    if !probe.is_object() {
        return;
    }
    tree::set_default(probe, &["failureThreshold"], json!(p.failure_threshold));
    tree::set_default(probe, &["periodSeconds"], json!(p.period_seconds));
    tree::set_default(probe, &["successThreshold"], json!(p.success_threshold));
    tree::set_default(probe, &["timeoutSeconds"], json!(p.timeout_seconds));
    if tree::get_path(probe, &["httpGet"]).map(Json::is_object).unwrap_or(false) {
        tree::set_default(probe, &["httpGet", "scheme"], json!(p.http_scheme));
    }
}

fn default_container(d: &Defaults, c: &mut Json) {
    let p = &d.pod;
    if tree::get_path(c, &["terminationMessagePolicy"]).map(Json::is_null).unwrap_or(true) {
        tree::set_path(c, &["terminationMessagePolicy"], json!(p.termination_message_policy));
        tree::set_default(c, &["terminationMessagePath"], json!(p.termination_message_path));
    }
    default_ports(c, &["ports"], &d.protocol);
    each_in_array(c, &["env"], |env| {
        if tree::get_path(env, &["valueFrom", "fieldRef"]).map(Json::is_object).unwrap_or(false) {
            tree::set_default(env, &["valueFrom", "fieldRef", "apiVersion"], json!(p.field_ref_api_version));
        }
    });
    tree::set_default(c, &["imagePullPolicy"], json!(p.image_pull_policy));
    for probe in ["livenessProbe", "readinessProbe"] {
        if let Some(pr) = c.get_mut(probe) {
            default_probe(&p.probe, pr);
        }
    }
}

fn default_pod_template(d: &Defaults, v: &mut Json) {
    let Some(spec) = tree::get_path_mut(v, &["spec", "template", "spec"]).filter(|s| s.is_object()) else { return };
    let p = &d.pod;
    each_in_array(spec, &["containers"], |c| default_container(d, c));
    each_in_array(spec, &["initContainers"], |c| default_container(d, c));
    each_in_array(spec, &["volumes"], |vol| {
        for source in ["configMap", "secret"] {
            if vol.get(source).map(Json::is_object).unwrap_or(false) {
                tree::set_default(vol, &[source, "defaultMode"], json!(p.volume_default_mode));
            }
        }
    });
    tree::set_default(spec, &["terminationGracePeriodSeconds"], json!(p.termination_grace_period_seconds));

    let sa_name = tree::str_at(spec, &["serviceAccountName"]).unwrap_or_default().to_string();
    let sa = tree::str_at(spec, &["serviceAccount"]).unwrap_or_default().to_string();
    if !sa_name.is_empty() && sa_name != sa {
        tree::set_path(spec, &["serviceAccount"], json!(sa_name));
    } else if !sa.is_empty() && sa_name != sa {
        tree::set_path(spec, &["serviceAccountName"], json!(sa));
    }

    tree::set_default(spec, &["dnsPolicy"], json!(p.dns_policy));
    tree::set_default(spec, &["restartPolicy"], json!(p.restart_policy));
    tree::set_default(spec, &["schedulerName"], json!(p.scheduler_name));
    tree::set_default(spec, &["securityContext"], json!({}));
}

fn default_deployment(d: &Defaults, v: &mut Json) {
    tree::set_default(v, &["spec", "progressDeadlineSeconds"], json!(d.progress_deadline_seconds));
    tree::set_default(v, &["spec", "revisionHistoryLimit"], json!(d.revision_history_limit));
    if tree::get_path(v, &["spec", "strategy", "type"]).map(Json::is_null).unwrap_or(true) {
        tree::set_path(
            v,
            &["spec", "strategy"],
            json!({"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": d.max_unavailable, "maxSurge": d.max_surge}}),
        );
    }
    default_pod_template(d, v);
}

fn default_daemonset(d: &Defaults, v: &mut Json) {
    tree::set_default(v, &["spec", "revisionHistoryLimit"], json!(d.revision_history_limit));
    if tree::get_path(v, &["spec", "updateStrategy", "type"]).map(Json::is_null).unwrap_or(true) {
        tree::set_path(
            v,
            &["spec", "updateStrategy"],
            json!({"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": d.daemonset_max_unavailable}}),
        );
    }
    default_pod_template(d, v);
}

fn default_statefulset(d: &Defaults, v: &mut Json) {
    tree::set_default(v, &["spec", "revisionHistoryLimit"], json!(d.revision_history_limit));
    tree::set_default(v, &["spec", "podManagementPolicy"], json!(d.pod_management_policy));
    if tree::get_path(v, &["spec", "updateStrategy", "type"]).map(Json::is_null).unwrap_or(true) {
        tree::set_path(v, &["spec", "updateStrategy"], json!({"type": "RollingUpdate", "rollingUpdate": {"partition": 0}}));
    }
    default_pod_template(d, v);
}

fn default_binding(d: &Defaults, v: &mut Json) {
    each_in_array(v, &["subjects"], |s| {
        let kind = tree::kind(s).map(str::to_string);
        match kind.as_deref() {
            Some("ServiceAccount") => {
                tree::remove_path(s, &["apiGroup"]);
            }
            Some("User") | Some("Group") => {
                tree::set_path(s, &["apiGroup"], json!(d.rbac_api_group));
            }
            _ => {}
        }
    });
}

fn default_crd(_: &Defaults, v: &mut Json) {
    if tree::get_path(v, &["spec", "conversion"]).map(Json::is_null).unwrap_or(true) {
        tree::set_path(v, &["spec", "conversion"], json!({"strategy": "None"}));
    }
    if let Some(kind) = tree::str_at(v, &["spec", "names", "kind"]).map(str::to_string) {
        tree::set_default(v, &["spec", "names", "listKind"], json!(format!("{}List", kind)));
    }
    let has_versions = tree::get_path(v, &["spec", "versions"]).and_then(Json::as_array).map(|a| !a.is_empty()).unwrap_or(false);
    if !has_versions {
        if let Some(version) = tree::str_at(v, &["spec", "version"]).map(str::to_string) {
            tree::set_path(v, &["spec", "versions"], json!([{"name": version, "served": true, "storage": true}]));
        }
    }
    if tree::api_version(v) == Some("apiextensions.k8s.io/v1beta1") {
        tree::set_default(v, &["spec", "preserveUnknownFields"], json!(true));
    }
}
