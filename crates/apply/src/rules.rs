//! Per-kind reconciliation data: which live fields are carried into the
//! desired copy, which update failures force a delete+create, and which kinds
//! skip diffing. Held as data so callers can extend or override it.

use std::collections::{HashMap, HashSet};

use converge_core::{tree, AccessError, Json};
use serde::{Deserialize, Serialize};

/// Server identity copied from live before every update.
const IDENTITY_PATHS: &[&str] = &[
    "metadata.resourceVersion",
    "metadata.selfLink",
    "metadata.uid",
    "metadata.creationTimestamp",
    "metadata.generation",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CarryForward {
    /// Desired takes the live value at each dotted path, or loses the field when live lacks it.
    Overwrite(Vec<String>),
    /// Desired takes the live value only where live has one.
    IfPresent(Vec<String>),
    /// Live `spec` replaces desired `spec`, keeping desired `spec.resources.requests`.
    /// A no-op when desired sets no requests.
    LiveSpecKeepRequests,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaceTrigger {
    pub kinds: Vec<String>,
    /// Error message fragment that marks the update as impossible in place.
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindRules {
    pub carry_forward: HashMap<String, CarryForward>,
    pub replace_triggers: Vec<ReplaceTrigger>,
    pub sticky_annotations: Vec<String>,
    /// Kinds never diffed; they are always sent as an update.
    pub diff_excluded: HashSet<String>,
}

fn paths(p: &[&str]) -> Vec<String> { p.iter().map(|s| s.to_string()).collect() }

impl Default for KindRules {
    fn default() -> Self {
        let mut carry_forward = HashMap::new();
        carry_forward.insert(
            "Service".to_string(),
            CarryForward::Overwrite(paths(&[
                "spec.clusterIP",
                "spec.clusterIPs",
                "spec.ipFamilies",
                "spec.ipFamilyPolicy",
                "spec.type",
                "spec.sessionAffinity",
            ])),
        );
        carry_forward.insert("ServiceAccount".to_string(), CarryForward::Overwrite(paths(&["secrets"])));
        carry_forward.insert("PersistentVolumeClaim".to_string(), CarryForward::LiveSpecKeepRequests);
        carry_forward.insert("Secret".to_string(), CarryForward::Overwrite(paths(&["type"])));
        carry_forward.insert(
            "CustomResourceDefinition".to_string(),
            CarryForward::IfPresent(paths(&["spec.conversion.webhook"])),
        );
        Self {
            carry_forward,
            replace_triggers: vec![
                ReplaceTrigger {
                    kinds: paths(&["Deployment", "DaemonSet", "StatefulSet"]),
                    message: "field is immutable".into(),
                },
                ReplaceTrigger {
                    kinds: paths(&["RoleBinding", "ClusterRoleBinding"]),
                    message: "cannot change roleRef".into(),
                },
            ],
            sticky_annotations: Vec::new(),
            diff_excluded: ["Secret", "CustomResourceDefinition"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn copy_path(live: &Json, to: &mut Json, dotted: &str, remove_missing: bool) {
    let segs: Vec<&str> = dotted.split('.').collect();
    match tree::get_path(live, &segs) {
        Some(v) if !v.is_null() => {
            tree::set_path(to, &segs, v.clone());
        }
        _ if remove_missing => {
            tree::remove_path(to, &segs);
        }
        _ => {}
    }
}

impl KindRules {
    pub fn with_sticky_annotations(mut self, annotations: Vec<String>) -> Self {
        self.sticky_annotations = annotations;
        self
    }

    /// Overlay server-owned and immutable fields from `live` onto `working`.
    pub fn carry_forward(&self, live: &Json, working: &mut Json) {
        let kind = tree::kind(working).unwrap_or_default().to_string();
        match self.carry_forward.get(&kind) {
            Some(CarryForward::Overwrite(ps)) => ps.iter().for_each(|p| copy_path(live, working, p, true)),
            Some(CarryForward::IfPresent(ps)) => ps.iter().for_each(|p| copy_path(live, working, p, false)),
            Some(CarryForward::LiveSpecKeepRequests) => {
                let requests = tree::get_path(working, &["spec", "resources", "requests"]).cloned();
                if let (Some(requests), Some(spec)) = (requests, live.get("spec")) {
                    tree::set_path(working, &["spec"], spec.clone());
                    tree::set_path(working, &["spec", "resources", "requests"], requests);
                }
            }
            None => {}
        }
        for key in &self.sticky_annotations {
            if let Some(v) = tree::annotations(live).and_then(|a| a.get(key)) {
                tree::set_annotation(working, key, v.clone());
            }
        }
        for p in IDENTITY_PATHS {
            copy_path(live, working, p, true);
        }
    }

    /// True when `err` from updating a `kind` object means delete+create is the only way forward.
    pub fn requires_replacement(&self, kind: &str, err: &AccessError) -> bool {
        let msg = err.to_string();
        self.replace_triggers.iter().any(|t| t.kinds.iter().any(|k| k == kind) && msg.contains(&t.message))
    }

    pub fn is_diffable(&self, kind: &str) -> bool { !self.diff_excluded.contains(kind) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn service_keeps_cluster_assigned_fields() {
        let live = json!({"kind": "Service", "metadata": {"name": "s", "resourceVersion": "5", "uid": "u"},
            "spec": {"clusterIP": "10.0.0.7", "type": "ClusterIP", "sessionAffinity": "None", "ports": [{"port": 80}]}});
        let mut working = json!({"kind": "Service", "metadata": {"name": "s"}, "spec": {"ports": [{"port": 81}]}});
        KindRules::default().carry_forward(&live, &mut working);
        assert_eq!(working["spec"]["clusterIP"], "10.0.0.7");
        assert_eq!(working["spec"]["type"], "ClusterIP");
        assert_eq!(working["spec"]["ports"][0]["port"], 81);
        assert_eq!(working["metadata"]["resourceVersion"], "5");
        assert_eq!(working["metadata"]["uid"], "u");
        assert!(working["metadata"].get("generation").is_none());
    }

    #[test]
    fn pvc_takes_live_spec_but_desired_requests() {
        let live = json!({"kind": "PersistentVolumeClaim", "metadata": {"name": "data"},
            "spec": {"volumeName": "pv-1", "storageClassName": "local", "resources": {"requests": {"storage": "1Gi"}}}});
        let mut working = json!({"kind": "PersistentVolumeClaim", "metadata": {"name": "data"},
            "spec": {"resources": {"requests": {"storage": "2Gi"}}}});
        KindRules::default().carry_forward(&live, &mut working);
        assert_eq!(working["spec"]["volumeName"], "pv-1");
        assert_eq!(working["spec"]["resources"]["requests"]["storage"], "2Gi");
    }

    #[test]
    fn crd_webhook_only_copied_when_live_has_one() {
        let rules = KindRules::default();
        let mut working = json!({"kind": "CustomResourceDefinition", "metadata": {"name": "w"},
            "spec": {"conversion": {"strategy": "None"}}});
        rules.carry_forward(&json!({"kind": "CustomResourceDefinition", "metadata": {"name": "w"}}), &mut working);
        assert_eq!(working["spec"]["conversion"], json!({"strategy": "None"}));

        let live = json!({"kind": "CustomResourceDefinition", "metadata": {"name": "w"},
            "spec": {"conversion": {"strategy": "Webhook", "webhook": {"clientConfig": {"url": "https://x"}}}}});
        rules.carry_forward(&live, &mut working);
        assert_eq!(working["spec"]["conversion"]["webhook"]["clientConfig"]["url"], "https://x");
    }

    #[test]
    fn sticky_annotations_keep_live_value() {
        let rules = KindRules::default().with_sticky_annotations(vec!["owner".into()]);
        let live = json!({"kind": "ConfigMap", "metadata": {"name": "c", "annotations": {"owner": "operator-a"}}});
        let mut working = json!({"kind": "ConfigMap", "metadata": {"name": "c", "annotations": {"owner": "me", "x": "y"}}});
        rules.carry_forward(&live, &mut working);
        assert_eq!(working["metadata"]["annotations"]["owner"], "operator-a");
        assert_eq!(working["metadata"]["annotations"]["x"], "y");
    }

    #[test]
    fn replacement_requires_matching_kind_and_message() {
        let rules = KindRules::default();
        let immutable = AccessError::Api {
            code: 422,
            reason: "Invalid".into(),
            message: "spec.selector: Invalid value: field is immutable".into(),
        };
        assert!(rules.requires_replacement("Deployment", &immutable));
        assert!(rules.requires_replacement("StatefulSet", &immutable));
        assert!(!rules.requires_replacement("ConfigMap", &immutable));
        let role_ref = AccessError::Api { code: 422, reason: "Invalid".into(), message: "cannot change roleRef".into() };
        assert!(rules.requires_replacement("RoleBinding", &role_ref));
        assert!(!rules.requires_replacement("Deployment", &role_ref));
    }
}
