//! Change detection between a live object and the working desired copy.
//!
//! Both sides are sanitized the same way and compared structurally. The YAML
//! line diff is display-only and rendered on demand through [`Change::diff`].

use converge_core::{tree, Json};
use serde::{Deserialize, Serialize};

use crate::normalize::strip_bookkeeping;

/// Line-diff inputs above this many line pairs fall back to a summary.
const MAX_DIFF_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Change {
    pub changed: bool,
    pub summary: DiffSummary,
    /// Sanitized (live, desired), kept only when they differ.
    sides: Option<(Json, Json)>,
}

impl Change {
    /// Human-readable line diff from live to desired; empty when unchanged.
    pub fn diff(&self) -> String {
        match &self.sides {
            Some((live, desired)) => line_diff(&to_yaml(live), &to_yaml(desired)),
            None => String::new(),
        }
    }

    pub fn sides(&self) -> Option<(&Json, &Json)> { self.sides.as_ref().map(|(a, b)| (a, b)) }
}

/// Drop every field the comparison ignores: bookkeeping, noisy annotations,
/// `status`, and the pod-template creation timestamp.
pub fn sanitize(v: &Json, noisy_annotations: &[String]) -> Json {
    let mut out = v.clone();
    strip_bookkeeping(&mut out, noisy_annotations);
    tree::remove_path(&mut out, &["status"]);
    tree::remove_path(&mut out, &["spec", "template", "metadata", "creationTimestamp"]);
    out
}

pub fn has_changed(live: &Json, desired: &Json, noisy_annotations: &[String]) -> Change {
    let a = sanitize(live, noisy_annotations);
    let b = sanitize(desired, noisy_annotations);
    if a == b {
        return Change::default();
    }
    let summary = diff_summary(&b, &a);
    Change { changed: true, summary, sides: Some((a, b)) }
}

fn to_yaml(v: &Json) -> String { serde_yaml::to_string(v).unwrap_or_else(|_| v.to_string()) }

/// `-`/`+` lines from an LCS alignment of the two texts.
pub fn line_diff(from: &str, to: &str) -> String {
    let a: Vec<&str> = from.lines().collect();
    let b: Vec<&str> = to.lines().collect();
    if a.len().saturating_mul(b.len()) > MAX_DIFF_CELLS {
        return format!("--- live ({} lines)\n+++ desired ({} lines)\n", a.len(), b.len());
    }
    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] { lcs[i + 1][j + 1] + 1 } else { lcs[i + 1][j].max(lcs[i][j + 1]) };
        }
    }
    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            out.push_str(&format!("- {}\n", a[i]));
            i += 1;
        } else {
            out.push_str(&format!("+ {}\n", b[j]));
            j += 1;
        }
    }
    for line in &a[i..] {
        out.push_str(&format!("- {}\n", line));
    }
    for line in &b[j..] {
        out.push_str(&format!("+ {}\n", line));
    }
    out
}

/// Count keys added, scalars updated and keys removed going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::NOISY_ANNOTATIONS;
    use serde_json::json;

    fn noisy() -> Vec<String> { NOISY_ANNOTATIONS.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn noise_only_differences_are_unchanged() {
        let desired = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cm", "namespace": "ns"},
            "data": {"k": "v"}
        });
        let live = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {
                "name": "cm", "namespace": "ns", "uid": "abc", "resourceVersion": "12", "selfLink": "/api/v1/cm",
                "generation": 4, "creationTimestamp": "2021-01-01T00:00:00Z",
                "managedFields": [{"manager": "x"}], "ownerReferences": [{"kind": "Foo", "name": "f"}],
                "annotations": {"deployment.kubernetes.io/revision": "3"}
            },
            "data": {"k": "v"},
            "status": {"observedGeneration": 4}
        });
        let c = has_changed(&live, &desired, &noisy());
        assert!(!c.changed);
        assert!(c.sides().is_none());
        assert!(c.diff().is_empty());
        assert!(!has_changed(&desired, &live, &noisy()).changed);
    }

    #[test]
    fn template_timestamp_is_ignored() {
        let a = json!({"kind": "Deployment", "metadata": {"name": "d"}, "spec": {"template": {"metadata": {"creationTimestamp": null}}}});
        let b = json!({"kind": "Deployment", "metadata": {"name": "d"}, "spec": {"template": {"metadata": {}}}});
        assert!(!has_changed(&a, &b, &noisy()).changed);
    }

    #[test]
    fn real_change_produces_diff_text() {
        let live = json!({"kind": "ConfigMap", "metadata": {"name": "cm"}, "data": {"k": "v"}});
        let desired = json!({"kind": "ConfigMap", "metadata": {"name": "cm"}, "data": {"k": "w"}});
        let c = has_changed(&live, &desired, &noisy());
        assert!(c.changed);
        let text = c.diff();
        assert!(text.contains("-   k: v"), "{}", text);
        assert!(text.contains("+   k: w"), "{}", text);
        assert_eq!(c.summary.updates, 1);
    }

    #[test]
    fn change_keeps_sanitized_sides_for_later_rendering() {
        let live = json!({"kind": "ConfigMap", "metadata": {"name": "cm", "uid": "u-1"}, "data": {"k": "v"}, "status": {"x": 1}});
        let desired = json!({"kind": "ConfigMap", "metadata": {"name": "cm"}, "data": {"k": "w"}});
        let c = has_changed(&live, &desired, &noisy());
        let (l, d) = c.sides().expect("changed objects keep both sides");
        assert!(tree::get_path(l, &["metadata", "uid"]).is_none());
        assert!(tree::get_path(l, &["status"]).is_none());
        assert_eq!(d, &desired);
        assert_eq!(c.diff(), c.diff());
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }

    #[test]
    fn line_diff_keeps_common_lines_out() {
        let d = line_diff("a\nb\nc\n", "a\nx\nc\n");
        assert_eq!(d, "- b\n+ x\n");
    }
}
