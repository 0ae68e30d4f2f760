//! Narrow accessors over schema-less attribute trees (`serde_json::Value`).
//!
//! Only the handful of well-known fields get named helpers; everything else is
//! addressed by path so kind-specific logic can stay table-driven.

use serde_json::Map;

pub type Json = serde_json::Value;

/// Server-assigned identity fields under `metadata`.
pub const IDENTITY_FIELDS: &[&str] = &["resourceVersion", "selfLink", "uid", "creationTimestamp", "generation"];

pub fn kind(v: &Json) -> Option<&str> { v.get("kind").and_then(|k| k.as_str()) }

pub fn api_version(v: &Json) -> Option<&str> { v.get("apiVersion").and_then(|k| k.as_str()) }

pub fn name(v: &Json) -> Option<&str> { str_at(v, &["metadata", "name"]) }

pub fn namespace(v: &Json) -> Option<&str> {
    str_at(v, &["metadata", "namespace"]).filter(|s| !s.is_empty())
}

pub fn resource_version(v: &Json) -> Option<&str> {
    str_at(v, &["metadata", "resourceVersion"]).filter(|s| !s.is_empty())
}

pub fn annotations(v: &Json) -> Option<&Map<String, Json>> {
    get_path(v, &["metadata", "annotations"]).and_then(|a| a.as_object())
}

pub fn labels(v: &Json) -> Option<&Map<String, Json>> {
    get_path(v, &["metadata", "labels"]).and_then(|a| a.as_object())
}

pub fn label<'a>(v: &'a Json, key: &str) -> Option<&'a str> {
    labels(v).and_then(|l| l.get(key)).and_then(|s| s.as_str())
}

pub fn owner_references(v: &Json) -> &[Json] {
    get_path(v, &["metadata", "ownerReferences"])
        .and_then(|o| o.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

/// `status.conditions`, or None when the status block or the list is absent.
pub fn conditions(v: &Json) -> Option<&Vec<Json>> {
    get_path(v, &["status", "conditions"]).and_then(|c| c.as_array())
}

pub fn get_path<'a>(v: &'a Json, path: &[&str]) -> Option<&'a Json> {
    let mut cur = v;
    for seg in path {
        cur = cur.as_object()?.get(*seg)?;
    }
    Some(cur)
}

pub fn get_path_mut<'a>(v: &'a mut Json, path: &[&str]) -> Option<&'a mut Json> {
    let mut cur = v;
    for seg in path {
        cur = cur.as_object_mut()?.get_mut(*seg)?;
    }
    Some(cur)
}

pub fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> { get_path(v, path).and_then(|s| s.as_str()) }

pub fn i64_at(v: &Json, path: &[&str]) -> Option<i64> { get_path(v, path).and_then(|n| n.as_i64()) }

pub fn bool_at(v: &Json, path: &[&str]) -> Option<bool> { get_path(v, path).and_then(|b| b.as_bool()) }

/// Set `value` at `path`, creating intermediate maps. Non-map intermediates are
/// replaced. A non-object root is left untouched and `false` is returned.
pub fn set_path(v: &mut Json, path: &[&str], value: Json) -> bool {
    let Some((last, parents)) = path.split_last() else { return false };
    let mut cur = v;
    for seg in parents {
        let Some(obj) = cur.as_object_mut() else { return false };
        let next = obj.entry(seg.to_string()).or_insert_with(|| Json::Object(Map::new()));
        if !next.is_object() {
            *next = Json::Object(Map::new());
        }
        cur = next;
    }
    match cur.as_object_mut() {
        Some(obj) => { obj.insert(last.to_string(), value); true }
        None => false,
    }
}

/// Set `value` at `path` only when the field is absent or null.
pub fn set_default(v: &mut Json, path: &[&str], value: Json) {
    if get_path(v, path).map(|x| x.is_null()).unwrap_or(true) {
        set_path(v, path, value);
    }
}

pub fn remove_path(v: &mut Json, path: &[&str]) -> Option<Json> {
    let (last, parents) = path.split_last()?;
    get_path_mut(v, parents)?.as_object_mut()?.remove(*last)
}

pub fn set_annotation(v: &mut Json, key: &str, value: Json) {
    set_path(v, &["metadata", "annotations", key], value);
}

/// Reset server-assigned identity so the tree can be submitted as a fresh create.
pub fn strip_identifiers(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for f in IDENTITY_FIELDS {
            meta.remove(*f);
        }
    }
}

/// True when `metadata.deletionTimestamp` is set.
pub fn is_terminating(v: &Json) -> bool {
    get_path(v, &["metadata", "deletionTimestamp"]).map(|t| !t.is_null()).unwrap_or(false)
}

/// Controller owner, falling back to the first owner when none is flagged controller.
pub fn controller_of(v: &Json) -> Option<&Json> {
    let owners = owner_references(v);
    owners
        .iter()
        .find(|o| o.get("controller").and_then(|c| c.as_bool()).unwrap_or(false))
        .or_else(|| owners.first())
}
