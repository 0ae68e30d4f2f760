//! Converge core types: resource references, outcomes, verdicts and the
//! schema-less attribute tree helpers shared by apply/ops.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod tree;

pub use config::ConvergeConfig;
pub use error::AccessError;
pub use tree::Json;

/// Identifies one resource in the accessor's universe.
///
/// `namespace` is empty for cluster-scoped kinds. `api_version` is optional:
/// when empty the accessor resolves the type by kind name alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { api_version: String::new(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Build a reference from the well-known fields of a tree.
    /// Returns None when `kind` or `metadata.name` is missing.
    pub fn from_tree(v: &Json) -> Option<Self> {
        let kind = tree::kind(v)?;
        let name = tree::name(v)?;
        Some(Self {
            api_version: tree::api_version(v).unwrap_or_default().to_string(),
            kind: kind.to_string(),
            namespace: tree::namespace(v).unwrap_or_default().to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Resolved API location for a kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeInfo {
    pub api_version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

/// What a single reconciliation did. Observability only; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Replaced,
    Unchanged,
    Skipped,
    /// Last entry of a partial report; carries the rendered error chain.
    Failed(String),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Created => f.write_str("created"),
            Outcome::Updated => f.write_str("configured"),
            Outcome::Replaced => f.write_str("replaced"),
            Outcome::Unchanged => f.write_str("unchanged"),
            Outcome::Skipped => f.write_str("skipped"),
            Outcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Readiness verdict: `message` is empty when ready and describes progress otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub ready: bool,
    pub message: String,
}

impl Verdict {
    pub fn ready() -> Self { Self { ready: true, message: String::new() } }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self { ready: false, message: message.into() }
    }
}

pub mod prelude {
    pub use super::{AccessError, ConvergeConfig, Json, Outcome, ResourceRef, TypeInfo, Verdict};
    pub use super::tree;
}
