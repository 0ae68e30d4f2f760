//! Error taxonomy for calls against the cluster API.

use serde::{Deserialize, Serialize};

/// Message fragment the API server uses for optimistic-concurrency conflicts.
pub const CONFLICT_HINT: &str = "please apply your changes to the latest version and try again";

const TYPE_MISSING_HINTS: &[&str] = &["the server could not find the requested resource", "no matches for kind"];

/// Errors surfaced by a resource accessor.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource type not registered: {0}")]
    Unregistered(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("exec failed: {0}")]
    Exec(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl AccessError {
    pub fn message(&self) -> &str {
        match self {
            AccessError::NotFound(m)
            | AccessError::Unregistered(m)
            | AccessError::Conflict(m)
            | AccessError::AlreadyExists(m)
            | AccessError::Exec(m)
            | AccessError::Transport(m) => m,
            AccessError::Api { message, .. } => message,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, AccessError::NotFound(_)) }

    /// Optimistic-concurrency conflict: the submitted resourceVersion was stale.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AccessError::Conflict(_)) || self.message().contains(CONFLICT_HINT)
    }

    /// The kind is not (yet) served by the cluster.
    pub fn is_type_missing(&self) -> bool {
        match self {
            AccessError::Unregistered(_) => true,
            AccessError::NotFound(m) | AccessError::Api { message: m, .. } => is_type_missing_message(m),
            _ => false,
        }
    }
}

/// Mirrors the messages the API server and REST mappers emit for unknown kinds.
pub fn is_type_missing_message(msg: &str) -> bool {
    TYPE_MISSING_HINTS.iter().any(|h| msg.contains(h)) || (msg.contains("is not recognized") && msg.contains("kind"))
}
