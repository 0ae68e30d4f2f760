//! Runtime knobs, read from `CONVERGE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvergeConfig {
    /// Normalize and log, never mutate; readiness waits return immediately.
    pub dry_run: bool,
    pub registration_timeout_secs: u64,
    pub conflict_retries: u32,
    /// Upper bound of the uniform jitter slept between conflict retries.
    pub conflict_backoff_max_ms: u64,
    pub wait_poll_ms: u64,
    pub evict_timeout_secs: u64,
    pub pvc_delete_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Annotations that keep their live value once set.
    pub sticky_annotations: Vec<String>,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            registration_timeout_secs: 180,
            conflict_retries: 3,
            conflict_backoff_max_ms: 5000,
            wait_poll_ms: 1000,
            evict_timeout_secs: 120,
            pvc_delete_timeout_secs: 120,
            probe_timeout_secs: 30,
            sticky_annotations: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl ConvergeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dry_run: env_flag("CONVERGE_DRY_RUN").unwrap_or(d.dry_run),
            registration_timeout_secs: env_parse("CONVERGE_REGISTRATION_TIMEOUT_SECS").unwrap_or(d.registration_timeout_secs),
            conflict_retries: env_parse("CONVERGE_CONFLICT_RETRIES").unwrap_or(d.conflict_retries),
            conflict_backoff_max_ms: env_parse("CONVERGE_CONFLICT_BACKOFF_MAX_MS").unwrap_or(d.conflict_backoff_max_ms),
            wait_poll_ms: env_parse("CONVERGE_WAIT_POLL_MS").unwrap_or(d.wait_poll_ms),
            evict_timeout_secs: env_parse("CONVERGE_EVICT_TIMEOUT_SECS").unwrap_or(d.evict_timeout_secs),
            pvc_delete_timeout_secs: env_parse("CONVERGE_PVC_DELETE_TIMEOUT_SECS").unwrap_or(d.pvc_delete_timeout_secs),
            probe_timeout_secs: env_parse("CONVERGE_PROBE_TIMEOUT_SECS").unwrap_or(d.probe_timeout_secs),
            sticky_annotations: std::env::var("CONVERGE_STICKY_ANNOTATIONS")
                .ok()
                .map(|s| split_list(&s))
                .unwrap_or(d.sticky_annotations),
        }
    }

    pub fn registration_timeout(&self) -> Duration { Duration::from_secs(self.registration_timeout_secs) }
    pub fn conflict_backoff_max(&self) -> Duration { Duration::from_millis(self.conflict_backoff_max_ms) }
    pub fn wait_poll(&self) -> Duration { Duration::from_millis(self.wait_poll_ms.max(1)) }
    pub fn evict_timeout(&self) -> Duration { Duration::from_secs(self.evict_timeout_secs) }
    pub fn pvc_delete_timeout(&self) -> Duration { Duration::from_secs(self.pvc_delete_timeout_secs) }
    pub fn probe_timeout(&self) -> Duration { Duration::from_secs(self.probe_timeout_secs) }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}
