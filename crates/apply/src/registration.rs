//! Waiting for a resource kind to be served by the cluster.

use std::time::Duration;

use converge_core::AccessError;
use converge_kubehub::{gvk_key, Accessor};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("timed out after {waited:?} waiting for kind {kind} to be registered")]
    Timeout { kind: String, waited: Duration },
    #[error(transparent)]
    Access(#[from] AccessError),
}

fn is_served(kinds: &[String], api_version: &str, kind: &str) -> bool {
    if api_version.is_empty() {
        let suffix = format!("/{}", kind);
        kinds.iter().any(|k| k.ends_with(&suffix))
    } else {
        let key = gvk_key(api_version, kind);
        kinds.iter().any(|k| *k == key)
    }
}

/// Poll the served kind list until `kind` shows up. The accessor's type cache
/// is dropped whenever the list changes so later resolutions see new kinds.
pub async fn wait_for_kind_registration(
    accessor: &dyn Accessor,
    api_version: &str,
    kind: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<(), RegistrationError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last: Option<Vec<String>> = None;
    loop {
        let kinds = accessor.registered_kinds().await?;
        if last.as_ref().map(|l| *l != kinds).unwrap_or(false) {
            debug!(kind = %kind, "served kinds changed");
            accessor.invalidate();
        }
        if is_served(&kinds, api_version, kind) {
            accessor.invalidate();
            info!(kind = %kind, api_version = %api_version, waited_ms = started.elapsed().as_millis() as u64, "kind registered");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RegistrationError::Timeout { kind: kind.to_string(), waited: started.elapsed() });
        }
        if last.is_none() {
            info!(kind = %kind, api_version = %api_version, "waiting for kind to be registered");
        }
        last = Some(kinds);
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_kubehub::MockCluster;

    #[tokio::test(start_paused = true)]
    async fn returns_once_kind_appears() {
        let m = MockCluster::new();
        m.register_kind_after(3, "example.com/v1", "Widget", "widgets", true);
        wait_for_kind_registration(&m, "example.com/v1", "Widget", Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(m.resolve("example.com/v1", "Widget").await.is_ok());
        assert!(m.invalidations() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_kind_never_appears() {
        let m = MockCluster::new();
        let err = wait_for_kind_registration(&m, "", "Gadget", Duration::from_secs(3), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Timeout { .. }));
    }

    #[test]
    fn served_matches_by_kind_when_version_empty() {
        let kinds = vec!["apps/v1/Deployment".to_string()];
        assert!(is_served(&kinds, "", "Deployment"));
        assert!(is_served(&kinds, "apps/v1", "Deployment"));
        assert!(!is_served(&kinds, "apps/v2", "Deployment"));
    }
}
