//! Converge public API façade (in-process).
//!
//! Callers such as a CLI or a controller loop depend on `ConvergeApi` only.
//! `InProcessApi` wires the reconciler, the readiness evaluator and the
//! drainer over one accessor.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_apply::{wait_for_kind_registration, ApplyHook, Reconciler, RegistrationError};
use converge_core::{AccessError, ConvergeConfig, Json, Outcome, ResourceRef};
use converge_kubehub::{Accessor, Evictor, KubeAccessor, PodExec};
use converge_ops::{wait::STATUS_POLL, wait_for_namespace, wait_for_resource, DrainReport, Drainer, Evaluator, WaitError};
use serde::{Deserialize, Serialize};
use tracing::info;

/// API errors suitable for transport to callers.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConvergeError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unregistered: {0}")]
    Unregistered(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ConvergeResult<T> = Result<T, ConvergeError>;

impl ConvergeError {
    fn from_access(e: &AccessError, message: String) -> Self {
        if e.is_conflict() {
            ConvergeError::Conflict(message)
        } else if e.is_type_missing() {
            ConvergeError::Unregistered(message)
        } else if e.is_not_found() {
            ConvergeError::NotFound(message)
        } else {
            ConvergeError::Internal(message)
        }
    }
}

impl From<anyhow::Error> for ConvergeError {
    fn from(e: anyhow::Error) -> Self {
        let message = format!("{:#}", e);
        if let Some(w) = e.downcast_ref::<WaitError>() {
            return ConvergeError::from(w);
        }
        if let Some(RegistrationError::Timeout { .. }) = e.downcast_ref::<RegistrationError>() {
            return ConvergeError::Timeout(message);
        }
        match e.downcast_ref::<AccessError>() {
            Some(a) => ConvergeError::from_access(a, message),
            None => ConvergeError::Internal(message),
        }
    }
}

impl From<&WaitError> for ConvergeError {
    fn from(e: &WaitError) -> Self {
        match e {
            WaitError::Timeout { .. } => ConvergeError::Timeout(e.to_string()),
            WaitError::Access(a) => ConvergeError::from_access(a, e.to_string()),
        }
    }
}

impl From<RegistrationError> for ConvergeError {
    fn from(e: RegistrationError) -> Self {
        match &e {
            RegistrationError::Timeout { .. } => ConvergeError::Timeout(e.to_string()),
            RegistrationError::Access(a) => ConvergeError::from_access(a, e.to_string()),
        }
    }
}

/// The operations exposed to callers.
#[async_trait::async_trait]
pub trait ConvergeApi: Send + Sync {
    /// Converge each manifest in order; the first fatal error aborts the batch.
    async fn apply(&self, namespace: &str, manifests: &[Json]) -> ConvergeResult<Vec<Outcome>>;

    /// Poll until the resource is ready. Returns the last live object (None in dry-run).
    async fn wait_for_resource(&self, kind: &str, namespace: &str, name: &str, timeout: Duration) -> ConvergeResult<Option<Json>>;

    /// Block until `kind` is served. `kind` may be qualified as `group/version/Kind`.
    async fn wait_for_kind_registration(&self, kind: &str, timeout: Duration) -> ConvergeResult<()>;

    /// Block until the namespace has pods and none of them are pending.
    async fn wait_for_namespace(&self, namespace: &str, timeout: Duration) -> ConvergeResult<()>;

    async fn drain(&self, node: &str, timeout: Duration) -> ConvergeResult<DrainReport>;

    async fn cordon(&self, node: &str) -> ConvergeResult<()>;

    async fn uncordon(&self, node: &str) -> ConvergeResult<()>;
}

/// Split an optionally qualified kind into (apiVersion, Kind).
fn split_kind(kind: &str) -> (&str, &str) {
    match kind.rsplit_once('/') {
        Some((api_version, k)) => (api_version, k),
        None => ("", kind),
    }
}

/// In-process implementation that calls the internal crates directly.
pub struct InProcessApi {
    accessor: Arc<dyn Accessor>,
    reconciler: Reconciler,
    evaluator: Evaluator,
    drainer: Drainer,
    cfg: ConvergeConfig,
}

impl InProcessApi {
    pub fn new(accessor: Arc<dyn Accessor>, exec: Arc<dyn PodExec>, evictor: Arc<dyn Evictor>, cfg: ConvergeConfig) -> Self {
        Self {
            reconciler: Reconciler::new(accessor.clone(), &cfg),
            evaluator: Evaluator::new(accessor.clone(), exec.clone(), cfg.probe_timeout()),
            drainer: Drainer::new(accessor.clone(), exec, evictor, &cfg),
            accessor,
            cfg,
        }
    }

    /// Connect with the default kube client and `CONVERGE_*` settings.
    pub async fn from_kube() -> anyhow::Result<Self> {
        let kube = Arc::new(KubeAccessor::try_default().await?);
        Ok(Self::new(kube.clone(), kube.clone(), kube, ConvergeConfig::from_env()))
    }

    pub fn with_apply_hook(mut self, hook: ApplyHook) -> Self {
        self.reconciler = self.reconciler.with_hook(hook);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_drainer(mut self, drainer: Drainer) -> Self {
        self.drainer = drainer;
        self
    }

    pub fn config(&self) -> &ConvergeConfig { &self.cfg }
}

#[async_trait::async_trait]
impl ConvergeApi for InProcessApi {
    async fn apply(&self, namespace: &str, manifests: &[Json]) -> ConvergeResult<Vec<Outcome>> {
        let t0 = Instant::now();
        info!(ns = %namespace, count = manifests.len(), dry_run = self.cfg.dry_run, "api: apply start");
        let outcomes = self.reconciler.apply(namespace, manifests).await?;
        info!(ns = %namespace, took_ms = %t0.elapsed().as_millis(), "api: apply ok");
        Ok(outcomes)
    }

    async fn wait_for_resource(&self, kind: &str, namespace: &str, name: &str, timeout: Duration) -> ConvergeResult<Option<Json>> {
        let (api_version, kind) = split_kind(kind);
        let r = ResourceRef::new(kind, namespace, name).with_api_version(api_version);
        wait_for_resource(&self.evaluator, &r, timeout, self.cfg.wait_poll(), self.cfg.dry_run)
            .await
            .map_err(|e| ConvergeError::from(&e))
    }

    async fn wait_for_kind_registration(&self, kind: &str, timeout: Duration) -> ConvergeResult<()> {
        let (api_version, kind) = split_kind(kind);
        wait_for_kind_registration(self.accessor.as_ref(), api_version, kind, timeout, self.cfg.wait_poll()).await?;
        Ok(())
    }

    async fn wait_for_namespace(&self, namespace: &str, timeout: Duration) -> ConvergeResult<()> {
        wait_for_namespace(self.accessor.as_ref(), namespace, timeout, STATUS_POLL, self.cfg.dry_run)
            .await
            .map_err(|e| ConvergeError::from(&e))
    }

    async fn drain(&self, node: &str, timeout: Duration) -> ConvergeResult<DrainReport> {
        let t0 = Instant::now();
        info!(node = %node, timeout_secs = timeout.as_secs(), "api: drain start");
        let report = self.drainer.drain(node, timeout).await?;
        info!(node = %node, evicted = report.evicted.len(), took_ms = %t0.elapsed().as_millis(), "api: drain ok");
        Ok(report)
    }

    async fn cordon(&self, node: &str) -> ConvergeResult<()> {
        self.drainer.cordon(node).await?;
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> ConvergeResult<()> {
        self.drainer.uncordon(node).await?;
        Ok(())
    }
}
