//! The apply state machine: converge one manifest at a time against the cluster.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use converge_core::{tree, AccessError, ConvergeConfig, Json, Outcome, ResourceRef, TypeInfo};
use converge_kubehub::Accessor;
use metrics::{counter, histogram};
use tracing::{debug, error, info, Level};

use crate::diff;
use crate::normalize::Normalizer;
use crate::registration::wait_for_kind_registration;
use crate::retry::{retry_while, RetryPolicy};
use crate::rules::KindRules;

/// Called with `(namespace, manifest)` after normalization, before any mutating call.
pub type ApplyHook = Arc<dyn Fn(&str, &mut Json) + Send + Sync>;

enum Step {
    Done(Outcome),
    Replace { live: Json, working: Json, cause: AccessError },
}

fn is_conflict(e: &anyhow::Error) -> bool {
    e.downcast_ref::<AccessError>().map(AccessError::is_conflict).unwrap_or(false)
}

/// Per-manifest outcomes of one apply call; ends with `Failed` when `error` is set.
#[derive(Debug)]
pub struct ApplyReport {
    pub outcomes: Vec<Outcome>,
    pub error: Option<anyhow::Error>,
}

impl ApplyReport {
    /// Outcomes on success, the first fatal error otherwise.
    pub fn into_result(self) -> Result<Vec<Outcome>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.outcomes),
        }
    }
}

pub struct Reconciler {
    accessor: Arc<dyn Accessor>,
    normalizer: Normalizer,
    rules: KindRules,
    retry: RetryPolicy,
    registration_timeout: Duration,
    registration_poll: Duration,
    dry_run: bool,
    hook: Option<ApplyHook>,
}

impl Reconciler {
    pub fn new(accessor: Arc<dyn Accessor>, cfg: &ConvergeConfig) -> Self {
        Self {
            accessor,
            normalizer: Normalizer::default(),
            rules: KindRules::default().with_sticky_annotations(cfg.sticky_annotations.clone()),
            retry: RetryPolicy::from_config(cfg),
            registration_timeout: cfg.registration_timeout(),
            registration_poll: cfg.wait_poll(),
            dry_run: cfg.dry_run,
            hook: None,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_rules(mut self, rules: KindRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_hook(mut self, hook: ApplyHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn accessor(&self) -> &Arc<dyn Accessor> { &self.accessor }

    /// Converge every manifest in order. Stops at the first fatal error; work
    /// already committed is left in place.
    pub async fn apply(&self, namespace: &str, manifests: &[Json]) -> Result<Vec<Outcome>> {
        self.apply_report(namespace, manifests).await.into_result()
    }

    /// Like [`apply`](Self::apply), but keeps the outcomes reached before a
    /// failure. The failing manifest is recorded as [`Outcome::Failed`] and the
    /// remaining manifests are not attempted.
    pub async fn apply_report(&self, namespace: &str, manifests: &[Json]) -> ApplyReport {
        let t0 = Instant::now();
        let mut report = ApplyReport { outcomes: Vec::with_capacity(manifests.len()), error: None };
        for manifest in manifests.iter().filter(|m| !m.is_null()) {
            counter!("apply_attempts", 1u64);
            match self.apply_one(namespace, manifest).await {
                Ok(outcome) => {
                    match &outcome {
                        Outcome::Created => { counter!("apply_created", 1u64); }
                        Outcome::Updated => { counter!("apply_updated", 1u64); }
                        Outcome::Replaced => { counter!("apply_replaced", 1u64); }
                        Outcome::Unchanged => { counter!("apply_unchanged", 1u64); }
                        Outcome::Skipped | Outcome::Failed(_) => {}
                    }
                    report.outcomes.push(outcome);
                }
                Err(e) => {
                    counter!("apply_err", 1u64);
                    report.outcomes.push(Outcome::Failed(format!("{:#}", e)));
                    report.error = Some(e);
                    return report;
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        report
    }

    pub async fn apply_one(&self, namespace: &str, manifest: &Json) -> Result<Outcome> {
        let mut desired = self.normalizer.normalize(manifest);
        let r = ResourceRef::from_tree(&desired).ok_or_else(|| anyhow!("manifest is missing kind or metadata.name"))?;
        if let Some(hook) = &self.hook {
            hook(namespace, &mut desired);
        }
        if self.dry_run {
            debug!(resource = %r, "[dry-run] would create or configure");
            return Ok(Outcome::Skipped);
        }

        let ty = self.resolve(&r).await?;
        if ty.namespaced && tree::namespace(&desired).is_none() && !namespace.is_empty() {
            tree::set_path(&mut desired, &["metadata", "namespace"], Json::String(namespace.to_string()));
        }
        let r = ResourceRef::from_tree(&desired).unwrap_or(r).with_api_version(ty.api_version.clone());

        let attempts = AtomicU32::new(0);
        let (attempts, r_ref, desired_ref) = (&attempts, &r, &desired);
        let step = retry_while(&self.retry, "update", is_conflict, move || async move {
            if attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                counter!("apply_conflict_retries", 1u64);
            }
            self.attempt(r_ref, desired_ref).await
        })
        .await?;

        match step {
            Step::Done(outcome) => Ok(outcome),
            Step::Replace { live, working, cause } => self.replace(&r, &live, working, cause).await,
        }
    }

    /// Resolve the kind, waiting out a registration race once.
    async fn resolve(&self, r: &ResourceRef) -> Result<TypeInfo> {
        match self.accessor.resolve(&r.api_version, &r.kind).await {
            Ok(ty) => Ok(ty),
            Err(e) if e.is_type_missing() => {
                self.wait_registered(r).await?;
                self.accessor.resolve(&r.api_version, &r.kind).await.with_context(|| format!("resolving {}", r))
            }
            Err(e) => Err(e).with_context(|| format!("resolving {}", r)),
        }
    }

    async fn wait_registered(&self, r: &ResourceRef) -> Result<()> {
        wait_for_kind_registration(
            self.accessor.as_ref(),
            &r.api_version,
            &r.kind,
            self.registration_timeout,
            self.registration_poll,
        )
        .await
        .with_context(|| format!("waiting for {} to be registered", r.kind))
    }

    async fn fetch_live(&self, r: &ResourceRef) -> Result<Option<Json>> {
        match self.accessor.get(r).await {
            Ok(live) => Ok(live),
            Err(e) if e.is_type_missing() => {
                self.wait_registered(r).await?;
                self.accessor.get(r).await.with_context(|| format!("fetching {}", r))
            }
            Err(e) => Err(e).with_context(|| format!("fetching {}", r)),
        }
    }

    /// One get/compare/write round against a freshly fetched live object.
    async fn attempt(&self, r: &ResourceRef, desired: &Json) -> Result<Step> {
        let mut working = desired.clone();
        let Some(live) = self.fetch_live(r).await? else {
            self.accessor.create(&working).await.with_context(|| format!("creating {}", r))?;
            info!(resource = %r, "created");
            return Ok(Step::Done(Outcome::Created));
        };

        self.rules.carry_forward(&live, &mut working);
        if self.rules.is_diffable(&r.kind) {
            let change = diff::has_changed(&live, &working, self.normalizer.noisy_annotations());
            if !change.changed {
                debug!(resource = %r, "unchanged");
                return Ok(Step::Done(Outcome::Unchanged));
            }
            if tracing::enabled!(Level::DEBUG) {
                debug!(
                    resource = %r,
                    adds = change.summary.adds,
                    updates = change.summary.updates,
                    removes = change.summary.removes,
                    diff = %change.diff(),
                    "changes detected"
                );
            }
        }

        let submitted = tree::resource_version(&working).map(str::to_string);
        match self.accessor.update(&working).await {
            Ok(updated) => {
                if tree::resource_version(&updated).map(str::to_string) == submitted {
                    debug!(resource = %r, "unchanged (server no-op)");
                    Ok(Step::Done(Outcome::Unchanged))
                } else {
                    info!(resource = %r, "configured");
                    Ok(Step::Done(Outcome::Updated))
                }
            }
            Err(e) if self.rules.requires_replacement(&r.kind, &e) => Ok(Step::Replace { live, working, cause: e }),
            Err(e) => Err(e).with_context(|| format!("updating {}", r)),
        }
    }

    /// Delete the live object and create the working copy without server identity.
    async fn replace(&self, r: &ResourceRef, live: &Json, mut working: Json, cause: AccessError) -> Result<Outcome> {
        info!(resource = %r, cause = %cause, "update rejected, replacing");
        let target = ResourceRef::from_tree(live).unwrap_or_else(|| r.clone()).with_api_version(r.api_version.clone());
        if let Err(e) = self.accessor.delete(&target).await {
            error!(resource = %r, error = %e, "delete failed during replacement");
            return Err(e).with_context(|| format!("failed to delete {} during replacement", r));
        }
        tree::strip_identifiers(&mut working);
        if let Err(e) = self.accessor.create(&working).await {
            error!(resource = %r, error = %e, "recreate failed after delete");
            return Err(e)
                .with_context(|| format!("failed to recreate {} during replacement, neither the new nor the old object remain", r));
        }
        info!(resource = %r, "replaced");
        Ok(Outcome::Replaced)
    }
}
