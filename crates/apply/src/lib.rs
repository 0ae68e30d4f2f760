//! Converge apply: normalize desired manifests, detect changes against live
//! state, and drive create/update/replace through the accessor.

#![forbid(unsafe_code)]

pub mod diff;
pub mod normalize;
pub mod reconciler;
pub mod registration;
pub mod retry;
pub mod rules;

pub use diff::{has_changed, Change, DiffSummary};
pub use normalize::{Defaults, Normalizer};
pub use reconciler::{ApplyHook, ApplyReport, Reconciler};
pub use registration::{wait_for_kind_registration, RegistrationError};
pub use retry::{retry_while, RetryPolicy};
pub use rules::{CarryForward, KindRules, ReplaceTrigger};
