//! Converge ops: readiness evaluation, polling waits and node drain.

#![forbid(unsafe_code)]

pub mod drain;
pub mod readiness;
pub mod wait;

pub use drain::{skip_reason, DrainConfig, DrainReport, Drainer, SkipReason};
pub use readiness::{namespace_verdict, pod_is_ready, Evaluator, Owned, OwnedWorkloads, ProbedStatefulSet, ReadinessCheck, StatusField};
pub use wait::{
    node_conditions, poll_until, poll_until_with, selector_matches, wait_for_job, wait_for_namespace, wait_for_node, wait_for_pod,
    wait_for_pod_by_label, wait_for_pod_command, wait_for_resource, wait_for_resource_with, wait_for_taint_removal, Poll,
    WaitError,
};
