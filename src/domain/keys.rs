//! Key layout of the shared state store.
//!
//! `leader/*` keys are written only by the current leader, `status/<agent>`
//! and `metrics/<agent>` only by the agent they name.

pub(crate) const TARGET: &str = "leader/target";
pub(crate) const HEALTH: &str = "leader/health";
pub(crate) const STATUS_PREFIX: &str = "status/";
pub(crate) const METRICS_PREFIX: &str = "metrics/";

pub(crate) fn status(agent_id: &str) -> String {
    format!("{}{}", STATUS_PREFIX, agent_id)
}

pub(crate) fn metrics(agent_id: &str) -> String {
    format!("{}{}", METRICS_PREFIX, agent_id)
}
