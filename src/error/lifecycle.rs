use thiserror::Error;

use crate::domain::{Command, LifecyclePhase};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Cannot {command} while the target phase is {target}.")]
    InvalidTransition {
        command: Command,
        target: LifecyclePhase,
    },
    #[error("Benchmark config is fixed for cycle {cycle}; '{field}' differs from the agreed value.")]
    ConfigConflict { cycle: u64, field: &'static str },
    #[error("Prepare requires a benchmark config.")]
    MissingConfig,
    #[error("This agent is not the leader (leader: {leader}).")]
    NotLeader { leader: String },
    #[error("No leader is currently known.")]
    NoLeader,
    #[error("Timed out waiting for the leader lock.")]
    LeaderBusy,
    #[error("Illegal phase change {from} -> {to}.")]
    IllegalPhaseChange {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
    #[error("Leader at {addr} could not be reached: {reason}")]
    LeaderUnreachable { addr: String, reason: String },
    #[error("Leader rejected the command: {reason}")]
    Rejected { reason: String },
}
