//! Shared data model: lifecycle phases, commands, the agreed benchmark config,
//! and the records agents exchange through the state store.
mod command;
mod config;
pub(crate) mod keys;
mod phase;
mod records;
mod types;


pub use command::Command;
pub use config::{BenchmarkConfig, DatabaseEndpoint, DatabaseKind, DatabaseTarget, DurationBound};
pub use phase::LifecyclePhase;
pub use records::{
    AgentStatus, ClusterHealth, EngineIdentity, ExitState, FailureNote, TargetRecord,
};
pub use types::PositiveU64;

/// Milliseconds since the Unix epoch, saturating on overflow.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
