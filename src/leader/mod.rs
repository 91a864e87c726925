//! Leader coordinator: the single writer of the target record.
mod coordinator;
mod report;
mod transition;


pub use coordinator::LeaderCoordinator;
pub use report::{AgentReport, AgentVerdict, ClusterReport, ClusterVerdict, CommandAck};
pub use transition::plan_transition;
