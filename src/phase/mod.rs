//! Per-agent lifecycle: plan the next step toward the leader's target, run
//! it through the supervisor, and report the observed phase.
mod guard;
mod machine;
mod plan;


pub use guard::PhaseGuard;
pub use machine::PhaseMachine;
pub use plan::{Action, plan_next};
