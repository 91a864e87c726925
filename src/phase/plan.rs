use crate::domain::{AgentStatus, LifecyclePhase, TargetRecord};

/// Next local step toward the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Prepare,
    Start,
    Stop,
    /// Bookkeeping move with no process work.
    Settle(LifecyclePhase),
    Collect,
    Clean,
    AdoptCycle(u64),
    Fail(String),
    Idle,
}

/// Decides the next action for an agent with no work in flight.
///
/// Pure: the caller supplies whether the engine process is alive.
#[must_use]
pub fn plan_next(status: &AgentStatus, target: &TargetRecord, engine_running: bool) -> Action {
    if target.cycle < status.cycle {
        // Stale replica of an older cycle.
        return Action::Idle;
    }
    if target.cycle > status.cycle {
        return if status.phase == LifecyclePhase::Unset && !engine_running {
            Action::AdoptCycle(target.cycle)
        } else {
            Action::Clean
        };
    }

    let already_ran = status.run_version == Some(target.version);
    match (status.phase, target.phase) {
        (LifecyclePhase::Failed, LifecyclePhase::Unset) => Action::Clean,
        (LifecyclePhase::Failed, _) => Action::Idle,
        (LifecyclePhase::Unset, LifecyclePhase::Unset) if engine_running => Action::Clean,
        (LifecyclePhase::Unset, LifecyclePhase::Unset) => Action::Idle,
        (_, LifecyclePhase::Unset) => Action::Clean,

        (LifecyclePhase::Preparing, _) => Action::Fail("prepare was interrupted".to_owned()),
        (LifecyclePhase::Starting, _) => Action::Fail("engine start was interrupted".to_owned()),
        (LifecyclePhase::Stopping, _) => Action::Settle(LifecyclePhase::Stopped),
        (LifecyclePhase::Collecting, _) => Action::Collect,
        (LifecyclePhase::Cleaning, _) => Action::Clean,

        (LifecyclePhase::Running, _) if !engine_running => {
            Action::Fail("engine process is gone".to_owned())
        }
        (LifecyclePhase::Running, LifecyclePhase::Stopped | LifecyclePhase::Collected) => {
            Action::Stop
        }
        (LifecyclePhase::Running, _) => Action::Idle,

        (LifecyclePhase::Unset, _) => Action::Prepare,

        (LifecyclePhase::Prepared, LifecyclePhase::Running) if !already_ran => Action::Start,
        (LifecyclePhase::Prepared, LifecyclePhase::Stopped | LifecyclePhase::Collected) => {
            Action::Settle(LifecyclePhase::Stopped)
        }
        (LifecyclePhase::Prepared, _) => Action::Idle,

        (
            LifecyclePhase::Stopped | LifecyclePhase::Collected,
            LifecyclePhase::Running,
        ) if !already_ran => Action::Start,
        (LifecyclePhase::Stopped, LifecyclePhase::Collected) => Action::Collect,
        (LifecyclePhase::Stopped | LifecyclePhase::Collected, _) => Action::Idle,
    }
}
