use crate::domain::{BenchmarkConfig, Command, LifecyclePhase, TargetRecord};
use crate::error::LifecycleError;

/// Computes the target record a command leads to.
///
/// `Ok(None)` means the command is an idempotent repeat and nothing must be
/// written. Rejections leave the current record untouched. The new record
/// keeps the current term; the coordinator stamps its own.
///
/// # Errors
///
/// Returns `InvalidTransition` when the command is not allowed from the
/// current target phase, `ConfigConflict` when a prepare would change the
/// agreed config mid-cycle, and `MissingConfig` for a first prepare without
/// parameters.
pub fn plan_transition(
    current: &TargetRecord,
    command: Command,
    config: Option<BenchmarkConfig>,
    leader: &str,
    now_ms: u64,
) -> Result<Option<TargetRecord>, LifecycleError> {
    let invalid = || LifecycleError::InvalidTransition {
        command,
        target: current.phase,
    };
    let advance = |phase: LifecyclePhase, config: Option<BenchmarkConfig>, cycle: u64| {
        Some(TargetRecord {
            version: current.version.saturating_add(1),
            term: current.term,
            cycle,
            phase,
            config,
            leader: leader.to_owned(),
            updated_at_ms: now_ms,
        })
    };

    match command {
        Command::Prepare => match (current.phase, config) {
            (LifecyclePhase::Unset, Some(config)) => Ok(advance(
                LifecyclePhase::Prepared,
                Some(config),
                current.cycle,
            )),
            (LifecyclePhase::Unset, None) => Err(LifecycleError::MissingConfig),
            (_, None) => Ok(None),
            (_, Some(config)) => match current.config.as_ref() {
                Some(agreed) => match agreed.first_difference(&config) {
                    Some(field) => Err(LifecycleError::ConfigConflict {
                        cycle: current.cycle,
                        field,
                    }),
                    None => Ok(None),
                },
                None => Err(invalid()),
            },
        },
        Command::Run => match current.phase {
            LifecyclePhase::Prepared | LifecyclePhase::Stopped | LifecyclePhase::Collected => Ok(
                advance(LifecyclePhase::Running, current.config.clone(), current.cycle),
            ),
            LifecyclePhase::Running => Ok(None),
            LifecyclePhase::Unset
            | LifecyclePhase::Preparing
            | LifecyclePhase::Starting
            | LifecyclePhase::Stopping
            | LifecyclePhase::Collecting
            | LifecyclePhase::Cleaning
            | LifecyclePhase::Failed => Err(invalid()),
        },
        Command::Stop => match current.phase {
            LifecyclePhase::Prepared | LifecyclePhase::Running => Ok(advance(
                LifecyclePhase::Stopped,
                current.config.clone(),
                current.cycle,
            )),
            LifecyclePhase::Stopped | LifecyclePhase::Collected => Ok(None),
            LifecyclePhase::Unset
            | LifecyclePhase::Preparing
            | LifecyclePhase::Starting
            | LifecyclePhase::Stopping
            | LifecyclePhase::Collecting
            | LifecyclePhase::Cleaning
            | LifecyclePhase::Failed => Err(invalid()),
        },
        Command::Collect => match current.phase {
            LifecyclePhase::Stopped => Ok(advance(
                LifecyclePhase::Collected,
                current.config.clone(),
                current.cycle,
            )),
            LifecyclePhase::Collected => Ok(None),
            LifecyclePhase::Unset
            | LifecyclePhase::Preparing
            | LifecyclePhase::Prepared
            | LifecyclePhase::Starting
            | LifecyclePhase::Running
            | LifecyclePhase::Stopping
            | LifecyclePhase::Collecting
            | LifecyclePhase::Cleaning
            | LifecyclePhase::Failed => Err(invalid()),
        },
        Command::Clean => match current.phase {
            LifecyclePhase::Unset => Ok(None),
            LifecyclePhase::Preparing
            | LifecyclePhase::Prepared
            | LifecyclePhase::Starting
            | LifecyclePhase::Running
            | LifecyclePhase::Stopping
            | LifecyclePhase::Stopped
            | LifecyclePhase::Collecting
            | LifecyclePhase::Collected
            | LifecyclePhase::Cleaning
            | LifecyclePhase::Failed => Ok(advance(
                LifecyclePhase::Unset,
                None,
                current.cycle.saturating_add(1),
            )),
        },
    }
}
