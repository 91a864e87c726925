use std::path::PathBuf;
use thiserror::Error;

use crate::domain::ExitState;
use crate::supervisor::EngineStep;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Engine executable '{path}' does not exist.")]
    MissingExecutable { path: PathBuf },
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Database at {endpoint} is not reachable: {reason}")]
    ConnectionPrecheck { endpoint: String, reason: String },
    #[error("Engine {step} step failed ({exit}).")]
    StepFailed { step: EngineStep, exit: ExitState },
    #[error("Engine {step} step timed out after {timeout_ms}ms.")]
    StepTimeout { step: EngineStep, timeout_ms: u64 },
    #[error("Engine {step} step was interrupted.")]
    Interrupted { step: EngineStep },
    #[error("Engine {step} step is still in flight.")]
    Busy { step: EngineStep },
    #[error("Engine process has no pid.")]
    MissingPid,
    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}
