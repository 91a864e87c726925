use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

use super::LifecyclePhase;

/// Operator-facing lifecycle commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Prepare,
    Run,
    Stop,
    Collect,
    Clean,
}

impl Command {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Prepare => "prepare",
            Command::Run => "run",
            Command::Stop => "stop",
            Command::Collect => "collect",
            Command::Clean => "clean",
        }
    }

    /// Target phase the leader sets when the command is accepted.
    #[must_use]
    pub const fn target_phase(self) -> LifecyclePhase {
        match self {
            Command::Prepare => LifecyclePhase::Prepared,
            Command::Run => LifecyclePhase::Running,
            Command::Stop => LifecyclePhase::Stopped,
            Command::Collect => LifecyclePhase::Collected,
            Command::Clean => LifecyclePhase::Unset,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Command {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prepare" => Ok(Command::Prepare),
            "run" => Ok(Command::Run),
            "stop" => Ok(Command::Stop),
            "collect" => Ok(Command::Collect),
            "clean" => Ok(Command::Clean),
            _ => Err(ValidationError::InvalidCommand {
                value: s.to_owned(),
            }),
        }
    }
}
