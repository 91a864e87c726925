use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BenchmarkConfig, LifecyclePhase};

/// Leader-owned target state. Phase and config live in one record so they
/// change together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub version: u64,
    /// Leadership term of the leader that wrote the record.
    #[serde(default)]
    pub term: u64,
    pub cycle: u64,
    pub phase: LifecyclePhase,
    pub config: Option<BenchmarkConfig>,
    pub leader: String,
    pub updated_at_ms: u64,
}

impl TargetRecord {
    #[must_use]
    pub fn initial(leader: &str) -> Self {
        Self {
            version: 0,
            term: 0,
            cycle: 1,
            phase: LifecyclePhase::Unset,
            config: None,
            leader: leader.to_owned(),
            updated_at_ms: super::now_ms(),
        }
    }

    /// Whether `self` was written after `other`: a newer term wins, then the
    /// higher version.
    #[must_use]
    pub const fn supersedes(&self, other: &TargetRecord) -> bool {
        self.term > other.term || (self.term == other.term && self.version > other.version)
    }
}

/// Exit information of an engine process.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitState {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(default)]
    pub stderr_tail: Vec<String>,
}

impl ExitState {
    #[must_use]
    pub fn from_status(status: std::process::ExitStatus, stderr_tail: Vec<String>) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            stderr_tail,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0)) && self.signal.is_none()
    }
}

impl std::fmt::Display for ExitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "killed by signal {}", signal)?,
            (None, None) => f.write_str("unknown exit")?,
        }
        if let Some(last) = self.stderr_tail.last() {
            write!(f, ": {}", last)?;
        }
        Ok(())
    }
}

/// Per-agent status. Only the agent it describes writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub phase: LifecyclePhase,
    pub cycle: u64,
    /// Last target version this agent converged on.
    pub target_version: u64,
    /// Target version at which the engine was last started.
    #[serde(default)]
    pub run_version: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub exit: Option<ExitState>,
    /// Engine process started for the current run and not yet seen to exit.
    #[serde(default)]
    pub engine: Option<EngineIdentity>,
    pub updated_at_ms: u64,
}

impl AgentStatus {
    #[must_use]
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            phase: LifecyclePhase::Unset,
            cycle: 1,
            target_version: 0,
            run_version: None,
            last_error: None,
            exit: None,
            engine: None,
            updated_at_ms: super::now_ms(),
        }
    }
}

/// Enough to find an engine process again after the agent restarts. The
/// start time (clock ticks since boot) tells a reused pid apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineIdentity {
    pub pid: u32,
    #[serde(default)]
    pub start_ticks: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub reason: String,
    pub by_timeout: bool,
    pub at_ms: u64,
}

/// Failures the leader has acknowledged for the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cycle: u64,
    pub failures: BTreeMap<String, FailureNote>,
    pub updated_at_ms: u64,
}
