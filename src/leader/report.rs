use serde::{Deserialize, Serialize};

use crate::domain::{ClusterHealth, LifecyclePhase, TargetRecord};

/// Acknowledgement returned for every operator command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub accepted: bool,
    pub reason: String,
    pub target_phase: LifecyclePhase,
    pub version: u64,
}

impl CommandAck {
    #[must_use]
    pub fn accepted(target: &TargetRecord, reason: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: reason.into(),
            target_phase: target.phase,
            version: target.version,
        }
    }

    #[must_use]
    pub fn rejected(target_phase: LifecyclePhase, version: u64, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: reason.into(),
            target_phase,
            version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterVerdict {
    /// Every agent reached the target phase.
    Complete,
    /// Every agent settled, at least one failed.
    Degraded,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentVerdict {
    Reached,
    Pending,
    /// Silent past the liveness window but not yet timed out.
    Unknown,
    Failed { reason: String, by_timeout: bool },
}

impl AgentVerdict {
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, AgentVerdict::Reached | AgentVerdict::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub phase: Option<LifecyclePhase>,
    pub cycle: Option<u64>,
    pub verdict: AgentVerdict,
    pub last_error: Option<String>,
    pub silent_for_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub target: TargetRecord,
    pub verdict: ClusterVerdict,
    pub agents: Vec<AgentReport>,
    pub health: ClusterHealth,
}

impl ClusterReport {
    pub(super) fn verdict_for(agents: &[AgentReport]) -> ClusterVerdict {
        if agents.iter().any(|agent| !agent.verdict.is_settled()) {
            ClusterVerdict::InProgress
        } else if agents
            .iter()
            .any(|agent| matches!(agent.verdict, AgentVerdict::Failed { .. }))
        {
            ClusterVerdict::Degraded
        } else {
            ClusterVerdict::Complete
        }
    }
}
