use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle of one benchmark cycle.
///
/// The leader only ever targets the settled phases (`Unset`, `Prepared`,
/// `Running`, `Stopped`, `Collected`); the transient ones are observed by
/// agents while they work toward a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    #[default]
    Unset,
    Preparing,
    Prepared,
    Starting,
    Running,
    Stopping,
    Stopped,
    Collecting,
    Collected,
    Cleaning,
    Failed,
}

impl LifecyclePhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Unset => "unset",
            LifecyclePhase::Preparing => "preparing",
            LifecyclePhase::Prepared => "prepared",
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Stopping => "stopping",
            LifecyclePhase::Stopped => "stopped",
            LifecyclePhase::Collecting => "collecting",
            LifecyclePhase::Collected => "collected",
            LifecyclePhase::Cleaning => "cleaning",
            LifecyclePhase::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(
            self,
            LifecyclePhase::Unset
                | LifecyclePhase::Prepared
                | LifecyclePhase::Running
                | LifecyclePhase::Stopped
                | LifecyclePhase::Collected
        )
    }

    /// Position on the forward chain; `Cleaning` and `Failed` sit outside it.
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            LifecyclePhase::Unset => Some(0),
            LifecyclePhase::Preparing => Some(1),
            LifecyclePhase::Prepared => Some(2),
            LifecyclePhase::Starting => Some(3),
            LifecyclePhase::Running => Some(4),
            LifecyclePhase::Stopping => Some(5),
            LifecyclePhase::Stopped => Some(6),
            LifecyclePhase::Collecting => Some(7),
            LifecyclePhase::Collected => Some(8),
            LifecyclePhase::Cleaning | LifecyclePhase::Failed => None,
        }
    }

    /// Whether an agent may move its observed phase from `self` to `next`.
    ///
    /// Forward moves follow the chain. Re-runs go back to `Starting` from
    /// `Stopped`/`Collected`. The only other ways back are `Failed` and the
    /// `Cleaning -> Unset` reset.
    #[must_use]
    pub const fn can_transition_to(self, next: LifecyclePhase) -> bool {
        if self as u8 == next as u8 {
            return true;
        }
        match (self, next) {
            (LifecyclePhase::Failed, LifecyclePhase::Cleaning) => true,
            (LifecyclePhase::Failed, _) => false,
            (_, LifecyclePhase::Failed | LifecyclePhase::Cleaning) => true,
            (LifecyclePhase::Cleaning, LifecyclePhase::Unset) => true,
            (LifecyclePhase::Unset, LifecyclePhase::Preparing) => true,
            (LifecyclePhase::Preparing, LifecyclePhase::Prepared) => true,
            (LifecyclePhase::Prepared, LifecyclePhase::Starting | LifecyclePhase::Stopped) => true,
            (LifecyclePhase::Starting, LifecyclePhase::Running | LifecyclePhase::Stopping) => true,
            (LifecyclePhase::Running, LifecyclePhase::Stopping | LifecyclePhase::Stopped) => true,
            (LifecyclePhase::Stopping, LifecyclePhase::Stopped) => true,
            (LifecyclePhase::Stopped, LifecyclePhase::Starting | LifecyclePhase::Collecting) => {
                true
            }
            (LifecyclePhase::Collecting, LifecyclePhase::Collected) => true,
            (LifecyclePhase::Collected, LifecyclePhase::Starting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecyclePhase {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unset" => Ok(LifecyclePhase::Unset),
            "preparing" => Ok(LifecyclePhase::Preparing),
            "prepared" => Ok(LifecyclePhase::Prepared),
            "starting" => Ok(LifecyclePhase::Starting),
            "running" => Ok(LifecyclePhase::Running),
            "stopping" => Ok(LifecyclePhase::Stopping),
            "stopped" => Ok(LifecyclePhase::Stopped),
            "collecting" => Ok(LifecyclePhase::Collecting),
            "collected" => Ok(LifecyclePhase::Collected),
            "cleaning" => Ok(LifecyclePhase::Cleaning),
            "failed" => Ok(LifecyclePhase::Failed),
            _ => Err(ValidationError::InvalidPhase {
                value: s.to_owned(),
            }),
        }
    }
}
