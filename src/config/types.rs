use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::BenchmarkConfig;
use crate::error::ValidationError;

/// Agent configuration as written on disk. Every section is optional; missing
/// values fall back to the defaults in [`super::resolve`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfigFile {
    pub agent_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub control_listen: Option<String>,
    pub gossip_listen: Option<String>,
    pub leader: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    pub engine: Option<EngineConfig>,
    pub liveness: Option<LivenessConfig>,
    pub replication: Option<ReplicationConfig>,
    pub coordinator: Option<CoordinatorConfig>,
    pub benchmark: Option<BenchmarkConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub control_addr: String,
    pub gossip_addr: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub path: Option<PathBuf>,
    pub report_interval: Option<DurationValue>,
    pub graceful_stop_timeout: Option<DurationValue>,
    pub poll_interval: Option<DurationValue>,
    pub step_timeout: Option<DurationValue>,
    pub precheck_timeout: Option<DurationValue>,
    pub overrun_grace: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LivenessConfig {
    pub heartbeat_interval: Option<DurationValue>,
    pub window: Option<DurationValue>,
    pub timeout: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    pub sync_interval: Option<DurationValue>,
    pub push_timeout: Option<DurationValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub lock_timeout: Option<DurationValue>,
    pub tick_interval: Option<DurationValue>,
    pub forward_timeout: Option<DurationValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub(crate) fn to_duration(&self) -> Result<Duration, ValidationError> {
        match self {
            DurationValue::Seconds(secs) => {
                if *secs == 0 {
                    Err(ValidationError::DurationZero)
                } else {
                    Ok(Duration::from_secs(*secs))
                }
            }
            DurationValue::Text(text) => super::parse_duration_value(text),
        }
    }
}

/// Fully resolved agent settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_id: String,
    pub data_dir: PathBuf,
    pub control_listen: String,
    pub gossip_listen: String,
    pub leader: Option<String>,
    /// Other group members; never contains `agent_id`.
    pub peers: Vec<PeerConfig>,
    pub engine: EngineSettings,
    pub liveness: LivenessSettings,
    pub replication: ReplicationSettings,
    pub coordinator: CoordinatorSettings,
    pub benchmark: Option<BenchmarkConfig>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub path: PathBuf,
    pub report_interval: Duration,
    pub graceful_stop_timeout: Duration,
    pub poll_interval: Duration,
    pub step_timeout: Duration,
    pub precheck_timeout: Duration,
    pub overrun_grace: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct LivenessSettings {
    pub heartbeat_interval: Duration,
    /// Silence after which an agent is reported as unknown.
    pub window: Duration,
    /// Silence after which an agent is marked failed.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationSettings {
    pub sync_interval: Duration,
    pub push_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub lock_timeout: Duration,
    pub tick_interval: Duration,
    pub forward_timeout: Duration,
}
