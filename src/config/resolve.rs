use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult, ConfigError};

use super::types::{
    AgentConfigFile, AgentSettings, CoordinatorConfig, CoordinatorSettings, DurationValue,
    EngineConfig, EngineSettings, LivenessConfig, LivenessSettings, ReplicationConfig,
    ReplicationSettings,
};

const DEFAULT_ENGINE_PATH: &str = "/usr/bin/sysbench";
const DEFAULT_CONTROL_LISTEN: &str = "127.0.0.1:7400";
const DEFAULT_GOSSIP_LISTEN: &str = "127.0.0.1:7401";
const DEFAULT_DATA_DIR: &str = "benchmesh-data";

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_PRECHECK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_OVERRUN_GRACE: Duration = Duration::from_secs(30);

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_ENGINE_PATH),
            report_interval: DEFAULT_REPORT_INTERVAL,
            graceful_stop_timeout: DEFAULT_GRACEFUL_STOP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            precheck_timeout: DEFAULT_PRECHECK_TIMEOUT,
            overrun_grace: DEFAULT_OVERRUN_GRACE,
        }
    }
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            window: DEFAULT_LIVENESS_WINDOW,
            timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }
}

fn duration_or(
    field: &'static str,
    value: Option<&DurationValue>,
    default: Duration,
) -> AppResult<Duration> {
    value.map_or(Ok(default), |value| {
        value
            .to_duration()
            .map_err(|err| AppError::config(ConfigError::InvalidField { field, source: err }))
    })
}

fn resolve_engine(config: Option<&EngineConfig>) -> AppResult<EngineSettings> {
    let defaults = EngineSettings::default();
    let Some(config) = config else {
        return Ok(defaults);
    };
    let report_interval = duration_or(
        "engine.report_interval",
        config.report_interval.as_ref(),
        defaults.report_interval,
    )?;
    if report_interval < Duration::from_secs(1) {
        return Err(AppError::config(ConfigError::InvalidField {
            field: "engine.report_interval",
            source: crate::error::ValidationError::ValueTooSmall { min: 1 },
        }));
    }
    Ok(EngineSettings {
        path: config.path.clone().unwrap_or(defaults.path),
        report_interval,
        graceful_stop_timeout: duration_or(
            "engine.graceful_stop_timeout",
            config.graceful_stop_timeout.as_ref(),
            defaults.graceful_stop_timeout,
        )?,
        poll_interval: duration_or(
            "engine.poll_interval",
            config.poll_interval.as_ref(),
            defaults.poll_interval,
        )?,
        step_timeout: duration_or(
            "engine.step_timeout",
            config.step_timeout.as_ref(),
            defaults.step_timeout,
        )?,
        precheck_timeout: duration_or(
            "engine.precheck_timeout",
            config.precheck_timeout.as_ref(),
            defaults.precheck_timeout,
        )?,
        overrun_grace: duration_or(
            "engine.overrun_grace",
            config.overrun_grace.as_ref(),
            defaults.overrun_grace,
        )?,
    })
}

fn resolve_liveness(config: Option<&LivenessConfig>) -> AppResult<LivenessSettings> {
    let defaults = LivenessSettings::default();
    let settings = match config {
        Some(config) => LivenessSettings {
            heartbeat_interval: duration_or(
                "liveness.heartbeat_interval",
                config.heartbeat_interval.as_ref(),
                defaults.heartbeat_interval,
            )?,
            window: duration_or("liveness.window", config.window.as_ref(), defaults.window)?,
            timeout: duration_or(
                "liveness.timeout",
                config.timeout.as_ref(),
                defaults.timeout,
            )?,
        },
        None => defaults,
    };
    if settings.window >= settings.timeout {
        return Err(AppError::config(ConfigError::LivenessOrder {
            window_ms: settings.window.as_millis(),
            timeout_ms: settings.timeout.as_millis(),
        }));
    }
    Ok(settings)
}

fn resolve_replication(config: Option<&ReplicationConfig>) -> AppResult<ReplicationSettings> {
    let defaults = ReplicationSettings::default();
    let Some(config) = config else {
        return Ok(defaults);
    };
    Ok(ReplicationSettings {
        sync_interval: duration_or(
            "replication.sync_interval",
            config.sync_interval.as_ref(),
            defaults.sync_interval,
        )?,
        push_timeout: duration_or(
            "replication.push_timeout",
            config.push_timeout.as_ref(),
            defaults.push_timeout,
        )?,
    })
}

fn resolve_coordinator(config: Option<&CoordinatorConfig>) -> AppResult<CoordinatorSettings> {
    let defaults = CoordinatorSettings::default();
    let Some(config) = config else {
        return Ok(defaults);
    };
    Ok(CoordinatorSettings {
        lock_timeout: duration_or(
            "coordinator.lock_timeout",
            config.lock_timeout.as_ref(),
            defaults.lock_timeout,
        )?,
        tick_interval: duration_or(
            "coordinator.tick_interval",
            config.tick_interval.as_ref(),
            defaults.tick_interval,
        )?,
        forward_timeout: duration_or(
            "coordinator.forward_timeout",
            config.forward_timeout.as_ref(),
            defaults.forward_timeout,
        )?,
    })
}

impl AgentConfigFile {
    /// Applies defaults and validates the group layout.
    ///
    /// # Errors
    ///
    /// Returns an error when a required field is missing, a duration is
    /// malformed, a peer id repeats, or the configured leader is unknown.
    pub fn resolve(self, agent_id_override: Option<String>) -> AppResult<AgentSettings> {
        let AgentConfigFile {
            agent_id,
            data_dir,
            control_listen,
            gossip_listen,
            leader,
            peers: configured_peers,
            engine,
            liveness,
            replication,
            coordinator,
            benchmark,
        } = self;
        let agent_id = agent_id_override
            .or(agent_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::config(ConfigError::MissingField { field: "agent_id" }))?;

        let mut seen = BTreeSet::new();
        let mut peers = Vec::with_capacity(configured_peers.len());
        for peer in configured_peers {
            if !seen.insert(peer.id.clone()) {
                return Err(AppError::config(ConfigError::DuplicatePeer {
                    agent_id: peer.id,
                }));
            }
            if peer.id != agent_id {
                peers.push(peer);
            }
        }

        if let Some(leader) = leader.as_ref()
            && *leader != agent_id
            && !peers.iter().any(|peer| peer.id == *leader)
        {
            return Err(AppError::config(ConfigError::UnknownLeader {
                leader: leader.clone(),
            }));
        }

        Ok(AgentSettings {
            data_dir: data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR).join(&agent_id)),
            control_listen: control_listen.unwrap_or_else(|| DEFAULT_CONTROL_LISTEN.to_owned()),
            gossip_listen: gossip_listen.unwrap_or_else(|| DEFAULT_GOSSIP_LISTEN.to_owned()),
            leader,
            peers,
            engine: resolve_engine(engine.as_ref())?,
            liveness: resolve_liveness(liveness.as_ref())?,
            replication: resolve_replication(replication.as_ref())?,
            coordinator: resolve_coordinator(coordinator.as_ref())?,
            benchmark,
            agent_id,
        })
    }
}
