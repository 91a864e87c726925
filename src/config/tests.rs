use std::path::PathBuf;
use std::time::Duration;

use tempfile::tempdir;

use super::{load_benchmark_config, load_config_file, parse_duration_value, types::AgentConfigFile};
use crate::domain::{DatabaseKind, DurationBound};
use crate::error::{AppError, ConfigError};

#[test]
fn parse_toml_agent_config() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let path = dir.path().join("benchmesh.toml");
    let content = r#"
agent_id = "agent-a"
control_listen = "127.0.0.1:9000"
gossip_listen = "127.0.0.1:9001"
leader = "agent-a"

[[peers]]
id = "agent-a"
control_addr = "127.0.0.1:9000"
gossip_addr = "127.0.0.1:9001"

[[peers]]
id = "agent-b"
control_addr = "127.0.0.1:9100"
gossip_addr = "127.0.0.1:9101"

[engine]
path = "/opt/sysbench/bin/sysbench"
graceful_stop_timeout = "3s"
poll_interval = "250ms"

[liveness]
window = "2s"
timeout = "6s"

[benchmark]
workload = "oltp_read_only"
threads = 8
tables = 4
scale = 10
duration = "5m"

[benchmark.database]
kind = "postgresql"
endpoint = "10.0.0.5:5432"
name = "bench"
user = "bench"
"#;
    std::fs::write(&path, content).map_err(|err| format!("write failed: {}", err))?;

    let settings = load_config_file(&path)
        .and_then(|file| file.resolve(None))
        .map_err(|err| err.to_string())?;
    if settings.agent_id != "agent-a" {
        return Err(format!("Unexpected agent id: {}", settings.agent_id));
    }
    if settings.peers.len() != 1 {
        return Err(format!("Self must be dropped from peers: {:?}", settings.peers));
    }
    if settings.engine.path != PathBuf::from("/opt/sysbench/bin/sysbench") {
        return Err("Unexpected engine path".to_owned());
    }
    if settings.engine.poll_interval != Duration::from_millis(250) {
        return Err("Unexpected poll interval".to_owned());
    }
    if settings.liveness.timeout != Duration::from_secs(6) {
        return Err("Unexpected liveness timeout".to_owned());
    }
    let benchmark = settings
        .benchmark
        .ok_or_else(|| "Expected benchmark defaults".to_owned())?;
    if benchmark.database.kind != DatabaseKind::PostgreSql {
        return Err("Unexpected database kind".to_owned());
    }
    if benchmark.duration != DurationBound::For(Duration::from_secs(300)) {
        return Err("Unexpected duration".to_owned());
    }
    Ok(())
}

#[test]
fn parse_json_agent_config_with_defaults() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let path = dir.path().join("benchmesh.json");
    std::fs::write(&path, r#"{"agent_id": "solo"}"#)
        .map_err(|err| format!("write failed: {}", err))?;

    let settings = load_config_file(&path)
        .and_then(|file| file.resolve(None))
        .map_err(|err| err.to_string())?;
    if settings.data_dir != PathBuf::from("benchmesh-data").join("solo") {
        return Err(format!("Unexpected data dir: {}", settings.data_dir.display()));
    }
    if settings.engine.path != PathBuf::from("/usr/bin/sysbench") {
        return Err("Unexpected default engine path".to_owned());
    }
    if settings.leader.is_some() || !settings.peers.is_empty() {
        return Err("Expected a single-agent group".to_owned());
    }
    Ok(())
}

#[test]
fn rejects_unknown_extension() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let path = dir.path().join("benchmesh.yaml");
    std::fs::write(&path, "agent_id: a").map_err(|err| format!("write failed: {}", err))?;
    match load_config_file(&path) {
        Err(AppError::Config(ConfigError::UnsupportedExtension { ext })) if ext == "yaml" => Ok(()),
        Err(err) => Err(format!("Unexpected error: {}", err)),
        Ok(_) => Err("Expected unsupported extension error".to_owned()),
    }
}

#[test]
fn rejects_duplicate_peers_and_unknown_leader() -> Result<(), String> {
    let duplicate: AgentConfigFile = toml::from_str(
        r#"
agent_id = "a"
[[peers]]
id = "b"
control_addr = "127.0.0.1:1"
gossip_addr = "127.0.0.1:2"
[[peers]]
id = "b"
control_addr = "127.0.0.1:3"
gossip_addr = "127.0.0.1:4"
"#,
    )
    .map_err(|err| err.to_string())?;
    if !matches!(
        duplicate.resolve(None),
        Err(AppError::Config(ConfigError::DuplicatePeer { .. }))
    ) {
        return Err("Expected duplicate peer error".to_owned());
    }

    let unknown: AgentConfigFile =
        toml::from_str("agent_id = \"a\"\nleader = \"z\"\n").map_err(|err| err.to_string())?;
    if !matches!(
        unknown.resolve(None),
        Err(AppError::Config(ConfigError::UnknownLeader { .. }))
    ) {
        return Err("Expected unknown leader error".to_owned());
    }
    Ok(())
}

#[test]
fn liveness_window_must_be_shorter_than_timeout() -> Result<(), String> {
    let file: AgentConfigFile = toml::from_str(
        "agent_id = \"a\"\n[liveness]\nwindow = \"10s\"\ntimeout = \"10s\"\n",
    )
    .map_err(|err| err.to_string())?;
    match file.resolve(None) {
        Err(AppError::Config(ConfigError::LivenessOrder { .. })) => Ok(()),
        Err(err) => Err(format!("Unexpected error: {}", err)),
        Ok(_) => Err("Expected liveness order error".to_owned()),
    }
}

#[test]
fn agent_id_override_wins() -> Result<(), String> {
    let file: AgentConfigFile =
        toml::from_str("agent_id = \"a\"\n").map_err(|err| err.to_string())?;
    let settings = file
        .resolve(Some("b".to_owned()))
        .map_err(|err| err.to_string())?;
    if settings.agent_id != "b" {
        return Err(format!("Unexpected agent id: {}", settings.agent_id));
    }
    Ok(())
}

#[test]
fn parse_duration_units() -> Result<(), String> {
    let cases = [
        ("250ms", Duration::from_millis(250)),
        ("15", Duration::from_secs(15)),
        ("2m", Duration::from_secs(120)),
        ("1h", Duration::from_secs(3600)),
    ];
    for (input, expected) in cases {
        let parsed = parse_duration_value(input).map_err(|err| err.to_string())?;
        if parsed != expected {
            return Err(format!("{} parsed to {:?}", input, parsed));
        }
    }
    for bad in ["", "ms", "5d", "0s"] {
        if parse_duration_value(bad).is_ok() {
            return Err(format!("Expected '{}' to be rejected", bad));
        }
    }
    Ok(())
}

#[test]
fn load_standalone_benchmark_config() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let path = dir.path().join("tpcc.json");
    let content = r#"{
        "workload": "tpcc",
        "database": {"kind": "mysql", "endpoint": "unix:///run/mysqld/mysqld.sock", "name": "tpcc", "user": "bench"},
        "threads": 16,
        "tables": 10,
        "scale": 100,
        "duration": "until-stopped",
        "custom_script": "/srv/scripts/tpcc.zip"
    }"#;
    std::fs::write(&path, content).map_err(|err| format!("write failed: {}", err))?;

    let config = load_benchmark_config(&path).map_err(|err| err.to_string())?;
    if config.workload != "tpcc" || config.threads.get() != 16 || config.database.user != "bench" {
        return Err(format!("Unexpected config: {:?}", config));
    }
    if config.duration != DurationBound::UntilStopped {
        return Err(format!("Unexpected duration: {:?}", config.duration));
    }
    if config.custom_script != Some(PathBuf::from("/srv/scripts/tpcc.zip")) {
        return Err(format!("Unexpected script: {:?}", config.custom_script));
    }
    Ok(())
}

#[test]
fn benchmark_config_requires_database_user() -> Result<(), String> {
    let dir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let cases = [
        ("missing", r#""name": "sbtest""#),
        ("blank", r#""name": "sbtest", "user": "  ""#),
    ];
    for (label, database_fields) in cases {
        let path = dir.path().join(format!("{}.json", label));
        let content = format!(
            r#"{{
                "workload": "oltp_read_write",
                "database": {{"kind": "mysql", "endpoint": "mysql://127.0.0.1:3306", {}}},
                "threads": 4,
                "tables": 2,
                "scale": 10,
                "duration": "30s"
            }}"#,
            database_fields
        );
        std::fs::write(&path, content).map_err(|err| format!("write failed: {}", err))?;
        match load_benchmark_config(&path) {
            Err(err) if err.to_string().contains("user") || err.to_string().contains("empty") => {}
            Err(err) => return Err(format!("{}: unexpected error {}", label, err)),
            Ok(config) => return Err(format!("{}: accepted {:?}", label, config)),
        }
    }
    Ok(())
}
