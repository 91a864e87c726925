use super::ValidationError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML config '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to parse JSON config '{path}': {source}")]
    ParseJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unsupported config extension '{ext}'. Use .toml or .json.")]
    UnsupportedExtension { ext: String },
    #[error("Config file must have .toml or .json extension.")]
    MissingExtension,
    #[error("No config file given and neither benchmesh.toml nor benchmesh.json exists.")]
    NotFound,
    #[error("Config '{field}' is invalid: {source}")]
    InvalidField {
        field: &'static str,
        #[source]
        source: ValidationError,
    },
    #[error("Config '{field}' must be set.")]
    MissingField { field: &'static str },
    #[error("Agent id '{agent_id}' is listed twice in peers.")]
    DuplicatePeer { agent_id: String },
    #[error("Leader '{leader}' is not part of the configured group.")]
    UnknownLeader { leader: String },
    #[error("Liveness window ({window_ms}ms) must be shorter than the liveness timeout ({timeout_ms}ms).")]
    LivenessOrder { window_ms: u128, timeout_ms: u128 },
}
