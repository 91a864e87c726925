//! Agent configuration loading and resolution.
mod loader;
mod parse;
mod resolve;
pub mod types;

#[cfg(test)]
mod tests;

pub use loader::{load_benchmark_config, load_config};
pub use types::{
    AgentConfigFile, AgentSettings, CoordinatorSettings, DurationValue, EngineSettings,
    LivenessSettings, PeerConfig, ReplicationSettings,
};

#[cfg(test)]
pub(crate) use loader::load_config_file;
pub(crate) use parse::parse_duration_value;
