use std::path::Path;

use serde::de::DeserializeOwned;

use crate::domain::BenchmarkConfig;
use crate::error::{AppError, AppResult, ConfigError};

use super::types::AgentConfigFile;

/// Looked up in the working directory when no `--config` is given.
const DEFAULT_CONFIG_FILES: [&str; 2] = ["benchmesh.toml", "benchmesh.json"];

/// Loads the agent config from `path`, or from the first default file that
/// exists.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed, or when no path
/// is given and no default file exists.
pub fn load_config(path: Option<&Path>) -> AppResult<AgentConfigFile> {
    let path = match path {
        Some(path) => path,
        None => DEFAULT_CONFIG_FILES
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.exists())
            .ok_or_else(|| AppError::config(ConfigError::NotFound))?,
    };
    load_config_file(path)
}

pub(crate) fn load_config_file(path: &Path) -> AppResult<AgentConfigFile> {
    load_document(path)
}

/// Loads a standalone benchmark config, as passed to `benchmesh prepare`.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn load_benchmark_config(path: &Path) -> AppResult<BenchmarkConfig> {
    load_document(path)
}

/// The extension picks the format.
fn load_document<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext @ ("toml" | "json")) => ext,
        Some(other) => {
            return Err(AppError::config(ConfigError::UnsupportedExtension {
                ext: other.to_owned(),
            }));
        }
        None => return Err(AppError::config(ConfigError::MissingExtension)),
    };
    let content = std::fs::read_to_string(path).map_err(|source| {
        AppError::config(ConfigError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })
    })?;
    if format == "toml" {
        toml::from_str(&content).map_err(|source| {
            AppError::config(ConfigError::ParseToml {
                path: path.to_path_buf(),
                source,
            })
        })
    } else {
        serde_json::from_str(&content).map_err(|source| {
            AppError::config(ConfigError::ParseJson {
                path: path.to_path_buf(),
                source,
            })
        })
    }
}
