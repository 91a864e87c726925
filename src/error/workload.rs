use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Workload '{reference}' was not found.")]
    NotFound { reference: String },
    #[error("Workload '{reference}' is invalid: {reason}")]
    Invalid { reference: String, reason: String },
    #[error("No built-in workload preset exists for database kind '{kind}'.")]
    UnsupportedDatabase { kind: String },
    #[error("Failed to read archive '{path}': {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("I/O error during {context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
