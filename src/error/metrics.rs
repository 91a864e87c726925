use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to format metrics output: {source}")]
    WriteLine {
        #[source]
        source: std::fmt::Error,
    },
}
