mod app;
mod config;
mod lifecycle;
mod metrics;
mod store;
mod supervisor;
mod validation;
mod workload;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use config::ConfigError;
pub use lifecycle::LifecycleError;
pub use metrics::MetricsError;
pub use store::StoreError;
pub use supervisor::SupervisorError;
pub use validation::ValidationError;
pub use workload::WorkloadError;
