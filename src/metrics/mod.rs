//! Latest engine metrics per agent, as a versioned JSON document and as
//! Prometheus text.
mod format;
mod model;
mod prometheus;
mod publisher;

#[cfg(test)]
mod tests;

pub use model::{BenchmarkMetrics, ClusterMetricsDocument, METRICS_SCHEMA_VERSION, MetricsDocument};
pub use prometheus::render_prometheus;
pub use publisher::MetricsPublisher;
