use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const METRICS_SCHEMA_VERSION: u32 = 1;

/// Latest metrics snapshot of one agent. Overwritten on every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    pub agent_id: String,
    pub db_kind: Option<String>,
    pub workload: Option<String>,
    pub cycle: u64,
    pub threads: u64,
    pub tps: f64,
    pub qps: f64,
    /// Latency in milliseconds keyed by percentile label (`"95"`).
    pub latency_ms: BTreeMap<String, f64>,
    pub errors_per_sec: f64,
    /// Estimated from the per-second error rate and the report interval.
    pub error_count: u64,
    pub reconnects_per_sec: f64,
    pub elapsed_secs: u64,
    pub reports: u64,
    pub malformed_lines: u64,
    pub output_tail: Vec<String>,
    pub updated_at_ms: u64,
}

impl BenchmarkMetrics {
    #[must_use]
    pub fn empty(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_owned(),
            db_kind: None,
            workload: None,
            cycle: 0,
            threads: 0,
            tps: 0.0,
            qps: 0.0,
            latency_ms: BTreeMap::new(),
            errors_per_sec: 0.0,
            error_count: 0,
            reconnects_per_sec: 0.0,
            elapsed_secs: 0,
            reports: 0,
            malformed_lines: 0,
            output_tail: Vec::new(),
            updated_at_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub schema_version: u32,
    pub metrics: BenchmarkMetrics,
}

impl MetricsDocument {
    #[must_use]
    pub const fn new(metrics: BenchmarkMetrics) -> Self {
        Self {
            schema_version: METRICS_SCHEMA_VERSION,
            metrics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetricsDocument {
    pub schema_version: u32,
    pub agents: Vec<BenchmarkMetrics>,
}

impl ClusterMetricsDocument {
    #[must_use]
    pub const fn new(agents: Vec<BenchmarkMetrics>) -> Self {
        Self {
            schema_version: METRICS_SCHEMA_VERSION,
            agents,
        }
    }
}
