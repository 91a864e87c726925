use crate::error::AppResult;

use super::format::{escape_label, write_line};
use super::model::BenchmarkMetrics;

struct Family {
    name: &'static str,
    help: &'static str,
    kind: &'static str,
    value: fn(&BenchmarkMetrics) -> String,
}

const FAMILIES: [Family; 10] = [
    Family {
        name: "benchmesh_transactions_per_second",
        help: "Transactions per second in the latest engine report.",
        kind: "gauge",
        value: |metrics| metrics.tps.to_string(),
    },
    Family {
        name: "benchmesh_queries_per_second",
        help: "Queries per second in the latest engine report.",
        kind: "gauge",
        value: |metrics| metrics.qps.to_string(),
    },
    Family {
        name: "benchmesh_threads",
        help: "Engine worker threads.",
        kind: "gauge",
        value: |metrics| metrics.threads.to_string(),
    },
    Family {
        name: "benchmesh_errors_per_second",
        help: "Errors per second in the latest engine report.",
        kind: "gauge",
        value: |metrics| metrics.errors_per_sec.to_string(),
    },
    Family {
        name: "benchmesh_errors_total",
        help: "Estimated errors since the run started.",
        kind: "counter",
        value: |metrics| metrics.error_count.to_string(),
    },
    Family {
        name: "benchmesh_reconnects_per_second",
        help: "Reconnects per second in the latest engine report.",
        kind: "gauge",
        value: |metrics| metrics.reconnects_per_sec.to_string(),
    },
    Family {
        name: "benchmesh_elapsed_seconds",
        help: "Run time reported by the engine.",
        kind: "gauge",
        value: |metrics| metrics.elapsed_secs.to_string(),
    },
    Family {
        name: "benchmesh_reports_total",
        help: "Engine reports parsed.",
        kind: "counter",
        value: |metrics| metrics.reports.to_string(),
    },
    Family {
        name: "benchmesh_malformed_lines_total",
        help: "Report lines that could not be parsed.",
        kind: "counter",
        value: |metrics| metrics.malformed_lines.to_string(),
    },
    Family {
        name: "benchmesh_cycle",
        help: "Benchmark cycle the metrics belong to.",
        kind: "gauge",
        value: |metrics| metrics.cycle.to_string(),
    },
];

fn labels(metrics: &BenchmarkMetrics) -> String {
    format!(
        "agent=\"{}\",db_kind=\"{}\"",
        escape_label(&metrics.agent_id),
        escape_label(metrics.db_kind.as_deref().unwrap_or("unknown"))
    )
}

/// Renders the Prometheus text exposition for one or more agents.
///
/// # Errors
///
/// Returns an error if the output buffer cannot be written.
pub fn render_prometheus(agents: &[BenchmarkMetrics]) -> AppResult<String> {
    let mut output = String::new();

    for family in &FAMILIES {
        write_line(
            &mut output,
            &format!("# HELP {} {}", family.name, family.help),
        )?;
        write_line(
            &mut output,
            &format!("# TYPE {} {}", family.name, family.kind),
        )?;
        for metrics in agents {
            write_line(
                &mut output,
                &format!(
                    "{}{{{}}} {}",
                    family.name,
                    labels(metrics),
                    (family.value)(metrics)
                ),
            )?;
        }
    }

    write_line(
        &mut output,
        "# HELP benchmesh_latency_milliseconds Latency percentile in the latest engine report.",
    )?;
    write_line(&mut output, "# TYPE benchmesh_latency_milliseconds gauge")?;
    for metrics in agents {
        for (percentile, value) in &metrics.latency_ms {
            write_line(
                &mut output,
                &format!(
                    "benchmesh_latency_milliseconds{{{},percentile=\"{}\"}} {}",
                    labels(metrics),
                    escape_label(percentile),
                    value
                ),
            )?;
        }
    }

    Ok(output)
}
