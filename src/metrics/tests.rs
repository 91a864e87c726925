use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::supervisor::EngineReport;

use super::{BenchmarkMetrics, METRICS_SCHEMA_VERSION, MetricsPublisher, render_prometheus};

fn report(elapsed_secs: u64, tps: f64, errors_per_sec: f64) -> EngineReport {
    EngineReport {
        elapsed_secs,
        threads: 8,
        tps,
        qps: tps * 20.0,
        latency: Some(("95".to_owned(), 12.5)),
        errors_per_sec,
        reconnects_per_sec: 0.0,
    }
}

#[test]
fn publisher_keeps_latest_report_and_accumulates_errors() -> AppResult<()> {
    let publisher = MetricsPublisher::new("agent-1", Duration::from_secs(2));
    publisher.begin_run(3, "mysql", "oltp_read_only", 8);
    publisher.record(&report(2, 100.0, 1.0));
    publisher.record(&report(4, 150.0, 0.5));
    publisher.record_malformed("[ 6s ] thds: ?");

    let metrics = publisher.snapshot();
    if metrics.tps != 150.0 || metrics.elapsed_secs != 4 || metrics.reports != 2 {
        return Err(AppError::validation(format!("Unexpected snapshot {:?}", metrics)));
    }
    // 1.0/s * 2s + 0.5/s * 2s
    if metrics.error_count != 3 || metrics.malformed_lines != 1 {
        return Err(AppError::validation(format!("Unexpected counters {:?}", metrics)));
    }
    if metrics.cycle != 3 || metrics.db_kind.as_deref() != Some("mysql") {
        return Err(AppError::validation(format!("Unexpected run labels {:?}", metrics)));
    }

    let document = publisher.document();
    if document.schema_version != METRICS_SCHEMA_VERSION || document.metrics.agent_id != "agent-1"
    {
        return Err(AppError::validation("Document must carry the schema version"));
    }

    publisher.reset();
    let cleared = publisher.snapshot();
    if cleared.reports != 0 || cleared.agent_id != "agent-1" || cleared.db_kind.is_some() {
        return Err(AppError::validation(format!("Reset left {:?}", cleared)));
    }
    Ok(())
}

#[test]
fn publisher_notifies_subscribers() -> AppResult<()> {
    let publisher = MetricsPublisher::new("agent-1", Duration::from_secs(1));
    let mut updates = publisher.subscribe();
    updates.mark_unchanged();
    publisher.record(&report(1, 10.0, 0.0));
    if !updates
        .has_changed()
        .map_err(|err| AppError::validation(err.to_string()))?
    {
        return Err(AppError::validation("Report must notify subscribers"));
    }
    Ok(())
}

#[test]
fn prometheus_text_has_stable_names_and_labels() -> AppResult<()> {
    let mut metrics = BenchmarkMetrics::empty("agent-1");
    metrics.db_kind = Some("mysql".to_owned());
    metrics.tps = 42.5;
    metrics.latency_ms.insert("95".to_owned(), 7.25);

    let text = render_prometheus(&[metrics, BenchmarkMetrics::empty("agent-2")])?;
    for expected in [
        "# TYPE benchmesh_transactions_per_second gauge",
        "benchmesh_transactions_per_second{agent=\"agent-1\",db_kind=\"mysql\"} 42.5",
        "benchmesh_transactions_per_second{agent=\"agent-2\",db_kind=\"unknown\"} 0",
        "# TYPE benchmesh_errors_total counter",
        "benchmesh_latency_milliseconds{agent=\"agent-1\",db_kind=\"mysql\",percentile=\"95\"} 7.25",
    ] {
        if !text.lines().any(|line| line == expected) {
            return Err(AppError::validation(format!(
                "Missing line '{}' in:\n{}",
                expected, text
            )));
        }
    }
    Ok(())
}

#[test]
fn label_values_are_escaped() -> AppResult<()> {
    let metrics = BenchmarkMetrics::empty("we\"ird\\agent");
    let text = render_prometheus(&[metrics])?;
    if !text.contains("agent=\"we\\\"ird\\\\agent\"") {
        return Err(AppError::validation(format!("Label not escaped:\n{}", text)));
    }
    Ok(())
}
