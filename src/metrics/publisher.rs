use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{keys, now_ms};
use crate::error::AppResult;
use crate::store::{StateStore, put_json};
use crate::supervisor::EngineReport;
use crate::system::ShutdownReceiver;

use super::model::{BenchmarkMetrics, MetricsDocument};

const OUTPUT_TAIL_LINES: usize = 20;

struct Inner {
    latest: Mutex<BenchmarkMetrics>,
    updates: watch::Sender<u64>,
    report_interval: Duration,
}

/// Keeps only the latest snapshot of the local agent. Cloning shares it.
#[derive(Clone)]
pub struct MetricsPublisher {
    inner: Arc<Inner>,
}

impl MetricsPublisher {
    #[must_use]
    pub fn new(agent_id: &str, report_interval: Duration) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                latest: Mutex::new(BenchmarkMetrics::empty(agent_id)),
                updates,
                report_interval,
            }),
        }
    }

    fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut BenchmarkMetrics),
    {
        {
            let mut latest = self
                .inner
                .latest
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            f(&mut latest);
            latest.updated_at_ms = now_ms();
        }
        self.inner
            .updates
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Starts a fresh snapshot for a new engine run.
    pub fn begin_run(&self, cycle: u64, db_kind: &str, workload: &str, threads: u64) {
        self.modify(|metrics| {
            let agent_id = std::mem::take(&mut metrics.agent_id);
            *metrics = BenchmarkMetrics {
                db_kind: Some(db_kind.to_owned()),
                workload: Some(workload.to_owned()),
                cycle,
                threads,
                ..BenchmarkMetrics::empty(&agent_id)
            };
        });
    }

    pub fn record(&self, report: &EngineReport) {
        let interval_secs = self.inner.report_interval.as_secs_f64();
        self.modify(|metrics| {
            metrics.threads = report.threads;
            metrics.tps = report.tps;
            metrics.qps = report.qps;
            if let Some((percentile, value)) = report.latency.as_ref() {
                metrics.latency_ms.insert(percentile.clone(), *value);
            }
            metrics.errors_per_sec = report.errors_per_sec;
            metrics.error_count = metrics
                .error_count
                .saturating_add(estimated_errors(report.errors_per_sec, interval_secs));
            metrics.reconnects_per_sec = report.reconnects_per_sec;
            metrics.elapsed_secs = report.elapsed_secs;
            metrics.reports = metrics.reports.saturating_add(1);
        });
    }

    pub fn record_malformed(&self, line: &str) {
        debug!("Skipping malformed engine report: {}", line);
        self.modify(|metrics| {
            metrics.malformed_lines = metrics.malformed_lines.saturating_add(1);
        });
    }

    pub fn push_output(&self, line: &str) {
        let mut latest = self
            .inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if latest.output_tail.len() >= OUTPUT_TAIL_LINES {
            latest.output_tail.remove(0);
        }
        latest.output_tail.push(line.to_owned());
    }

    /// Clears everything except the agent id.
    pub fn reset(&self) {
        self.modify(|metrics| {
            let agent_id = std::mem::take(&mut metrics.agent_id);
            *metrics = BenchmarkMetrics::empty(&agent_id);
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> BenchmarkMetrics {
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn document(&self) -> MetricsDocument {
        MetricsDocument::new(self.snapshot())
    }

    /// Fires after every report, malformed line, and reset.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.updates.subscribe()
    }

    /// Writes every update to `metrics/<agent>`, one write at a time, so
    /// readers see this agent's snapshots in order.
    ///
    /// # Errors
    ///
    /// Never fails; write errors are logged and retried on the next update.
    pub async fn sync_to_store(
        self,
        store: Arc<dyn StateStore>,
        mut shutdown_rx: ShutdownReceiver,
    ) -> AppResult<()> {
        let mut updates = self.subscribe();
        let key = keys::metrics(&self.snapshot().agent_id);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            updates.mark_unchanged();
            if let Err(err) = put_json(store.as_ref(), &key, &self.document()).await {
                warn!("Failed to publish metrics: {}", err);
            }
        }
        debug!("Metrics sync for {} stopped", key);
        Ok(())
    }
}

fn estimated_errors(errors_per_sec: f64, interval_secs: f64) -> u64 {
    let estimate = (errors_per_sec * interval_secs).round();
    if estimate.is_finite() && estimate > 0.0 {
        // Float-to-int `as` saturates.
        estimate as u64
    } else {
        0
    }
}
