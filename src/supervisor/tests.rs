use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tokio::net::TcpListener;

use crate::config::EngineSettings;
use crate::domain::{DatabaseEndpoint, DurationBound, EngineIdentity};
use crate::error::{AppError, AppResult, SupervisorError};
use crate::metrics::MetricsPublisher;
use crate::test_support::run_async_test;
use crate::workload::{Invocation, WorkloadSource};

use super::{
    EngineEvent, EngineOutcome, EngineStep, ParsedLine, ProcessSupervisor, StartOutcome,
    TailBuffer, identify, parse_line,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_POLL: Duration = Duration::from_millis(20);

const REPORTING_ENGINE: &str = r#"
echo "Threads started!"
echo "[ 1s ] thds: 2 tps: 10.50 qps: 210.00 (r/w/o: 147.00/42.00/21.00) lat (ms,95%): 3.25 err/s: 2.00 reconn/s: 0.00"
echo "[ 2s ] thds: 2 tps: oops qps: 1.0"
exit 0
"#;

fn settings() -> EngineSettings {
    EngineSettings {
        poll_interval: EVENT_POLL,
        graceful_stop_timeout: Duration::from_millis(500),
        step_timeout: Duration::from_secs(5),
        precheck_timeout: Duration::from_secs(1),
        overrun_grace: Duration::ZERO,
        ..EngineSettings::default()
    }
}

fn script_invocation(dir: &TempDir, body: &str) -> AppResult<Invocation> {
    let script = dir.path().join("engine.sh");
    std::fs::write(&script, body)?;
    Ok(Invocation {
        program: PathBuf::from("/bin/sh"),
        script: script.display().to_string(),
        args: Vec::new(),
        env: vec![("BENCH_DB_NAME".to_owned(), "sysbench-db".to_owned())],
        source: WorkloadSource::Script(script),
    })
}

async fn database() -> AppResult<(TcpListener, DatabaseEndpoint)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((
        listener,
        DatabaseEndpoint::Tcp {
            host: "127.0.0.1".to_owned(),
            port,
        },
    ))
}

async fn next_event(supervisor: &ProcessSupervisor) -> AppResult<EngineEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            if let Some(event) = supervisor.poll_engine().await {
                return event;
            }
            tokio::time::sleep(EVENT_POLL).await;
        }
    })
    .await
    .map_err(|_elapsed| AppError::validation("Timed out waiting for engine event"))
}

fn kill_externally(pid: u32) -> AppResult<()> {
    let status = std::process::Command::new("kill")
        .arg("-KILL")
        .arg(pid.to_string())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::validation(format!("kill {} failed", pid)))
    }
}

/// Stand-in for an engine left behind by an earlier agent process.
fn spawn_leftover() -> AppResult<(tokio::process::Child, u32)> {
    let child = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| AppError::validation("Leftover process has no pid"))?;
    Ok((child, pid))
}

#[test]
fn parses_sysbench_interval_report() -> AppResult<()> {
    let line = "[ 10s ] thds: 8 tps: 1021.45 qps: 20429.02 (r/w/o: 14300.31/4085.81/2042.90) lat (ms,95%): 12.08 err/s: 0.40 reconn/s: 0.10";
    let ParsedLine::Report(report) = parse_line(line) else {
        return Err(AppError::validation("Expected a report"));
    };
    if report.elapsed_secs != 10 || report.threads != 8 {
        return Err(AppError::validation(format!("Unexpected report {:?}", report)));
    }
    if (report.tps - 1021.45).abs() > 1e-9 || (report.qps - 20429.02).abs() > 1e-9 {
        return Err(AppError::validation(format!("Unexpected rates {:?}", report)));
    }
    if report.latency != Some(("95".to_owned(), 12.08)) {
        return Err(AppError::validation(format!(
            "Unexpected latency {:?}",
            report.latency
        )));
    }
    if (report.errors_per_sec - 0.40).abs() > 1e-9 || (report.reconnects_per_sec - 0.10).abs() > 1e-9
    {
        return Err(AppError::validation(format!("Unexpected error rates {:?}", report)));
    }
    Ok(())
}

#[test]
fn accepts_rates_without_colon() -> AppResult<()> {
    let line = "[ 5s ] thds: 4 tps: 10.00 qps: 200.00 (r/w/o: 140.00/40.00/20.00) lat (ms,99%): 4.00 err/s 1.50 reconn/s 0.00";
    match parse_line(line) {
        ParsedLine::Report(report) if (report.errors_per_sec - 1.5).abs() < 1e-9 => Ok(()),
        other => Err(AppError::validation(format!("Unexpected parse {:?}", other))),
    }
}

#[test]
fn report_shaped_garbage_is_malformed_and_prose_is_ignored() -> AppResult<()> {
    if parse_line("[ 3s ] thds: 2 tps: n/a qps: 1.0") != ParsedLine::Malformed {
        return Err(AppError::validation("Broken report must be malformed"));
    }
    for line in ["Threads started!", "", "[ 3s ] progress", "SQL statistics:"] {
        if parse_line(line) != ParsedLine::Other {
            return Err(AppError::validation(format!("'{}' must be ignored", line)));
        }
    }
    Ok(())
}

#[test]
fn tail_buffer_keeps_latest_lines() -> AppResult<()> {
    let mut tail = TailBuffer::new(2);
    for line in ["a", "b", "c"] {
        tail.push(line);
    }
    if tail.lines() != vec!["b".to_owned(), "c".to_owned()] {
        return Err(AppError::validation(format!("Unexpected tail {:?}", tail.lines())));
    }
    Ok(())
}

#[test]
fn completed_run_feeds_publisher() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let publisher = MetricsPublisher::new("a", Duration::from_secs(1));
        let supervisor = ProcessSupervisor::new(settings(), publisher.clone());
        let invocation = script_invocation(&dir, REPORTING_ENGINE)?;

        let outcome = supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await?;
        let StartOutcome::Started { generation, .. } = outcome else {
            return Err(AppError::validation(format!("Unexpected outcome {:?}", outcome)));
        };
        match next_event(&supervisor).await? {
            EngineEvent {
                generation: reported,
                outcome: EngineOutcome::Completed(exit),
            } if exit.is_success() && reported == generation => {}
            other => return Err(AppError::validation(format!("Unexpected event {:?}", other))),
        }

        let metrics = publisher.snapshot();
        if metrics.reports != 1 || metrics.malformed_lines != 1 || metrics.error_count != 2 {
            return Err(AppError::validation(format!("Unexpected metrics {:?}", metrics)));
        }
        if (metrics.tps - 10.5).abs() > 1e-9 || metrics.latency_ms.get("95") != Some(&3.25) {
            return Err(AppError::validation(format!("Unexpected rates {:?}", metrics)));
        }
        if !metrics.output_tail.iter().any(|line| line == "Threads started!") {
            return Err(AppError::validation("Output tail must keep engine lines"));
        }
        Ok(())
    })
}

#[test]
fn second_start_does_not_spawn_again() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(&dir, "exec sleep 30\n")?;

        let first = supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await?;
        let second = supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await?;
        let StartOutcome::Started { generation, .. } = first else {
            return Err(AppError::validation(format!("Unexpected outcome {:?}", first)));
        };
        if second != (StartOutcome::AlreadyRunning { generation }) {
            return Err(AppError::validation(format!(
                "Unexpected outcomes {:?} {:?}",
                first, second
            )));
        }

        let exit = supervisor.stop().await?;
        if exit.as_ref().and_then(|exit| exit.signal) != Some(libc::SIGTERM) {
            return Err(AppError::validation(format!("Unexpected exit {:?}", exit)));
        }
        if supervisor.stop().await?.is_some() || supervisor.is_running().await {
            return Err(AppError::validation("Stop must be idempotent"));
        }
        Ok(())
    })
}

#[test]
fn external_kill_is_reported_as_crash() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(&dir, "exec sleep 30\n")?;

        let StartOutcome::Started { engine, .. } = supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await?
        else {
            return Err(AppError::validation("Engine must start"));
        };
        kill_externally(engine.pid)?;

        match next_event(&supervisor).await?.outcome {
            EngineOutcome::Crashed(exit) if exit.signal == Some(libc::SIGKILL) => Ok(()),
            other => Err(AppError::validation(format!("Unexpected event {:?}", other))),
        }
    })
}

#[test]
fn crash_carries_exit_code_and_stderr() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(&dir, "echo 'FATAL: connection lost' >&2\nexit 3\n")?;

        supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await?;
        match next_event(&supervisor).await?.outcome {
            EngineOutcome::Crashed(exit)
                if exit.code == Some(3)
                    && exit.stderr_tail == vec!["FATAL: connection lost".to_owned()] =>
            {
                Ok(())
            }
            other => Err(AppError::validation(format!("Unexpected event {:?}", other))),
        }
    })
}

#[test]
fn overrun_is_stopped() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(&dir, "exec sleep 30\n")?;

        supervisor
            .start(
                &invocation,
                &endpoint,
                DurationBound::For(Duration::from_millis(200)),
            )
            .await?;
        match next_event(&supervisor).await?.outcome {
            EngineOutcome::Overran(exit) if exit.signal == Some(libc::SIGTERM) => Ok(()),
            other => Err(AppError::validation(format!("Unexpected event {:?}", other))),
        }
    })
}

#[test]
fn ignored_sigterm_escalates_to_kill() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let settings = EngineSettings {
            graceful_stop_timeout: Duration::from_millis(200),
            ..settings()
        };
        let supervisor =
            ProcessSupervisor::new(settings, MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation =
            script_invocation(&dir, "trap '' TERM\nwhile true; do sleep 0.05; done\n")?;

        supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let exit = supervisor.stop().await?;
        if exit.as_ref().and_then(|exit| exit.signal) != Some(libc::SIGKILL) {
            return Err(AppError::validation(format!("Unexpected exit {:?}", exit)));
        }
        Ok(())
    })
}

#[test]
fn unreachable_database_fails_precheck() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let endpoint = {
            let (listener, endpoint) = database().await?;
            drop(listener);
            endpoint
        };
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(&dir, "exit 0\n")?;

        match supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await
        {
            Err(AppError::Supervisor(SupervisorError::ConnectionPrecheck { .. })) => {}
            other => return Err(AppError::validation(format!("Unexpected result {:?}", other))),
        }
        if supervisor.is_running().await {
            return Err(AppError::validation("Nothing may run after a failed precheck"));
        }
        Ok(())
    })
}

#[test]
fn missing_executable_is_reported() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let (_db, endpoint) = database().await?;
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let mut invocation = script_invocation(&dir, "exit 0\n")?;
        invocation.program = dir.path().join("no-such-engine");

        match supervisor
            .start(&invocation, &endpoint, DurationBound::UntilStopped)
            .await
        {
            Err(AppError::Supervisor(SupervisorError::MissingExecutable { path }))
                if path == invocation.program =>
            {
                Ok(())
            }
            other => Err(AppError::validation(format!("Unexpected result {:?}", other))),
        }
    })
}

#[test]
fn failing_step_reports_exit() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(
            &dir,
            "if [ \"$1\" = prepare ]; then echo 'table exists' >&2; exit 1; fi\nexit 0\n",
        )?;

        supervisor.run_step(&invocation, EngineStep::Cleanup).await?;
        match supervisor.run_step(&invocation, EngineStep::Prepare).await {
            Err(AppError::Supervisor(SupervisorError::StepFailed { step, exit }))
                if step == EngineStep::Prepare && exit.code == Some(1) =>
            {
                Ok(())
            }
            other => Err(AppError::validation(format!("Unexpected result {:?}", other))),
        }
    })
}

#[test]
fn slow_step_times_out() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let settings = EngineSettings {
            step_timeout: Duration::from_millis(200),
            ..settings()
        };
        let supervisor =
            ProcessSupervisor::new(settings, MetricsPublisher::new("a", Duration::from_secs(1)));
        let invocation = script_invocation(&dir, "exec sleep 30\n")?;

        match supervisor.run_step(&invocation, EngineStep::Prepare).await {
            Err(AppError::Supervisor(SupervisorError::StepTimeout { timeout_ms: 200, .. })) => {}
            other => return Err(AppError::validation(format!("Unexpected result {:?}", other))),
        }
        if supervisor.stop().await?.is_some() {
            return Err(AppError::validation("Timed out step must be reaped"));
        }
        Ok(())
    })
}

#[test]
fn stop_interrupts_step_in_flight() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let supervisor = Arc::new(ProcessSupervisor::new(
            settings(),
            MetricsPublisher::new("a", Duration::from_secs(1)),
        ));
        let invocation = script_invocation(&dir, "exec sleep 30\n")?;

        let step = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run_step(&invocation, EngineStep::Prepare).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        if supervisor.stop().await?.is_none() {
            return Err(AppError::validation("Step process must be stopped"));
        }
        match step.await? {
            Err(AppError::Supervisor(SupervisorError::Interrupted { step }))
                if step == EngineStep::Prepare =>
            {
                Ok(())
            }
            other => Err(AppError::validation(format!("Unexpected result {:?}", other))),
        }
    })
}

#[test]
fn orphaned_engine_is_terminated() -> AppResult<()> {
    run_async_test(async {
        let (mut leftover, pid) = spawn_leftover()?;
        let engine = identify(pid);
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));

        if !supervisor.reap_orphan(&engine).await? {
            return Err(AppError::validation("A live orphan must be terminated"));
        }
        let status = tokio::time::timeout(EVENT_TIMEOUT, leftover.wait())
            .await
            .map_err(|_elapsed| AppError::validation("Orphan outlived its termination"))??;
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        if signal != Some(libc::SIGTERM) {
            return Err(AppError::validation(format!("Unexpected orphan exit {:?}", status)));
        }
        if supervisor.reap_orphan(&engine).await? {
            return Err(AppError::validation("A terminated orphan must not be found again"));
        }
        Ok(())
    })
}

#[cfg(target_os = "linux")]
#[test]
fn reused_pid_is_left_alone() -> AppResult<()> {
    run_async_test(async {
        let (mut leftover, pid) = spawn_leftover()?;
        let Some(start_ticks) = identify(pid).start_ticks else {
            return Err(AppError::validation("Linux must report a start time"));
        };
        let recorded = EngineIdentity {
            pid,
            start_ticks: Some(start_ticks.wrapping_add(1)),
        };
        let supervisor =
            ProcessSupervisor::new(settings(), MetricsPublisher::new("a", Duration::from_secs(1)));

        if supervisor.reap_orphan(&recorded).await? {
            return Err(AppError::validation("A different process under the same pid was signalled"));
        }
        if leftover.try_wait()?.is_some() {
            return Err(AppError::validation("Unrelated process must keep running"));
        }
        leftover.kill().await?;
        Ok(())
    })
}
