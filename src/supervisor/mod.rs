//! Owns the engine process: spawn, watch, time out, tear down.
//!
//! One process slot per agent. `prepare`/`cleanup` steps and the long `run`
//! step share it, so `stop()` pre-empts whichever is in flight.
mod output;

#[cfg(test)]
mod tests;

pub use output::{EngineReport, ParsedLine, TailBuffer, parse_line};

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::domain::{DatabaseEndpoint, DurationBound, EngineIdentity, ExitState};
use crate::error::{AppError, AppResult, SupervisorError};
use crate::metrics::MetricsPublisher;
use crate::system::ShutdownReceiver;
use crate::workload::Invocation;

const STDERR_TAIL_LINES: usize = 20;
const STEP_POLL_CAP: Duration = Duration::from_millis(50);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const ORPHAN_KILL_TIMEOUT: Duration = Duration::from_secs(1);

/// Engine sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStep {
    Prepare,
    Run,
    Cleanup,
}

impl EngineStep {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EngineStep::Prepare => "prepare",
            EngineStep::Run => "run",
            EngineStep::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for EngineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the watch loop observed about a `run` process it did not stop itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    /// Spawn generation of the process the event is about.
    pub generation: u64,
    pub outcome: EngineOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Exited cleanly on its own (duration bound reached).
    Completed(ExitState),
    /// Ran past duration + grace and was stopped.
    Overran(ExitState),
    Crashed(ExitState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        engine: EngineIdentity,
        generation: u64,
    },
    AlreadyRunning {
        generation: u64,
    },
}

struct EngineProcess {
    child: Child,
    step: EngineStep,
    generation: u64,
    pid: u32,
    deadline: Option<Instant>,
    stderr_tail: Arc<StdMutex<TailBuffer>>,
    readers: Vec<JoinHandle<()>>,
}

impl EngineProcess {
    async fn finish(self, status: ExitStatus) -> ExitState {
        for reader in self.readers {
            match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Engine output reader failed: {}", err),
                Err(_elapsed) => debug!("Engine output still open after exit"),
            }
        }
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines();
        ExitState::from_status(status, tail)
    }
}

enum Observed {
    Exited(EngineProcess, ExitStatus),
    Overdue(EngineProcess),
    Lost(EngineProcess, std::io::Error),
}

pub struct ProcessSupervisor {
    settings: EngineSettings,
    publisher: MetricsPublisher,
    slot: Mutex<Option<EngineProcess>>,
    generation: AtomicU64,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(settings: EngineSettings, publisher: MetricsPublisher) -> Self {
        Self {
            settings,
            publisher,
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Whether a `run` process is alive.
    pub async fn is_running(&self) -> bool {
        self.running_generation().await.is_some()
    }

    /// Spawn generation of the live `run` process, if any.
    pub async fn running_generation(&self) -> Option<u64> {
        let mut slot = self.slot.lock().await;
        let process = slot.as_mut().filter(|p| p.step == EngineStep::Run)?;
        matches!(process.child.try_wait(), Ok(None)).then_some(process.generation)
    }

    /// Starts the long-running `run` step.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionPrecheck` when the database is unreachable,
    /// `MissingExecutable`/`Spawn` when the engine cannot be started, and
    /// `Busy` while a `prepare` or `cleanup` step holds the slot.
    pub async fn start(
        &self,
        invocation: &Invocation,
        endpoint: &DatabaseEndpoint,
        duration: DurationBound,
    ) -> AppResult<StartOutcome> {
        if let Some(generation) = self.running_generation().await {
            return Ok(StartOutcome::AlreadyRunning { generation });
        }
        precheck(endpoint, self.settings.precheck_timeout).await?;

        let mut slot = self.slot.lock().await;
        if let Some(process) = slot.as_mut() {
            match process.child.try_wait() {
                Ok(None) if process.step == EngineStep::Run => {
                    return Ok(StartOutcome::AlreadyRunning {
                        generation: process.generation,
                    });
                }
                Ok(None) => {
                    return Err(AppError::supervisor(SupervisorError::Busy {
                        step: process.step,
                    }));
                }
                Ok(Some(_)) | Err(_) => {
                    debug!("Discarding finished engine process {}", process.pid);
                    *slot = None;
                }
            }
        }
        let deadline = duration.as_duration().and_then(|bound| {
            Instant::now().checked_add(bound.saturating_add(self.settings.overrun_grace))
        });
        let process = self.spawn(invocation, EngineStep::Run, deadline)?;
        let engine = identify(process.pid);
        let generation = process.generation;
        info!("Engine started (pid {}, duration {})", engine.pid, duration);
        *slot = Some(process);
        Ok(StartOutcome::Started { engine, generation })
    }

    /// Runs a one-shot `prepare` or `cleanup` step to completion.
    ///
    /// # Errors
    ///
    /// Returns `StepFailed` on a non-zero exit, `StepTimeout` when the step
    /// outlives the step timeout, and `Interrupted` when `stop()` pre-empts it.
    pub async fn run_step(&self, invocation: &Invocation, step: EngineStep) -> AppResult<()> {
        let generation = {
            let mut slot = self.slot.lock().await;
            if let Some(process) = slot.as_mut()
                && matches!(process.child.try_wait(), Ok(None))
            {
                return Err(AppError::supervisor(SupervisorError::Busy {
                    step: process.step,
                }));
            }
            let deadline = Instant::now().checked_add(self.settings.step_timeout);
            let process = self.spawn(invocation, step, deadline)?;
            let generation = process.generation;
            debug!("Engine {} step started (pid {})", step, process.pid);
            *slot = Some(process);
            generation
        };

        let poll = self.settings.poll_interval.min(STEP_POLL_CAP);
        loop {
            tokio::time::sleep(poll).await;
            let observed = {
                let mut slot = self.slot.lock().await;
                let Some(process) = slot.as_mut().filter(|p| p.generation == generation) else {
                    return Err(AppError::supervisor(SupervisorError::Interrupted { step }));
                };
                let overdue = process.deadline.is_some_and(|at| Instant::now() >= at);
                match process.child.try_wait() {
                    Ok(Some(status)) => slot.take().map(|p| Observed::Exited(p, status)),
                    Ok(None) if overdue => slot.take().map(Observed::Overdue),
                    Ok(None) => None,
                    Err(err) => slot.take().map(|p| Observed::Lost(p, err)),
                }
            };
            match observed {
                None => {}
                Some(Observed::Exited(process, status)) => {
                    let exit = process.finish(status).await;
                    if exit.is_success() {
                        debug!("Engine {} step finished", step);
                        return Ok(());
                    }
                    return Err(AppError::supervisor(SupervisorError::StepFailed { step, exit }));
                }
                Some(Observed::Overdue(process)) => {
                    warn!("Engine {} step exceeded its timeout, terminating", step);
                    if let Err(err) = self.terminate(process).await {
                        warn!("Failed to terminate engine {} step: {}", step, err);
                    }
                    return Err(AppError::supervisor(SupervisorError::StepTimeout {
                        step,
                        timeout_ms: u64::try_from(self.settings.step_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    }));
                }
                Some(Observed::Lost(process, err)) => {
                    if let Err(stop_err) = self.terminate(process).await {
                        warn!("Failed to terminate engine {} step: {}", step, stop_err);
                    }
                    return Err(AppError::supervisor(SupervisorError::Io {
                        context: "wait for engine step",
                        source: err,
                    }));
                }
            }
        }
    }

    /// SIGTERM, wait up to the graceful timeout, then SIGKILL. Returns the exit
    /// of the process it stopped, or `None` when nothing was running.
    ///
    /// # Errors
    ///
    /// Returns an error when the child cannot be waited on or killed.
    pub async fn stop(&self) -> AppResult<Option<ExitState>> {
        let Some(process) = self.slot.lock().await.take() else {
            return Ok(None);
        };
        info!("Stopping engine {} step (pid {})", process.step, process.pid);
        self.terminate(process).await.map(Some)
    }

    async fn terminate(&self, mut process: EngineProcess) -> AppResult<ExitState> {
        let io_error = |context: &'static str| {
            move |source: std::io::Error| AppError::supervisor(SupervisorError::Io { context, source })
        };
        if let Some(status) = process.child.try_wait().map_err(io_error("poll engine"))? {
            return Ok(process.finish(status).await);
        }
        if let Err(err) = send_signal(process.pid, libc::SIGTERM) {
            warn!("{}", err);
        }
        let graceful = self.settings.graceful_stop_timeout;
        let status = match tokio::time::timeout(graceful, process.child.wait()).await {
            Ok(result) => result.map_err(io_error("wait for engine"))?,
            Err(_elapsed) => {
                warn!(
                    "Engine pid {} ignored SIGTERM for {}ms, killing",
                    process.pid,
                    graceful.as_millis()
                );
                process.child.kill().await.map_err(io_error("kill engine"))?;
                process.child.wait().await.map_err(io_error("reap engine"))?
            }
        };
        Ok(process.finish(status).await)
    }

    /// Terminates an engine left behind by an earlier agent process, matched
    /// by pid and start time. Returns whether one was still alive.
    ///
    /// # Errors
    ///
    /// Returns `Signal` when the process cannot be signalled or survives
    /// SIGKILL.
    pub async fn reap_orphan(&self, engine: &EngineIdentity) -> AppResult<bool> {
        let owned = self
            .slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|process| process.pid == engine.pid);
        if owned || !still_alive(engine) {
            return Ok(false);
        }
        warn!("Terminating orphaned engine pid {}", engine.pid);
        if !signal_orphan(engine, libc::SIGTERM)? {
            return Ok(true);
        }
        if wait_gone(engine, self.settings.graceful_stop_timeout).await {
            return Ok(true);
        }
        warn!("Orphaned engine pid {} ignored SIGTERM, killing", engine.pid);
        if !signal_orphan(engine, libc::SIGKILL)? {
            return Ok(true);
        }
        if wait_gone(engine, ORPHAN_KILL_TIMEOUT).await {
            return Ok(true);
        }
        Err(AppError::supervisor(SupervisorError::Signal {
            pid: engine.pid,
            source: std::io::Error::from(std::io::ErrorKind::TimedOut),
        }))
    }

    /// Checks the `run` process once; `None` while it is healthy or absent.
    pub async fn poll_engine(&self) -> Option<EngineEvent> {
        let observed = {
            let mut slot = self.slot.lock().await;
            let process = slot.as_mut().filter(|p| p.step == EngineStep::Run)?;
            let overdue = process.deadline.is_some_and(|at| Instant::now() >= at);
            match process.child.try_wait() {
                Ok(Some(status)) => slot.take().map(|p| Observed::Exited(p, status)),
                Ok(None) if overdue => slot.take().map(Observed::Overdue),
                Ok(None) => None,
                Err(err) => slot.take().map(|p| Observed::Lost(p, err)),
            }
        }?;

        let (generation, outcome) = match observed {
            Observed::Exited(process, status) => {
                let generation = process.generation;
                let exit = process.finish(status).await;
                if exit.is_success() {
                    info!("Engine completed");
                    (generation, EngineOutcome::Completed(exit))
                } else {
                    warn!("Engine crashed: {}", exit);
                    (generation, EngineOutcome::Crashed(exit))
                }
            }
            Observed::Overdue(process) => {
                warn!("Engine overran its duration bound, stopping");
                let generation = process.generation;
                match self.terminate(process).await {
                    Ok(exit) => (generation, EngineOutcome::Overran(exit)),
                    Err(err) => {
                        warn!("Failed to stop overrunning engine: {}", err);
                        (generation, EngineOutcome::Overran(ExitState::default()))
                    }
                }
            }
            Observed::Lost(process, err) => {
                warn!("Lost track of engine pid {}: {}", process.pid, err);
                let generation = process.generation;
                let exit = self.terminate(process).await.unwrap_or_default();
                (generation, EngineOutcome::Crashed(exit))
            }
        };
        Some(EngineEvent {
            generation,
            outcome,
        })
    }

    /// Watch loop. Stops the engine gracefully on shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error when the final stop fails.
    pub async fn supervise(
        self: Arc<Self>,
        events: mpsc::Sender<EngineEvent>,
        mut shutdown_rx: ShutdownReceiver,
    ) -> AppResult<()> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }
            if let Some(event) = self.poll_engine().await
                && events.send(event).await.is_err()
            {
                debug!("Engine event receiver closed");
                break;
            }
        }
        if let Some(exit) = self.stop().await? {
            info!("Engine stopped on shutdown ({})", exit);
        }
        Ok(())
    }

    fn spawn(
        &self,
        invocation: &Invocation,
        step: EngineStep,
        deadline: Option<Instant>,
    ) -> AppResult<EngineProcess> {
        let program = invocation.program.as_path();
        if program.components().count() > 1 && !program.exists() {
            return Err(AppError::supervisor(SupervisorError::MissingExecutable {
                path: program.to_path_buf(),
            }));
        }
        let mut child = Command::new(program)
            .args(invocation.command_args(step))
            .envs(invocation.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| spawn_error(program, source))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::supervisor(SupervisorError::MissingPid))?;

        let stderr_tail = Arc::new(StdMutex::new(TailBuffer::new(STDERR_TAIL_LINES)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let publisher = (step == EngineStep::Run).then(|| self.publisher.clone());
            readers.push(tokio::spawn(read_stdout(stdout, step, publisher)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stderr(stderr, Arc::clone(&stderr_tail))));
        }

        Ok(EngineProcess {
            child,
            step,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            pid,
            deadline,
            stderr_tail,
            readers,
        })
    }
}

fn spawn_error(program: &Path, source: std::io::Error) -> AppError {
    AppError::supervisor(SupervisorError::Spawn {
        program: program.to_path_buf(),
        source,
    })
}

async fn read_stdout<R>(stream: R, step: EngineStep, publisher: Option<MetricsPublisher>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("Engine stdout closed: {}", err);
                break;
            }
        };
        let Some(publisher) = publisher.as_ref() else {
            debug!("[{}] {}", step, line);
            continue;
        };
        publisher.push_output(&line);
        match parse_line(&line) {
            ParsedLine::Report(report) => publisher.record(&report),
            ParsedLine::Malformed => publisher.record_malformed(&line),
            ParsedLine::Other => {}
        }
    }
}

async fn read_stderr<R>(stream: R, tail: Arc<StdMutex<TailBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("engine stderr: {}", line);
        tail.lock().unwrap_or_else(PoisonError::into_inner).push(&line);
    }
}

/// Identity of a live process, including its start time where `/proc` has it.
#[must_use]
pub fn identify(pid: u32) -> EngineIdentity {
    EngineIdentity {
        pid,
        start_ticks: proc_stat(pid).map(|(_, start_ticks)| start_ticks),
    }
}

/// State letter and start time (clock ticks since boot) from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn proc_stat(pid: u32) -> Option<(char, u64)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may hold spaces and parentheses.
    let (_, fields) = stat.rsplit_once(')')?;
    let mut fields = fields.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let start_ticks = fields.nth(18)?.parse().ok()?;
    Some((state, start_ticks))
}

#[cfg(not(target_os = "linux"))]
fn proc_stat(_pid: u32) -> Option<(char, u64)> {
    None
}

/// Whether `engine` still names a running process. Zombies count as gone.
fn still_alive(engine: &EngineIdentity) -> bool {
    match proc_stat(engine.pid) {
        Some((state, start_ticks)) => {
            state != 'Z' && engine.start_ticks.is_none_or(|recorded| recorded == start_ticks)
        }
        None if cfg!(target_os = "linux") => false,
        None => send_signal(engine.pid, 0).is_ok(),
    }
}

async fn wait_gone(engine: &EngineIdentity, within: Duration) -> bool {
    let deadline = Instant::now().checked_add(within);
    loop {
        if !still_alive(engine) {
            return true;
        }
        if deadline.is_none_or(|at| Instant::now() >= at) {
            return false;
        }
        tokio::time::sleep(STEP_POLL_CAP).await;
    }
}

/// Signals an orphan; `Ok(false)` when it exited before the signal landed.
fn signal_orphan(engine: &EngineIdentity, signal: libc::c_int) -> AppResult<bool> {
    match send_signal(engine.pid, signal) {
        Ok(()) => Ok(true),
        Err(SupervisorError::Signal { source, .. })
            if source.raw_os_error() == Some(libc::ESRCH) =>
        {
            Ok(false)
        }
        Err(err) => Err(AppError::supervisor(err)),
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), SupervisorError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_overflow| SupervisorError::Signal {
        pid,
        source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
    })?;
    // SAFETY: kill(2) takes plain integers and touches no memory we own.
    // Children are signalled before they are reaped and orphans only after
    // their start time matched, so `raw` names the intended process.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(SupervisorError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

/// TCP or unix-socket reachability check. Says nothing about credentials.
///
/// # Errors
///
/// Returns `ConnectionPrecheck` when the connection fails or times out.
pub async fn precheck(endpoint: &DatabaseEndpoint, timeout: Duration) -> AppResult<()> {
    let attempt = match endpoint {
        DatabaseEndpoint::Tcp { host, port } => {
            tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), *port)))
                .await
                .map(|result| result.map(drop))
        }
        DatabaseEndpoint::UnixSocket { path } => {
            tokio::time::timeout(timeout, UnixStream::connect(path))
                .await
                .map(|result| result.map(drop))
        }
    };
    let reason = match attempt {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => err.to_string(),
        Err(_elapsed) => format!("no answer within {}ms", timeout.as_millis()),
    };
    Err(AppError::supervisor(SupervisorError::ConnectionPrecheck {
        endpoint: endpoint.to_string(),
        reason,
    }))
}
