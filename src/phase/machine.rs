use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{AgentStatus, BenchmarkConfig, ExitState, LifecyclePhase, TargetRecord, keys};
use crate::error::{AppError, AppResult, SupervisorError};
use crate::metrics::MetricsPublisher;
use crate::store::{StateStore, StoreEntry, decode_entry, get_json, put_json};
use crate::supervisor::{EngineEvent, EngineOutcome, EngineStep, ProcessSupervisor, StartOutcome};
use crate::system::ShutdownReceiver;
use crate::workload::{Invocation, WorkloadResolver};

use super::guard::PhaseGuard;
use super::plan::{Action, plan_next};

/// Upper bound on actions taken for one observed target before yielding.
const MAX_STEPS_PER_TARGET: usize = 16;

struct ResolvedWorkload {
    cycle: u64,
    invocation: Invocation,
}

/// Result of work that a newer target may pre-empt.
struct Guarded<T> {
    result: AppResult<T>,
    /// Newest target seen while the work ran.
    newer: Option<TargetRecord>,
    preempted: bool,
}

/// Drives the local agent toward the leader's target.
pub struct PhaseMachine {
    agent_id: String,
    store: Arc<dyn StateStore>,
    guard: Arc<PhaseGuard>,
    supervisor: Arc<ProcessSupervisor>,
    resolver: WorkloadResolver,
    publisher: MetricsPublisher,
    workload: StdMutex<Option<ResolvedWorkload>>,
    /// Spawn generation of the engine this machine started that has not
    /// reported back. Events about any other generation are stale.
    owned_run: StdMutex<Option<u64>>,
}

impl PhaseMachine {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        guard: Arc<PhaseGuard>,
        supervisor: Arc<ProcessSupervisor>,
        resolver: WorkloadResolver,
        publisher: MetricsPublisher,
    ) -> Self {
        Self {
            agent_id: store.writer().to_owned(),
            store,
            guard,
            supervisor,
            resolver,
            publisher,
            workload: StdMutex::new(None),
            owned_run: StdMutex::new(None),
        }
    }

    /// Observes the target record and engine events until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error when the initial status cannot be written.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<EngineEvent>,
        mut shutdown_rx: ShutdownReceiver,
    ) -> AppResult<()> {
        let mut feed = self.store.subscribe();
        let mut target = self.read_target().await;
        self.guard.publish().await?;
        self.reap_recorded_engine().await;
        info!("Phase machine for {} started", self.agent_id);

        let mut events_open = true;
        loop {
            while let Ok(event) = events.try_recv() {
                self.on_engine_event(event).await;
            }
            if let Some(current) = target.take() {
                target = Some(self.converge(current, &mut feed).await);
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                received = feed.recv() => {
                    if matches!(received, Err(RecvError::Closed)) {
                        warn!("Store change feed closed");
                        break;
                    }
                    if let Some(next) = self.target_from(received).await {
                        target = Some(newest(target, next));
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_engine_event(event).await,
                    None => events_open = false,
                },
            }
        }
        Ok(())
    }

    async fn read_target(&self) -> Option<TargetRecord> {
        get_json::<TargetRecord>(self.store.as_ref(), keys::TARGET)
            .await
            .map(|(target, _)| target)
    }

    async fn target_from(&self, received: Result<StoreEntry, RecvError>) -> Option<TargetRecord> {
        match received {
            Ok(entry) if entry.key == keys::TARGET => decode_entry(&entry),
            Ok(_) | Err(RecvError::Closed) => None,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Change feed lagged by {} entries, re-reading target", skipped);
                self.read_target().await
            }
        }
    }

    /// Takes actions until the plan says `Idle`. Returns the target it ended on.
    async fn converge(
        &self,
        mut target: TargetRecord,
        feed: &mut broadcast::Receiver<StoreEntry>,
    ) -> TargetRecord {
        for _ in 0..MAX_STEPS_PER_TARGET {
            let status = self.guard.snapshot().await;
            let engine_live = self.owned_run().is_some() || self.supervisor.is_running().await;
            let action = plan_next(&status, &target, engine_live);
            if action == Action::Idle {
                if status.cycle == target.cycle
                    && status.target_version != target.version
                    && let Err(err) = self
                        .guard
                        .record(|status| status.target_version = target.version)
                        .await
                {
                    warn!("Failed to record target version: {}", err);
                }
                return target;
            }

            debug!(
                "{} at {} toward {} v{}: {:?}",
                self.agent_id, status.phase, target.phase, target.version, action
            );
            match self.execute(action, &target, feed).await {
                Ok(Some(newer)) => target = newest(Some(target), newer),
                Ok(None) => {}
                Err(err) => {
                    warn!("Phase action failed: {}", err);
                    return target;
                }
            }
        }
        warn!(
            "No convergence on target {} v{} after {} actions",
            target.phase, target.version, MAX_STEPS_PER_TARGET
        );
        target
    }

    async fn execute(
        &self,
        action: Action,
        target: &TargetRecord,
        feed: &mut broadcast::Receiver<StoreEntry>,
    ) -> AppResult<Option<TargetRecord>> {
        match action {
            Action::Prepare => return self.prepare(target, feed).await,
            Action::Start => return self.start(target, feed).await,
            Action::Stop => self.stop_engine().await?,
            Action::Settle(phase) => {
                self.guard.transition(phase).await?;
            }
            Action::Collect => self.collect().await?,
            Action::Clean => self.clean().await?,
            Action::AdoptCycle(cycle) => {
                info!("Joining cycle {}", cycle);
                self.guard
                    .record(|status| {
                        status.cycle = cycle;
                        status.run_version = None;
                        status.last_error = None;
                        status.exit = None;
                        status.engine = None;
                    })
                    .await?;
            }
            Action::Fail(reason) => {
                self.guard.fail(&reason, None).await?;
            }
            Action::Idle => {}
        }
        Ok(None)
    }

    async fn prepare(
        &self,
        target: &TargetRecord,
        feed: &mut broadcast::Receiver<StoreEntry>,
    ) -> AppResult<Option<TargetRecord>> {
        let Some(config) = target.config.clone() else {
            self.guard.fail("target has no benchmark config", None).await?;
            return Ok(None);
        };
        self.guard
            .advance(LifecyclePhase::Preparing, |status| {
                status.last_error = None;
                status.exit = None;
            })
            .await?;
        let invocation = match self.resolve(target.cycle, config).await {
            Ok(invocation) => invocation,
            Err(err) => {
                self.guard.fail(&err.to_string(), None).await?;
                return Ok(None);
            }
        };

        let work = async {
            // Leftovers from an earlier run would make prepare fail.
            match self.supervisor.run_step(&invocation, EngineStep::Cleanup).await {
                Ok(()) => {}
                interrupted @ Err(AppError::Supervisor(SupervisorError::Interrupted { .. })) => {
                    return interrupted;
                }
                Err(err) => debug!("Cleanup before prepare failed: {}", err),
            }
            self.supervisor.run_step(&invocation, EngineStep::Prepare).await
        };
        let guarded = self.preemptible(target, feed, work).await;
        match guarded.result {
            Ok(()) => {
                info!("Workload prepared for cycle {}", target.cycle);
                self.guard.transition(LifecyclePhase::Prepared).await?;
            }
            Err(err) => {
                let exit = step_exit(&err);
                self.guard.fail(&err.to_string(), exit).await?;
            }
        }
        Ok(guarded.newer)
    }

    async fn start(
        &self,
        target: &TargetRecord,
        feed: &mut broadcast::Receiver<StoreEntry>,
    ) -> AppResult<Option<TargetRecord>> {
        let Some(config) = target.config.clone() else {
            self.guard.fail("target has no benchmark config", None).await?;
            return Ok(None);
        };
        self.guard
            .advance(LifecyclePhase::Starting, |status| {
                status.last_error = None;
                status.exit = None;
            })
            .await?;
        let invocation = match self.resolve(target.cycle, config.clone()).await {
            Ok(invocation) => invocation,
            Err(err) => {
                self.guard.fail(&err.to_string(), None).await?;
                return Ok(None);
            }
        };

        self.publisher.begin_run(
            target.cycle,
            config.database.kind.label(),
            &config.workload,
            config.threads.get(),
        );
        let work = self
            .supervisor
            .start(&invocation, &config.database.endpoint, config.duration);
        let guarded = self.preemptible(target, feed, work).await;

        if guarded.preempted {
            self.stop_quietly().await;
            self.guard.transition(LifecyclePhase::Stopping).await?;
            self.guard.transition(LifecyclePhase::Stopped).await?;
            return Ok(guarded.newer);
        }
        match guarded.result {
            Ok(outcome) => {
                let (generation, engine) = match outcome {
                    StartOutcome::Started { engine, generation } => {
                        info!("Run v{} started (pid {})", target.version, engine.pid);
                        (generation, Some(engine))
                    }
                    StartOutcome::AlreadyRunning { generation } => {
                        debug!("Engine already running for v{}", target.version);
                        (generation, None)
                    }
                };
                self.set_owned_run(Some(generation));
                let version = target.version;
                self.guard
                    .advance(LifecyclePhase::Running, |status| {
                        status.run_version = Some(version);
                        if engine.is_some() {
                            status.engine = engine;
                        }
                    })
                    .await?;
            }
            Err(err) => {
                self.guard.fail(&err.to_string(), None).await?;
            }
        }
        Ok(guarded.newer)
    }

    async fn stop_engine(&self) -> AppResult<()> {
        self.guard.transition(LifecyclePhase::Stopping).await?;
        self.set_owned_run(None);
        let exit = match self.supervisor.stop().await {
            Ok(exit) => exit,
            Err(err) => {
                self.guard.fail(&err.to_string(), None).await?;
                return Ok(());
            }
        };
        self.guard
            .advance(LifecyclePhase::Stopped, |status| {
                if exit.is_some() {
                    status.exit = exit;
                }
                status.engine = None;
            })
            .await?;
        Ok(())
    }

    async fn collect(&self) -> AppResult<()> {
        self.guard.transition(LifecyclePhase::Collecting).await?;
        let document = self.publisher.document();
        if let Err(err) =
            put_json(self.store.as_ref(), &keys::metrics(&self.agent_id), &document).await
        {
            self.guard
                .fail(&format!("metrics collection failed: {}", err), None)
                .await?;
            return Ok(());
        }
        info!(
            "Collected {} reports (tps {:.2}, errors {})",
            document.metrics.reports, document.metrics.tps, document.metrics.error_count
        );
        self.guard.transition(LifecyclePhase::Collected).await?;
        Ok(())
    }

    /// Never fails for engine reasons; only status writes can error.
    async fn clean(&self) -> AppResult<()> {
        self.guard.transition(LifecyclePhase::Cleaning).await?;
        self.set_owned_run(None);
        self.stop_quietly().await;
        self.reap_recorded_engine().await;

        let workload = self
            .workload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match workload {
            Some(workload) => {
                if let Err(err) = self
                    .supervisor
                    .run_step(&workload.invocation, EngineStep::Cleanup)
                    .await
                {
                    warn!("Workload cleanup failed: {}", err);
                }
            }
            None => debug!("No resolved workload to clean up"),
        }

        self.publisher.reset();
        self.guard
            .advance(LifecyclePhase::Unset, |status| {
                status.run_version = None;
                status.last_error = None;
                status.exit = None;
                status.engine = None;
            })
            .await?;
        info!("Cleaned up");
        Ok(())
    }

    /// Terminates an engine the status still names but no live supervisor
    /// slot owns, such as one a crashed agent process left running.
    async fn reap_recorded_engine(&self) {
        let Some(engine) = self.guard.snapshot().await.engine else {
            return;
        };
        match self.supervisor.reap_orphan(&engine).await {
            Ok(true) => info!("Terminated orphaned engine pid {}", engine.pid),
            Ok(false) => debug!("Recorded engine pid {} is gone", engine.pid),
            Err(err) => warn!("Failed to terminate orphaned engine pid {}: {}", engine.pid, err),
        }
    }

    fn owned_run(&self) -> Option<u64> {
        *self.owned_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_owned_run(&self, generation: Option<u64>) {
        *self.owned_run.lock().unwrap_or_else(PoisonError::into_inner) = generation;
    }

    async fn stop_quietly(&self) {
        match self.supervisor.stop().await {
            Ok(Some(exit)) => info!("Engine stopped ({})", exit),
            Ok(None) => {}
            Err(err) => warn!("Failed to stop engine: {}", err),
        }
    }

    async fn resolve(&self, cycle: u64, config: BenchmarkConfig) -> AppResult<Invocation> {
        if let Some(cached) = self
            .workload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|workload| workload.cycle == cycle)
        {
            return Ok(cached.invocation.clone());
        }
        let resolver = self.resolver.clone();
        let invocation = tokio::task::spawn_blocking(move || resolver.resolve(&config)).await??;
        *self.workload.lock().unwrap_or_else(PoisonError::into_inner) = Some(ResolvedWorkload {
            cycle,
            invocation: invocation.clone(),
        });
        Ok(invocation)
    }

    /// Runs `work` while watching for a newer target that makes it moot
    /// (`stopped`, `unset`, or a new cycle). On pre-emption the engine is
    /// stopped until the work gives up.
    async fn preemptible<T, F>(
        &self,
        current: &TargetRecord,
        feed: &mut broadcast::Receiver<StoreEntry>,
        work: F,
    ) -> Guarded<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        tokio::pin!(work);
        let mut newer: Option<TargetRecord> = None;
        let mut preempted = false;
        let mut feed_open = true;
        let mut retry = tokio::time::interval(self.supervisor.settings().poll_interval);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => {
                    return Guarded { result, newer, preempted };
                }
                received = feed.recv(), if feed_open => {
                    if matches!(received, Err(RecvError::Closed)) {
                        feed_open = false;
                        continue;
                    }
                    let Some(next) = self.target_from(received).await else {
                        continue;
                    };
                    if !next.supersedes(current) {
                        continue;
                    }
                    if !preempted && preempts(current, &next) {
                        info!(
                            "Target {} v{} pre-empts work for v{}",
                            next.phase, next.version, current.version
                        );
                        preempted = true;
                        self.stop_quietly().await;
                    }
                    newer = Some(newest(newer, next));
                }
                _ = retry.tick(), if preempted => self.stop_quietly().await,
            }
        }
    }

    async fn on_engine_event(&self, event: EngineEvent) {
        if self.owned_run() != Some(event.generation) {
            debug!(
                "Ignoring event from engine generation {}: {:?}",
                event.generation, event.outcome
            );
            return;
        }
        let phase = self.guard.snapshot().await.phase;
        if phase != LifecyclePhase::Running {
            debug!("Ignoring engine event in phase {}: {:?}", phase, event.outcome);
            return;
        }
        self.set_owned_run(None);
        let recorded = match event.outcome {
            EngineOutcome::Completed(exit) => {
                info!("Engine reached its duration bound");
                self.settle_stopped(exit).await
            }
            EngineOutcome::Overran(exit) => {
                warn!("Engine overran its duration bound and was stopped");
                self.settle_stopped(exit).await
            }
            EngineOutcome::Crashed(exit) => {
                let reason = format!("engine crashed: {}", exit);
                self.guard.fail(&reason, Some(exit)).await
            }
        };
        if let Err(err) = recorded {
            warn!("Failed to record engine event: {}", err);
        }
    }

    async fn settle_stopped(&self, exit: ExitState) -> AppResult<AgentStatus> {
        self.guard
            .advance(LifecyclePhase::Stopped, |status| {
                status.exit = Some(exit);
                status.engine = None;
            })
            .await
    }
}

fn preempts(current: &TargetRecord, next: &TargetRecord) -> bool {
    next.cycle > current.cycle
        || matches!(next.phase, LifecyclePhase::Stopped | LifecyclePhase::Unset)
}

fn newest(current: Option<TargetRecord>, candidate: TargetRecord) -> TargetRecord {
    match current {
        Some(current) if !candidate.supersedes(&current) => current,
        Some(_) | None => candidate,
    }
}

fn step_exit(err: &AppError) -> Option<ExitState> {
    if let AppError::Supervisor(SupervisorError::StepFailed { exit, .. }) = err {
        Some(exit.clone())
    } else {
        None
    }
}
