use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CoordinatorSettings, LivenessSettings};
use crate::domain::{
    AgentStatus, BenchmarkConfig, ClusterHealth, Command, FailureNote, LifecyclePhase,
    TargetRecord, keys, now_ms,
};
use crate::error::{AppError, AppResult, LifecycleError};
use crate::membership::GroupMembership;
use crate::store::{StateStore, get_all_json, get_json, put_json_in_term};
use crate::system::ShutdownReceiver;

use super::report::{AgentReport, AgentVerdict, ClusterReport, CommandAck};
use super::transition::plan_transition;

/// Last status version the leader observed per agent, stamped with the
/// leader's own monotonic clock.
#[derive(Debug, Clone, Copy)]
struct Sighting {
    version: u64,
    at: Instant,
}

#[derive(Debug, Default)]
struct LeaderState {
    last_seen: HashMap<String, Sighting>,
}

struct Evaluation {
    report: ClusterReport,
    /// Every agent either stopped after the current run or failed.
    run_finished: bool,
}

/// Leader duties: validate commands, write the target record, aggregate
/// agent status, and advance the target when a bounded run ends.
pub struct LeaderCoordinator {
    agent_id: String,
    store: Arc<dyn StateStore>,
    membership: Arc<dyn GroupMembership>,
    liveness: LivenessSettings,
    settings: CoordinatorSettings,
    state: Mutex<LeaderState>,
}

impl LeaderCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        membership: Arc<dyn GroupMembership>,
        liveness: LivenessSettings,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            agent_id: membership.self_id().to_owned(),
            store,
            membership,
            liveness,
            settings,
            state: Mutex::new(LeaderState::default()),
        }
    }

    async fn ensure_leader(&self) -> Result<(), LifecycleError> {
        match self.membership.current_leader().await {
            Some(leader) if leader == self.agent_id => Ok(()),
            Some(leader) => Err(LifecycleError::NotLeader { leader }),
            None => Err(LifecycleError::NoLeader),
        }
    }

    async fn lock_state(&self) -> Result<MutexGuard<'_, LeaderState>, LifecycleError> {
        tokio::time::timeout(self.settings.lock_timeout, self.state.lock())
            .await
            .map_err(|_elapsed| LifecycleError::LeaderBusy)
    }

    /// The last durable target record, or the initial one when none exists.
    pub async fn current_target(&self) -> TargetRecord {
        get_json::<TargetRecord>(self.store.as_ref(), keys::TARGET)
            .await
            .map_or_else(|| TargetRecord::initial(&self.agent_id), |(target, _)| target)
    }

    async fn current_health(&self, cycle: u64) -> ClusterHealth {
        get_json::<ClusterHealth>(self.store.as_ref(), keys::HEALTH)
            .await
            .map(|(health, _)| health)
            .filter(|health| health.cycle == cycle)
            .unwrap_or_else(|| ClusterHealth {
                cycle,
                failures: BTreeMap::new(),
                updated_at_ms: now_ms(),
            })
    }

    /// Validates `command` against the current target and writes the new
    /// target record.
    ///
    /// # Errors
    ///
    /// Returns `NotLeader`/`NoLeader` when this agent does not lead,
    /// `LeaderBusy` when the leader lock times out, the rejection from the
    /// transition rules, or a store error.
    pub async fn request_transition(
        &self,
        command: Command,
        config: Option<BenchmarkConfig>,
    ) -> AppResult<CommandAck> {
        self.ensure_leader().await.map_err(AppError::lifecycle)?;
        let _guard = self.lock_state().await.map_err(AppError::lifecycle)?;

        let current = self.current_target().await;
        let planned = plan_transition(&current, command, config, &self.agent_id, now_ms())
            .map_err(|err| {
                info!("Rejected {} at target {}: {}", command, current.phase, err);
                AppError::lifecycle(err)
            })?;
        let Some(next) = planned else {
            debug!("{} is a repeat at target {} v{}", command, current.phase, current.version);
            return Ok(CommandAck::accepted(
                &current,
                format!("Target already {} (v{}).", current.phase, current.version),
            ));
        };

        let next = self.write_target(next).await?;
        if next.cycle != current.cycle {
            let health = ClusterHealth {
                cycle: next.cycle,
                failures: BTreeMap::new(),
                updated_at_ms: now_ms(),
            };
            put_json_in_term(self.store.as_ref(), keys::HEALTH, &health, next.term).await?;
        }
        info!(
            "Accepted {}: target {} -> {} (v{}, term {}, cycle {})",
            command, current.phase, next.phase, next.version, next.term, next.cycle
        );
        Ok(CommandAck::accepted(
            &next,
            format!("Target set to {} (v{}).", next.phase, next.version),
        ))
    }

    /// Stamps `next` with this leader's term and writes it. The store refuses
    /// the write when it already holds a target from a newer term.
    async fn write_target(&self, next: TargetRecord) -> AppResult<TargetRecord> {
        let term = self.membership.term().await;
        let next = TargetRecord { term, ..next };
        put_json_in_term(self.store.as_ref(), keys::TARGET, &next, term).await?;
        Ok(next)
    }

    /// Reports how far every known agent is from the target phase, marking
    /// agents silent past the liveness timeout as failed.
    ///
    /// # Errors
    ///
    /// Returns an error when this agent does not lead, the lock times out, or
    /// the health record cannot be written.
    pub async fn aggregate_status(&self) -> AppResult<ClusterReport> {
        self.ensure_leader().await.map_err(AppError::lifecycle)?;
        let mut state = self.lock_state().await.map_err(AppError::lifecycle)?;
        let evaluation = self.evaluate(&mut state).await?;
        Ok(evaluation.report)
    }

    /// Resets liveness clocks after gaining leadership and returns the target
    /// record this leader continues from.
    ///
    /// # Errors
    ///
    /// Returns `LeaderBusy` when the lock times out.
    pub async fn reconcile(&self) -> AppResult<TargetRecord> {
        let mut state = self.lock_state().await.map_err(AppError::lifecycle)?;
        state.last_seen.clear();
        let target = self.current_target().await;
        let health = self.current_health(target.cycle).await;
        info!(
            "Leading in term {} from target {} (v{}, term {}, cycle {}, {} acknowledged failures)",
            self.membership.term().await,
            target.phase,
            target.version,
            target.term,
            target.cycle,
            health.failures.len()
        );
        Ok(target)
    }

    /// One leader tick: aggregate, then advance `running -> stopped` once the
    /// run has ended everywhere.
    ///
    /// # Errors
    ///
    /// Returns an error when a store write fails or the lock times out.
    pub async fn tick(&self) -> AppResult<ClusterReport> {
        self.ensure_leader().await.map_err(AppError::lifecycle)?;
        let mut state = self.lock_state().await.map_err(AppError::lifecycle)?;
        let evaluation = self.evaluate(&mut state).await?;
        if !evaluation.run_finished {
            return Ok(evaluation.report);
        }

        let current = evaluation.report.target.clone();
        let planned = plan_transition(&current, Command::Stop, None, &self.agent_id, now_ms())
            .map_err(AppError::lifecycle)?;
        let Some(next) = planned else {
            return Ok(evaluation.report);
        };
        let next = self.write_target(next).await?;
        info!(
            "Run v{} finished on every agent; target advanced to {} (v{})",
            current.version, next.phase, next.version
        );
        let advanced = self.evaluate(&mut state).await?;
        Ok(advanced.report)
    }

    async fn evaluate(&self, state: &mut LeaderState) -> AppResult<Evaluation> {
        let now = Instant::now();
        let target = self.current_target().await;
        let mut health = self.current_health(target.cycle).await;
        let mut health_changed = false;

        let roster: Vec<String> = self
            .membership
            .view()
            .await
            .members
            .into_iter()
            .map(|member| member.id)
            .collect();
        let statuses: HashMap<String, (AgentStatus, u64)> =
            get_all_json::<AgentStatus>(self.store.as_ref(), keys::STATUS_PREFIX)
                .await
                .into_iter()
                .map(|(status, entry)| (status.agent_id.clone(), (status, entry.version)))
                .collect();

        state
            .last_seen
            .retain(|agent_id, _| roster.iter().any(|id| id == agent_id));

        let mut agents = Vec::with_capacity(roster.len());
        let mut run_finished = target.phase == LifecyclePhase::Running && !roster.is_empty();
        for agent_id in roster {
            let status = statuses.get(&agent_id).map(|(status, _)| status);
            let observed_version = statuses.get(&agent_id).map_or(0, |(_, version)| *version);
            let sighting = state
                .last_seen
                .entry(agent_id.clone())
                .or_insert(Sighting {
                    version: observed_version,
                    at: now,
                });
            if sighting.version != observed_version {
                *sighting = Sighting {
                    version: observed_version,
                    at: now,
                };
            }
            let silent_for = now.saturating_duration_since(sighting.at);
            let same_cycle = status.is_some_and(|status| status.cycle == target.cycle);

            let verdict = if let Some(note) = health.failures.get(&agent_id) {
                AgentVerdict::Failed {
                    reason: note.reason.clone(),
                    by_timeout: note.by_timeout,
                }
            } else if let Some(status) = status.filter(|status| {
                status.phase == LifecyclePhase::Failed && status.cycle == target.cycle
            }) {
                let reason = status
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "agent reported failure".to_owned());
                warn!("Agent {} failed in cycle {}: {}", agent_id, target.cycle, reason);
                health.failures.insert(
                    agent_id.clone(),
                    FailureNote {
                        reason: reason.clone(),
                        by_timeout: false,
                        at_ms: now_ms(),
                    },
                );
                health_changed = true;
                AgentVerdict::Failed {
                    reason,
                    by_timeout: false,
                }
            } else if silent_for > self.liveness.timeout {
                let reason = format!("no status update for {}ms", silent_for.as_millis());
                warn!("Agent {} timed out: {}", agent_id, reason);
                health.failures.insert(
                    agent_id.clone(),
                    FailureNote {
                        reason: reason.clone(),
                        by_timeout: true,
                        at_ms: now_ms(),
                    },
                );
                health_changed = true;
                AgentVerdict::Failed {
                    reason,
                    by_timeout: true,
                }
            } else if silent_for > self.liveness.window {
                AgentVerdict::Unknown
            } else if same_cycle && status.is_some_and(|status| status.phase == target.phase) {
                AgentVerdict::Reached
            } else {
                AgentVerdict::Pending
            };

            let finished_run = match &verdict {
                AgentVerdict::Failed { .. } => true,
                AgentVerdict::Reached | AgentVerdict::Pending | AgentVerdict::Unknown => {
                    same_cycle
                        && status.is_some_and(|status| {
                            status.phase == LifecyclePhase::Stopped
                                && status.run_version == Some(target.version)
                        })
                }
            };
            run_finished = run_finished && finished_run;

            agents.push(AgentReport {
                agent_id,
                phase: status.map(|status| status.phase),
                cycle: status.map(|status| status.cycle),
                last_error: status.and_then(|status| status.last_error.clone()),
                silent_for_ms: u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                verdict,
            });
        }

        if health_changed {
            health.updated_at_ms = now_ms();
            let term = self.membership.term().await;
            put_json_in_term(self.store.as_ref(), keys::HEALTH, &health, term).await?;
        }

        let verdict = ClusterReport::verdict_for(&agents);
        Ok(Evaluation {
            report: ClusterReport {
                target,
                verdict,
                agents,
                health,
            },
            run_finished,
        })
    }

    /// Runs leader duties while this agent leads, re-evaluating on every
    /// membership change.
    ///
    /// # Errors
    ///
    /// Never fails; tick errors are logged.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: ShutdownReceiver) -> AppResult<()> {
        let mut membership_rx = self.membership.subscribe();
        let mut membership_open = true;
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut leading = false;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                changed = membership_rx.changed(), if membership_open => {
                    if changed.is_err() {
                        membership_open = false;
                    }
                }
                _ = ticker.tick() => {}
            }

            let is_leader = self.membership.is_leader().await;
            if is_leader && !leading {
                info!("Agent {} became leader", self.agent_id);
                if let Err(err) = self.reconcile().await {
                    warn!("Leader reconcile failed: {}", err);
                    continue;
                }
            } else if !is_leader && leading {
                info!("Agent {} is no longer leader", self.agent_id);
            }
            leading = is_leader;

            if leading && let Err(err) = self.tick().await {
                match err {
                    AppError::Lifecycle(
                        LifecycleError::NotLeader { .. } | LifecycleError::NoLeader,
                    ) => leading = false,
                    other => warn!("Leader tick failed: {}", other),
                }
            }
        }
        Ok(())
    }
}
