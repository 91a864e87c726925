use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{AgentStatus, ExitState, LifecyclePhase, keys, now_ms};
use crate::error::{AppError, AppResult, LifecycleError};
use crate::store::{StateStore, StoreEntry, get_json, put_json};
use crate::system::ShutdownReceiver;

/// Owns the agent's status. Every change is checked against the phase rules
/// and written to the store while the lock is held, so status writes from
/// the phase machine and the heartbeat never reorder.
pub struct PhaseGuard {
    store: Arc<dyn StateStore>,
    status: Mutex<AgentStatus>,
}

impl PhaseGuard {
    /// Picks up the status this agent last wrote, if the store still has it.
    pub async fn restore(store: Arc<dyn StateStore>, agent_id: &str) -> Self {
        let status = match get_json::<AgentStatus>(store.as_ref(), &keys::status(agent_id)).await {
            Some((status, _)) if status.agent_id == agent_id => {
                debug!(
                    "Restored status {} (cycle {}, target v{})",
                    status.phase, status.cycle, status.target_version
                );
                status
            }
            Some(_) | None => AgentStatus::new(agent_id),
        };
        Self {
            store,
            status: Mutex::new(status),
        }
    }

    pub async fn snapshot(&self) -> AgentStatus {
        self.status.lock().await.clone()
    }

    /// Moves to `next`, applies `update`, and writes the result.
    ///
    /// # Errors
    ///
    /// Returns `IllegalPhaseChange` (nothing changes) when the phase rules
    /// forbid the move, or a store error when the write fails.
    pub async fn advance<F>(&self, next: LifecyclePhase, update: F) -> AppResult<AgentStatus>
    where
        F: FnOnce(&mut AgentStatus) + Send,
    {
        let mut status = self.status.lock().await;
        if !status.phase.can_transition_to(next) {
            warn!("Refusing illegal phase change {} -> {}", status.phase, next);
            return Err(AppError::lifecycle(LifecycleError::IllegalPhaseChange {
                from: status.phase,
                to: next,
            }));
        }
        if status.phase != next {
            debug!("Phase {} -> {}", status.phase, next);
        }
        update(&mut status);
        status.phase = next;
        status.updated_at_ms = now_ms();
        put_json(self.store.as_ref(), &keys::status(&status.agent_id), &*status).await?;
        Ok(status.clone())
    }

    /// # Errors
    ///
    /// See [`PhaseGuard::advance`].
    pub async fn transition(&self, next: LifecyclePhase) -> AppResult<AgentStatus> {
        self.advance(next, |_| {}).await
    }

    /// Bookkeeping update that keeps the phase.
    ///
    /// # Errors
    ///
    /// Returns a store error when the write fails.
    pub async fn record<F>(&self, update: F) -> AppResult<AgentStatus>
    where
        F: FnOnce(&mut AgentStatus) + Send,
    {
        let phase = self.status.lock().await.phase;
        self.advance(phase, update).await
    }

    /// # Errors
    ///
    /// Returns a store error when the write fails.
    pub async fn fail(&self, reason: &str, exit: Option<ExitState>) -> AppResult<AgentStatus> {
        warn!("Agent failed: {}", reason);
        self.advance(LifecyclePhase::Failed, |status| {
            status.last_error = Some(reason.to_owned());
            if exit.is_some() {
                status.exit = exit;
            }
            status.engine = None;
        })
        .await
    }

    /// Rewrites the current status unchanged apart from its timestamp.
    ///
    /// # Errors
    ///
    /// Returns a store error when the write fails.
    pub async fn publish(&self) -> AppResult<StoreEntry> {
        let mut status = self.status.lock().await;
        status.updated_at_ms = now_ms();
        put_json(self.store.as_ref(), &keys::status(&status.agent_id), &*status).await
    }

    /// Republishes the status every `interval` so the leader sees this agent
    /// alive.
    ///
    /// # Errors
    ///
    /// Never fails; write errors are logged.
    pub async fn heartbeat(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: ShutdownReceiver,
    ) -> AppResult<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.publish().await {
                warn!("Heartbeat write failed: {}", err);
            }
        }
        Ok(())
    }
}
