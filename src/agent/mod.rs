//! One benchmark agent: wires the store, membership, leader duties, phase
//! machine, engine supervisor, metrics and control plane into a set of tasks
//! sharing one shutdown broadcast.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::AgentSettings;
use crate::control::{ControlClient, ControlContext, ControlServer};
use crate::error::{AppError, AppResult};
use crate::leader::LeaderCoordinator;
use crate::membership::{GroupMembership, Member, StaticMembership};
use crate::metrics::MetricsPublisher;
use crate::phase::{PhaseGuard, PhaseMachine};
use crate::store::{DurableStore, Replicator, ReplicatorConfig, StateStore};
use crate::supervisor::ProcessSupervisor;
use crate::system::ShutdownSender;
use crate::workload::WorkloadResolver;

#[cfg(test)]
mod tests;

/// Extracted custom-script archives live here, under the data directory.
const ARTIFACTS_DIR: &str = "artifacts";
const ENGINE_EVENT_CAPACITY: usize = 16;

/// An agent with its listeners bound but no task started yet.
pub struct Agent {
    settings: AgentSettings,
    store: Arc<dyn StateStore>,
    membership: Arc<StaticMembership>,
    control_listener: TcpListener,
    gossip_listener: TcpListener,
}

impl Agent {
    /// Opens the durable store under `data_dir` and binds both listeners.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal cannot be opened, a listener cannot
    /// be bound, or the group layout is invalid.
    pub async fn open(settings: AgentSettings) -> AppResult<Self> {
        let store = DurableStore::open(&settings.data_dir, &settings.agent_id).await?;
        Self::with_store(settings, Arc::new(store)).await
    }

    /// Like [`Agent::open`] with a caller-provided store.
    ///
    /// # Errors
    ///
    /// Returns an error when a listener cannot be bound or the group layout is
    /// invalid.
    pub async fn with_store(settings: AgentSettings, store: Arc<dyn StateStore>) -> AppResult<Self> {
        let control_listener = ControlServer::bind(&settings.control_listen).await?;
        let gossip_listener = Replicator::bind(&settings.gossip_listen).await?;
        let self_member = Member {
            id: settings.agent_id.clone(),
            control_addr: control_listener.local_addr()?.to_string(),
            gossip_addr: gossip_listener.local_addr()?.to_string(),
        };
        let peers = settings.peers.iter().cloned().map(Member::from).collect();
        let membership = Arc::new(StaticMembership::new(
            self_member,
            peers,
            settings.leader.clone(),
        )?);
        Ok(Self {
            settings,
            store,
            membership,
            control_listener,
            gossip_listener,
        })
    }

    /// # Errors
    ///
    /// Returns an error when the listener address is unavailable.
    pub fn control_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.control_listener.local_addr()?)
    }

    /// # Errors
    ///
    /// Returns an error when the listener address is unavailable.
    pub fn gossip_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.gossip_listener.local_addr()?)
    }

    /// Membership handle, for pushing roster updates from outside.
    #[must_use]
    pub fn membership(&self) -> Arc<StaticMembership> {
        Arc::clone(&self.membership)
    }

    /// Runs every agent task until shutdown is broadcast. A failing task
    /// broadcasts shutdown to the others.
    ///
    /// # Errors
    ///
    /// Returns the first task error.
    pub async fn run(self, shutdown_tx: ShutdownSender) -> AppResult<()> {
        let Agent {
            settings,
            store,
            membership,
            control_listener,
            gossip_listener,
        } = self;
        let agent_id = settings.agent_id.clone();
        info!(
            "Agent {} up (control {}, gossip {}, leader {})",
            agent_id,
            control_listener.local_addr()?,
            gossip_listener.local_addr()?,
            membership.current_leader().await.as_deref().unwrap_or("-")
        );

        let shared: Arc<dyn GroupMembership> = membership.clone();
        let publisher = MetricsPublisher::new(&agent_id, settings.engine.report_interval);
        let guard = Arc::new(PhaseGuard::restore(Arc::clone(&store), &agent_id).await);
        let supervisor = Arc::new(ProcessSupervisor::new(
            settings.engine.clone(),
            publisher.clone(),
        ));
        let resolver = WorkloadResolver::new(
            settings.engine.path.clone(),
            settings.data_dir.join(ARTIFACTS_DIR),
            settings.engine.report_interval,
        );
        let coordinator = Arc::new(LeaderCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&shared),
            settings.liveness,
            settings.coordinator,
        ));
        let replicator = Replicator::new(
            Arc::clone(&store),
            shared,
            ReplicatorConfig {
                sync_interval: settings.replication.sync_interval,
                push_timeout: settings.replication.push_timeout,
            },
        );
        let machine = PhaseMachine::new(
            Arc::clone(&store),
            Arc::clone(&guard),
            Arc::clone(&supervisor),
            resolver,
            publisher.clone(),
        );
        let control = ControlServer::new(ControlContext {
            coordinator: Arc::clone(&coordinator),
            membership,
            guard: Arc::clone(&guard),
            store: Arc::clone(&store),
            publisher: publisher.clone(),
            default_config: settings.benchmark.clone(),
            client: ControlClient::new(settings.coordinator.forward_timeout)?,
        });
        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_CAPACITY);

        let tasks = vec![
            spawn_task(
                "replication",
                &shutdown_tx,
                replicator.run(gossip_listener, shutdown_tx.subscribe()),
            ),
            spawn_task(
                "supervisor",
                &shutdown_tx,
                supervisor.supervise(events_tx, shutdown_tx.subscribe()),
            ),
            spawn_task(
                "phase machine",
                &shutdown_tx,
                machine.run(events_rx, shutdown_tx.subscribe()),
            ),
            spawn_task(
                "heartbeat",
                &shutdown_tx,
                guard.heartbeat(settings.liveness.heartbeat_interval, shutdown_tx.subscribe()),
            ),
            spawn_task(
                "leader",
                &shutdown_tx,
                coordinator.run(shutdown_tx.subscribe()),
            ),
            spawn_task(
                "metrics sync",
                &shutdown_tx,
                publisher.sync_to_store(Arc::clone(&store), shutdown_tx.subscribe()),
            ),
            spawn_task(
                "control",
                &shutdown_tx,
                control.run(control_listener, shutdown_tx.subscribe()),
            ),
        ];

        let mut first_error: Option<AppError> = None;
        for (name, handle) in tasks {
            let outcome = handle.await.map_err(AppError::from).and_then(|result| result);
            match outcome {
                Ok(()) => debug!("Agent task '{}' stopped", name),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        info!("Agent {} stopped", agent_id);
        first_error.map_or(Ok(()), Err)
    }
}

fn spawn_task<F>(
    name: &'static str,
    shutdown_tx: &ShutdownSender,
    task: F,
) -> (&'static str, JoinHandle<AppResult<()>>)
where
    F: Future<Output = AppResult<()>> + Send + 'static,
{
    let shutdown_tx = shutdown_tx.clone();
    let handle = tokio::spawn(async move {
        let result = task.await;
        if let Err(err) = &result {
            error!("Agent task '{}' failed: {}", name, err);
            drop(shutdown_tx.send(()));
        }
        result
    });
    (name, handle)
}
