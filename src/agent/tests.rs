use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use crate::config::{
    AgentSettings, CoordinatorSettings, EngineSettings, LivenessSettings, ReplicationSettings,
};
use crate::control::{ControlClient, StatusResponse};
use crate::domain::{AgentStatus, LifecyclePhase, keys};
use crate::error::{AppError, AppResult};
use crate::store::{MemoryStore, StateStore, get_json};
use crate::system::shutdown_channel;
use crate::test_support::run_async_test;

use super::Agent;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn solo_settings(data_dir: &Path) -> AgentSettings {
    AgentSettings {
        agent_id: "solo".to_owned(),
        data_dir: data_dir.to_path_buf(),
        control_listen: "127.0.0.1:0".to_owned(),
        gossip_listen: "127.0.0.1:0".to_owned(),
        leader: None,
        peers: Vec::new(),
        engine: EngineSettings::default(),
        liveness: LivenessSettings {
            heartbeat_interval: Duration::from_millis(50),
            ..LivenessSettings::default()
        },
        replication: ReplicationSettings::default(),
        coordinator: CoordinatorSettings::default(),
        benchmark: None,
    }
}

#[test]
fn agent_serves_status_and_stops_on_shutdown() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let store = MemoryStore::new("solo");
        let agent = Agent::with_store(solo_settings(dir.path()), Arc::new(store.clone())).await?;
        let control = agent.control_addr()?.to_string();
        let (shutdown_tx, _) = shutdown_channel();
        let running = tokio::spawn(agent.run(shutdown_tx.clone()));

        let reply = ControlClient::new(STOP_TIMEOUT)?.status(&control).await?;
        let status: StatusResponse = serde_json::from_str(&reply.body)?;
        if status.leader.as_deref() != Some("solo") || status.agent.phase != LifecyclePhase::Unset {
            return Err(AppError::validation(format!("Unexpected status {:?}", status)));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        let published = get_json::<AgentStatus>(&store as &dyn StateStore, &keys::status("solo")).await;
        if published.is_none() {
            return Err(AppError::validation("Agent never published its status"));
        }

        if shutdown_tx.send(()).is_err() {
            return Err(AppError::validation("Failed to broadcast shutdown"));
        }
        tokio::time::timeout(STOP_TIMEOUT, running)
            .await
            .map_err(|_elapsed| AppError::validation("Agent did not stop"))???;
        Ok(())
    })
}

#[test]
fn open_uses_durable_store_under_data_dir() -> AppResult<()> {
    run_async_test(async {
        let dir = tempdir()?;
        let agent = Agent::open(solo_settings(dir.path())).await?;
        if agent.gossip_addr()?.port() == 0 {
            return Err(AppError::validation("Gossip listener must be bound"));
        }
        if std::fs::read_dir(dir.path())?.next().is_none() {
            return Err(AppError::validation("Journal was not created"));
        }
        Ok(())
    })
}
