//! Group membership seam: who is in the group and who leads it.
//!
//! Leader election itself is external. The agent acts as leader only while
//! [`GroupMembership::current_leader`] names it, and re-evaluates its duties
//! whenever [`GroupMembership::subscribe`] signals a change.
mod static_roster;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::PeerConfig;

pub use static_roster::StaticMembership;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub control_addr: String,
    pub gossip_addr: String,
}

impl From<PeerConfig> for Member {
    fn from(peer: PeerConfig) -> Self {
        Self {
            id: peer.id,
            control_addr: peer.control_addr,
            gossip_addr: peer.gossip_addr,
        }
    }
}

/// Snapshot pushed by the membership collaborator (`PUT /v1/membership`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    pub leader: Option<String>,
    /// Leadership term. Grows whenever the leader changes; a collaborator
    /// that tracks its own epochs may push a higher one.
    #[serde(default)]
    pub term: u64,
    /// Every member including the local agent.
    pub members: Vec<Member>,
}

#[async_trait]
pub trait GroupMembership: Send + Sync {
    fn self_id(&self) -> &str;

    async fn current_leader(&self) -> Option<String>;

    /// Every member except the local agent.
    async fn peers(&self) -> Vec<Member>;

    async fn view(&self) -> MembershipView;

    async fn term(&self) -> u64 {
        self.view().await.term
    }

    /// Change notifications; the value is a generation counter.
    fn subscribe(&self) -> watch::Receiver<u64>;

    async fn is_leader(&self) -> bool {
        self.current_leader().await.as_deref() == Some(self.self_id())
    }

    async fn member(&self, id: &str) -> Option<Member> {
        self.view()
            .await
            .members
            .into_iter()
            .find(|member| member.id == id)
    }
}
