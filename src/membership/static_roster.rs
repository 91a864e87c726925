use std::collections::BTreeSet;

use arcshift::ArcShift;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::error::{AppError, AppResult, ConfigError};

use super::{GroupMembership, Member, MembershipView};

const INITIAL_TERM: u64 = 1;

#[derive(Debug, Clone)]
struct Roster {
    leader: Option<String>,
    term: u64,
    members: Vec<Member>,
}

/// Config-driven membership that the collaborator can replace at runtime.
///
/// Without an explicit leader the member with the smallest id leads. The
/// term starts at 1 and moves forward on every leader change.
pub struct StaticMembership {
    self_member: Member,
    roster: ArcShift<Roster>,
    changes: watch::Sender<u64>,
}

impl StaticMembership {
    /// # Errors
    ///
    /// Returns an error when the leader is not a member or ids repeat.
    pub fn new(self_member: Member, peers: Vec<Member>, leader: Option<String>) -> AppResult<Self> {
        let roster = build_roster(&self_member, peers, leader, INITIAL_TERM)?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            self_member,
            roster: ArcShift::new(roster),
            changes,
        })
    }

    fn snapshot(&self) -> Roster {
        let mut handle = self.roster.clone();
        handle.get().clone()
    }

    /// Replaces the roster. The local agent is always kept as a member.
    ///
    /// # Errors
    ///
    /// Returns an error when the new leader is not a member or ids repeat.
    pub fn update(&self, view: MembershipView) -> AppResult<MembershipView> {
        let peers = view
            .members
            .into_iter()
            .filter(|member| member.id != self.self_member.id)
            .collect();
        let pushed_term = view.term;
        let proposed = build_roster(&self.self_member, peers, view.leader, pushed_term)?;
        let mut handle = self.roster.clone();
        handle.rcu(|current| {
            let mut next = proposed.clone();
            let succeeded = if next.leader == current.leader {
                current.term
            } else {
                current.term.saturating_add(1)
            };
            next.term = succeeded.max(pushed_term);
            next
        });
        let next = handle.get().clone();
        self.changes.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
        info!(
            "Membership updated: leader={} term={} members={}",
            next.leader.as_deref().unwrap_or("-"),
            next.term,
            next.members.len()
        );
        Ok(MembershipView {
            leader: next.leader,
            term: next.term,
            members: next.members,
        })
    }
}

fn build_roster(
    self_member: &Member,
    peers: Vec<Member>,
    leader: Option<String>,
    term: u64,
) -> AppResult<Roster> {
    let mut seen = BTreeSet::new();
    let mut members = Vec::with_capacity(peers.len().saturating_add(1));
    for member in std::iter::once(self_member.clone()).chain(peers) {
        if !seen.insert(member.id.clone()) {
            return Err(AppError::config(ConfigError::DuplicatePeer {
                agent_id: member.id,
            }));
        }
        members.push(member);
    }
    members.sort_by(|left, right| left.id.cmp(&right.id));

    let leader = match leader {
        Some(leader) if seen.contains(&leader) => Some(leader),
        Some(leader) => return Err(AppError::config(ConfigError::UnknownLeader { leader })),
        None => members.first().map(|member| member.id.clone()),
    };
    Ok(Roster {
        leader,
        term,
        members,
    })
}

#[async_trait]
impl GroupMembership for StaticMembership {
    fn self_id(&self) -> &str {
        &self.self_member.id
    }

    async fn current_leader(&self) -> Option<String> {
        self.snapshot().leader
    }

    async fn peers(&self) -> Vec<Member> {
        self.snapshot()
            .members
            .into_iter()
            .filter(|member| member.id != self.self_member.id)
            .collect()
    }

    async fn view(&self) -> MembershipView {
        let roster = self.snapshot();
        MembershipView {
            leader: roster.leader,
            term: roster.term,
            members: roster.members,
        }
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
