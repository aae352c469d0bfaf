use std::collections::{BTreeMap, HashSet};

use crate::ids::NodeId;

/// Per-peer replication bookkeeping the control loop drives one entry at a
/// time (§3a `PeerState`). Never sent over the wire; it is reconstructed
/// locally from AppendEntries responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerState {
    pub peer_id: NodeId,
    pub next_index: u64,
    pub match_index: u64,
    pub inflight: bool,
}

impl PeerState {
    pub fn new(peer_id: NodeId, next_index: u64) -> Self {
        Self {
            peer_id,
            next_index,
            match_index: 0,
            inflight: false,
        }
    }
}

/// Role-specific data, carried by the enum variant rather than left as
/// independently-optional fields (§3a, REDESIGN FLAGS: shared-mutable state
/// objects become a single owned enum).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Follower { leader_id: Option<NodeId> },
    Candidate { votes: HashSet<NodeId> },
    Leader { peers: BTreeMap<NodeId, PeerState> },
}

impl NodeRole {
    pub fn tag(&self) -> RoleTag {
        match self {
            NodeRole::Follower { .. } => RoleTag::Follower,
            NodeRole::Candidate { .. } => RoleTag::Candidate,
            NodeRole::Leader { .. } => RoleTag::Leader,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum RoleTag {
    Follower,
    Candidate,
    Leader,
}

/// The full mutable Raft state, exclusively owned by the control thread
/// (§5 "Shared resources & locking discipline").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftState {
    pub node_id: NodeId,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: NodeRole,
}

impl RaftState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            role: NodeRole::Follower { leader_id: None },
        }
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            NodeRole::Follower { leader_id } => *leader_id,
            NodeRole::Candidate { .. } => None,
            NodeRole::Leader { .. } => Some(self.node_id),
        }
    }

    /// An immutable, cheaply-cloneable snapshot published to reader threads
    /// (§5 "reads from other threads use an atomic snapshot").
    pub fn view(&self) -> RaftStateView {
        RaftStateView {
            node_id: self.node_id,
            current_term: self.current_term,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            role: self.role.tag(),
            leader_id: self.leader_id(),
        }
    }
}

/// A point-in-time, read-only view of `RaftState` safe to hand to any
/// thread without synchronization (it owns no locks).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RaftStateView {
    pub node_id: NodeId,
    pub current_term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub role: RoleTag,
    pub leader_id: Option<NodeId>,
}
