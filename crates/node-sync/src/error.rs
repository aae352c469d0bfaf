use sequencer_types::{ErrorKind, NodeId};

#[derive(thiserror::Error, Debug)]
pub enum NodeSyncError {
    #[error("no snapshot available to sync peer {peer:?}")]
    NoSnapshotAvailable { peer: NodeId },

    #[error("snapshot sync to peer {peer:?} aborted: {source}")]
    Aborted {
        peer: NodeId,
        #[source]
        source: raft_core::RaftError,
    },
}

impl NodeSyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeSyncError::NoSnapshotAvailable { .. } => ErrorKind::Transient,
            NodeSyncError::Aborted { source, .. } => source.kind(),
        }
    }
}
