use sequencer_types::ErrorKind;

#[derive(thiserror::Error, Debug)]
pub enum RaftError {
    #[error("this node is not the leader (leader is {leader_id:?})")]
    NotLeader { leader_id: Option<sequencer_types::NodeId> },

    #[error("stale term {attempted}, current term is {current}")]
    StaleTerm { attempted: u64, current: u64 },

    #[error("replication log error: {0}")]
    Log(#[from] replication_log::ReplicationLogError),

    #[error("transport error contacting {peer:?}: {reason}")]
    Transport { peer: sequencer_types::NodeId, reason: String },

    #[error("control loop is no longer running")]
    Stopped,
}

impl RaftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RaftError::NotLeader { .. } => ErrorKind::Validation,
            RaftError::StaleTerm { .. } => ErrorKind::Consistency,
            RaftError::Log(e) => e.kind(),
            RaftError::Transport { .. } => ErrorKind::Transient,
            RaftError::Stopped => ErrorKind::Fatal,
        }
    }
}
