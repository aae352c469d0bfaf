use sequencer_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("shard {shard_id} is unavailable")]
    ShardUnavailable { shard_id: usize },

    #[error("multi-shard transaction failed after {attempts} attempt(s): {reason}")]
    CommitFailed { attempts: u32, reason: String },

    #[error("transaction callback rejected the operation: {0}")]
    Rejected(String),
}

impl StateStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateStoreError::ShardUnavailable { .. } => ErrorKind::Transient,
            StateStoreError::CommitFailed { .. } => ErrorKind::Consistency,
            StateStoreError::Rejected(_) => ErrorKind::Validation,
        }
    }
}
