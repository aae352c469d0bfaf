use sequencer_types::ErrorKind;

#[derive(thiserror::Error, Debug)]
pub enum ReplicationLogError {
    #[error("append at stale term {attempted}, current term is {current}")]
    TermConflict { attempted: u64, current: u64 },

    #[error("entry at index {index} failed checksum verification")]
    ChecksumMismatch { index: u64 },

    #[error("requested index {index} is not present in the log")]
    MissingIndex { index: u64 },

    #[error("refusing to append an empty batch at index {index}")]
    EmptyBatch { index: u64 },

    #[error("encoding error: {0}")]
    Codec(#[from] prost::DecodeError),

    #[error("conversion error: {0}")]
    Conversion(#[from] sequencer_proto::ConversionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationLogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicationLogError::TermConflict { .. } => ErrorKind::Consistency,
            ReplicationLogError::ChecksumMismatch { .. } => ErrorKind::Consistency,
            ReplicationLogError::MissingIndex { .. } => ErrorKind::Validation,
            ReplicationLogError::EmptyBatch { .. } => ErrorKind::Validation,
            ReplicationLogError::Codec(_) => ErrorKind::Consistency,
            ReplicationLogError::Conversion(_) => ErrorKind::Consistency,
            ReplicationLogError::Io(_) => ErrorKind::Transient,
        }
    }
}
