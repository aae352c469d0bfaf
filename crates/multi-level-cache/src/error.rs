use sequencer_types::ErrorKind;

/// Cache misses are never errors (§4.4 "Failure semantics"); this only
/// covers a loader failing to produce a value, in which case the error is
/// propagated to the caller verbatim and the miss is not cached.
#[derive(Debug, thiserror::Error)]
#[error("loader failed for cache key: {0}")]
pub struct LoadError(pub String);

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}
