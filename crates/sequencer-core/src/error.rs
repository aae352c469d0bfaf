use sequencer_types::ErrorKind;

/// The stable, client-facing error enum named by §6's error columns.
/// [`SequencerApi`](crate::SequencerApi) is the only place component errors
/// get downgraded into this; the match is always on `.kind()`, never on a
/// component error's own variants (§7a), so a new `RaftError`/`StateStoreError`
/// variant never requires touching this enum.
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("signature does not verify")]
    InvalidSignature,

    #[error("nonce {nonce} is not greater than the sender's last committed nonce {last_committed}")]
    NonceTooLow { nonce: u64, last_committed: u64 },

    #[error("transaction payload is malformed: {0}")]
    MalformedPayload(String),

    #[error("sequencer is overloaded, try again later")]
    Overloaded,

    #[error("not found")]
    NotFound,

    #[error("requested index has been truncated from the log")]
    Truncated,

    #[error("requested leaf has been pruned from the accumulator")]
    Pruned,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SequencerError {
    /// Maps any component error onto the client-facing enum purely from its
    /// taxonomy, per §7a's "never matches on a component error's own
    /// variants" rule.
    pub fn from_kind(kind: ErrorKind, context: impl Into<String>) -> Self {
        match kind {
            ErrorKind::Transient => SequencerError::Overloaded,
            ErrorKind::Consistency => SequencerError::Internal(context.into()),
            ErrorKind::Validation => SequencerError::MalformedPayload(context.into()),
            ErrorKind::Fatal => SequencerError::Internal(context.into()),
        }
    }

    /// A fixed, low-cardinality label for metrics; unlike `Display`, it
    /// never interpolates dynamic fields (nonces, reasons) into the label
    /// value, which would otherwise blow up a Prometheus series per
    /// distinct error message.
    pub fn label(&self) -> &'static str {
        match self {
            SequencerError::InvalidSignature => "invalid_signature",
            SequencerError::NonceTooLow { .. } => "nonce_too_low",
            SequencerError::MalformedPayload(_) => "malformed_payload",
            SequencerError::Overloaded => "overloaded",
            SequencerError::NotFound => "not_found",
            SequencerError::Truncated => "truncated",
            SequencerError::Pruned => "pruned",
            SequencerError::Internal(_) => "internal",
        }
    }
}
