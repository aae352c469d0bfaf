//! Admission, conflict-aware parallel execution, and deterministic state
//! replication for the sequencer (§4.7, §4.9).

mod admission;
mod api;
mod bundle;
mod capability;
mod conflict;
mod error;
mod executor;
mod replication;
mod sequencer;

pub use admission::{AdmissionConfig, AdmissionController, NonceSource, StateStoreNonceSource};
pub use api::{NodeStatus, SequencerApi, SequencerNode, StatusTracker, SubmitAck, TransactionProof};
pub use bundle::BundleConfig;
pub use capability::{LogAppender, NoopReceiptSink, ReceiptSink};
pub use conflict::schedule_levels;
pub use error::SequencerError;
pub use executor::{StagedView, TransactionExecutor, TransferExecutor};
pub use replication::StateReplication;
pub use sequencer::{ParallelSequencer, PipelineConfig};
