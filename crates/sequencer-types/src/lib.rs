//! Core data model shared by every sequencer crate: the types described in
//! spec §3, plus the supplements of §3a. No component-specific logic lives
//! here, only the shapes components exchange.

mod admission;
mod batch;
mod cache;
mod error;
mod ids;
mod raft;
mod snapshot;
mod transaction;

pub use admission::{AdmissionRecord, TransactionStatus};
pub use batch::{Batch, LogEntry};
pub use cache::{CacheEntry, CacheLevelConfig, EvictionPolicy};
pub use error::ErrorKind;
pub use ids::{AccountId, NodeId, TxId};
pub use raft::{NodeRole, PeerState, RaftState, RaftStateView, RoleTag};
pub use snapshot::{LogSegmentMeta, Snapshot};
pub use transaction::{Priority, Receipt, ReceiptOutcome, Transaction};
