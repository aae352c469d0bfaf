//! Sharded, transactionally-consistent key-value store for account state.

mod error;
mod partition;
mod shard;
mod store;

pub use error::StateStoreError;
pub use partition::{ConsistentHashPolicy, HashPolicy, PartitionPolicy, RangePolicy};
pub use shard::Shard;
pub use store::{ReadConsistency, ShardTxnHandle, StateStore, StateStoreConfig, WriteConsistency};
