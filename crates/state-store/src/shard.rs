use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::error::StateStoreError;

pub(crate) type ShardMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// A single shard: single-writer, multi-reader (§4.1), with an
/// availability flag used to model `ShardUnavailable` for tests and fault
/// injection without a real network.
#[derive(Clone)]
pub(crate) struct Shard {
    pub(crate) id: usize,
    data: Arc<RwLock<ShardMap>>,
    available: Arc<AtomicBool>,
}

impl Shard {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            data: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    pub fn mark_available(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateStoreError> {
        self.check_available()?;
        Ok(self.data.read().await.get(key).cloned())
    }

    pub(crate) async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StateStoreError> {
        self.check_available()?;
        self.data.write().await.insert(key, value);
        Ok(())
    }

    pub(crate) async fn snapshot(&self) -> Result<ShardMap, StateStoreError> {
        self.check_available()?;
        Ok(self.data.read().await.clone())
    }

    pub(crate) async fn restore(&self, entries: ShardMap) -> Result<(), StateStoreError> {
        self.check_available()?;
        *self.data.write().await = entries;
        Ok(())
    }

    /// Acquires the exclusive write lock for a multi-shard transaction
    /// participant. Callers are required to acquire shards in ascending
    /// `id` order (§4.1, §5a) to avoid deadlock.
    pub(crate) async fn lock_owned(&self) -> Result<OwnedRwLockWriteGuard<ShardMap>, StateStoreError> {
        self.check_available()?;
        Ok(self.data.clone().write_owned().await)
    }

    fn check_available(&self) -> Result<(), StateStoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StateStoreError::ShardUnavailable { shard_id: self.id })
        }
    }
}
