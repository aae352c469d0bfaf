use async_trait::async_trait;
use dashmap::DashMap;
use sequencer_types::Transaction;
use state_store::StateStore;

/// Read view combining the canonical `StateStore` with an in-flight overlay
/// of writes already staged earlier in the same batch (§4.9 step 4: deltas
/// are buffered without touching the canonical store until commit). Both
/// `ParallelSequencer`'s pre-commit staging pass and `StateReplication`'s
/// post-commit deterministic replay build one of these per batch, so a
/// later conflict level can observe an earlier level's writes.
pub struct StagedView<'a> {
    base: &'a StateStore,
    overlay: &'a DashMap<Vec<u8>, Vec<u8>>,
}

impl<'a> StagedView<'a> {
    pub fn new(base: &'a StateStore, overlay: &'a DashMap<Vec<u8>, Vec<u8>>) -> Self {
        Self { base, overlay }
    }

    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.overlay.get(key) {
            return Some(value.clone());
        }
        self.base.get(key).await.ok().flatten()
    }
}

/// Pluggable executor deriving a deterministic write set from an otherwise
/// opaque transaction payload (§1 Non-goals: the core never interprets
/// payload bytes itself). The same executor instance is shared between the
/// leader's staging pass and every node's post-commit replay, which is what
/// makes `(stateDigest, merkleRoot)` determinism hold without ever shipping
/// raw deltas over the wire.
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    async fn execute(&self, tx: &Transaction, view: &StagedView<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String>;
}

/// Default executor: treats the leading 8 bytes of `payload` as a
/// little-endian balance amount moved from `sender` to `recipient`, with
/// accounts keyed directly by their 32-byte identifier. Stands in for the
/// "smart contract execution" the spec keeps explicitly out of scope; a
/// real deployment supplies its own `TransactionExecutor`.
pub struct TransferExecutor;

#[async_trait]
impl TransactionExecutor for TransferExecutor {
    async fn execute(&self, tx: &Transaction, view: &StagedView<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, String> {
        let amount = tx
            .payload
            .get(0..8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0);

        let sender_key = tx.sender.as_bytes().to_vec();
        let recipient_key = tx.recipient.as_bytes().to_vec();

        let sender_balance = read_balance(view.get(&sender_key).await);
        if sender_balance < amount {
            return Err(format!("sender balance {sender_balance} is below transfer amount {amount}"));
        }
        let recipient_balance = read_balance(view.get(&recipient_key).await);

        Ok(vec![
            (sender_key, (sender_balance - amount).to_le_bytes().to_vec()),
            (recipient_key, (recipient_balance + amount).to_le_bytes().to_vec()),
        ])
    }
}

fn read_balance(value: Option<Vec<u8>>) -> u64 {
    value.and_then(|bytes| bytes.try_into().ok()).map(u64::from_le_bytes).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_types::{AccountId, Priority, TxId};
    use state_store::{StateStore, StateStoreConfig};

    fn tx(sender: AccountId, recipient: AccountId, amount: u64) -> Transaction {
        Transaction {
            id: TxId::from_tag(b"t1"),
            sender,
            recipient,
            nonce: 1,
            priority: Priority::Medium,
            submitted_at: 0,
            signature: Vec::new(),
            payload: amount.to_le_bytes().to_vec(),
            conflict_set: Default::default(),
        }
        .with_default_conflict_set()
    }

    #[tokio::test]
    async fn transfer_moves_balance_between_accounts() {
        let store = StateStore::new(StateStoreConfig::default());
        let sender = AccountId::from_tag(b"alice");
        let recipient = AccountId::from_tag(b"bob");
        store.put(sender.as_bytes().to_vec(), 100u64.to_le_bytes().to_vec()).await.unwrap();

        let overlay = DashMap::new();
        let view = StagedView::new(&store, &overlay);
        let writes = TransferExecutor.execute(&tx(sender, recipient, 40), &view).await.unwrap();

        let sender_write = writes.iter().find(|(k, _)| k.as_slice() == sender.as_bytes().as_slice()).unwrap();
        let recipient_write = writes.iter().find(|(k, _)| k.as_slice() == recipient.as_bytes().as_slice()).unwrap();
        assert_eq!(u64::from_le_bytes(sender_write.1.clone().try_into().unwrap()), 60);
        assert_eq!(u64::from_le_bytes(recipient_write.1.clone().try_into().unwrap()), 40);
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected() {
        let store = StateStore::new(StateStoreConfig::default());
        let sender = AccountId::from_tag(b"alice");
        let recipient = AccountId::from_tag(b"bob");

        let overlay = DashMap::new();
        let view = StagedView::new(&store, &overlay);
        let result = TransferExecutor.execute(&tx(sender, recipient, 1), &view).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn overlay_write_is_visible_to_a_later_read_in_the_same_batch() {
        let store = StateStore::new(StateStoreConfig::default());
        let sender = AccountId::from_tag(b"alice");
        let recipient = AccountId::from_tag(b"bob");
        let overlay: DashMap<Vec<u8>, Vec<u8>> = DashMap::new();
        overlay.insert(sender.as_bytes().to_vec(), 100u64.to_le_bytes().to_vec());

        let view = StagedView::new(&store, &overlay);
        let writes = TransferExecutor.execute(&tx(sender, recipient, 25), &view).await.unwrap();
        let sender_write = writes.iter().find(|(k, _)| k.as_slice() == sender.as_bytes().as_slice()).unwrap();
        assert_eq!(u64::from_le_bytes(sender_write.1.clone().try_into().unwrap()), 75);
    }
}
