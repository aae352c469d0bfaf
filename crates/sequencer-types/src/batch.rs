use crate::transaction::{Receipt, Transaction};

/// An ordered sequence of transactions formed by `BundleProcessor` (§4.9).
/// `term`/`index` are unset (`0`) until the batch is actually committed
/// through `ReplicationLog::append`; `batch_id` is assigned at formation
/// time and is monotonic within a leader term, independent of the log index
/// it eventually lands at.
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Batch {
    pub batch_id: u64,
    pub term: u64,
    pub index: u64,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<Receipt>,
    /// Merkle accumulator root after this batch's leaves are appended.
    pub root_after: [u8; 32],
}

impl Batch {
    pub fn new(batch_id: u64, transactions: Vec<Transaction>) -> Self {
        Self {
            batch_id,
            term: 0,
            index: 0,
            transactions,
            receipts: Vec::new(),
            root_after: [0u8; 32],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn encoded_len_hint(&self) -> usize {
        // Cheap byte-budget estimate used by `BundleProcessor` (§4.9 step 2);
        // the wire encoder is free to produce a slightly different size, the
        // budget only needs to be conservative enough to bound frames (§6).
        self.transactions
            .iter()
            .map(|tx| 96 + tx.signature.len() + tx.payload.len() + 32 * tx.conflict_set.len())
            .sum()
    }
}

/// A committed, checksummed unit of the replication log (§3 `LogEntry`).
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub batch: Batch,
    pub checksum: u32,
}
