use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sequencer_types::{Batch, Transaction};

#[derive(Clone, Debug)]
pub struct BundleConfig {
    /// Transactions per batch under normal load.
    pub base_batch_size: usize,
    /// Ceiling a backlog is allowed to grow the batch size to.
    pub max_batch_size: usize,
    /// Pending-queue length above which batch size scales up toward
    /// `max_batch_size` instead of staying at `base_batch_size` (§4.9
    /// "dynamic batch-size expansion").
    pub expand_threshold: usize,
    pub max_batch_bytes: usize,
    /// Added to a transaction's base priority weight per elapsed admission
    /// tick, so an old `Low` transaction eventually outranks a freshly
    /// admitted one (§4.9 step 2 aging).
    pub aging_weight_per_tick: u64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            base_batch_size: 100,
            max_batch_size: 500,
            expand_threshold: 1_000,
            max_batch_bytes: 1 << 20,
            aging_weight_per_tick: 1,
        }
    }
}

struct Entry {
    tx: Transaction,
    sequence: u64,
}

impl Entry {
    fn score(&self, now_tick: u64, config: &BundleConfig) -> u64 {
        let age = now_tick.saturating_sub(self.tx.submitted_at);
        self.tx.priority.base_weight().saturating_add(age.saturating_mul(config.aging_weight_per_tick))
    }
}

fn estimated_len(tx: &Transaction) -> usize {
    96 + tx.signature.len() + tx.payload.len() + 32 * tx.conflict_set.len()
}

/// The admission-side holding area transactions sit in between `admit` and
/// batch formation (§4.9 step 1 -> step 2). Selection is priority+aging
/// weighted, ties broken by submission order so two `Critical`
/// transactions admitted back to back never reorder relative to each
/// other.
struct PendingQueue {
    entries: Mutex<Vec<Entry>>,
    sequence: AtomicU64,
}

impl PendingQueue {
    fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()), sequence: AtomicU64::new(0) }
    }

    fn push(&self, tx: Transaction) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().push(Entry { tx, sequence });
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Greedily selects transactions in score order under `limit` count and
    /// `max_bytes`, skipping (not dropping) any that would blow the byte
    /// budget so a later, smaller transaction still gets a chance this
    /// round.
    fn take_batch(&self, now_tick: u64, limit: usize, max_bytes: usize, config: &BundleConfig) -> Vec<Transaction> {
        let mut entries = self.entries.lock().unwrap();
        entries.sort_by(|a, b| {
            b.score(now_tick, config).cmp(&a.score(now_tick, config)).then(a.sequence.cmp(&b.sequence))
        });

        let mut taken = Vec::new();
        let mut bytes = 0usize;
        let mut keep = Vec::new();
        for entry in entries.drain(..) {
            if taken.len() < limit && bytes.saturating_add(estimated_len(&entry.tx)) <= max_bytes {
                bytes += estimated_len(&entry.tx);
                taken.push(entry.tx);
            } else {
                keep.push(entry);
            }
        }
        *entries = keep;
        taken
    }
}

/// Forms batches out of the pending queue (§4.9 step 2). `ParallelSequencer`
/// owns one of these; on commit failure it calls `enqueue` again for each
/// transaction rather than threading a separate retry queue.
pub struct BundleProcessor {
    queue: PendingQueue,
    config: BundleConfig,
    next_batch_id: AtomicU64,
}

impl BundleProcessor {
    pub fn new(config: BundleConfig) -> Self {
        Self { queue: PendingQueue::new(), config, next_batch_id: AtomicU64::new(0) }
    }

    pub fn enqueue(&self, tx: Transaction) {
        self.queue.push(tx);
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Forms the next batch if anything is pending. Above
    /// `expand_threshold` queued transactions, the batch size grows to
    /// `max_batch_size` so a backlog drains rather than compounding.
    pub fn form_batch(&self, now_tick: u64) -> Option<Batch> {
        let pending = self.queue.len();
        if pending == 0 {
            return None;
        }

        let limit = if pending > self.config.expand_threshold { self.config.max_batch_size } else { self.config.base_batch_size };

        let transactions = self.queue.take_batch(now_tick, limit, self.config.max_batch_bytes, &self.config);
        if transactions.is_empty() {
            return None;
        }

        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        Some(Batch::new(batch_id, transactions))
    }
}
