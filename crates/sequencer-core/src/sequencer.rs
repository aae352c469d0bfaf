use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sequencer_metrics::SequencerMetrics;
use sequencer_types::{Batch, Priority, Receipt, ReceiptOutcome, TxId, Transaction};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::bundle::{BundleConfig, BundleProcessor};
use crate::capability::{LogAppender, ReceiptSink};
use crate::conflict::schedule_levels;
use crate::error::SequencerError;
use crate::executor::{StagedView, TransactionExecutor};
use state_store::StateStore;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub bundle: BundleConfig,
    /// A transaction is dropped for good, surfaced as a terminal `Failed`,
    /// once its containing batch has failed to commit this many times.
    pub max_retries: u32,
    /// The rolling window over which admitted vs. committed counts are
    /// compared to decide whether to start shedding low-priority work
    /// (§4.9 "Backpressure").
    pub backpressure_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { bundle: BundleConfig::default(), max_retries: 3, backpressure_window: Duration::from_secs(5) }
    }
}

struct Throughput {
    window_start: Instant,
    admitted: u64,
    committed: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackpressureLevel {
    None,
    DropLow,
    DropLowAndMedium,
}

/// The leader-only admit -> batch -> schedule -> execute -> commit pipeline
/// (§4.9). A node that is not currently leader never calls `run_once`;
/// `sequencer-node` is responsible for only driving this loop while
/// `RaftHandle::state_view().role` is `Leader`.
pub struct ParallelSequencer<E: TransactionExecutor> {
    bundles: BundleProcessor,
    store: StateStore,
    executor: Arc<E>,
    appender: Arc<dyn LogAppender>,
    receipts: Arc<dyn ReceiptSink>,
    config: PipelineConfig,
    retry_counts: DashMap<TxId, u32>,
    throughput: Mutex<Throughput>,
    tick: AtomicU64,
    metrics: Option<Arc<SequencerMetrics>>,
}

impl<E: TransactionExecutor> ParallelSequencer<E> {
    pub fn new(
        config: PipelineConfig,
        store: StateStore,
        executor: Arc<E>,
        appender: Arc<dyn LogAppender>,
        receipts: Arc<dyn ReceiptSink>,
    ) -> Self {
        Self {
            bundles: BundleProcessor::new(config.bundle.clone()),
            store,
            executor,
            appender,
            receipts,
            config,
            retry_counts: DashMap::new(),
            throughput: Mutex::new(Throughput { window_start: Instant::now(), admitted: 0, committed: 0 }),
            tick: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<SequencerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pending_len(&self) -> usize {
        self.bundles.pending_len()
    }

    /// Admits `tx` into the pending queue unless backpressure sheds it
    /// (§4.9 step 1 "Backpressure"). Assumes the caller has already run
    /// signature/nonce checks via `AdmissionController` — this is purely
    /// about load shedding, not validity.
    #[instrument(skip(self, tx), fields(tx_id = ?tx.id))]
    pub async fn admit(&self, tx: Transaction) -> Result<(), SequencerError> {
        let level = self.backpressure_level().await;
        let shed = match level {
            BackpressureLevel::None => false,
            BackpressureLevel::DropLow => tx.priority == Priority::Low,
            BackpressureLevel::DropLowAndMedium => tx.priority <= Priority::Medium,
        };
        if shed {
            warn!(priority = ?tx.priority, ?level, "dropping transaction under backpressure");
            return Err(SequencerError::Overloaded);
        }

        self.throughput.lock().await.admitted += 1;
        self.bundles.enqueue(tx);
        Ok(())
    }

    async fn backpressure_level(&self) -> BackpressureLevel {
        let mut throughput = self.throughput.lock().await;
        if throughput.window_start.elapsed() < self.config.backpressure_window {
            return Self::level_from_counts(throughput.admitted, throughput.committed);
        }
        let level = Self::level_from_counts(throughput.admitted, throughput.committed);
        *throughput = Throughput { window_start: Instant::now(), admitted: 0, committed: 0 };
        level
    }

    /// More than 2x as many admissions as commits in the window sheds
    /// `Low`; more than 4x sheds `Medium` too. `Critical` and `High` are
    /// never shed — the spec leaves their fate to `maxRetries` instead.
    fn level_from_counts(admitted: u64, committed: u64) -> BackpressureLevel {
        if admitted <= committed.saturating_mul(2).max(1) {
            BackpressureLevel::None
        } else if admitted <= committed.saturating_mul(4).max(1) {
            BackpressureLevel::DropLow
        } else {
            BackpressureLevel::DropLowAndMedium
        }
    }

    /// Forms one batch, stages its receipts against conflict-free levels,
    /// and commits it (§4.9 steps 2-6). Returns `Ok(None)` if there was
    /// nothing pending to batch.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<Option<u64>, SequencerError> {
        let now_tick = self.tick.fetch_add(1, Ordering::SeqCst);
        let Some(mut batch) = self.bundles.form_batch(now_tick) else {
            return Ok(None);
        };
        self.receipts.on_batch_started(&batch).await;

        batch.receipts = self.stage_receipts(&batch.transactions).await;

        let started = Instant::now();
        match self.appender.append(batch.clone()).await {
            Ok(index) => {
                self.throughput.lock().await.committed += batch.transactions.len() as u64;
                for tx in &batch.transactions {
                    self.retry_counts.remove(&tx.id);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.batches_committed_total.with_label_values(&[&batch.term.to_string()]).inc();
                    metrics.commit_latency_seconds.with_label_values(&["committed"]).observe(started.elapsed().as_secs_f64());
                }
                self.receipts.on_batch_committed(&batch, index).await;
                Ok(Some(index))
            }
            Err(error) => {
                if let Some(metrics) = &self.metrics {
                    metrics.batches_failed_total.with_label_values(&[error.label()]).inc();
                    metrics.commit_latency_seconds.with_label_values(&["failed"]).observe(started.elapsed().as_secs_f64());
                }
                self.handle_commit_failure(batch, &error).await;
                Err(error)
            }
        }
    }

    /// Runs every transaction through the pluggable executor level by
    /// level, buffering writes in an overlay that never touches
    /// `StateStore` directly (§4.9 step 4). A transaction whose execute
    /// call errors becomes `Failed` and contributes nothing to the
    /// overlay; everything else becomes `Included`.
    async fn stage_receipts(&self, transactions: &[Transaction]) -> Vec<Receipt> {
        let levels = schedule_levels(transactions);
        let overlay: DashMap<Vec<u8>, Vec<u8>> = DashMap::new();
        let mut receipts: Vec<Option<Receipt>> = vec![None; transactions.len()];

        for level in levels {
            let results: Vec<(usize, Result<Vec<(Vec<u8>, Vec<u8>)>, String>)> = futures::future::join_all(level.iter().map(|&idx| {
                let tx = &transactions[idx];
                let view = StagedView::new(&self.store, &overlay);
                async move { (idx, self.executor.execute(tx, &view).await) }
            }))
            .await;

            for (idx, result) in results {
                receipts[idx] = Some(match result {
                    Ok(writes) => {
                        for (key, value) in writes {
                            overlay.insert(key, value);
                        }
                        Receipt { tx_id: transactions[idx].id, outcome: ReceiptOutcome::Included }
                    }
                    Err(reason) => Receipt { tx_id: transactions[idx].id, outcome: ReceiptOutcome::Failed { reason } },
                });
            }
        }

        receipts.into_iter().map(|r| r.expect("every transaction is scheduled into exactly one level")).collect()
    }

    /// Re-enqueues every transaction in a batch that failed to commit, up
    /// to `max_retries`; beyond that a transaction is dropped for good
    /// (§4.9 "Fail path").
    async fn handle_commit_failure(&self, batch: Batch, error: &SequencerError) {
        warn!(batch_id = batch.batch_id, %error, "batch failed to commit, re-enqueuing");
        self.receipts.on_batch_failed(&batch, &error.to_string()).await;

        for tx in batch.transactions {
            let attempts = {
                let mut entry = self.retry_counts.entry(tx.id).or_insert(0);
                *entry += 1;
                *entry
            };
            if attempts > self.config.max_retries {
                warn!(tx_id = ?tx.id, attempts, "transaction exceeded max retries, dropping");
                self.retry_counts.remove(&tx.id);
                continue;
            }
            self.bundles.enqueue(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NoopReceiptSink;
    use crate::executor::TransferExecutor;
    use async_trait::async_trait;
    use sequencer_types::{AccountId, Priority};
    use state_store::StateStoreConfig;
    use std::sync::atomic::AtomicBool;

    fn tx(tag: &[u8], sender: AccountId, recipient: AccountId, amount: u64, priority: Priority) -> Transaction {
        Transaction {
            id: TxId::from_tag(tag),
            sender,
            recipient,
            nonce: 1,
            priority,
            submitted_at: 0,
            signature: Vec::new(),
            payload: amount.to_le_bytes().to_vec(),
            conflict_set: Default::default(),
        }
        .with_default_conflict_set()
    }

    struct AlwaysCommits(AtomicU64);

    #[async_trait]
    impl LogAppender for AlwaysCommits {
        async fn append(&self, _batch: Batch) -> Result<u64, SequencerError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl LogAppender for AlwaysFails {
        async fn append(&self, _batch: Batch) -> Result<u64, SequencerError> {
            Err(SequencerError::Overloaded)
        }
    }

    fn sequencer(appender: Arc<dyn LogAppender>) -> ParallelSequencer<TransferExecutor> {
        ParallelSequencer::new(
            PipelineConfig::default(),
            StateStore::new(StateStoreConfig::default()),
            Arc::new(TransferExecutor),
            appender,
            Arc::new(NoopReceiptSink),
        )
    }

    #[tokio::test]
    async fn run_once_commits_a_pending_batch_and_drains_the_queue() {
        let sequencer = sequencer(Arc::new(AlwaysCommits(AtomicU64::new(0))));
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");
        sequencer.store.put(alice.as_bytes().to_vec(), 100u64.to_le_bytes().to_vec()).await.unwrap();

        sequencer.admit(tx(b"t1", alice, bob, 10, Priority::Medium)).await.unwrap();
        let index = sequencer.run_once().await.unwrap();
        assert!(index.is_some());
        assert_eq!(sequencer.pending_len(), 0);
    }

    #[tokio::test]
    async fn insufficient_balance_yields_a_failed_receipt_not_a_pipeline_error() {
        let sequencer = sequencer(Arc::new(AlwaysCommits(AtomicU64::new(0))));
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");

        sequencer.admit(tx(b"t1", alice, bob, 10, Priority::Medium)).await.unwrap();
        let index = sequencer.run_once().await.unwrap();
        assert!(index.is_some());
    }

    #[tokio::test]
    async fn a_commit_failure_re_enqueues_transactions_for_retry() {
        let sequencer = sequencer(Arc::new(AlwaysFails));
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");
        sequencer.admit(tx(b"t1", alice, bob, 10, Priority::Medium)).await.unwrap();

        assert!(sequencer.run_once().await.is_err());
        assert_eq!(sequencer.pending_len(), 1);
    }

    #[tokio::test]
    async fn a_transaction_is_dropped_after_exceeding_max_retries() {
        let config = PipelineConfig { max_retries: 1, ..PipelineConfig::default() };
        let sequencer = ParallelSequencer::new(
            config,
            StateStore::new(StateStoreConfig::default()),
            Arc::new(TransferExecutor),
            Arc::new(AlwaysFails) as Arc<dyn LogAppender>,
            Arc::new(NoopReceiptSink),
        );
        let alice = AccountId::from_tag(b"alice");
        let bob = AccountId::from_tag(b"bob");
        sequencer.admit(tx(b"t1", alice, bob, 10, Priority::Medium)).await.unwrap();

        sequencer.run_once().await.ok();
        assert_eq!(sequencer.pending_len(), 1);
        sequencer.run_once().await.ok();
        assert_eq!(sequencer.pending_len(), 0);
    }

    #[tokio::test]
    async fn empty_queue_returns_none_without_touching_the_appender() {
        let committed = Arc::new(AtomicBool::new(false));
        struct Tracking(Arc<AtomicBool>);
        #[async_trait]
        impl LogAppender for Tracking {
            async fn append(&self, _batch: Batch) -> Result<u64, SequencerError> {
                self.0.store(true, Ordering::SeqCst);
                Ok(0)
            }
        }
        let sequencer = sequencer(Arc::new(Tracking(committed.clone())));
        assert!(sequencer.run_once().await.unwrap().is_none());
        assert!(!committed.load(Ordering::SeqCst));
    }
}
