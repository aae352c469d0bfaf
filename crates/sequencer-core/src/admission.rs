use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use sequencer_crypto::SignatureVerifier;
use sequencer_metrics::SequencerMetrics;
use sequencer_types::{AccountId, Priority, Transaction, TxId};
use state_store::StateStore;

use crate::error::SequencerError;

/// Supplies the sender's last-committed nonce for the admission check
/// (§4.9 step 1). Kept as a trait, not a direct `StateStore` dependency, so
/// admission logic can be unit-tested against a fake nonce ledger without
/// replaying a batch through `StateReplication` first.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn last_committed_nonce(&self, sender: AccountId) -> u64;
}

/// Reads the committed nonce out of `StateStore` under a fixed key prefix.
/// Transactions never touch this key directly through the default
/// `TransferExecutor`; a deployment that wants the nonce check to actually
/// bind would have its `TransactionExecutor` advance it as part of the same
/// write set.
pub struct StateStoreNonceSource(pub StateStore);

#[async_trait]
impl NonceSource for StateStoreNonceSource {
    async fn last_committed_nonce(&self, sender: AccountId) -> u64 {
        let key = nonce_key(sender);
        self.0
            .get(&key)
            .await
            .ok()
            .flatten()
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0)
    }
}

fn nonce_key(sender: AccountId) -> Vec<u8> {
    let mut key = b"nonce:".to_vec();
    key.extend_from_slice(sender.as_bytes());
    key
}

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub max_pending_per_sender: usize,
    pub global_rate_limit: u64,
    pub rate_limit_window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { max_pending_per_sender: 1_000, global_rate_limit: 50_000, rate_limit_window: Duration::from_secs(1) }
    }
}

struct RateWindow {
    started: Instant,
    count: u64,
}

/// Admission gate (§4.9 step 1): signature verification, nonce freshness,
/// per-sender and global caps, and idempotency on `tx.id`.
pub struct AdmissionController<V, N> {
    verifier: V,
    nonce_source: N,
    config: AdmissionConfig,
    admitted: DashMap<TxId, u64>,
    pending_per_sender: DashMap<AccountId, usize>,
    rate_window: tokio::sync::Mutex<RateWindow>,
    logical_clock: AtomicU64,
    metrics: Option<std::sync::Arc<SequencerMetrics>>,
}

impl<V, N> AdmissionController<V, N>
where
    V: SignatureVerifier,
    N: NonceSource,
{
    pub fn new(verifier: V, nonce_source: N, config: AdmissionConfig) -> Self {
        Self {
            verifier,
            nonce_source,
            config,
            admitted: DashMap::new(),
            pending_per_sender: DashMap::new(),
            rate_window: tokio::sync::Mutex::new(RateWindow { started: Instant::now(), count: 0 }),
            logical_clock: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: std::sync::Arc<SequencerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record_rejection(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.rejections_total.with_label_values(&[reason]).inc();
        }
    }

    /// Runs every admission check and returns a logical admission timestamp
    /// on success. Re-submitting an already-admitted `tx.id` returns the
    /// original timestamp instead of re-validating (§6: `submitTransaction`
    /// is idempotent on `tx.id`).
    pub async fn admit(&self, tx: &Transaction) -> Result<u64, SequencerError> {
        if let Some(existing) = self.admitted.get(&tx.id) {
            return Ok(*existing);
        }

        if self
            .verifier
            .verify(tx.sender.as_bytes(), &admission_message(tx), &tx.signature)
            .is_err()
        {
            self.record_rejection("invalid_signature");
            return Err(SequencerError::InvalidSignature);
        }

        let last_committed = self.nonce_source.last_committed_nonce(tx.sender).await;
        if tx.nonce <= last_committed {
            self.record_rejection("nonce_too_low");
            return Err(SequencerError::NonceTooLow { nonce: tx.nonce, last_committed });
        }

        {
            let mut pending = self.pending_per_sender.entry(tx.sender).or_insert(0);
            if *pending >= self.config.max_pending_per_sender {
                self.record_rejection("sender_cap");
                return Err(SequencerError::Overloaded);
            }
            *pending += 1;
        }

        if !self.check_global_rate().await {
            self.pending_per_sender.entry(tx.sender).and_modify(|n| *n = n.saturating_sub(1));
            self.record_rejection("global_rate_limit");
            return Err(SequencerError::Overloaded);
        }

        let accepted_at = self.logical_clock.fetch_add(1, Ordering::SeqCst);
        self.admitted.insert(tx.id, accepted_at);
        if let Some(metrics) = &self.metrics {
            metrics.admissions_total.with_label_values(&[priority_label(tx.priority)]).inc();
        }
        Ok(accepted_at)
    }

    /// Releases a sender's pending-count slot once its transaction leaves
    /// admission bookkeeping (batched terminally, or abandoned after
    /// `maxRetries`).
    pub fn release(&self, sender: AccountId) {
        self.pending_per_sender.entry(sender).and_modify(|n| *n = n.saturating_sub(1));
    }

    async fn check_global_rate(&self) -> bool {
        let mut window = self.rate_window.lock().await;
        if window.started.elapsed() >= self.config.rate_limit_window {
            window.started = Instant::now();
            window.count = 0;
        }
        if window.count >= self.config.global_rate_limit {
            false
        } else {
            window.count += 1;
            true
        }
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

fn admission_message(tx: &Transaction) -> Vec<u8> {
    let mut message = Vec::with_capacity(64 + tx.payload.len());
    message.extend_from_slice(tx.sender.as_bytes());
    message.extend_from_slice(tx.recipient.as_bytes());
    message.extend_from_slice(&tx.nonce.to_le_bytes());
    message.extend_from_slice(&tx.payload);
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_crypto::AcceptAllVerifier;

    struct FixedNonce(u64);

    #[async_trait]
    impl NonceSource for FixedNonce {
        async fn last_committed_nonce(&self, _sender: AccountId) -> u64 {
            self.0
        }
    }

    fn tx(nonce: u64) -> Transaction {
        Transaction {
            id: TxId::from_tag(b"t1"),
            sender: AccountId::from_tag(b"alice"),
            recipient: AccountId::from_tag(b"bob"),
            nonce,
            priority: Priority::Medium,
            submitted_at: 0,
            signature: Vec::new(),
            payload: Vec::new(),
            conflict_set: Default::default(),
        }
        .with_default_conflict_set()
    }

    #[tokio::test]
    async fn admits_a_fresh_transaction() {
        let controller = AdmissionController::new(AcceptAllVerifier, FixedNonce(0), AdmissionConfig::default());
        assert!(controller.admit(&tx(1)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_nonce_not_greater_than_committed() {
        let controller = AdmissionController::new(AcceptAllVerifier, FixedNonce(5), AdmissionConfig::default());
        let result = controller.admit(&tx(5)).await;
        assert!(matches!(result, Err(SequencerError::NonceTooLow { nonce: 5, last_committed: 5 })));
    }

    #[tokio::test]
    async fn resubmitting_the_same_tx_id_is_idempotent() {
        let controller = AdmissionController::new(AcceptAllVerifier, FixedNonce(0), AdmissionConfig::default());
        let first = controller.admit(&tx(1)).await.unwrap();
        let second = controller.admit(&tx(1)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn per_sender_cap_is_enforced() {
        let config = AdmissionConfig { max_pending_per_sender: 1, ..AdmissionConfig::default() };
        let controller = AdmissionController::new(AcceptAllVerifier, FixedNonce(0), config);
        assert!(controller.admit(&tx(1)).await.is_ok());

        let mut second = tx(2);
        second.id = TxId::from_tag(b"t2");
        assert!(matches!(controller.admit(&second).await, Err(SequencerError::Overloaded)));
    }

    #[tokio::test]
    async fn global_rate_limit_is_enforced() {
        let config = AdmissionConfig { global_rate_limit: 1, ..AdmissionConfig::default() };
        let controller = AdmissionController::new(AcceptAllVerifier, FixedNonce(0), config);
        assert!(controller.admit(&tx(1)).await.is_ok());

        let mut second = tx(2);
        second.id = TxId::from_tag(b"t2");
        assert!(matches!(controller.admit(&second).await, Err(SequencerError::Overloaded)));
    }
}
