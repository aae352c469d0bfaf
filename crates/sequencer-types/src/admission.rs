use crate::ids::TxId;

/// The durable (in-memory, bounded) record that makes `submitTransaction`
/// idempotent on `tx.id` (§8 round-trip property; §3a `AdmissionRecord`).
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct AdmissionRecord {
    pub tx_id: TxId,
    pub accepted_at: u64,
}

/// Terminal state reached by exactly one path per transaction (§7
/// "User-visible behavior"): there is no "unknown" terminal state.
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum TransactionStatus {
    Pending,
    Processing,
    Committed { batch_index: u64 },
    Failed { reason: String },
}
