use std::collections::BTreeSet;

use crate::ids::{AccountId, TxId};

/// Relative scheduling weight for admission and batch formation (§4.9).
///
/// Numeric weights are used directly by `BundleProcessor`'s aging formula;
/// the ordering `Low < Medium < High < Critical` is relied on by tests.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Base weight before aging is applied. Aging adds to this, it never
    /// subtracts, so a `Critical` transaction is never overtaken by an aged
    /// `Low` one within the same admission window.
    pub fn base_weight(self) -> u64 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 10,
            Priority::High => 100,
            Priority::Critical => 1_000,
        }
    }
}

/// A signed, admitted transaction. The payload is treated as an opaque
/// side-effect descriptor; the sequencer core never interprets it (§1
/// Non-goals).
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub sender: AccountId,
    pub recipient: AccountId,
    pub nonce: u64,
    pub priority: Priority,
    /// Logical admission timestamp (monotonic counter, not wall-clock), used
    /// only for aging and ordering.
    pub submitted_at: u64,
    /// Verified once at admission; opaque thereafter.
    pub signature: Vec<u8>,
    /// Opaque side-effect payload handed to the pluggable executor.
    pub payload: Vec<u8>,
    /// The set of account keys this transaction reads or writes, declared by
    /// the submitter or derived from `sender`/`recipient`. Drives the
    /// conflict graph (§4.9 step 3).
    pub conflict_set: BTreeSet<AccountId>,
}

impl Transaction {
    /// Builds the conflict set from `sender`/`recipient` when the caller has
    /// not declared a wider one explicitly. Most simple transfers only ever
    /// touch these two accounts.
    pub fn with_default_conflict_set(mut self) -> Self {
        if self.conflict_set.is_empty() {
            self.conflict_set.insert(self.sender);
            self.conflict_set.insert(self.recipient);
        }
        self
    }

    pub fn conflicts_with(&self, other: &Transaction) -> bool {
        !self.conflict_set.is_disjoint(&other.conflict_set)
    }
}

/// Outcome recorded for a transaction once its containing batch is decided.
#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum ReceiptOutcome {
    Included,
    Failed { reason: String },
}

#[derive(Clone, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Receipt {
    pub tx_id: TxId,
    pub outcome: ReceiptOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(sender: &[u8], recipient: &[u8]) -> Transaction {
        Transaction {
            id: TxId::from_tag(sender),
            sender: AccountId::from_tag(sender),
            recipient: AccountId::from_tag(recipient),
            nonce: 1,
            priority: Priority::Medium,
            submitted_at: 0,
            signature: Vec::new(),
            payload: Vec::new(),
            conflict_set: Default::default(),
        }
        .with_default_conflict_set()
    }

    #[test]
    fn priority_ordering_is_strictly_increasing() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert!(Priority::Low.base_weight() < Priority::Critical.base_weight());
    }

    #[test]
    fn shared_account_conflicts() {
        let a = tx(b"S1", b"S2");
        let b = tx(b"S1", b"S3");
        let c = tx(b"S4", b"S5");
        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c));
        assert!(!b.conflicts_with(&c));
    }

    #[test]
    fn default_conflict_set_is_sender_and_recipient() {
        let t = tx(b"S1", b"S2");
        assert_eq!(t.conflict_set.len(), 2);
        assert!(t.conflict_set.contains(&t.sender));
        assert!(t.conflict_set.contains(&t.recipient));
    }
}
