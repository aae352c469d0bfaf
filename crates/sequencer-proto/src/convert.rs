use std::collections::BTreeSet;

use sequencer_types::{AccountId, Priority, Receipt, ReceiptOutcome, TxId};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("field `{field}` must be exactly {expected} bytes, got {actual}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("batch is missing its required `{0}` field")]
    MissingField(&'static str),
}

fn to_array32(field: &'static str, bytes: &[u8]) -> Result<[u8; 32], ConversionError> {
    bytes.try_into().map_err(|_| ConversionError::WrongLength {
        field,
        expected: 32,
        actual: bytes.len(),
    })
}

impl From<Priority> for crate::Priority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Low => crate::Priority::PriorityLow,
            Priority::Medium => crate::Priority::PriorityMedium,
            Priority::High => crate::Priority::PriorityHigh,
            Priority::Critical => crate::Priority::PriorityCritical,
        }
    }
}

impl From<crate::Priority> for Priority {
    fn from(p: crate::Priority) -> Self {
        match p {
            crate::Priority::PriorityLow => Priority::Low,
            crate::Priority::PriorityMedium => Priority::Medium,
            crate::Priority::PriorityHigh => Priority::High,
            crate::Priority::PriorityCritical => Priority::Critical,
        }
    }
}

impl From<&sequencer_types::Transaction> for crate::Transaction {
    fn from(tx: &sequencer_types::Transaction) -> Self {
        crate::Transaction {
            id: tx.id.as_bytes().to_vec(),
            sender: tx.sender.as_bytes().to_vec(),
            recipient: tx.recipient.as_bytes().to_vec(),
            nonce: tx.nonce,
            priority: crate::Priority::from(tx.priority) as i32,
            submitted_at: tx.submitted_at,
            signature: tx.signature.clone(),
            payload: tx.payload.clone(),
            conflict_set: tx.conflict_set.iter().map(|a| a.as_bytes().to_vec()).collect(),
        }
    }
}

impl TryFrom<crate::Transaction> for sequencer_types::Transaction {
    type Error = ConversionError;

    fn try_from(pb: crate::Transaction) -> Result<Self, Self::Error> {
        let priority = crate::Priority::try_from(pb.priority).unwrap_or(crate::Priority::PriorityLow);
        let mut conflict_set = BTreeSet::new();
        for key in &pb.conflict_set {
            conflict_set.insert(AccountId::from_bytes(to_array32("conflict_set[]", key)?));
        }
        Ok(sequencer_types::Transaction {
            id: TxId::from_bytes(to_array32("id", &pb.id)?),
            sender: AccountId::from_bytes(to_array32("sender", &pb.sender)?),
            recipient: AccountId::from_bytes(to_array32("recipient", &pb.recipient)?),
            nonce: pb.nonce,
            priority: priority.into(),
            submitted_at: pb.submitted_at,
            signature: pb.signature,
            payload: pb.payload,
            conflict_set,
        })
    }
}

impl From<&Receipt> for crate::Receipt {
    fn from(r: &Receipt) -> Self {
        match &r.outcome {
            ReceiptOutcome::Included => crate::Receipt {
                tx_id: r.tx_id.as_bytes().to_vec(),
                included: true,
                failure_reason: String::new(),
            },
            ReceiptOutcome::Failed { reason } => crate::Receipt {
                tx_id: r.tx_id.as_bytes().to_vec(),
                included: false,
                failure_reason: reason.clone(),
            },
        }
    }
}

impl TryFrom<crate::Receipt> for Receipt {
    type Error = ConversionError;

    fn try_from(pb: crate::Receipt) -> Result<Self, Self::Error> {
        Ok(Receipt {
            tx_id: TxId::from_bytes(to_array32("tx_id", &pb.tx_id)?),
            outcome: if pb.included {
                ReceiptOutcome::Included
            } else {
                ReceiptOutcome::Failed { reason: pb.failure_reason }
            },
        })
    }
}

impl From<&sequencer_types::Batch> for crate::Batch {
    fn from(batch: &sequencer_types::Batch) -> Self {
        crate::Batch {
            batch_id: batch.batch_id,
            term: batch.term,
            index: batch.index,
            transactions: batch.transactions.iter().map(crate::Transaction::from).collect(),
            receipts: batch.receipts.iter().map(crate::Receipt::from).collect(),
            root_after: batch.root_after.to_vec(),
        }
    }
}

impl TryFrom<crate::Batch> for sequencer_types::Batch {
    type Error = ConversionError;

    fn try_from(pb: crate::Batch) -> Result<Self, Self::Error> {
        let mut transactions = Vec::with_capacity(pb.transactions.len());
        for tx in pb.transactions {
            transactions.push(sequencer_types::Transaction::try_from(tx)?);
        }
        let mut receipts = Vec::with_capacity(pb.receipts.len());
        for r in pb.receipts {
            receipts.push(Receipt::try_from(r)?);
        }
        Ok(sequencer_types::Batch {
            batch_id: pb.batch_id,
            term: pb.term,
            index: pb.index,
            transactions,
            receipts,
            root_after: to_array32("root_after", &pb.root_after)?,
        })
    }
}

impl From<&sequencer_types::LogEntry> for crate::LogEntry {
    fn from(entry: &sequencer_types::LogEntry) -> Self {
        crate::LogEntry {
            term: entry.term,
            index: entry.index,
            batch: Some(crate::Batch::from(&entry.batch)),
            checksum: entry.checksum,
        }
    }
}

impl TryFrom<crate::LogEntry> for sequencer_types::LogEntry {
    type Error = ConversionError;

    fn try_from(pb: crate::LogEntry) -> Result<Self, Self::Error> {
        let batch = pb.batch.ok_or(ConversionError::MissingField("batch"))?;
        Ok(sequencer_types::LogEntry {
            term: pb.term,
            index: pb.index,
            batch: sequencer_types::Batch::try_from(batch)?,
            checksum: pb.checksum,
        })
    }
}

impl From<&sequencer_types::Snapshot> for crate::Snapshot {
    fn from(s: &sequencer_types::Snapshot) -> Self {
        crate::Snapshot {
            last_included_index: s.last_included_index,
            last_included_term: s.last_included_term,
            state_digest: s.state_digest.to_vec(),
            state_bytes: s.state_bytes.clone(),
        }
    }
}

impl TryFrom<crate::Snapshot> for sequencer_types::Snapshot {
    type Error = ConversionError;

    fn try_from(pb: crate::Snapshot) -> Result<Self, Self::Error> {
        Ok(sequencer_types::Snapshot {
            last_included_index: pb.last_included_index,
            last_included_term: pb.last_included_term,
            state_digest: to_array32("state_digest", &pb.state_digest)?,
            state_bytes: pb.state_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_types::{AccountId, Batch, Priority as DomainPriority, Transaction as DomainTx, TxId};

    fn sample_tx() -> DomainTx {
        DomainTx {
            id: TxId::from_tag(b"tx"),
            sender: AccountId::from_tag(b"S1"),
            recipient: AccountId::from_tag(b"S2"),
            nonce: 7,
            priority: DomainPriority::High,
            submitted_at: 42,
            signature: vec![1, 2, 3],
            payload: vec![9, 9],
            conflict_set: Default::default(),
        }
        .with_default_conflict_set()
    }

    #[test]
    fn transaction_round_trips_through_proto() {
        let original = sample_tx();
        let pb = crate::Transaction::from(&original);
        let decoded = DomainTx::try_from(pb).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn log_entry_round_trips_through_proto() {
        let batch = Batch::new(1, vec![sample_tx()]);
        let entry = sequencer_types::LogEntry {
            term: 3,
            index: 10,
            batch,
            checksum: 0xdead_beef,
        };
        let pb = crate::LogEntry::from(&entry);
        let decoded = sequencer_types::LogEntry::try_from(pb).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn malformed_id_length_is_rejected() {
        let mut pb = crate::Transaction::from(&sample_tx());
        pb.id = vec![1, 2, 3];
        let err = DomainTx::try_from(pb).unwrap_err();
        assert!(matches!(err, ConversionError::WrongLength { field: "id", .. }));
    }
}
