use sequencer_types::Transaction;

/// Groups a batch's transactions into conflict-free execution levels
/// (§4.9 step 3 "Build conflict graph"). Every transaction in one level can
/// run concurrently; level `k` is only started once level `k - 1` has
/// finished, so a transaction always sees the effects of everything it
/// conflicts with that came before it in the batch.
///
/// `level(i)` is one more than the highest level of any earlier transaction
/// it conflicts with, or `0` if it conflicts with none. A greedy
/// first-disjoint-level assignment is tempting but wrong: it can place a
/// later transaction into an earlier level than one it actually conflicts
/// with, since a level's "occupied" conflict set only reflects what was
/// placed there, not everything tested against it. This is the textbook
/// correct algorithm instead, at the cost of being O(n^2); batches are
/// bounded by `maxBatchSize` so that cost stays in the low hundreds.
pub fn schedule_levels(transactions: &[Transaction]) -> Vec<Vec<usize>> {
    if transactions.is_empty() {
        return Vec::new();
    }

    let mut level_of = vec![0usize; transactions.len()];
    for i in 0..transactions.len() {
        let mut level = 0usize;
        for j in 0..i {
            if transactions[i].conflicts_with(&transactions[j]) {
                level = level.max(level_of[j] + 1);
            }
        }
        level_of[i] = level;
    }

    let num_levels = level_of.iter().copied().max().map(|m| m + 1).unwrap_or(1);
    let mut levels = vec![Vec::new(); num_levels];
    for (idx, level) in level_of.into_iter().enumerate() {
        levels[level].push(idx);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_types::{AccountId, Priority, TxId};

    fn tx(tag: &[u8], sender: &[u8], recipient: &[u8]) -> Transaction {
        Transaction {
            id: TxId::from_tag(tag),
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
    fn disjoint_transactions_all_land_in_level_zero() {
        let txs = vec![tx(b"t1", b"A", b"B"), tx(b"t2", b"C", b"D"), tx(b"t3", b"E", b"F")];
        let levels = schedule_levels(&txs);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0], vec![0, 1, 2]);
    }

    #[test]
    fn a_chain_of_conflicts_gets_one_level_each() {
        // t1: A->B, t2: B->C, t3: C->D - each conflicts only with its
        // immediate predecessor, forming a strict chain.
        let txs = vec![tx(b"t1", b"A", b"B"), tx(b"t2", b"B", b"C"), tx(b"t3", b"C", b"D")];
        let levels = schedule_levels(&txs);
        assert_eq!(levels, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn transitive_conflict_is_not_placed_earlier_than_its_true_dependency() {
        // t1: A->B (level 0)
        // t2: C->D (level 0, disjoint from t1)
        // t3: B->C (conflicts with both t1 and t2) must land after both,
        // i.e. strictly after the max of their levels, not merely after
        // whichever one a greedy first-fit happened to check first.
        let txs = vec![tx(b"t1", b"A", b"B"), tx(b"t2", b"C", b"D"), tx(b"t3", b"B", b"C")];
        let levels = schedule_levels(&txs);
        assert_eq!(levels.len(), 2);
        assert!(levels[0].contains(&0));
        assert!(levels[0].contains(&1));
        assert_eq!(levels[1], vec![2]);
    }

    #[test]
    fn empty_batch_has_no_levels() {
        assert!(schedule_levels(&[]).is_empty());
    }
}
