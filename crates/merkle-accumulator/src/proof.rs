use sequencer_crypto::{hash_inner, Hash32};

/// Which side of the combination a sibling hash sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One level's contribution to a Merkle proof. A level with no entry in
/// [`Proof::steps`] means that level's node had no sibling and was carried
/// upward unchanged (§4.3a) — not every proof has the same number of steps
/// as `log2(leaf_count)` for that reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash32,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub leaf: Hash32,
    pub steps: Vec<ProofStep>,
    pub root: Hash32,
}

/// Replays `proof.steps` against `leaf` and checks the result against
/// `expected_root` (§4.3 `verifyProof`).
pub fn verify_proof(leaf: Hash32, proof: &Proof, expected_root: Hash32) -> bool {
    if proof.leaf != leaf {
        return false;
    }
    let mut current = leaf;
    for step in &proof.steps {
        current = match step.side {
            Side::Left => hash_inner(&step.sibling, &current),
            Side::Right => hash_inner(&current, &step.sibling),
        };
    }
    current == expected_root && current == proof.root
}

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("leaf index {index} is out of bounds (tree has {leaf_count} leaves)")]
    IndexOutOfBounds { index: u64, leaf_count: u64 },
}
