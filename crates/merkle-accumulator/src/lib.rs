//! Append-oriented Merkle accumulator used for tamper-evident transaction
//! history (§4.3).

mod proof;
mod tree;

pub use proof::{verify_proof, Proof, ProofError, ProofStep, Side};
pub use tree::MerkleAccumulator;
