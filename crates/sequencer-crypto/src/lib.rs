//! Hashing and signature verification primitives used by the core.
//!
//! Signing itself is an opaque, HSM-backed capability out of scope for this
//! repository (spec §1); what the core owns is *verification* at admission
//! and the domain-separated hash used by the Merkle accumulator and state
//! digests.

use sha2::{Digest, Sha256};

/// Domain separator prepended to a Merkle leaf hash input (§4.3).
pub const LEAF_DOMAIN: u8 = 0x00;
/// Domain separator prepended to a Merkle inner-node hash input (§4.3).
pub const INNER_DOMAIN: u8 = 0x01;
/// Domain separator for the `StateStore` digest (§4.1a), distinct from both
/// Merkle domains so a state digest can never be mistaken for a tree node.
pub const STATE_DOMAIN: u8 = 0x02;

pub type Hash32 = [u8; 32];

/// SHA-256 of a single already-domain-separated leaf value.
pub fn hash_leaf(value: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_DOMAIN]);
    hasher.update(value);
    hasher.finalize().into()
}

/// SHA-256 over two child hashes, in left/right order, domain-separated
/// from leaves so a leaf value can never collide with an inner node (§4.3
/// "leaf domain separator `0x00`, inner `0x01`").
pub fn hash_inner(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([INNER_DOMAIN]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hashes a sequence of `(key, value)` pairs in caller-provided order into a
/// single digest (§4.1a `stateDigest`). Callers are responsible for
/// supplying pairs in byte-lexicographic key order so the digest is
/// deterministic across nodes.
pub fn hash_state<'a>(pairs: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([STATE_DOMAIN]);
    for (key, value) in pairs {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key);
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
    }
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("signature does not verify against declared sender's public key")]
    InvalidSignature,
    #[error("malformed public key or signature bytes")]
    Malformed,
}

/// Pluggable verifier capability consumed at admission (§4.9 step 1). The
/// default implementation is ed25519; the trait exists so tests can swap in
/// a permissive fake without touching `ParallelSequencer`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), VerifyError>;
}

/// Production verifier: standard ed25519 over the raw message bytes.
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| VerifyError::Malformed)?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| VerifyError::Malformed)?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| VerifyError::Malformed)?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(message, &signature)
            .map_err(|_| VerifyError::InvalidSignature)
    }
}

/// Accepts every signature. Used by tests that exercise admission/ordering
/// logic without wanting to construct real keypairs for every fixture.
#[derive(Default)]
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _public_key: &[u8], _message: &[u8], _signature: &[u8]) -> Result<(), VerifyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_inner_domains_never_collide() {
        let leaf = hash_leaf(b"same-bytes");
        let inner = hash_inner(&[0u8; 32], &[0u8; 32]);
        assert_ne!(leaf, inner);
    }

    #[test]
    fn hash_state_is_order_sensitive_but_deterministic() {
        let pairs = vec![(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..])];
        let d1 = hash_state(pairs.clone().into_iter());
        let d2 = hash_state(pairs.into_iter());
        assert_eq!(d1, d2);

        let reordered = hash_state(vec![(&b"b"[..], &b"2"[..]), (&b"a"[..], &b"1"[..])].into_iter());
        assert_ne!(d1, reordered);
    }

    #[test]
    fn ed25519_round_trip() {
        use ed25519_dalek::{Signer, SigningKey};
        use rand::rngs::OsRng;

        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let message = b"transfer S1->S2 nonce=1";
        let signature = signing_key.sign(message);

        let verifier = Ed25519Verifier;
        verifier
            .verify(signing_key.verifying_key().as_bytes(), message, &signature.to_bytes())
            .expect("valid signature must verify");

        let tampered = b"transfer S1->S2 nonce=2";
        assert!(verifier
            .verify(signing_key.verifying_key().as_bytes(), tampered, &signature.to_bytes())
            .is_err());
    }
}
