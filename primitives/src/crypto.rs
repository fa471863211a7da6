//! Hashing and signature helpers.
//!
//! Hash and signature verification are opaque calls from the execution
//! core's point of view:
//! - SHA-256 for transaction ids, block ids, and merkle nodes
//! - BLAKE3 for action payload digests
//! - Ed25519 for transaction and block producer signatures
//!
//! Verification is pure and deterministic, so it may run ahead of the
//! ordered apply step on other threads.

use crate::types::{Hash, PublicKey, SignatureBytes};

/// Compute BLAKE3 hash of the input data.
pub fn hash_blake3(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute SHA-256 hash of the input data.
pub fn hash_sha256(data: &[u8]) -> Hash {
    use sha2::Digest;
    let result = sha2::Sha256::digest(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// SHA-256 over the concatenation of two digests.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Verify an Ed25519 signature. Returns `false` for malformed keys.
pub fn verify_ed25519(message: &[u8], signature: &SignatureBytes, public_key: &PublicKey) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    verifying_key.verify(message, &sig).is_ok()
}

/// Sign a message with an Ed25519 private key.
#[cfg(feature = "std")]
pub fn sign_ed25519(message: &[u8], secret_key: &ed25519_dalek::SigningKey) -> SignatureBytes {
    use ed25519_dalek::Signer;
    secret_key.sign(message).to_bytes()
}

/// Generate a random Ed25519 keypair. Never used on the apply path.
#[cfg(feature = "std")]
pub fn generate_keypair() -> (ed25519_dalek::VerifyingKey, ed25519_dalek::SigningKey) {
    let mut rng = rand::rngs::OsRng;
    let signing_key = ed25519_dalek::SigningKey::generate(&mut rng);
    (signing_key.verifying_key(), signing_key)
}

/// Keypair whose secret is `[seed; 32]`, reproducible across machines.
#[cfg(feature = "std")]
pub fn deterministic_keypair(seed: u8) -> (ed25519_dalek::VerifyingKey, ed25519_dalek::SigningKey) {
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    (signing_key.verifying_key(), signing_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256("") = e3b0c442...7852b855
        let h = hash_sha256(b"");
        assert_eq!(h[0], 0xe3);
        assert_eq!(h[1], 0xb0);
        assert_eq!(h[31], 0x55);
    }

    #[test]
    fn test_hash_pair_matches_concat() {
        let a = hash_sha256(b"a");
        let b = hash_sha256(b"b");
        let mut cat = a.to_vec();
        cat.extend_from_slice(&b);
        assert_eq!(hash_pair(&a, &b), hash_sha256(&cat));
    }

    #[test]
    fn test_blake3_deterministic() {
        assert_eq!(hash_blake3(b"meter"), hash_blake3(b"meter"));
        assert_ne!(hash_blake3(b"meter"), hash_blake3(b"meter!"));
    }

    #[test]
    fn test_ed25519_roundtrip_and_rejects() {
        let (vk, sk) = generate_keypair();
        let sig = sign_ed25519(b"block", &sk);
        assert!(verify_ed25519(b"block", &sig, vk.as_bytes()));
        assert!(!verify_ed25519(b"other", &sig, vk.as_bytes()));

        let (vk2, _) = deterministic_keypair(9);
        assert!(!verify_ed25519(b"block", &sig, vk2.as_bytes()));
        assert!(!verify_ed25519(b"block", &[0u8; 64], &[0xFF; 32]));
    }

    #[test]
    fn test_deterministic_keypair_stable() {
        let (a, _) = deterministic_keypair(1);
        let (b, _) = deterministic_keypair(1);
        assert_eq!(a, b);
    }
}
