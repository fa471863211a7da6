//! Transaction and action types.
//!
//! A transaction carries ordered context-free actions and actions. Its id
//! is the SHA-256 of the packed body; signatures and context-free data are
//! excluded from the id so they can be pruned without changing it.

use crate::codec::Pack;
use crate::crypto;
use crate::types::{Hash, Name, PublicKey, SignatureBytes, TimestampMs, TransactionId};

/// `actor@permission` authorization pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermissionLevel {
    pub actor: Name,
    pub permission: Name,
}

impl PermissionLevel {
    pub const fn new(actor: Name, permission: Name) -> Self {
        Self { actor, permission }
    }
}

/// One call into a contract: `account::name(data)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Contract account whose code handles the action.
    pub account: Name,
    /// Action name.
    pub name: Name,
    /// Authorizations asserted by the sender.
    pub authorization: Vec<PermissionLevel>,
    /// Opaque payload for the contract.
    pub data: Vec<u8>,
}

impl Action {
    pub fn new(account: Name, name: Name, authorization: Vec<PermissionLevel>, data: Vec<u8>) -> Self {
        Self {
            account,
            name,
            authorization,
            data,
        }
    }

    /// BLAKE3 digest of the packed action, recorded in action receipts.
    pub fn digest(&self) -> Hash {
        crypto::hash_blake3(&self.packed())
    }
}

/// Transaction header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionHeader {
    /// Block time after which the transaction can no longer be included.
    pub expiration: TimestampMs,
    /// Upper bound on billed NET, in 8-byte words. Zero means no bound.
    pub max_net_usage_words: u32,
    /// Upper bound on billed CPU, in microseconds. Zero means no bound.
    pub max_cpu_usage_us: u32,
    /// Seconds to delay execution; non-zero turns the transaction into a
    /// deferred entry.
    pub delay_sec: u32,
}

/// Unsigned transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub header: TransactionHeader,
    pub context_free_actions: Vec<Action>,
    pub actions: Vec<Action>,
    /// `(type, payload)` extensions, carried but not interpreted.
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl Transaction {
    /// Transaction id: SHA-256 of the packed body.
    pub fn id(&self) -> TransactionId {
        crypto::hash_sha256(&self.packed())
    }

    /// Account billed for an action: the actor of its first authorization.
    pub fn first_authorizer(&self) -> Option<Name> {
        self.actions
            .iter()
            .flat_map(|a| a.authorization.iter())
            .map(|p| p.actor)
            .next()
    }

    /// Total action count (context-free plus regular).
    pub fn action_count(&self) -> usize {
        self.context_free_actions.len() + self.actions.len()
    }
}

/// A public key and the signature it produced over the signing digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionSignature {
    pub public_key: PublicKey,
    pub signature: SignatureBytes,
}

/// Transaction with signatures and prunable context-free data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub signatures: Vec<TransactionSignature>,
    pub context_free_data: Vec<Vec<u8>>,
}

impl SignedTransaction {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            signatures: Vec::new(),
            context_free_data: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// Digest covered by signatures:
    /// `SHA-256(chain_id || packed body || SHA-256(context_free_data))`.
    pub fn signing_digest(&self, chain_id: &Hash) -> Hash {
        let cfd_digest = if self.context_free_data.is_empty() {
            [0u8; 32]
        } else {
            crypto::hash_sha256(&self.context_free_data.packed())
        };
        let mut data = Vec::with_capacity(64 + 128);
        data.extend_from_slice(chain_id);
        self.transaction.pack(&mut data);
        data.extend_from_slice(&cfd_digest);
        crypto::hash_sha256(&data)
    }

    /// Append an ed25519 signature over the signing digest.
    #[cfg(feature = "std")]
    pub fn sign(&mut self, chain_id: &Hash, key: &ed25519_dalek::SigningKey) {
        let digest = self.signing_digest(chain_id);
        self.signatures.push(TransactionSignature {
            public_key: key.verifying_key().to_bytes(),
            signature: crypto::sign_ed25519(&digest, key),
        });
    }

    /// Packed size of body plus signatures (never pruned).
    pub fn unprunable_size(&self) -> u64 {
        let mut buf = Vec::new();
        self.transaction.pack(&mut buf);
        self.signatures.pack(&mut buf);
        buf.len() as u64
    }

    /// Packed size of context-free data (prunable).
    pub fn prunable_size(&self) -> u64 {
        self.context_free_data.packed().len() as u64
    }
}

/// Key of a deferred transaction entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeferredKey {
    pub sender: Name,
    pub sender_id: u128,
}

impl DeferredKey {
    pub const fn new(sender: Name, sender_id: u128) -> Self {
        Self { sender, sender_id }
    }
}

impl core::fmt::Display for DeferredKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.sender, self.sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::name;

    fn transfer() -> Transaction {
        Transaction {
            header: TransactionHeader {
                expiration: 1_000,
                ..Default::default()
            },
            context_free_actions: Vec::new(),
            actions: vec![Action::new(
                name("token"),
                name("transfer"),
                vec![PermissionLevel::new(name("alice"), name("active"))],
                b"alice->bob:5".to_vec(),
            )],
            extensions: Vec::new(),
        }
    }

    #[test]
    fn test_id_excludes_signatures_and_cfd() {
        let trx = transfer();
        let mut signed = SignedTransaction::new(trx.clone());
        let (_, sk) = crypto::deterministic_keypair(1);
        signed.sign(&[7u8; 32], &sk);
        signed.context_free_data.push(b"prunable".to_vec());
        assert_eq!(signed.id(), trx.id());
    }

    #[test]
    fn test_signing_digest_binds_chain_and_cfd() {
        let mut signed = SignedTransaction::new(transfer());
        let a = signed.signing_digest(&[1u8; 32]);
        let b = signed.signing_digest(&[2u8; 32]);
        assert_ne!(a, b);
        signed.context_free_data.push(vec![1]);
        assert_ne!(a, signed.signing_digest(&[1u8; 32]));
    }

    #[test]
    fn test_sign_verifies() {
        let mut signed = SignedTransaction::new(transfer());
        let (vk, sk) = crypto::deterministic_keypair(3);
        signed.sign(&[0u8; 32], &sk);
        let sig = signed.signatures[0];
        assert_eq!(sig.public_key, vk.to_bytes());
        let digest = signed.signing_digest(&[0u8; 32]);
        assert!(crypto::verify_ed25519(&digest, &sig.signature, &sig.public_key));
    }

    #[test]
    fn test_first_authorizer() {
        assert_eq!(transfer().first_authorizer(), Some(name("alice")));
        assert_eq!(Transaction::default().first_authorizer(), None);
    }

    #[test]
    fn test_sizes() {
        let mut signed = SignedTransaction::new(transfer());
        let base = signed.unprunable_size();
        let (_, sk) = crypto::deterministic_keypair(1);
        signed.sign(&[0u8; 32], &sk);
        assert_eq!(signed.unprunable_size(), base + 96);
        assert_eq!(signed.prunable_size(), 4);
        signed.context_free_data.push(vec![0; 10]);
        assert_eq!(signed.prunable_size(), 4 + 4 + 10);
    }
}
