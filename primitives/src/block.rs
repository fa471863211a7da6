//! Block, receipt, and producer schedule types.
//!
//! The header layout is protocol: field order and hashing must match
//! byte-for-byte on every node (see [`crate::codec`]).

use crate::codec::Pack;
use crate::crypto;
use crate::trace::TransactionStatus;
use crate::transaction::{DeferredKey, SignedTransaction};
use crate::types::{
    block_num_from_id, BlockId, BlockNum, Hash, Name, PublicKey, SignatureBytes, TimestampMs,
    TransactionId,
};

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Id of the parent block.
    pub previous: BlockId,
    /// Logical block time taken from the producer slot.
    pub timestamp_ms: TimestampMs,
    /// Producer scheduled for this slot.
    pub producer: Name,
    /// Merkle root over transaction receipt digests.
    pub transaction_mroot: Hash,
    /// Merkle root over action receipt digests.
    pub action_mroot: Hash,
    /// Version of the producer schedule that authorized this block.
    pub schedule_version: u32,
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl BlockHeader {
    pub fn block_num(&self) -> BlockNum {
        block_num_from_id(&self.previous).wrapping_add(1)
    }

    /// SHA-256 of the packed header.
    pub fn digest(&self) -> Hash {
        crypto::hash_sha256(&self.packed())
    }

    /// Header digest with the first four bytes replaced by the big-endian
    /// block number.
    pub fn id(&self) -> BlockId {
        let mut id = self.digest();
        id[..4].copy_from_slice(&self.block_num().to_be_bytes());
        id
    }
}

/// Receipt fields that enter the merkle root and billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionReceiptHeader {
    pub status: TransactionStatus,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
}

impl Default for TransactionReceiptHeader {
    fn default() -> Self {
        Self {
            status: TransactionStatus::Executed,
            cpu_usage_us: 0,
            net_usage_words: 0,
        }
    }
}

/// How a receipt refers to its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptTransaction {
    /// An input transaction, carried in full.
    Input(SignedTransaction),
    /// A deferred transaction already stored on chain.
    Scheduled { id: TransactionId, key: DeferredKey },
}

impl ReceiptTransaction {
    pub fn id(&self) -> TransactionId {
        match self {
            Self::Input(trx) => trx.id(),
            Self::Scheduled { id, key } => {
                let mut data = id.to_vec();
                data.extend_from_slice(&key.packed());
                crypto::hash_sha256(&data)
            }
        }
    }

    /// Digest committing to the transaction including its signatures and
    /// context-free data, or to the deferred entry a scheduled receipt ran.
    fn digest(&self) -> Hash {
        match self {
            Self::Input(trx) => {
                let mut data = Vec::with_capacity(96);
                data.extend_from_slice(&trx.id());
                data.extend_from_slice(&crypto::hash_sha256(&trx.signatures.packed()));
                data.extend_from_slice(&crypto::hash_sha256(&trx.context_free_data.packed()));
                crypto::hash_sha256(&data)
            }
            Self::Scheduled { id, .. } => *id,
        }
    }
}

/// Recorded outcome of one transaction in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub header: TransactionReceiptHeader,
    pub trx: ReceiptTransaction,
}

impl TransactionReceipt {
    /// Leaf digest for the transaction merkle root.
    pub fn digest(&self) -> Hash {
        let mut data = self.header.packed();
        data.extend_from_slice(&self.trx.digest());
        crypto::hash_sha256(&data)
    }
}

/// Header, producer signature, and ordered receipts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    pub header: BlockHeader,
    /// Ed25519 signature by the producer over the block id.
    pub producer_signature: SignatureBytes,
    pub transactions: Vec<TransactionReceipt>,
}

impl Default for SignedBlock {
    fn default() -> Self {
        Self {
            header: BlockHeader::default(),
            producer_signature: [0u8; 64],
            transactions: Vec::new(),
        }
    }
}

impl SignedBlock {
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    pub fn previous(&self) -> BlockId {
        self.header.previous
    }

    /// Check the producer signature against `key`.
    pub fn verify_signature(&self, key: &PublicKey) -> bool {
        crypto::verify_ed25519(&self.id(), &self.producer_signature, key)
    }

    #[cfg(feature = "std")]
    pub fn sign(&mut self, key: &ed25519_dalek::SigningKey) {
        self.producer_signature = crypto::sign_ed25519(&self.id(), key);
    }
}

/// A producer and the key its blocks must be signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerKey {
    pub producer_name: Name,
    pub signing_key: PublicKey,
}

/// Ordered producer rotation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    /// Producer owning the slot containing `timestamp_ms`. Each producer
    /// keeps `repetitions` consecutive slots.
    pub fn scheduled_producer(
        &self,
        timestamp_ms: TimestampMs,
        interval_ms: u64,
        repetitions: u32,
    ) -> Option<&ProducerKey> {
        if self.producers.is_empty() || interval_ms == 0 || repetitions == 0 {
            return None;
        }
        let slot = timestamp_ms / interval_ms;
        let index = (slot / repetitions as u64) % self.producers.len() as u64;
        self.producers.get(index as usize)
    }

    pub fn find(&self, producer: Name) -> Option<&ProducerKey> {
        self.producers.iter().find(|p| p.producer_name == producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use crate::types::name;

    fn header_after(previous_num: u32) -> BlockHeader {
        let mut previous = [0x5A; 32];
        previous[..4].copy_from_slice(&previous_num.to_be_bytes());
        BlockHeader {
            previous,
            timestamp_ms: 1_000,
            producer: name("alice"),
            ..Default::default()
        }
    }

    #[test]
    fn test_id_embeds_block_num() {
        let header = header_after(41);
        assert_eq!(header.block_num(), 42);
        let id = header.id();
        assert_eq!(block_num_from_id(&id), 42);
        assert_eq!(&id[4..], &header.digest()[4..]);
    }

    #[test]
    fn test_id_changes_with_any_field() {
        let base = header_after(1);
        let mut other = base.clone();
        other.action_mroot = [1; 32];
        assert_ne!(base.id(), other.id());
        let mut other = base.clone();
        other.schedule_version = 1;
        assert_ne!(base.id(), other.id());
    }

    #[test]
    fn test_block_signature() {
        let (vk, sk) = crypto::deterministic_keypair(4);
        let mut block = SignedBlock {
            header: header_after(0),
            ..Default::default()
        };
        block.sign(&sk);
        assert!(block.verify_signature(vk.as_bytes()));
        block.header.timestamp_ms += 500;
        assert!(!block.verify_signature(vk.as_bytes()));
    }

    #[test]
    fn test_receipt_digest_binds_status_and_signatures() {
        let trx = SignedTransaction::new(Transaction::default());
        let executed = TransactionReceipt {
            header: TransactionReceiptHeader::default(),
            trx: ReceiptTransaction::Input(trx.clone()),
        };
        let mut soft = executed.clone();
        soft.header.status = TransactionStatus::SoftFail;
        assert_ne!(executed.digest(), soft.digest());

        let mut signed = trx;
        signed.signatures.push(crate::transaction::TransactionSignature {
            public_key: [1; 32],
            signature: [2; 64],
        });
        let resigned = TransactionReceipt {
            header: TransactionReceiptHeader::default(),
            trx: ReceiptTransaction::Input(signed),
        };
        assert_eq!(executed.trx.id(), resigned.trx.id());
        assert_ne!(executed.digest(), resigned.digest());
    }

    #[test]
    fn test_scheduled_receipt_digest_binds_key() {
        let receipt = |sender_id| TransactionReceipt {
            header: TransactionReceiptHeader::default(),
            trx: ReceiptTransaction::Scheduled {
                id: [7; 32],
                key: DeferredKey::new(name("bob"), sender_id),
            },
        };
        assert_eq!(receipt(1).trx.id(), receipt(2).trx.id());
        assert_ne!(receipt(1).digest(), receipt(2).digest());
    }

    #[test]
    fn test_scheduled_producer_rotation() {
        let schedule = ProducerSchedule {
            version: 1,
            producers: ["alice", "bob", "carol"]
                .iter()
                .map(|n| ProducerKey {
                    producer_name: name(n),
                    signing_key: [0; 32],
                })
                .collect(),
        };
        let at = |ts| schedule.scheduled_producer(ts, 500, 2).map(|p| p.producer_name);
        assert_eq!(at(0), Some(name("alice")));
        assert_eq!(at(999), Some(name("alice")));
        assert_eq!(at(1_000), Some(name("bob")));
        assert_eq!(at(2_000), Some(name("carol")));
        assert_eq!(at(3_000), Some(name("alice")));
        assert!(schedule.scheduled_producer(0, 0, 2).is_none());
        assert!(schedule.find(name("bob")).is_some());
    }
}
