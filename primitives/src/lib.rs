//! `meterchain-primitives` — foundational types for the meterchain
//! execution core.
//!
//! This crate provides names and ids, the error taxonomy, the deterministic
//! codec, hashing and signature helpers, the canonical merkle accumulator,
//! fixed-point resource windows and elastic-limit math, and the undoable
//! key-value store shared by the engine.

pub mod types;
pub mod error;
pub mod resource;
pub mod transaction;
pub mod trace;
pub mod block;
pub mod crypto;
pub mod merkle;
pub mod state;
pub mod codec;

// Re-export commonly used types at the crate root for convenience.
pub use types::{name, BlockId, BlockNum, Hash, Name, TimestampMs, TransactionId, ZERO_HASH};
pub use error::{ChainError, ChainResult, FailureCategory};
pub use resource::{ElasticLimitParameters, Ratio, ResourceKind, UsageWindow, WindowConfig};
pub use transaction::{
    Action, DeferredKey, PermissionLevel, SignedTransaction, Transaction, TransactionHeader,
};
pub use trace::{ActionReceipt, ActionTrace, FailureInfo, TransactionStatus, TransactionTrace};
pub use block::{
    BlockHeader, ProducerKey, ProducerSchedule, ReceiptTransaction, SignedBlock,
    TransactionReceipt, TransactionReceiptHeader,
};
pub use merkle::{MerkleAccumulator, MerkleProof};
pub use state::{KeyValueStore, UndoStore};
pub use codec::{Pack, Unpack};
