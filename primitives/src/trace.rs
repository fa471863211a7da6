//! Transaction status, action receipts, and execution traces.
//!
//! Receipts are consensus data: their digests feed the block's action
//! merkle root. Traces are local observability output and never hashed.

use crate::codec::Pack;
use crate::crypto;
use crate::error::{ChainError, FailureCategory};
use crate::transaction::Action;
use crate::types::{BlockNum, Hash, Name, TimestampMs, TransactionId};
use crate::block::TransactionReceiptHeader;

/// Outcome recorded in a transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Applied and committed.
    Executed = 0,
    /// Failed objectively; state undone, resources still billed.
    SoftFail = 1,
    /// Failed in a way that invalidates any block claiming it.
    HardFail = 2,
    /// Stored as a deferred entry instead of executing.
    Delayed = 3,
    /// Deferred entry past its expiration; removed without billing.
    Expired = 4,
}

impl TransactionStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Executed),
            1 => Some(Self::SoftFail),
            2 => Some(Self::HardFail),
            3 => Some(Self::Delayed),
            4 => Some(Self::Expired),
            _ => None,
        }
    }
}

impl core::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Executed => "executed",
            Self::SoftFail => "soft_fail",
            Self::HardFail => "hard_fail",
            Self::Delayed => "delayed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Proof that `receiver` ran an action, with its sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub receiver: Name,
    /// BLAKE3 digest of the packed action.
    pub act_digest: Hash,
    /// Chain-wide action counter.
    pub global_sequence: u64,
    /// Per-receiver action counter.
    pub recv_sequence: u64,
    /// Per-authorizer counters, in authorization order.
    pub auth_sequence: Vec<(Name, u64)>,
}

impl ActionReceipt {
    /// Leaf digest for the action merkle root.
    pub fn digest(&self) -> Hash {
        crypto::hash_sha256(&self.packed())
    }
}

/// Category, code, and message of a failure, as recorded on traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub category: FailureCategory,
    pub code: u32,
    pub message: String,
}

impl From<&ChainError> for FailureInfo {
    fn from(err: &ChainError) -> Self {
        Self {
            category: err.category(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// One dispatched action (original, notification, or inline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTrace {
    /// 1-based position in dispatch order.
    pub action_ordinal: u32,
    /// Ordinal of the action that scheduled this one; 0 for top-level.
    pub creator_action_ordinal: u32,
    pub receiver: Name,
    pub act: Action,
    pub context_free: bool,
    /// Present once the handler returned successfully.
    pub receipt: Option<ActionReceipt>,
    /// CPU charged while this action ran.
    pub cpu_usage_us: u64,
    pub console: String,
    pub except: Option<FailureInfo>,
}

/// Full record of one transaction's execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionTrace {
    pub id: TransactionId,
    pub block_num: BlockNum,
    pub block_time: TimestampMs,
    /// Receipt header for transactions that entered the block.
    pub receipt: Option<TransactionReceiptHeader>,
    /// Wall-clock time spent, local only.
    pub elapsed_us: u64,
    pub net_usage: u64,
    /// True for deferred transactions.
    pub scheduled: bool,
    pub action_traces: Vec<ActionTrace>,
    pub except: Option<FailureInfo>,
}

impl TransactionTrace {
    pub fn status(&self) -> Option<TransactionStatus> {
        self.receipt.map(|r| r.status)
    }

    /// Included in the block with any status other than a hard failure.
    pub fn is_included(&self) -> bool {
        matches!(self.status(), Some(s) if s != TransactionStatus::HardFail)
    }

    /// Receipts of actions that completed, in dispatch order.
    pub fn action_receipts(&self) -> impl Iterator<Item = &ActionReceipt> {
        self.action_traces.iter().filter_map(|t| t.receipt.as_ref())
    }
}
