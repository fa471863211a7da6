//! Error taxonomy for the meterchain execution core.
//!
//! Every failure is classified into one of three categories:
//!
//! - **Objective**: detected identically by every node on replay (resource
//!   exhaustion, authorization failure, malformed data, contract assertion,
//!   billed CPU exceeding its cap). Aborts the transaction; if a producer
//!   claimed the transaction valid, the whole block is invalid.
//! - **Subjective**: symptoms of local conditions such as a slow machine
//!   (wall-clock deadline). Never alters recorded state.
//! - **Fatal**: local store or fork database corruption. The node must halt
//!   rather than risk producing an invalid block.

use crate::resource::ResourceKind;
use crate::types::{BlockNum, Name};

/// Failure class of a [`ChainError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FailureCategory {
    Objective = 0,
    Subjective = 1,
    Fatal = 2,
}

impl core::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Objective => write!(f, "objective"),
            Self::Subjective => write!(f, "subjective"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Primary error type used throughout the execution core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    // ── Objective ──
    /// An account, block, or transaction resource cap would be exceeded.
    #[error("{resource} exhausted for {scope}: used {used}, limit {limit}")]
    ResourceExhausted {
        resource: ResourceKind,
        scope: String,
        used: u64,
        limit: u64,
    },

    /// RAM usage would exceed the account's quota.
    #[error("ram exhausted for {account}: needs {needed} bytes, quota {quota}")]
    RamExhausted { account: Name, needed: u64, quota: u64 },

    /// Billed CPU exceeded the transaction's own CPU cap.
    #[error("billed cpu {billed_us}us exceeds transaction limit {limit_us}us")]
    BilledCpuExceeded { billed_us: u64, limit_us: u64 },

    /// Inline action depth or count bound exceeded.
    #[error("recursion exceeded: {0}")]
    RecursionExceeded(String),

    /// Missing or invalid authorization.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Contract code raised an assertion.
    #[error("contract assertion: {0}")]
    ContractAssertion(String),

    /// Structurally invalid transaction or action payload.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Transaction expired or expiration too far in the future.
    #[error("transaction expired: {0}")]
    Expired(String),

    /// Transaction id already applied and not yet expired.
    #[error("duplicate transaction: {0}")]
    DuplicateTransaction(String),

    /// A referenced account does not exist, or already exists on create.
    #[error("account error: {0}")]
    Account(String),

    /// Context-free actions may not touch state or schedule actions.
    #[error("context-free violation: {0}")]
    ContextFreeViolation(String),

    /// A block failed structural or replay validation.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// A block does not link to any known block.
    #[error("unlinkable block {block_num}: {reason}")]
    UnlinkableBlock { block_num: BlockNum, reason: String },

    /// Ed25519 verification failed.
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    /// A name literal failed to parse.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Merkle proof generation failed.
    #[error("merkle error: {0}")]
    Merkle(String),

    // ── Subjective ──
    /// Wall-clock deadline reached. Local safety valve only.
    #[error("deadline exceeded after {elapsed_us}us")]
    DeadlineExceeded { elapsed_us: u64 },

    /// Controller used in the wrong phase (e.g. push without a pending block).
    #[error("controller state: {0}")]
    ControllerState(String),

    /// Configuration rejected at load time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // ── Fatal ──
    /// Store session misuse or corrupted record.
    #[error("database error: {0}")]
    Database(String),

    /// Fork database structure is inconsistent.
    #[error("fork database error: {0}")]
    ForkDatabase(String),

    /// Ledger bookkeeping would go negative.
    #[error("ledger inconsistent: {0}")]
    LedgerInconsistent(String),
}

impl ChainError {
    /// Classify this error (see module docs).
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::DeadlineExceeded { .. }
            | Self::ControllerState(_)
            | Self::InvalidConfig(_) => FailureCategory::Subjective,
            Self::Database(_) | Self::ForkDatabase(_) | Self::LedgerInconsistent(_) => {
                FailureCategory::Fatal
            }
            _ => FailureCategory::Objective,
        }
    }

    /// Stable numeric code recorded in failure info.
    pub fn code(&self) -> u32 {
        match self {
            Self::ResourceExhausted { .. } => 1,
            Self::RamExhausted { .. } => 2,
            Self::BilledCpuExceeded { .. } => 3,
            Self::RecursionExceeded(_) => 4,
            Self::Unauthorized(_) => 5,
            Self::ContractAssertion(_) => 6,
            Self::Malformed(_) => 7,
            Self::Expired(_) => 8,
            Self::DuplicateTransaction(_) => 9,
            Self::Account(_) => 10,
            Self::ContextFreeViolation(_) => 11,
            Self::InvalidBlock(_) => 12,
            Self::UnlinkableBlock { .. } => 13,
            Self::SignatureInvalid(_) => 14,
            Self::InvalidName(_) => 15,
            Self::Serialization(_) => 16,
            Self::Merkle(_) => 17,
            Self::DeadlineExceeded { .. } => 100,
            Self::ControllerState(_) => 101,
            Self::InvalidConfig(_) => 102,
            Self::Database(_) => 200,
            Self::ForkDatabase(_) => 201,
            Self::LedgerInconsistent(_) => 202,
        }
    }

    /// Resource-class failures (ledger caps) as opposed to contract or
    /// validation failures. Both unwind to the transaction boundary, but
    /// traces keep them apart.
    pub fn is_resource_failure(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::RamExhausted { .. } | Self::BilledCpuExceeded { .. }
        )
    }

    /// Shorthand for [`FailureCategory::Fatal`].
    pub fn is_fatal(&self) -> bool {
        self.category() == FailureCategory::Fatal
    }
}

/// Convenience result type for the execution core.
pub type ChainResult<T> = core::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let exhausted = ChainError::ResourceExhausted {
            resource: ResourceKind::Cpu,
            scope: "account alice".into(),
            used: 120_000,
            limit: 100_000,
        };
        assert_eq!(exhausted.category(), FailureCategory::Objective);
        assert!(exhausted.is_resource_failure());

        let assertion = ChainError::ContractAssertion("overdrawn".into());
        assert_eq!(assertion.category(), FailureCategory::Objective);
        assert!(!assertion.is_resource_failure());

        assert_eq!(
            ChainError::DeadlineExceeded { elapsed_us: 10 }.category(),
            FailureCategory::Subjective
        );
        assert!(ChainError::Database("no session".into()).is_fatal());
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            ChainError::RecursionExceeded(String::new()),
            ChainError::Unauthorized(String::new()),
            ChainError::ContractAssertion(String::new()),
            ChainError::Malformed(String::new()),
            ChainError::DeadlineExceeded { elapsed_us: 0 },
            ChainError::Database(String::new()),
        ];
        let mut codes: Vec<u32> = errors.iter().map(ChainError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_display() {
        let err = ChainError::ResourceExhausted {
            resource: ResourceKind::Net,
            scope: "block".into(),
            used: 1500,
            limit: 1000,
        };
        let s = err.to_string();
        assert!(s.contains("net"));
        assert!(s.contains("1500"));
        assert!(s.contains("1000"));
    }
}
