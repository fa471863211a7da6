//! Host interface between contract code and the execution core.
//!
//! The sandboxed executor that runs contract bytecode lives outside this
//! crate. It sees the chain only through [`HostApi`], which the dispatch
//! layer implements for the action being applied. Every method that
//! touches state or schedules work is checked here (context-free rules,
//! payer authorization, RAM billing), so an executor cannot bypass them.
//!
//! - In production: a bytecode runtime implements [`ContractExecutor`]
//! - In tests: [`NativeContractExecutor`] maps code bytes to Rust closures

use std::collections::BTreeMap;
use std::fmt;

use meterchain_primitives::types::short_hex;
use meterchain_primitives::{
    crypto, Action, BlockNum, ChainError, ChainResult, Name, TimestampMs, Transaction,
};

/// Calls available to contract code while one action is applied.
pub trait HostApi {
    /// Account whose code is running (the original receiver or a notified one).
    fn receiver(&self) -> Name;

    fn action(&self) -> &Action;

    fn is_context_free(&self) -> bool;

    /// Schedule a notification of the current action to `account`, run
    /// after the current receiver returns. Repeated requests are ignored.
    fn require_recipient(&mut self, account: Name) -> ChainResult<()>;

    /// Fail with `Unauthorized` unless `account` authorized the action.
    fn require_auth(&self, account: Name) -> ChainResult<()>;

    fn has_auth(&self, account: Name) -> bool;

    /// Queue an inline action, run after the current action and its
    /// notifications. Its actors must be the receiver or accounts that
    /// already authorized the transaction.
    fn send_inline(&mut self, action: Action) -> ChainResult<()>;

    /// Schedule `trx` under `(receiver, sender_id)`, replacing any entry
    /// with the same key. `payer` is billed the entry's RAM.
    fn send_deferred(&mut self, sender_id: u128, payer: Name, trx: Transaction) -> ChainResult<()>;

    /// Remove the receiver's entry `sender_id`. Returns whether it existed.
    fn cancel_deferred(&mut self, sender_id: u128) -> ChainResult<bool>;

    /// Read a row from any contract's table.
    fn db_get(&self, code: Name, scope: Name, table: Name, primary_key: u64) -> ChainResult<Option<Vec<u8>>>;

    /// Create a row in the receiver's table. Fails if it already exists.
    fn db_store(
        &mut self,
        scope: Name,
        table: Name,
        primary_key: u64,
        payer: Name,
        value: Vec<u8>,
    ) -> ChainResult<()>;

    /// Overwrite an existing row, moving its RAM to `payer`.
    fn db_update(
        &mut self,
        scope: Name,
        table: Name,
        primary_key: u64,
        payer: Name,
        value: Vec<u8>,
    ) -> ChainResult<()>;

    /// Delete an existing row, refunding its payer.
    fn db_erase(&mut self, scope: Name, table: Name, primary_key: u64) -> ChainResult<()>;

    /// Report CPU consumed by the running code, in microseconds.
    fn charge_cpu(&mut self, us: u64) -> ChainResult<()>;

    /// Poll the deadline monitor.
    fn checktime(&self) -> ChainResult<()>;

    /// Append to the action's console output.
    fn print(&mut self, message: &str);

    fn block_num(&self) -> BlockNum;

    fn block_time(&self) -> TimestampMs;

    /// Context-free data segment `index`. Only context-free actions may read it.
    fn context_free_data(&self, index: usize) -> ChainResult<Option<Vec<u8>>>;

    /// Contract assertion: fail the action with `message` unless `condition`.
    fn check(&self, condition: bool, message: &str) -> ChainResult<()> {
        if condition {
            Ok(())
        } else {
            Err(ChainError::ContractAssertion(message.into()))
        }
    }
}

/// Runs contract code against a [`HostApi`].
pub trait ContractExecutor {
    /// Execute `code` for the action exposed by `host`.
    ///
    /// An `Err` aborts the action; the transaction context decides whether
    /// that soft-fails or rejects the transaction.
    fn execute(&self, code: &[u8], host: &mut dyn HostApi) -> ChainResult<()>;
}

// ── NativeContractExecutor ──

/// A contract written as a Rust closure.
pub type NativeContract = Box<dyn Fn(&mut dyn HostApi) -> ChainResult<()> + Send + Sync>;

/// Executor that resolves code bytes to registered closures.
///
/// The code deployed with `setcode` is used as the lookup key, so a test
/// deploys `b"token"` and registers the closure under the same bytes.
#[derive(Default)]
pub struct NativeContractExecutor {
    contracts: BTreeMap<Vec<u8>, NativeContract>,
}

impl NativeContractExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, code: impl Into<Vec<u8>>, contract: F)
    where
        F: Fn(&mut dyn HostApi) -> ChainResult<()> + Send + Sync + 'static,
    {
        self.contracts.insert(code.into(), Box::new(contract));
    }

    pub fn with_contract<F>(mut self, code: impl Into<Vec<u8>>, contract: F) -> Self
    where
        F: Fn(&mut dyn HostApi) -> ChainResult<()> + Send + Sync + 'static,
    {
        self.register(code, contract);
        self
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

impl fmt::Debug for NativeContractExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeContractExecutor")
            .field("contracts", &self.contracts.len())
            .finish()
    }
}

impl ContractExecutor for NativeContractExecutor {
    fn execute(&self, code: &[u8], host: &mut dyn HostApi) -> ChainResult<()> {
        match self.contracts.get(code) {
            Some(contract) => contract(host),
            None => Err(ChainError::Malformed(format!(
                "no executable contract for code {}",
                short_hex(&crypto::hash_sha256(code))
            ))),
        }
    }
}
