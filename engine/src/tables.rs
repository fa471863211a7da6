//! Chain records kept in the key-value store.
//!
//! Every record is packed with the deterministic codec under a short
//! prefix followed by big-endian key fields, so prefix scans come back in
//! numeric order. A record that fails to decode means the store is corrupt,
//! which is fatal.
//!
//! Layout:
//! - `acct/<name>`          account record
//! - `code/<name>`          contract code bytes
//! - `rlim/<name>`          account resource limits
//! - `rusg/<name>`          account resource usage
//! - `rstate`               block-wide resource state
//! - `glob`                 global counters
//! - `dup/i/<id>`           dedup record by id
//! - `dup/e/<exp><id>`      dedup record by expiration
//! - `gtrx/k/<sender><sid>` deferred entry by key
//! - `gtrx/t/<until><seq>`  deferred entry by scheduled time
//! - `row/<code><scope><table><pk>` contract row

use meterchain_primitives::codec::{unpack_from, Pack, Unpack};
use meterchain_primitives::{
    impl_pack, ChainError, ChainResult, DeferredKey, Hash, KeyValueStore, Name, TimestampMs,
    TransactionId, UsageWindow,
};
use meterchain_primitives::types::{PublicKey, DEFERRED_OVERHEAD_BYTES, ROW_OVERHEAD_BYTES};

// ── Keys ──

const ACCOUNT_PREFIX: &[u8] = b"acct/";
const CODE_PREFIX: &[u8] = b"code/";
const LIMITS_PREFIX: &[u8] = b"rlim/";
const USAGE_PREFIX: &[u8] = b"rusg/";
pub(crate) const RESOURCE_STATE_KEY: &[u8] = b"rstate";
pub(crate) const GLOBAL_KEY: &[u8] = b"glob";
const DEDUP_ID_PREFIX: &[u8] = b"dup/i/";
pub(crate) const DEDUP_EXPIRY_PREFIX: &[u8] = b"dup/e/";
pub(crate) const DEFERRED_KEY_PREFIX: &[u8] = b"gtrx/k/";
pub(crate) const DEFERRED_TIME_PREFIX: &[u8] = b"gtrx/t/";
const ROW_PREFIX: &[u8] = b"row/";

fn prefixed(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn account_key(account: Name) -> Vec<u8> {
    prefixed(ACCOUNT_PREFIX, &[&account.as_u64().to_be_bytes()])
}

pub fn code_key(account: Name) -> Vec<u8> {
    prefixed(CODE_PREFIX, &[&account.as_u64().to_be_bytes()])
}

pub fn limits_key(account: Name) -> Vec<u8> {
    prefixed(LIMITS_PREFIX, &[&account.as_u64().to_be_bytes()])
}

pub fn usage_key(account: Name) -> Vec<u8> {
    prefixed(USAGE_PREFIX, &[&account.as_u64().to_be_bytes()])
}

pub fn dedup_id_key(id: &TransactionId) -> Vec<u8> {
    prefixed(DEDUP_ID_PREFIX, &[id])
}

pub fn dedup_expiry_key(expiration: TimestampMs, id: &TransactionId) -> Vec<u8> {
    prefixed(DEDUP_EXPIRY_PREFIX, &[&expiration.to_be_bytes(), id])
}

pub fn deferred_key(key: &DeferredKey) -> Vec<u8> {
    prefixed(
        DEFERRED_KEY_PREFIX,
        &[&key.sender.as_u64().to_be_bytes(), &key.sender_id.to_be_bytes()],
    )
}

pub fn deferred_time_key(delay_until: TimestampMs, sequence: u64) -> Vec<u8> {
    prefixed(
        DEFERRED_TIME_PREFIX,
        &[&delay_until.to_be_bytes(), &sequence.to_be_bytes()],
    )
}

/// Identifies one contract row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    pub code: Name,
    pub scope: Name,
    pub table: Name,
    pub primary_key: u64,
}

impl RowId {
    pub fn key(&self) -> Vec<u8> {
        prefixed(
            ROW_PREFIX,
            &[
                &self.code.as_u64().to_be_bytes(),
                &self.scope.as_u64().to_be_bytes(),
                &self.table.as_u64().to_be_bytes(),
                &self.primary_key.to_be_bytes(),
            ],
        )
    }

    /// Bytes identifying the row within its code's tables.
    pub const KEY_BYTES: u64 = 24;
}

// ── Records ──

/// Account metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub name: Name,
    pub privileged: bool,
    /// Key whose signature satisfies this account's authorization.
    pub auth_key: PublicKey,
    /// SHA-256 of the deployed code; zero when no code is set.
    pub code_hash: Hash,
    pub recv_sequence: u64,
    pub auth_sequence: u64,
}
impl_pack!(AccountRecord { name, privileged, auth_key, code_hash, recv_sequence, auth_sequence });

/// Limits set by the privileged `setlimits` action. `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccountLimitsRecord {
    pub ram_bytes: Option<u64>,
    pub net_weight: Option<u64>,
    pub cpu_weight: Option<u64>,
}
impl_pack!(AccountLimitsRecord { ram_bytes, net_weight, cpu_weight });

/// Windowed CPU and NET usage plus RAM held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountUsageRecord {
    pub net: UsageWindow,
    pub cpu: UsageWindow,
    pub ram_usage: u64,
}
impl_pack!(AccountUsageRecord { net, cpu, ram_usage });

/// Block-wide resource state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStateRecord {
    /// Per-block CPU totals, averaged for the elastic update.
    pub average_block_cpu: UsageWindow,
    pub average_block_net: UsageWindow,
    /// Usage accumulated in the pending block.
    pub pending_block_cpu: u64,
    pub pending_block_net: u64,
    pub virtual_cpu_limit: u64,
    pub virtual_net_limit: u64,
    /// Sums of finite account weights.
    pub total_cpu_weight: u64,
    pub total_net_weight: u64,
}
impl_pack!(ResourceStateRecord {
    average_block_cpu,
    average_block_net,
    pending_block_cpu,
    pending_block_net,
    virtual_cpu_limit,
    virtual_net_limit,
    total_cpu_weight,
    total_net_weight,
});

/// Chain-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRecord {
    pub global_action_sequence: u64,
    /// Enqueue counter breaking ties between deferred entries.
    pub deferred_sequence: u64,
}
impl_pack!(GlobalRecord { global_action_sequence, deferred_sequence });

/// A stored deferred transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTransaction {
    pub key: DeferredKey,
    pub trx_id: TransactionId,
    /// Account paying the entry's RAM and a failed execution's usage.
    pub payer: Name,
    pub published: TimestampMs,
    pub delay_until: TimestampMs,
    pub expiration: TimestampMs,
    pub sequence: u64,
    /// Packed [`meterchain_primitives::Transaction`].
    pub packed_trx: Vec<u8>,
}
impl_pack!(GeneratedTransaction {
    key,
    trx_id,
    payer,
    published,
    delay_until,
    expiration,
    sequence,
    packed_trx,
});

impl GeneratedTransaction {
    pub fn billable_size(&self) -> u64 {
        self.packed_trx.len() as u64 + DEFERRED_OVERHEAD_BYTES
    }
}

/// A contract table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    pub payer: Name,
    pub value: Vec<u8>,
}
impl_pack!(RowRecord { payer, value });

impl RowRecord {
    pub fn billable_size(&self) -> u64 {
        RowId::KEY_BYTES + self.value.len() as u64 + ROW_OVERHEAD_BYTES
    }
}

// ── Typed access ──

/// Load and decode a record; corrupt bytes are a fatal database error.
pub fn get_record<T: Unpack>(store: &dyn KeyValueStore, key: &[u8]) -> ChainResult<Option<T>> {
    match store.get(key)? {
        None => Ok(None),
        Some(bytes) => unpack_from(&bytes)
            .map(Some)
            .map_err(|e| ChainError::Database(format!("corrupt record: {e}"))),
    }
}

pub fn put_record<T: Pack>(store: &mut dyn KeyValueStore, key: Vec<u8>, record: &T) -> ChainResult<()> {
    store.put(key, record.packed())
}

pub fn get_account(store: &dyn KeyValueStore, account: Name) -> ChainResult<Option<AccountRecord>> {
    get_record(store, &account_key(account))
}

/// Load an account that must exist.
pub fn require_account(store: &dyn KeyValueStore, account: Name) -> ChainResult<AccountRecord> {
    get_account(store, account)?
        .ok_or_else(|| ChainError::Account(format!("account {account} does not exist")))
}

pub fn is_account(store: &dyn KeyValueStore, account: Name) -> ChainResult<bool> {
    store.contains(&account_key(account))
}

pub fn get_global(store: &dyn KeyValueStore) -> ChainResult<GlobalRecord> {
    Ok(get_record(store, GLOBAL_KEY)?.unwrap_or_default())
}

pub fn get_generated(
    store: &dyn KeyValueStore,
    key: &DeferredKey,
) -> ChainResult<Option<GeneratedTransaction>> {
    get_record(store, &deferred_key(key))
}
