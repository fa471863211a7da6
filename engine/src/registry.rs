//! Apply-handler registry and the native system actions.
//!
//! Handlers are keyed by `(receiver, contract, action)` and looked up before
//! any deployed code runs. The registry is an ordinary value owned by the
//! controller and lent to each transaction, so independent chains in one
//! process never share handler tables.

use std::collections::BTreeMap;
use std::fmt;

use meterchain_primitives::codec::unpack_from;
use meterchain_primitives::types::{PublicKey, NEW_ACCOUNT_RAM_BYTES};
use meterchain_primitives::{
    crypto, impl_pack, name, ChainError, ChainResult, DeferredKey, Name, ZERO_HASH,
};

use crate::apply_context::ApplyContext;
use crate::host::HostApi;
use crate::tables::{self, get_account, put_record, require_account, AccountLimitsRecord, AccountRecord};

/// A native action handler.
pub type ApplyHandler = fn(&mut ApplyContext<'_, '_>) -> ChainResult<()>;

/// Handlers indexed by `(receiver, contract, action)`.
#[derive(Clone, Default)]
pub struct ApplyHandlerRegistry {
    handlers: BTreeMap<(Name, Name, Name), ApplyHandler>,
}

impl fmt::Debug for ApplyHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

impl ApplyHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `newaccount`, `setcode`, `setlimits`, and `canceldelay`
    /// installed on `system`.
    pub fn with_system_handlers(system: Name) -> Self {
        let mut registry = Self::new();
        registry.register(system, system, name("newaccount"), apply_newaccount);
        registry.register(system, system, name("setcode"), apply_setcode);
        registry.register(system, system, name("setlimits"), apply_setlimits);
        registry.register(system, system, name("canceldelay"), apply_canceldelay);
        registry
    }

    pub fn register(&mut self, receiver: Name, contract: Name, action: Name, handler: ApplyHandler) {
        self.handlers.insert((receiver, contract, action), handler);
    }

    pub fn find(&self, receiver: Name, contract: Name, action: Name) -> Option<ApplyHandler> {
        self.handlers.get(&(receiver, contract, action)).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Payloads ──

/// `newaccount` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub creator: Name,
    pub name: Name,
    pub auth_key: PublicKey,
}
impl_pack!(NewAccount { creator, name, auth_key });

/// `setcode` payload. Empty code removes the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCode {
    pub account: Name,
    pub code: Vec<u8>,
}
impl_pack!(SetCode { account, code });

/// `setlimits` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetLimits {
    pub account: Name,
    pub ram_bytes: Option<u64>,
    pub net_weight: Option<u64>,
    pub cpu_weight: Option<u64>,
}
impl_pack!(SetLimits { account, ram_bytes, net_weight, cpu_weight });

/// `canceldelay` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelDelay {
    pub sender: Name,
    pub sender_id: u128,
}
impl_pack!(CancelDelay { sender, sender_id });

// ── Handlers ──

fn apply_newaccount(ctx: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let create: NewAccount = unpack_from(&ctx.action().data)?;
    ctx.require_auth(create.creator)?;
    if create.name.is_empty() {
        return Err(ChainError::Account("account name cannot be empty".into()));
    }
    require_account(ctx.store(), create.creator)?;
    if get_account(ctx.store(), create.name)?.is_some() {
        return Err(ChainError::Account(format!("account {} already exists", create.name)));
    }

    let record = AccountRecord {
        name: create.name,
        privileged: false,
        auth_key: create.auth_key,
        code_hash: ZERO_HASH,
        recv_sequence: 0,
        auth_sequence: 0,
    };
    let ledger = ctx.ledger();
    let store = ctx.store_mut();
    put_record(store, tables::account_key(create.name), &record)?;
    ledger.initialize_account(store, create.name)?;
    ledger.add_ram_usage(store, create.creator, NEW_ACCOUNT_RAM_BYTES as i64)?;
    tracing::debug!(creator = %create.creator, account = %create.name, "created account");
    Ok(())
}

fn apply_setcode(ctx: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let set: SetCode = unpack_from(&ctx.action().data)?;
    ctx.require_auth(set.account)?;
    let mut account = require_account(ctx.store(), set.account)?;

    let key = tables::code_key(set.account);
    let old_len = ctx.store().get(&key)?.map_or(0, |c| c.len() as i64);
    let new_len = set.code.len() as i64;

    let ledger = ctx.ledger();
    let store = ctx.store_mut();
    if set.code.is_empty() {
        store.erase(&key)?;
        account.code_hash = ZERO_HASH;
    } else {
        account.code_hash = crypto::hash_sha256(&set.code);
        store.put(key, set.code)?;
    }
    ledger.add_ram_usage(store, set.account, new_len - old_len)?;
    put_record(store, tables::account_key(set.account), &account)
}

fn apply_setlimits(ctx: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let set: SetLimits = unpack_from(&ctx.action().data)?;
    let receiver = ctx.receiver();
    ctx.require_auth(receiver)?;
    if !require_account(ctx.store(), receiver)?.privileged {
        return Err(ChainError::Unauthorized(format!("{receiver} is not privileged")));
    }
    require_account(ctx.store(), set.account)?;
    let limits = AccountLimitsRecord {
        ram_bytes: set.ram_bytes,
        net_weight: set.net_weight,
        cpu_weight: set.cpu_weight,
    };
    let ledger = ctx.ledger();
    ledger.set_account_limits(ctx.store_mut(), set.account, limits)
}

fn apply_canceldelay(ctx: &mut ApplyContext<'_, '_>) -> ChainResult<()> {
    let cancel: CancelDelay = unpack_from(&ctx.action().data)?;
    ctx.require_auth(cancel.sender)?;
    let key = DeferredKey::new(cancel.sender, cancel.sender_id);
    if !ctx.remove_deferred(&key)? {
        return Err(ChainError::ContractAssertion(format!("no deferred transaction {key}")));
    }
    Ok(())
}
