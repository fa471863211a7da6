//! Transaction context: one transaction's session, dispatch, and billing.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──exec──▶ Executing ──finalize+commit──▶ Committed
//!                        │
//!                        ├──contract failure──▶ SoftFailed (state undone, usage billed)
//!                        └──objective rejection──▶ HardFailed (nothing recorded)
//! ```
//!
//! The context opens a nested store session when it is created. Committing
//! squashes that session into the block; every other exit (including a
//! drop on an error path) undoes it, so a transaction never leaves partial
//! state behind.
//!
//! ## Billing
//!
//! - CPU: `max(charged, minimum) + per_signature * signatures + per_action *
//!   dispatched actions`. Malformed payloads are billed the flat minimum.
//! - NET: packed transaction and signatures, plus the base charge, plus the
//!   discounted context-free data size, rounded up to 8-byte words.
//! - When replaying a block, CPU is the receipt's billed value.
//!
//! Wall-clock expiry (the deadline monitor) is a subjective rejection and
//! never feeds billing.

use std::collections::BTreeSet;
use std::time::Instant;

use meterchain_primitives::codec::{unpack_from, Pack};
use meterchain_primitives::types::short_hex;
use meterchain_primitives::{
    Action, ActionReceipt, ActionTrace, ChainError, ChainResult, DeferredKey, FailureCategory,
    FailureInfo, Hash,
    KeyValueStore, Name, ResourceKind, SignedTransaction, TimestampMs, Transaction,
    TransactionId, TransactionReceiptHeader, TransactionStatus, TransactionTrace,
};

use crate::apply_context::ApplyContext;
use crate::checktime::DeadlineMonitor;
use crate::config::ControllerConfig;
use crate::deferred;
use crate::host::ContractExecutor;
use crate::registry::ApplyHandlerRegistry;
use crate::resource_limits::ResourceLimitsLedger;
use crate::tables::{self, get_generated, require_account, GeneratedTransaction};
use crate::validation;

/// The pending block a transaction is applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub block_num: u32,
    pub timestamp_ms: TimestampMs,
}

/// Controller-owned collaborators lent to each transaction.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub config: &'a ControllerConfig,
    pub chain_id: &'a Hash,
    pub ledger: &'a ResourceLimitsLedger,
    pub registry: &'a ApplyHandlerRegistry,
    pub executor: &'a dyn ContractExecutor,
    pub monitor: &'a DeadlineMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Executing,
    Committed,
    /// State undone, usage still billed.
    SoftFailed,
    /// Rejected; nothing recorded.
    HardFailed,
}

pub struct TransactionContext<'a> {
    pub(crate) store: &'a mut dyn KeyValueStore,
    pub(crate) services: Services<'a>,
    pub(crate) block: BlockContext,
    /// Actors whose authority the transaction carries.
    pub(crate) authorized: BTreeSet<Name>,
    pub(crate) context_free_data: Vec<Vec<u8>>,
    trace: TransactionTrace,
    state: TransactionState,
    session_open: bool,
    deadline_armed: bool,
    explicit_cpu_us: Option<u32>,
    charged_cpu_us: u64,
    cpu_limit_us: u64,
    net_limit_bytes: u64,
    /// Billed NET, a whole number of words.
    net_bytes: u64,
    signature_count: u64,
    dispatched_actions: u32,
    bill_to: BTreeSet<Name>,
    enforce_account_caps: bool,
    expiration: TimestampMs,
    /// The stored entry being executed, for deferred transactions.
    deferred: Option<GeneratedTransaction>,
    started: Instant,
}

impl<'a> TransactionContext<'a> {
    /// Open a session for transaction `id`. A `deadline` arms the monitor;
    /// `explicit_cpu_us` bills a replayed receipt's CPU instead of the
    /// measured value.
    pub fn new(
        store: &'a mut dyn KeyValueStore,
        services: Services<'a>,
        block: BlockContext,
        id: TransactionId,
        scheduled: bool,
        deadline: Option<Instant>,
        explicit_cpu_us: Option<u32>,
    ) -> Self {
        store.begin();
        if let Some(deadline) = deadline {
            services.monitor.start(deadline);
        }
        let limits = &services.config.limits;
        Self {
            trace: TransactionTrace {
                id,
                block_num: block.block_num,
                block_time: block.timestamp_ms,
                scheduled,
                ..Default::default()
            },
            cpu_limit_us: u64::from(limits.max_transaction_cpu_usage_us),
            net_limit_bytes: limits.max_transaction_net_usage,
            store,
            services,
            block,
            authorized: BTreeSet::new(),
            context_free_data: Vec::new(),
            state: TransactionState::Created,
            session_open: true,
            deadline_armed: deadline.is_some(),
            explicit_cpu_us,
            charged_cpu_us: 0,
            net_bytes: 0,
            signature_count: 0,
            dispatched_actions: 0,
            bill_to: BTreeSet::new(),
            enforce_account_caps: true,
            expiration: 0,
            deferred: None,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn trace(&self) -> &TransactionTrace {
        &self.trace
    }

    // ── Initialization ──

    /// Static checks, signatures, authorization, duplicate detection, and
    /// NET sizing for an input transaction.
    pub fn init_for_input(&mut self, trx: &SignedTransaction) -> ChainResult<()> {
        let limits = &self.services.config.limits;
        let header = &trx.transaction.header;
        validation::validate_transaction(&trx.transaction, self.block.timestamp_ms, limits)?;

        let id = self.trace.id;
        if self.store.contains(&tables::dedup_id_key(&id))? {
            return Err(ChainError::DuplicateTransaction(short_hex(&id)));
        }

        let keys = validation::verify_signatures(trx, self.services.chain_id)?;
        let mut actors = BTreeSet::new();
        for level in trx.transaction.actions.iter().flat_map(|a| a.authorization.iter()) {
            let account = require_account(&*self.store, level.actor)?;
            if !keys.contains(&account.auth_key) {
                return Err(ChainError::Unauthorized(format!(
                    "missing signature of {}",
                    level.actor
                )));
            }
            actors.insert(level.actor);
        }
        if actors.is_empty() {
            return Err(ChainError::Unauthorized("transaction declares no authorization".into()));
        }

        if header.max_cpu_usage_us > 0 {
            self.cpu_limit_us = self.cpu_limit_us.min(u64::from(header.max_cpu_usage_us));
        }
        if header.max_net_usage_words > 0 {
            self.net_limit_bytes = self.net_limit_bytes.min(u64::from(header.max_net_usage_words) * 8);
        }
        let net = trx.unprunable_size()
            + u64::from(limits.base_per_transaction_net_usage)
            + limits.context_free_discount_net_usage.apply(trx.prunable_size());
        self.net_bytes = net.div_ceil(8) * 8;
        if self.net_bytes > self.net_limit_bytes {
            return Err(ChainError::ResourceExhausted {
                resource: ResourceKind::Net,
                scope: "transaction".into(),
                used: self.net_bytes,
                limit: self.net_limit_bytes,
            });
        }

        self.signature_count = trx.signatures.len() as u64;
        self.authorized = actors.clone();
        self.bill_to = actors;
        self.context_free_data = trx.context_free_data.clone();
        self.expiration = header.expiration;
        self.record_dedup()
    }

    /// Take a due deferred entry out of storage and bill its authorizers
    /// (or its payer when it declares none).
    fn init_for_deferred(&mut self, entry: GeneratedTransaction, trx: &Transaction) -> ChainResult<()> {
        deferred::remove(&mut *self.store, self.services.ledger, &entry.key)?;
        let actors: BTreeSet<Name> = trx
            .actions
            .iter()
            .flat_map(|a| a.authorization.iter())
            .map(|p| p.actor)
            .collect();
        if trx.header.max_cpu_usage_us > 0 {
            self.cpu_limit_us = self.cpu_limit_us.min(u64::from(trx.header.max_cpu_usage_us));
        }
        self.authorized = actors.clone();
        self.bill_to = if actors.is_empty() {
            BTreeSet::from([entry.payer])
        } else {
            actors
        };
        self.expiration = entry.expiration;
        self.deferred = Some(entry);
        Ok(())
    }

    fn record_dedup(&mut self) -> ChainResult<()> {
        let id = self.trace.id;
        self.store
            .put(tables::dedup_id_key(&id), self.expiration.to_le_bytes().to_vec())?;
        self.store
            .put(tables::dedup_expiry_key(self.expiration, &id), Vec::new())
    }

    // ── Execution ──

    /// Dispatch context-free actions, then regular actions.
    pub fn exec(&mut self, trx: &Transaction) -> ChainResult<()> {
        self.state = TransactionState::Executing;
        for act in &trx.context_free_actions {
            self.execute_action(act.clone(), 0, 0, true)?;
        }
        for act in &trx.actions {
            self.execute_action(act.clone(), 0, 0, false)?;
        }
        Ok(())
    }

    pub(crate) fn execute_action(
        &mut self,
        act: Action,
        creator_ordinal: u32,
        depth: u32,
        context_free: bool,
    ) -> ChainResult<()> {
        let max_depth = self.services.config.limits.max_inline_action_depth;
        if depth > max_depth {
            return Err(ChainError::RecursionExceeded(format!(
                "inline action depth exceeds {max_depth}"
            )));
        }
        ApplyContext::new(self, act, creator_ordinal, depth, context_free).exec()
    }

    /// Record a dispatch and return its 1-based trace ordinal.
    pub(crate) fn begin_action_trace(
        &mut self,
        receiver: Name,
        creator_action_ordinal: u32,
        act: &Action,
        context_free: bool,
    ) -> ChainResult<u32> {
        let max = self.services.config.limits.max_actions_per_transaction;
        self.dispatched_actions += 1;
        if self.dispatched_actions > max {
            return Err(ChainError::RecursionExceeded(format!(
                "more than {max} actions dispatched"
            )));
        }
        let action_ordinal = self.trace.action_traces.len() as u32 + 1;
        self.trace.action_traces.push(ActionTrace {
            action_ordinal,
            creator_action_ordinal,
            receiver,
            act: act.clone(),
            context_free,
            receipt: None,
            cpu_usage_us: 0,
            console: String::new(),
            except: None,
        });
        Ok(action_ordinal)
    }

    pub(crate) fn end_action_trace(
        &mut self,
        action_ordinal: u32,
        receipt: Option<ActionReceipt>,
        console: String,
        cpu_usage_us: u64,
        except: Option<&ChainError>,
    ) {
        let index = action_ordinal.saturating_sub(1) as usize;
        if let Some(trace) = self.trace.action_traces.get_mut(index) {
            trace.receipt = receipt;
            trace.console = console;
            trace.cpu_usage_us = cpu_usage_us;
            trace.except = except.map(FailureInfo::from);
        }
    }

    pub(crate) fn checktime(&self) -> ChainResult<()> {
        if self.deadline_armed {
            self.services.monitor.checktime()
        } else {
            Ok(())
        }
    }

    /// Add CPU charged by contract code. Outside replay, exceeding the
    /// transaction's own limit aborts immediately.
    pub(crate) fn add_cpu(&mut self, us: u64) -> ChainResult<()> {
        self.charged_cpu_us = self.charged_cpu_us.saturating_add(us);
        if self.explicit_cpu_us.is_none() && self.charged_cpu_us > self.cpu_limit_us {
            return Err(ChainError::BilledCpuExceeded {
                billed_us: self.charged_cpu_us,
                limit_us: self.cpu_limit_us,
            });
        }
        Ok(())
    }

    /// Store a deferred transaction sent by `key.sender`.
    pub(crate) fn schedule_deferred(&mut self, key: DeferredKey, payer: Name, trx: &Transaction) -> ChainResult<()> {
        let published = self.block.timestamp_ms;
        let delay_until = published + u64::from(trx.header.delay_sec) * 1000;
        let expiration = delay_until + self.services.config.limits.deferred_trx_expiration_window_ms;
        let sequence = deferred::next_sequence(&mut *self.store)?;
        let entry = GeneratedTransaction {
            key,
            trx_id: trx.id(),
            payer,
            published,
            delay_until,
            expiration,
            sequence,
            packed_trx: trx.packed(),
        };
        deferred::schedule(&mut *self.store, self.services.ledger, entry)?;
        Ok(())
    }

    pub(crate) fn remove_deferred(&mut self, key: &DeferredKey) -> ChainResult<bool> {
        Ok(deferred::remove(&mut *self.store, self.services.ledger, key)?.is_some())
    }

    /// Convert a delayed input transaction into a deferred entry keyed by
    /// its first authorizer and the low 128 bits of its id.
    fn schedule_delayed(&mut self, trx: &Transaction) -> ChainResult<()> {
        let payer = trx
            .first_authorizer()
            .ok_or_else(|| ChainError::Unauthorized("delayed transaction has no authorizer".into()))?;
        let id = self.trace.id;
        let mut low = [0u8; 16];
        low.copy_from_slice(&id[16..]);
        let key = DeferredKey::new(payer, u128::from_be_bytes(low));
        self.schedule_deferred(key, payer, trx)
    }

    // ── Billing and completion ──

    fn billed_cpu(&self, flat_minimum: bool) -> u64 {
        if let Some(explicit) = self.explicit_cpu_us {
            return u64::from(explicit);
        }
        let limits = &self.services.config.limits;
        let minimum = u64::from(limits.min_transaction_cpu_usage_us);
        if flat_minimum {
            return minimum;
        }
        self.charged_cpu_us.max(minimum)
            + self.signature_count * u64::from(limits.per_signature_cpu_us)
            + u64::from(self.dispatched_actions) * u64::from(limits.per_action_cpu_us)
    }

    fn bill(&mut self, status: TransactionStatus, cpu_us: u64) -> ChainResult<TransactionReceiptHeader> {
        if cpu_us > self.cpu_limit_us {
            return Err(ChainError::BilledCpuExceeded {
                billed_us: cpu_us,
                limit_us: self.cpu_limit_us,
            });
        }
        self.services.ledger.add_transaction_usage(
            &mut *self.store,
            &self.bill_to,
            cpu_us,
            self.net_bytes,
            self.block.block_num,
            self.enforce_account_caps,
        )?;
        let header = TransactionReceiptHeader {
            status,
            cpu_usage_us: cpu_us as u32,
            net_usage_words: (self.net_bytes / 8) as u32,
        };
        self.trace.receipt = Some(header);
        self.trace.net_usage = self.net_bytes;
        Ok(header)
    }

    /// Bill the transaction's usage under `status`.
    pub fn finalize(&mut self, status: TransactionStatus) -> ChainResult<TransactionReceiptHeader> {
        let cpu = self.billed_cpu(false);
        self.bill(status, cpu)
    }

    /// Squash the session into the block and hand back the trace.
    pub fn commit(mut self) -> ChainResult<TransactionTrace> {
        self.store.squash()?;
        self.session_open = false;
        if self.state != TransactionState::SoftFailed {
            self.state = TransactionState::Committed;
        }
        self.trace.elapsed_us = self.started.elapsed().as_micros() as u64;
        Ok(std::mem::take(&mut self.trace))
    }

    /// Revert every change made in the session.
    pub fn undo(&mut self) -> ChainResult<()> {
        if self.session_open {
            self.session_open = false;
            self.store.undo()?;
        }
        Ok(())
    }

    /// Undo the failed execution and bill it in a fresh session.
    fn soft_fail(mut self, err: ChainError) -> ChainResult<TransactionTrace> {
        tracing::debug!(
            id = %short_hex(&self.trace.id),
            code = err.code(),
            error = %err,
            "transaction soft failed"
        );
        let flat_minimum = matches!(err, ChainError::Malformed(_) | ChainError::Serialization(_));
        self.trace.except = Some(FailureInfo::from(&err));
        self.undo()?;
        self.store.begin();
        self.session_open = true;
        self.state = TransactionState::SoftFailed;

        if let Some(entry) = self.deferred.clone() {
            deferred::remove(&mut *self.store, self.services.ledger, &entry.key)?;
            self.bill_to = BTreeSet::from([entry.payer]);
            self.enforce_account_caps = false;
        } else {
            self.record_dedup()?;
        }
        let cpu = self.billed_cpu(flat_minimum).min(self.cpu_limit_us);
        self.bill(TransactionStatus::SoftFail, cpu)?;
        self.commit()
    }

    /// Undo everything and return `err` as the rejection.
    fn reject(&mut self, err: ChainError) -> ChainError {
        self.state = TransactionState::HardFailed;
        self.trace.except = Some(FailureInfo::from(&err));
        if err.is_fatal() {
            tracing::error!(id = %short_hex(&self.trace.id), error = %err, "fatal error applying transaction");
        } else {
            tracing::debug!(id = %short_hex(&self.trace.id), error = %err, "transaction rejected");
        }
        match self.undo() {
            Ok(()) => err,
            Err(undo_err) => undo_err,
        }
    }

    /// Remove an expired deferred entry without executing it.
    fn expire(mut self, key: &DeferredKey) -> ChainResult<TransactionTrace> {
        deferred::remove(&mut *self.store, self.services.ledger, key)?;
        tracing::debug!(%key, "deferred transaction expired");
        self.trace.receipt = Some(TransactionReceiptHeader {
            status: TransactionStatus::Expired,
            cpu_usage_us: 0,
            net_usage_words: 0,
        });
        self.commit()
    }
}

impl Drop for TransactionContext<'_> {
    fn drop(&mut self) {
        if self.deadline_armed {
            self.services.monitor.stop();
        }
        if self.session_open {
            if let Err(err) = self.store.undo() {
                tracing::error!(error = %err, "failed to undo transaction session");
            }
        }
    }
}

/// Whether `err` raised during execution soft-fails the transaction rather
/// than rejecting it. Deferred transactions soft-fail on every objective
/// error so the failure stays isolated from the scheduling transaction.
fn is_soft_failure(err: &ChainError, scheduled: bool) -> bool {
    if err.category() != FailureCategory::Objective {
        return false;
    }
    scheduled
        || matches!(
            err,
            ChainError::ContractAssertion(_)
                | ChainError::RecursionExceeded(_)
                | ChainError::ContextFreeViolation(_)
                | ChainError::Account(_)
                | ChainError::Malformed(_)
                | ChainError::Serialization(_)
        )
}

// ── Entry points ──

/// Apply an input transaction in the pending block.
///
/// Returns the trace of an executed, soft-failed, or delayed transaction.
/// Any other failure rejects it: the error is returned and nothing is
/// recorded.
pub fn apply_input(
    store: &mut dyn KeyValueStore,
    services: Services<'_>,
    block: BlockContext,
    trx: &SignedTransaction,
    deadline: Option<Instant>,
    explicit_cpu_us: Option<u32>,
) -> ChainResult<TransactionTrace> {
    let mut ctx = TransactionContext::new(store, services, block, trx.id(), false, deadline, explicit_cpu_us);
    if let Err(err) = ctx.init_for_input(trx) {
        return Err(ctx.reject(err));
    }

    if trx.transaction.header.delay_sec > 0 {
        let result = ctx
            .schedule_delayed(&trx.transaction)
            .and_then(|()| ctx.finalize(TransactionStatus::Delayed));
        return match result {
            Ok(_) => ctx.commit(),
            Err(err) => Err(ctx.reject(err)),
        };
    }

    match ctx.exec(&trx.transaction) {
        Ok(()) => match ctx.finalize(TransactionStatus::Executed) {
            Ok(_) => ctx.commit(),
            Err(err) => Err(ctx.reject(err)),
        },
        Err(err) if is_soft_failure(&err, false) => ctx.soft_fail(err),
        Err(err) => Err(ctx.reject(err)),
    }
}

/// Apply the deferred transaction stored under `key`.
///
/// An entry past its expiration is removed with status `Expired`. A failed
/// execution is undone, the entry removed, and the payer billed with status
/// `SoftFail`. A subjective failure leaves the entry in place.
pub fn apply_deferred(
    store: &mut dyn KeyValueStore,
    services: Services<'_>,
    block: BlockContext,
    key: &DeferredKey,
    deadline: Option<Instant>,
    explicit_cpu_us: Option<u32>,
) -> ChainResult<TransactionTrace> {
    let entry = get_generated(&*store, key)?
        .ok_or_else(|| ChainError::Malformed(format!("no deferred transaction {key}")))?;
    let mut ctx = TransactionContext::new(store, services, block, entry.trx_id, true, deadline, explicit_cpu_us);

    if entry.delay_until > block.timestamp_ms {
        return Err(ctx.reject(ChainError::Malformed(format!(
            "deferred transaction {key} not due until {}",
            entry.delay_until
        ))));
    }
    if entry.expiration <= block.timestamp_ms {
        return ctx.expire(key);
    }

    let trx: Transaction = match unpack_from(&entry.packed_trx) {
        Ok(trx) => trx,
        Err(err) => {
            return Err(ctx.reject(ChainError::Database(format!(
                "corrupt deferred transaction {key}: {err}"
            ))))
        }
    };
    if let Err(err) = ctx.init_for_deferred(entry, &trx) {
        return Err(ctx.reject(err));
    }

    match ctx.exec(&trx) {
        Ok(()) => match ctx.finalize(TransactionStatus::Executed) {
            Ok(_) => ctx.commit(),
            Err(err) if is_soft_failure(&err, true) => ctx.soft_fail(err),
            Err(err) => Err(ctx.reject(err)),
        },
        Err(err) if is_soft_failure(&err, true) => ctx.soft_fail(err),
        Err(err) => Err(ctx.reject(err)),
    }
}
