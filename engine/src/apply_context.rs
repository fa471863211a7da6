//! Action dispatch.
//!
//! One [`ApplyContext`] applies one action: first at its original receiver,
//! then at every account notified with `require_recipient` (in request
//! order, each at most once), then each inline action queued by any of those
//! receivers, in enqueue order, each recursively in its own context. This
//! order is consensus-critical.
//!
//! The context implements [`HostApi`] for the code being run. A receiver's
//! writes always land in its own tables; reads may target any contract.

use std::collections::BTreeSet;

use meterchain_primitives::{
    Action, ActionReceipt, BlockNum, ChainError, ChainResult, DeferredKey, KeyValueStore, Name,
    TimestampMs, Transaction,
};

use crate::host::HostApi;
use crate::resource_limits::ResourceLimitsLedger;
use crate::tables::{
    self, get_global, get_record, is_account, put_record, require_account, RowId, RowRecord,
};
use crate::transaction_context::TransactionContext;

pub struct ApplyContext<'t, 'a> {
    trx: &'t mut TransactionContext<'a>,
    act: Action,
    context_free: bool,
    depth: u32,
    creator_ordinal: u32,
    /// Receiver currently running.
    receiver: Name,
    /// Trace ordinal of the current receiver's execution.
    action_ordinal: u32,
    /// Receivers in dispatch order with the ordinal that requested each.
    notified: Vec<(Name, u32)>,
    inline_actions: Vec<(Action, u32)>,
    console: String,
    cpu_used_us: u64,
}

impl<'t, 'a> ApplyContext<'t, 'a> {
    pub(crate) fn new(
        trx: &'t mut TransactionContext<'a>,
        act: Action,
        creator_ordinal: u32,
        depth: u32,
        context_free: bool,
    ) -> Self {
        let receiver = act.account;
        Self {
            trx,
            act,
            context_free,
            depth,
            creator_ordinal,
            receiver,
            action_ordinal: 0,
            notified: Vec::new(),
            inline_actions: Vec::new(),
            console: String::new(),
            cpu_used_us: 0,
        }
    }

    /// Apply the action at its receiver, its notifications, and its inline
    /// actions.
    pub fn exec(&mut self) -> ChainResult<()> {
        require_account(&*self.trx.store, self.act.account)?;
        self.notified.push((self.act.account, self.creator_ordinal));

        let mut index = 0;
        while index < self.notified.len() {
            let (receiver, creator) = self.notified[index];
            self.exec_one(receiver, creator)?;
            index += 1;
        }

        let inline_actions = std::mem::take(&mut self.inline_actions);
        for (act, creator) in inline_actions {
            self.trx.execute_action(act, creator, self.depth + 1, false)?;
        }
        Ok(())
    }

    fn exec_one(&mut self, receiver: Name, creator: u32) -> ChainResult<()> {
        self.trx.checktime()?;
        self.receiver = receiver;
        self.cpu_used_us = 0;
        self.action_ordinal =
            self.trx
                .begin_action_trace(receiver, creator, &self.act, self.context_free)?;

        let result = self.run_and_record(receiver);
        let console = std::mem::take(&mut self.console);
        match result {
            Ok(receipt) => {
                self.trx
                    .end_action_trace(self.action_ordinal, Some(receipt), console, self.cpu_used_us, None);
                Ok(())
            }
            Err(err) => {
                self.trx
                    .end_action_trace(self.action_ordinal, None, console, self.cpu_used_us, Some(&err));
                Err(err)
            }
        }
    }

    fn run_and_record(&mut self, receiver: Name) -> ChainResult<ActionReceipt> {
        self.run(receiver)?;
        self.trx.checktime()?;
        self.make_receipt(receiver)
    }

    /// Native handler if registered, otherwise the receiver's deployed code.
    /// A receiver without code accepts the action.
    fn run(&mut self, receiver: Name) -> ChainResult<()> {
        let services = self.trx.services;
        if let Some(handler) = services.registry.find(receiver, self.act.account, self.act.name) {
            if self.context_free {
                return Err(ChainError::ContextFreeViolation(format!(
                    "native action {}::{} cannot run context-free",
                    self.act.account, self.act.name
                )));
            }
            return handler(self);
        }
        let Some(code) = self.trx.store.get(&tables::code_key(receiver))? else {
            return Ok(());
        };
        services.executor.execute(&code, self)
    }

    fn make_receipt(&mut self, receiver: Name) -> ChainResult<ActionReceipt> {
        let store = &mut *self.trx.store;

        let mut global = get_global(store)?;
        global.global_action_sequence += 1;
        put_record(store, tables::GLOBAL_KEY.to_vec(), &global)?;

        let mut account = require_account(store, receiver)?;
        account.recv_sequence += 1;
        put_record(store, tables::account_key(receiver), &account)?;

        let actors: BTreeSet<Name> = self.act.authorization.iter().map(|p| p.actor).collect();
        let mut auth_sequence = Vec::with_capacity(actors.len());
        for actor in actors {
            let mut record = require_account(store, actor)?;
            record.auth_sequence += 1;
            put_record(store, tables::account_key(actor), &record)?;
            auth_sequence.push((actor, record.auth_sequence));
        }

        Ok(ActionReceipt {
            receiver,
            act_digest: self.act.digest(),
            global_sequence: global.global_action_sequence,
            recv_sequence: account.recv_sequence,
            auth_sequence,
        })
    }

    // ── Access for native handlers ──

    pub(crate) fn store(&self) -> &dyn KeyValueStore {
        &*self.trx.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut dyn KeyValueStore {
        &mut *self.trx.store
    }

    pub(crate) fn ledger(&self) -> &'a ResourceLimitsLedger {
        self.trx.services.ledger
    }

    /// Remove any sender's deferred entry, refunding its payer.
    pub(crate) fn remove_deferred(&mut self, key: &DeferredKey) -> ChainResult<bool> {
        self.trx.remove_deferred(key)
    }

    // ── Checks ──

    fn require_stateful(&self, operation: &str) -> ChainResult<()> {
        if self.context_free {
            return Err(ChainError::ContextFreeViolation(format!(
                "context-free action cannot {operation}"
            )));
        }
        Ok(())
    }

    /// `payer` must be the receiver or have authorized the action.
    fn check_payer(&self, payer: Name) -> ChainResult<()> {
        if payer != self.receiver && !self.has_auth(payer) {
            return Err(ChainError::Unauthorized(format!(
                "{payer} must authorize billing by {}",
                self.receiver
            )));
        }
        if !is_account(&*self.trx.store, payer)? {
            return Err(ChainError::Account(format!("payer {payer} does not exist")));
        }
        Ok(())
    }

    /// Actors of a scheduled action must be the receiver or already
    /// authorized in the transaction.
    fn check_scheduled_auth(&self, action: &Action) -> ChainResult<()> {
        require_account(&*self.trx.store, action.account)?;
        for level in &action.authorization {
            if level.actor != self.receiver && !self.trx.authorized.contains(&level.actor) {
                return Err(ChainError::Unauthorized(format!(
                    "{} cannot act on behalf of {}",
                    self.receiver, level.actor
                )));
            }
        }
        Ok(())
    }

    fn row_id(&self, scope: Name, table: Name, primary_key: u64) -> RowId {
        RowId {
            code: self.receiver,
            scope,
            table,
            primary_key,
        }
    }

    fn load_row(&self, row: &RowId) -> ChainResult<Option<RowRecord>> {
        get_record(&*self.trx.store, &row.key())
    }
}

// State and scheduling calls are safe points for the deadline.
impl HostApi for ApplyContext<'_, '_> {
    fn receiver(&self) -> Name {
        self.receiver
    }

    fn action(&self) -> &Action {
        &self.act
    }

    fn is_context_free(&self) -> bool {
        self.context_free
    }

    fn require_recipient(&mut self, account: Name) -> ChainResult<()> {
        self.require_stateful("notify")?;
        if !is_account(&*self.trx.store, account)? {
            return Err(ChainError::Account(format!("notified account {account} does not exist")));
        }
        if !self.notified.iter().any(|(n, _)| *n == account) {
            self.notified.push((account, self.action_ordinal));
        }
        Ok(())
    }

    fn require_auth(&self, account: Name) -> ChainResult<()> {
        if self.has_auth(account) {
            Ok(())
        } else {
            Err(ChainError::Unauthorized(format!("missing authority of {account}")))
        }
    }

    fn has_auth(&self, account: Name) -> bool {
        self.act.authorization.iter().any(|p| p.actor == account)
    }

    fn send_inline(&mut self, action: Action) -> ChainResult<()> {
        self.trx.checktime()?;
        self.require_stateful("send inline actions")?;
        let max_depth = self.trx.services.config.limits.max_inline_action_depth;
        if self.depth >= max_depth {
            return Err(ChainError::RecursionExceeded(format!(
                "inline action depth exceeds {max_depth}"
            )));
        }
        self.check_scheduled_auth(&action)?;
        self.inline_actions.push((action, self.action_ordinal));
        Ok(())
    }

    fn send_deferred(&mut self, sender_id: u128, payer: Name, trx: Transaction) -> ChainResult<()> {
        self.trx.checktime()?;
        self.require_stateful("schedule deferred transactions")?;
        self.check_payer(payer)?;
        let limits = &self.trx.services.config.limits;
        if trx.actions.is_empty() {
            return Err(ChainError::Malformed("deferred transaction has no actions".into()));
        }
        if trx.header.delay_sec > limits.max_transaction_delay_sec {
            return Err(ChainError::Malformed(format!(
                "deferred delay {}s exceeds maximum {}s",
                trx.header.delay_sec, limits.max_transaction_delay_sec
            )));
        }
        for action in &trx.actions {
            self.check_scheduled_auth(action)?;
        }
        let key = DeferredKey::new(self.receiver, sender_id);
        self.trx.schedule_deferred(key, payer, &trx)
    }

    fn cancel_deferred(&mut self, sender_id: u128) -> ChainResult<bool> {
        self.trx.checktime()?;
        self.require_stateful("cancel deferred transactions")?;
        let key = DeferredKey::new(self.receiver, sender_id);
        self.trx.remove_deferred(&key)
    }

    fn db_get(&self, code: Name, scope: Name, table: Name, primary_key: u64) -> ChainResult<Option<Vec<u8>>> {
        self.trx.checktime()?;
        self.require_stateful("read tables")?;
        let row = RowId {
            code,
            scope,
            table,
            primary_key,
        };
        Ok(self.load_row(&row)?.map(|r| r.value))
    }

    fn db_store(
        &mut self,
        scope: Name,
        table: Name,
        primary_key: u64,
        payer: Name,
        value: Vec<u8>,
    ) -> ChainResult<()> {
        self.trx.checktime()?;
        self.require_stateful("write tables")?;
        self.check_payer(payer)?;
        let row = self.row_id(scope, table, primary_key);
        if self.load_row(&row)?.is_some() {
            return Err(ChainError::ContractAssertion(format!(
                "row {primary_key} already exists in {}::{table}",
                self.receiver
            )));
        }
        let record = RowRecord { payer, value };
        let ledger = self.ledger();
        ledger.add_ram_usage(&mut *self.trx.store, payer, record.billable_size() as i64)?;
        put_record(&mut *self.trx.store, row.key(), &record)
    }

    fn db_update(
        &mut self,
        scope: Name,
        table: Name,
        primary_key: u64,
        payer: Name,
        value: Vec<u8>,
    ) -> ChainResult<()> {
        self.trx.checktime()?;
        self.require_stateful("write tables")?;
        self.check_payer(payer)?;
        let row = self.row_id(scope, table, primary_key);
        let old = self.load_row(&row)?.ok_or_else(|| {
            ChainError::ContractAssertion(format!(
                "row {primary_key} not found in {}::{table}",
                self.receiver
            ))
        })?;
        let record = RowRecord { payer, value };
        let ledger = self.ledger();
        let store = &mut *self.trx.store;
        let old_size = old.billable_size() as i64;
        let new_size = record.billable_size() as i64;
        if old.payer == payer {
            ledger.add_ram_usage(store, payer, new_size - old_size)?;
        } else {
            ledger.add_ram_usage(store, old.payer, -old_size)?;
            ledger.add_ram_usage(store, payer, new_size)?;
        }
        put_record(store, row.key(), &record)
    }

    fn db_erase(&mut self, scope: Name, table: Name, primary_key: u64) -> ChainResult<()> {
        self.trx.checktime()?;
        self.require_stateful("write tables")?;
        let row = self.row_id(scope, table, primary_key);
        let old = self.load_row(&row)?.ok_or_else(|| {
            ChainError::ContractAssertion(format!(
                "row {primary_key} not found in {}::{table}",
                self.receiver
            ))
        })?;
        let ledger = self.ledger();
        let store = &mut *self.trx.store;
        store.erase(&row.key())?;
        ledger.add_ram_usage(store, old.payer, -(old.billable_size() as i64))
    }

    fn charge_cpu(&mut self, us: u64) -> ChainResult<()> {
        self.trx.checktime()?;
        self.trx.add_cpu(us)?;
        self.cpu_used_us += us;
        Ok(())
    }

    fn checktime(&self) -> ChainResult<()> {
        self.trx.checktime()
    }

    fn print(&mut self, message: &str) {
        self.console.push_str(message);
    }

    fn block_num(&self) -> BlockNum {
        self.trx.block.block_num
    }

    fn block_time(&self) -> TimestampMs {
        self.trx.block.timestamp_ms
    }

    fn context_free_data(&self, index: usize) -> ChainResult<Option<Vec<u8>>> {
        if !self.context_free {
            return Err(ChainError::ContextFreeViolation(
                "context-free data is readable only by context-free actions".into(),
            ));
        }
        Ok(self.trx.context_free_data.get(index).cloned())
    }
}
