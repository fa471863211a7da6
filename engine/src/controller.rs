//! Controller: block production, block validation, and fork management.
//!
//! The controller owns the store, the resource ledger, the handler registry,
//! the contract executor, the deadline monitor, and the fork database.
//!
//! ## Sessions
//!
//! Each applied block is one store session, opened by `start_block` (or by
//! block replay) and left open after commit so a fork switch can undo it.
//! Sessions only become permanent when their block becomes irreversible.
//! Transactions run in sessions nested inside the block's.
//!
//! ## Producing a block
//!
//! ```text
//! start_block ─▶ push_transaction* / push_scheduled_transaction*
//!             ─▶ finalize_block(key) ─▶ commit_block
//! ```
//!
//! `abort_block` may be called at any point before `commit_block` and
//! discards everything the pending block did.

use std::sync::Arc;
use std::time::Instant;

use ed25519_dalek::SigningKey;
use meterchain_primitives::merkle::merkle_root;
use meterchain_primitives::types::{hash_to_hex, short_hex, PublicKey};
use meterchain_primitives::{
    BlockHeader, BlockId, BlockNum, ChainError, ChainResult, DeferredKey, Hash, KeyValueStore,
    MerkleAccumulator, Name, ProducerSchedule, ReceiptTransaction, SignedBlock, SignedTransaction,
    TimestampMs, TransactionReceipt, TransactionStatus, TransactionTrace, UndoStore, ZERO_HASH,
};

use crate::checktime::DeadlineMonitor;
use crate::config::ControllerConfig;
use crate::deferred;
use crate::fork_database::{BlockState, ForkChoice, ForkDatabase};
use crate::host::ContractExecutor;
use crate::registry::{ApplyHandler, ApplyHandlerRegistry};
use crate::resource_limits::{AccountLimits, ResourceLimitsLedger};
use crate::tables::{
    self, get_account, get_record, put_record, AccountRecord, AccountUsageRecord, RowId, RowRecord,
};
use crate::transaction_context::{self, BlockContext, Services};
use crate::validation;

/// Initial chain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Genesis {
    /// Timestamp of block #1.
    pub initial_timestamp_ms: TimestampMs,
    /// Authorization key of the system account.
    pub initial_key: PublicKey,
    pub initial_schedule: ProducerSchedule,
}

/// The block under construction.
#[derive(Debug)]
struct PendingBlock {
    header: BlockHeader,
    receipts: Vec<TransactionReceipt>,
    actions: MerkleAccumulator,
    /// Input transactions in push order, returned by `abort_block`.
    input_trxs: Vec<SignedTransaction>,
    finalized: Option<SignedBlock>,
}

impl PendingBlock {
    fn new(header: BlockHeader) -> Self {
        Self {
            header,
            receipts: Vec::new(),
            actions: MerkleAccumulator::new(),
            input_trxs: Vec::new(),
            finalized: None,
        }
    }

    fn context(&self) -> BlockContext {
        BlockContext {
            block_num: self.header.block_num(),
            timestamp_ms: self.header.timestamp_ms,
        }
    }

    fn transaction_mroot(&self) -> Hash {
        let digests: Vec<Hash> = self.receipts.iter().map(TransactionReceipt::digest).collect();
        merkle_root(&digests)
    }
}

pub struct Controller<S: KeyValueStore = UndoStore> {
    config: ControllerConfig,
    chain_id: Hash,
    store: S,
    ledger: ResourceLimitsLedger,
    registry: ApplyHandlerRegistry,
    executor: Box<dyn ContractExecutor>,
    monitor: DeadlineMonitor,
    fork_db: ForkDatabase,
    /// Last block applied to the store.
    head: BlockState,
    schedule: ProducerSchedule,
    pending: Option<PendingBlock>,
    /// Store revision right after genesis; block `n` applies in revision
    /// `base_revision + n - 1`.
    base_revision: u64,
}

impl<S: KeyValueStore> Controller<S> {
    /// Initialize a chain in an empty `store`.
    ///
    /// Writes the system account and the ledger's initial state, then builds
    /// the unsigned genesis block #1, which becomes the irreversible root.
    pub fn new(
        config: ControllerConfig,
        genesis: Genesis,
        mut store: S,
        executor: Box<dyn ContractExecutor>,
    ) -> ChainResult<Self> {
        config.validate()?;
        if genesis.initial_schedule.producers.is_empty() {
            return Err(ChainError::InvalidConfig("initial producer schedule is empty".into()));
        }
        let system = config.system_account;
        if get_account(&store, system)?.is_some() {
            return Err(ChainError::ControllerState("store is already initialized".into()));
        }

        let ledger = ResourceLimitsLedger::new(config.resources.clone());
        ledger.initialize(&mut store)?;
        let account = AccountRecord {
            name: system,
            privileged: true,
            auth_key: genesis.initial_key,
            code_hash: ZERO_HASH,
            recv_sequence: 0,
            auth_sequence: 0,
        };
        put_record(&mut store, tables::account_key(system), &account)?;
        ledger.initialize_account(&mut store, system)?;

        let block = SignedBlock {
            header: BlockHeader {
                previous: ZERO_HASH,
                timestamp_ms: genesis.initial_timestamp_ms,
                producer: system,
                schedule_version: genesis.initial_schedule.version,
                ..Default::default()
            },
            ..Default::default()
        };
        let root = BlockState::new(block, true);
        tracing::info!(
            chain = %config.chain_name,
            chain_id = %hash_to_hex(&config.chain_id()),
            genesis = %short_hex(&root.id),
            "initialized chain"
        );

        Ok(Self {
            chain_id: config.chain_id(),
            registry: ApplyHandlerRegistry::with_system_handlers(system),
            monitor: DeadlineMonitor::new()?,
            fork_db: ForkDatabase::new(root.clone()),
            head: root,
            schedule: genesis.initial_schedule,
            pending: None,
            base_revision: store.revision(),
            config,
            store,
            ledger,
            executor,
        })
    }

    /// Replace the fork-choice rule.
    pub fn set_fork_choice(&mut self, choice: Box<dyn ForkChoice>) {
        self.fork_db.set_fork_choice(choice);
    }

    /// Install a native handler for `(receiver, contract, action)`.
    pub fn register_handler(&mut self, receiver: Name, contract: Name, action: Name, handler: ApplyHandler) {
        self.registry.register(receiver, contract, action, handler);
    }

    fn parts(&mut self) -> (&mut S, Services<'_>) {
        let services = Services {
            config: &self.config,
            chain_id: &self.chain_id,
            ledger: &self.ledger,
            registry: &self.registry,
            executor: self.executor.as_ref(),
            monitor: &self.monitor,
        };
        (&mut self.store, services)
    }

    fn pending(&self) -> ChainResult<&PendingBlock> {
        self.pending
            .as_ref()
            .ok_or_else(|| ChainError::ControllerState("no pending block".into()))
    }

    fn revision_of(&self, block_num: BlockNum) -> u64 {
        self.base_revision + u64::from(block_num.saturating_sub(1))
    }

    // ── Block production ──

    /// Open a pending block on top of the head.
    pub fn start_block(&mut self, timestamp_ms: TimestampMs, producer: Name) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::ControllerState("a block is already pending".into()));
        }
        validation::validate_block_timing(
            timestamp_ms,
            producer,
            self.head.timestamp_ms(),
            &self.schedule,
            &self.config.schedule,
        )?;
        let header = BlockHeader {
            previous: self.head.id,
            timestamp_ms,
            producer,
            schedule_version: self.schedule.version,
            ..Default::default()
        };
        self.open_block(header)?;
        tracing::debug!(block_num = self.head.block_num + 1, timestamp_ms, %producer, "started block");
        Ok(())
    }

    fn open_block(&mut self, header: BlockHeader) -> ChainResult<()> {
        self.store.begin();
        if let Err(err) = self.prune_dedup(header.timestamp_ms) {
            self.store.undo()?;
            return Err(err);
        }
        self.pending = Some(PendingBlock::new(header));
        Ok(())
    }

    /// Drop duplicate-detection records whose transactions have expired.
    fn prune_dedup(&mut self, now: TimestampMs) -> ChainResult<()> {
        let prefix = tables::DEDUP_EXPIRY_PREFIX;
        for (key, _) in self.store.scan_prefix(prefix)? {
            let expiration = key
                .get(prefix.len()..prefix.len() + 8)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| ChainError::Database("malformed dedup index".into()))?;
            if expiration > now {
                break;
            }
            let id = key
                .get(prefix.len() + 8..)
                .and_then(|b| <[u8; 32]>::try_from(b).ok())
                .ok_or_else(|| ChainError::Database("malformed dedup index".into()))?;
            self.store.erase(&key)?;
            self.store.erase(&tables::dedup_id_key(&id))?;
        }
        Ok(())
    }

    /// Apply an input transaction to the pending block.
    ///
    /// Executed, soft-failed, and delayed transactions are recorded and
    /// their trace returned. A rejected transaction returns its error and
    /// leaves the pending block untouched.
    pub fn push_transaction(
        &mut self,
        trx: &SignedTransaction,
        deadline: Option<Instant>,
    ) -> ChainResult<TransactionTrace> {
        self.apply_receipt_trx(&ReceiptTransaction::Input(trx.clone()), deadline, None)
    }

    /// Apply the deferred transaction stored under `key` to the pending block.
    pub fn push_scheduled_transaction(
        &mut self,
        key: &DeferredKey,
        deadline: Option<Instant>,
    ) -> ChainResult<TransactionTrace> {
        let entry = tables::get_generated(&self.store, key)?
            .ok_or_else(|| ChainError::Malformed(format!("no deferred transaction {key}")))?;
        let trx = ReceiptTransaction::Scheduled {
            id: entry.trx_id,
            key: *key,
        };
        self.apply_receipt_trx(&trx, deadline, None)
    }

    /// Keys of deferred transactions due at `now`, in schedule order.
    pub fn scheduled_transactions(&self, now: TimestampMs) -> ChainResult<Vec<DeferredKey>> {
        deferred::due(&self.store, now)
    }

    fn apply_receipt_trx(
        &mut self,
        trx: &ReceiptTransaction,
        deadline: Option<Instant>,
        explicit_cpu_us: Option<u32>,
    ) -> ChainResult<TransactionTrace> {
        let pending = self.pending()?;
        if pending.finalized.is_some() {
            return Err(ChainError::ControllerState("pending block is finalized".into()));
        }
        let block = pending.context();
        let (store, services) = self.parts();
        let trace = match trx {
            ReceiptTransaction::Input(signed) => {
                transaction_context::apply_input(store, services, block, signed, deadline, explicit_cpu_us)?
            }
            ReceiptTransaction::Scheduled { key, .. } => {
                transaction_context::apply_deferred(store, services, block, key, deadline, explicit_cpu_us)?
            }
        };

        let header = trace
            .receipt
            .ok_or_else(|| ChainError::ControllerState("applied transaction has no receipt".into()))?;
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| ChainError::ControllerState("no pending block".into()))?;
        if header.status == TransactionStatus::Executed {
            for receipt in trace.action_receipts() {
                pending.actions.append(receipt.digest());
            }
        }
        if let ReceiptTransaction::Input(signed) = trx {
            pending.input_trxs.push(signed.clone());
        }
        pending.receipts.push(TransactionReceipt {
            header,
            trx: trx.clone(),
        });
        Ok(trace)
    }

    /// Close the pending block: update the elastic limits, compute the
    /// merkle roots, and sign the header with `key`, which must belong to
    /// the block's producer.
    pub fn finalize_block(&mut self, key: &SigningKey) -> ChainResult<SignedBlock> {
        let pending = self.pending()?;
        if pending.finalized.is_some() {
            return Err(ChainError::ControllerState("block already finalized".into()));
        }
        let producer = pending.header.producer;
        let block_num = pending.header.block_num();
        let scheduled = self
            .schedule
            .find(producer)
            .ok_or_else(|| ChainError::ControllerState(format!("{producer} is not a scheduled producer")))?;
        if scheduled.signing_key != key.verifying_key().to_bytes() {
            return Err(ChainError::ControllerState(format!(
                "signing key does not belong to {producer}"
            )));
        }

        self.ledger.process_block_usage(&mut self.store, block_num)?;
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| ChainError::ControllerState("no pending block".into()))?;
        pending.header.transaction_mroot = pending.transaction_mroot();
        pending.header.action_mroot = pending.actions.root();
        let mut block = SignedBlock {
            header: pending.header.clone(),
            transactions: pending.receipts.clone(),
            ..Default::default()
        };
        block.sign(key);
        pending.finalized = Some(block.clone());
        tracing::info!(
            block_num,
            id = %short_hex(&block.id()),
            transactions = block.transactions.len(),
            actions = pending.actions.len(),
            "finalized block"
        );
        Ok(block)
    }

    /// Make the finalized pending block the new head.
    pub fn commit_block(&mut self) -> ChainResult<BlockState> {
        if !self.pending.as_ref().is_some_and(|p| p.finalized.is_some()) {
            return Err(ChainError::ControllerState("no finalized block to commit".into()));
        }
        let block = self
            .pending
            .take()
            .and_then(|p| p.finalized)
            .ok_or_else(|| ChainError::ControllerState("no finalized block to commit".into()))?;
        let state = BlockState::new(block, true);
        if let Err(err) = self.fork_db.add(state.clone()) {
            self.store.undo()?;
            return Err(err);
        }
        self.head = state.clone();
        tracing::info!(block_num = state.block_num, id = %short_hex(&state.id), "committed block");
        self.auto_irreversible()?;
        Ok(state)
    }

    /// Discard the pending block and return its input transactions.
    pub fn abort_block(&mut self) -> ChainResult<Vec<SignedTransaction>> {
        let Some(pending) = self.pending.take() else {
            return Ok(Vec::new());
        };
        self.store.undo()?;
        tracing::debug!(
            block_num = pending.header.block_num(),
            transactions = pending.input_trxs.len(),
            "aborted block"
        );
        Ok(pending.input_trxs)
    }

    // ── Block validation ──

    /// Validate and apply a block received from another producer.
    ///
    /// The header is checked against its parent before anything changes.
    /// The block is then added to the fork database and, if it becomes the
    /// head, applied on top of the current head or reached by a fork switch.
    pub fn push_block(&mut self, block: SignedBlock) -> ChainResult<()> {
        if self.pending.is_some() {
            return Err(ChainError::ControllerState("abort the pending block before pushing".into()));
        }
        let parent = self.fork_db.get(&block.previous()).ok_or_else(|| ChainError::UnlinkableBlock {
            block_num: block.block_num(),
            reason: format!("unknown previous block {}", short_hex(&block.previous())),
        })?;
        validation::validate_header(&block, parent, &self.schedule, &self.config.schedule)?;
        self.fork_db.add(BlockState::new(block, false))?;

        let new_head = self.fork_db.head().clone();
        if new_head.id == self.head.id {
            return Ok(());
        }
        if new_head.previous() == self.head.id {
            if let Err(err) = self.apply_block(&new_head) {
                tracing::warn!(block_num = new_head.block_num, error = %err, "rejected block");
                self.fork_db.remove(&new_head.id)?;
                self.fork_db.set_head(&self.head.id)?;
                return Err(err);
            }
            self.set_head_validated(&new_head.id)?;
        } else {
            self.switch_fork(&new_head.id)?;
        }
        self.auto_irreversible()
    }

    fn set_head_validated(&mut self, id: &BlockId) -> ChainResult<()> {
        self.fork_db.mark_valid(id)?;
        self.head = self
            .fork_db
            .get(id)
            .cloned()
            .ok_or_else(|| ChainError::ForkDatabase(format!("block {} vanished", short_hex(id))))?;
        Ok(())
    }

    /// Replay `state`'s block on top of the head. On failure the block's
    /// session is undone and the head is unchanged.
    fn apply_block(&mut self, state: &BlockState) -> ChainResult<()> {
        let block = Arc::clone(&state.block);
        let header = BlockHeader {
            transaction_mroot: ZERO_HASH,
            action_mroot: ZERO_HASH,
            ..block.header.clone()
        };
        self.open_block(header)?;
        let result = self.replay(&block);
        self.pending = None;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store.undo()?;
                Err(err)
            }
        }
    }

    fn replay(&mut self, block: &SignedBlock) -> ChainResult<()> {
        let block_num = block.block_num();
        for (index, receipt) in block.transactions.iter().enumerate() {
            let trace = self.apply_receipt_trx(&receipt.trx, None, Some(receipt.header.cpu_usage_us))?;
            if trace.receipt != Some(receipt.header) {
                return Err(ChainError::InvalidBlock(format!(
                    "receipt {index} of block #{block_num} does not match: claimed {:?}, got {:?}",
                    receipt.header, trace.receipt
                )));
            }
            if trace.id != receipt.trx.id() {
                return Err(ChainError::InvalidBlock(format!(
                    "receipt {index} of block #{block_num} names the wrong transaction"
                )));
            }
        }

        self.ledger.process_block_usage(&mut self.store, block_num)?;
        let pending = self.pending()?;
        if pending.transaction_mroot() != block.header.transaction_mroot {
            return Err(ChainError::InvalidBlock(format!(
                "transaction merkle root mismatch in block #{block_num}"
            )));
        }
        if pending.actions.root() != block.header.action_mroot {
            return Err(ChainError::InvalidBlock(format!(
                "action merkle root mismatch in block #{block_num}"
            )));
        }
        Ok(())
    }

    /// Undo the head's branch back to the common ancestor with `new_head`,
    /// then apply the new branch oldest first. If a new block fails, it is
    /// removed from the fork database along with its descendants and the
    /// previous branch is restored.
    fn switch_fork(&mut self, new_head: &BlockId) -> ChainResult<()> {
        let old_head = self.head.clone();
        let (new_branch, old_branch) = self.fork_db.fetch_branch_from(new_head, &old_head.id)?;
        let ancestor_id = new_branch
            .last()
            .map(BlockState::previous)
            .ok_or_else(|| ChainError::ForkDatabase("fork switch with an empty branch".into()))?;
        let ancestor = self
            .fork_db
            .get(&ancestor_id)
            .cloned()
            .ok_or_else(|| ChainError::ForkDatabase("fork ancestor not in fork database".into()))?;
        tracing::info!(
            from = old_head.block_num,
            to = new_branch.first().map_or(0, |b| b.block_num),
            ancestor = ancestor.block_num,
            "switching fork"
        );

        for _ in &old_branch {
            self.store.undo()?;
        }
        self.head = ancestor.clone();

        let mut applied = 0usize;
        for state in new_branch.iter().rev() {
            if let Err(err) = self.apply_block(state) {
                tracing::warn!(block_num = state.block_num, error = %err, "fork switch failed, restoring previous branch");
                self.fork_db.remove(&state.id)?;
                for _ in 0..applied {
                    self.store.undo()?;
                }
                self.head = ancestor;
                for old in old_branch.iter().rev() {
                    self.apply_block(old)?;
                    self.head = old.clone();
                }
                self.fork_db.set_head(&self.head.id)?;
                return Err(err);
            }
            self.set_head_validated(&state.id)?;
            applied += 1;
        }
        Ok(())
    }

    // ── Irreversibility ──

    fn auto_irreversible(&mut self) -> ChainResult<()> {
        let confirmations = self.config.schedule.irreversible_confirmations;
        if confirmations > 0 {
            self.advance_irreversible(confirmations)?;
        }
        Ok(())
    }

    /// Make the applied head's ancestor `confirmations` blocks back
    /// irreversible.
    pub fn advance_irreversible(&mut self, confirmations: u32) -> ChainResult<Option<BlockState>> {
        let target = self.head.block_num.saturating_sub(confirmations);
        if target <= self.fork_db.root().block_num {
            return Ok(None);
        }
        let id = self.fork_db.ancestor_at(&self.head.id, target)?.id;
        self.fork_db.advance_root(&id)?;
        let root = self.fork_db.root().clone();
        self.store.commit(self.revision_of(root.block_num));
        tracing::info!(block_num = root.block_num, id = %short_hex(&root.id), "advanced irreversible block");
        Ok(Some(root))
    }

    /// Make block `id`, which must be on the head's branch, irreversible.
    pub fn mark_irreversible(&mut self, id: &BlockId) -> ChainResult<()> {
        if !self.fork_db.is_on_branch(id, &self.head.id)? {
            return Err(ChainError::ForkDatabase(format!(
                "block {} is not on the head branch",
                short_hex(id)
            )));
        }
        let pruned = self.fork_db.advance_root(id)?;
        let root_num = self.fork_db.root().block_num;
        self.store.commit(self.revision_of(root_num));
        tracing::info!(block_num = root_num, pruned = pruned.len(), "marked block irreversible");
        Ok(())
    }

    // ── Reads ──

    pub fn head_block_state(&self) -> &BlockState {
        &self.head
    }

    pub fn fork_db_head(&self) -> &BlockState {
        self.fork_db.head()
    }

    pub fn fork_db(&self) -> &ForkDatabase {
        &self.fork_db
    }

    pub fn last_irreversible_block_num(&self) -> BlockNum {
        self.fork_db.root().block_num
    }

    pub fn pending_block_num(&self) -> Option<BlockNum> {
        self.pending.as_ref().map(|p| p.header.block_num())
    }

    fn current_block_num(&self) -> BlockNum {
        self.pending_block_num().unwrap_or(self.head.block_num)
    }

    /// Caps and windowed usage of `account`.
    pub fn get_account_limits(&self, account: Name) -> ChainResult<AccountLimits> {
        tables::require_account(&self.store, account)?;
        self.ledger.get_limits(&self.store, account, self.current_block_num())
    }

    pub fn get_account_usage(&self, account: Name) -> ChainResult<AccountUsageRecord> {
        self.ledger.get_account_usage(&self.store, account)
    }

    /// Current elastic `(cpu, net)` block limits.
    pub fn virtual_limits(&self) -> ChainResult<(u64, u64)> {
        self.ledger.virtual_limits(&self.store)
    }

    pub fn get_account(&self, account: Name) -> ChainResult<Option<AccountRecord>> {
        get_account(&self.store, account)
    }

    /// Value of a contract row.
    pub fn get_row(&self, code: Name, scope: Name, table: Name, primary_key: u64) -> ChainResult<Option<Vec<u8>>> {
        let row = RowId {
            code,
            scope,
            table,
            primary_key,
        };
        Ok(get_record::<RowRecord>(&self.store, &row.key())?.map(|r| r.value))
    }

    pub fn pending_deferred_count(&self) -> ChainResult<usize> {
        deferred::count(&self.store)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn chain_id(&self) -> &Hash {
        &self.chain_id
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn schedule(&self) -> &ProducerSchedule {
        &self.schedule
    }
}
