//! Resource limits ledger.
//!
//! Tracks per-account CPU and NET usage in decayed windows, RAM held against
//! a quota, and the block-wide elastic virtual limits. All records live in
//! the key-value store, so a transaction's usage is rolled back with its
//! session.
//!
//! An account with finite weight `w` out of total weight `W` may consume
//! `virtual_limit * window_horizon * w / W` within its window. Block totals
//! are capped by the configured block limit (the elastic floor), which the
//! virtual limit never drops below.

use std::collections::BTreeSet;

use meterchain_primitives::{
    ChainError, ChainResult, KeyValueStore, Name, ResourceKind, UsageWindow, WindowConfig,
};

use crate::config::ResourceLimitsConfig;
use crate::tables::{
    self, get_record, put_record, AccountLimitsRecord, AccountUsageRecord, ResourceStateRecord,
};

/// Used, available, and maximum units for one resource. `max` is `None`
/// when the account is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountResourceLimit {
    pub used: u64,
    pub available: Option<u64>,
    pub max: Option<u64>,
}

/// Snapshot of an account's caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountLimits {
    pub cpu: AccountResourceLimit,
    pub net: AccountResourceLimit,
    pub ram: AccountResourceLimit,
}

/// Ledger operations over a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct ResourceLimitsLedger {
    config: ResourceLimitsConfig,
}

impl ResourceLimitsLedger {
    pub fn new(config: ResourceLimitsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResourceLimitsConfig {
        &self.config
    }

    fn window(&self, kind: ResourceKind) -> &WindowConfig {
        match kind {
            ResourceKind::Net => &self.config.account_net_window,
            _ => &self.config.account_cpu_window,
        }
    }

    /// Create the block-wide state. Idempotent.
    pub fn initialize(&self, store: &mut dyn KeyValueStore) -> ChainResult<()> {
        if store.contains(tables::RESOURCE_STATE_KEY)? {
            return Ok(());
        }
        let state = ResourceStateRecord {
            average_block_cpu: UsageWindow::new(&self.config.cpu.average_window()),
            average_block_net: UsageWindow::new(&self.config.net.average_window()),
            pending_block_cpu: 0,
            pending_block_net: 0,
            virtual_cpu_limit: self.config.cpu.max,
            virtual_net_limit: self.config.net.max,
            total_cpu_weight: 0,
            total_net_weight: 0,
        };
        put_record(store, tables::RESOURCE_STATE_KEY.to_vec(), &state)
    }

    fn state(&self, store: &dyn KeyValueStore) -> ChainResult<ResourceStateRecord> {
        get_record(store, tables::RESOURCE_STATE_KEY)?
            .ok_or_else(|| ChainError::Database("resource state missing".into()))
    }

    /// Create limits (unlimited) and empty usage for a new account.
    pub fn initialize_account(&self, store: &mut dyn KeyValueStore, account: Name) -> ChainResult<()> {
        if store.contains(&tables::usage_key(account))? {
            return Err(ChainError::LedgerInconsistent(format!(
                "resource records for {account} already exist"
            )));
        }
        put_record(store, tables::limits_key(account), &AccountLimitsRecord::default())?;
        let usage = AccountUsageRecord {
            net: UsageWindow::new(&self.config.account_net_window),
            cpu: UsageWindow::new(&self.config.account_cpu_window),
            ram_usage: 0,
        };
        put_record(store, tables::usage_key(account), &usage)
    }

    fn limits_record(&self, store: &dyn KeyValueStore, account: Name) -> ChainResult<AccountLimitsRecord> {
        get_record(store, &tables::limits_key(account))?.ok_or_else(|| {
            ChainError::LedgerInconsistent(format!("no resource limits for {account}"))
        })
    }

    fn usage_record(&self, store: &dyn KeyValueStore, account: Name) -> ChainResult<AccountUsageRecord> {
        get_record(store, &tables::usage_key(account))?.ok_or_else(|| {
            ChainError::LedgerInconsistent(format!("no resource usage for {account}"))
        })
    }

    /// Replace an account's RAM quota and CPU/NET weights, keeping the
    /// weight totals in step. Lowering a quota below current usage fails.
    pub fn set_account_limits(
        &self,
        store: &mut dyn KeyValueStore,
        account: Name,
        limits: AccountLimitsRecord,
    ) -> ChainResult<()> {
        let old = self.limits_record(store, account)?;
        let usage = self.usage_record(store, account)?;
        if let Some(quota) = limits.ram_bytes {
            if usage.ram_usage > quota {
                return Err(ChainError::RamExhausted {
                    account,
                    needed: usage.ram_usage,
                    quota,
                });
            }
        }
        let mut state = self.state(store)?;
        state.total_cpu_weight = reweigh(state.total_cpu_weight, old.cpu_weight, limits.cpu_weight)?;
        state.total_net_weight = reweigh(state.total_net_weight, old.net_weight, limits.net_weight)?;
        put_record(store, tables::RESOURCE_STATE_KEY.to_vec(), &state)?;
        put_record(store, tables::limits_key(account), &limits)
    }

    pub fn get_account_limits(&self, store: &dyn KeyValueStore, account: Name) -> ChainResult<AccountLimitsRecord> {
        self.limits_record(store, account)
    }

    pub fn get_account_usage(&self, store: &dyn KeyValueStore, account: Name) -> ChainResult<AccountUsageRecord> {
        self.usage_record(store, account)
    }

    /// `(virtual_cpu_limit, virtual_net_limit)`.
    pub fn virtual_limits(&self, store: &dyn KeyValueStore) -> ChainResult<(u64, u64)> {
        let state = self.state(store)?;
        Ok((state.virtual_cpu_limit, state.virtual_net_limit))
    }

    /// `(pending_block_cpu, pending_block_net)`.
    pub fn pending_block_usage(&self, store: &dyn KeyValueStore) -> ChainResult<(u64, u64)> {
        let state = self.state(store)?;
        Ok((state.pending_block_cpu, state.pending_block_net))
    }

    /// Windowed capacity of an account for `kind`, or `None` if unlimited.
    fn account_cap(
        &self,
        state: &ResourceStateRecord,
        limits: &AccountLimitsRecord,
        kind: ResourceKind,
    ) -> Option<u64> {
        let (weight, total, virtual_limit) = match kind {
            ResourceKind::Cpu => (limits.cpu_weight?, state.total_cpu_weight, state.virtual_cpu_limit),
            ResourceKind::Net => (limits.net_weight?, state.total_net_weight, state.virtual_net_limit),
            ResourceKind::Ram => return limits.ram_bytes,
        };
        if total == 0 {
            return Some(0);
        }
        let capacity = virtual_limit as u128 * self.window(kind).horizon() as u128;
        let cap = capacity * weight as u128 / total as u128;
        Some(u64::try_from(cap).unwrap_or(u64::MAX))
    }

    /// Caps and current usage for `account` as of `block_num`.
    pub fn get_limits(&self, store: &dyn KeyValueStore, account: Name, block_num: u32) -> ChainResult<AccountLimits> {
        let state = self.state(store)?;
        let limits = self.limits_record(store, account)?;
        let usage = self.usage_record(store, account)?;
        let ordinal = u64::from(block_num);
        let view = |used: u64, max: Option<u64>| AccountResourceLimit {
            used,
            available: max.map(|m| m.saturating_sub(used)),
            max,
        };
        Ok(AccountLimits {
            cpu: view(
                usage.cpu.decayed_usage(&self.config.account_cpu_window, ordinal),
                self.account_cap(&state, &limits, ResourceKind::Cpu),
            ),
            net: view(
                usage.net.decayed_usage(&self.config.account_net_window, ordinal),
                self.account_cap(&state, &limits, ResourceKind::Net),
            ),
            ram: view(usage.ram_usage, limits.ram_bytes),
        })
    }

    /// Remaining block capacity `(cpu, net)` in the pending block.
    pub fn block_available(&self, store: &dyn KeyValueStore) -> ChainResult<(u64, u64)> {
        let state = self.state(store)?;
        Ok((
            self.config.cpu.max.saturating_sub(state.pending_block_cpu),
            self.config.net.max.saturating_sub(state.pending_block_net),
        ))
    }

    /// Bill `cpu_us` and `net_bytes` to every account in `accounts` and to
    /// the pending block. Checks every cap before writing anything, so a
    /// failure adds no usage. Account caps are skipped when
    /// `enforce_account_caps` is false; block caps always apply.
    pub fn add_transaction_usage(
        &self,
        store: &mut dyn KeyValueStore,
        accounts: &BTreeSet<Name>,
        cpu_us: u64,
        net_bytes: u64,
        block_num: u32,
        enforce_account_caps: bool,
    ) -> ChainResult<()> {
        let mut state = self.state(store)?;
        let ordinal = u64::from(block_num);
        let cpu_window = &self.config.account_cpu_window;
        let net_window = &self.config.account_net_window;

        let mut updated = Vec::with_capacity(accounts.len());
        for &account in accounts {
            let limits = self.limits_record(store, account)?;
            let mut usage = self.usage_record(store, account)?;
            usage.cpu.add(cpu_window, ordinal, cpu_us)?;
            usage.net.add(net_window, ordinal, net_bytes)?;

            if enforce_account_caps {
                for (kind, window, cfg) in [
                    (ResourceKind::Cpu, &usage.cpu, cpu_window),
                    (ResourceKind::Net, &usage.net, net_window),
                ] {
                    if let Some(cap) = self.account_cap(&state, &limits, kind) {
                        let used = window.decayed_usage(cfg, ordinal);
                        if used > cap {
                            return Err(ChainError::ResourceExhausted {
                                resource: kind,
                                scope: format!("account {account}"),
                                used,
                                limit: cap,
                            });
                        }
                    }
                }
            }
            updated.push((account, usage));
        }

        let block_cpu = state.pending_block_cpu.saturating_add(cpu_us);
        if block_cpu > self.config.cpu.max {
            return Err(ChainError::ResourceExhausted {
                resource: ResourceKind::Cpu,
                scope: "block".into(),
                used: block_cpu,
                limit: self.config.cpu.max,
            });
        }
        let block_net = state.pending_block_net.saturating_add(net_bytes);
        if block_net > self.config.net.max {
            return Err(ChainError::ResourceExhausted {
                resource: ResourceKind::Net,
                scope: "block".into(),
                used: block_net,
                limit: self.config.net.max,
            });
        }

        for (account, usage) in updated {
            put_record(store, tables::usage_key(account), &usage)?;
        }
        state.pending_block_cpu = block_cpu;
        state.pending_block_net = block_net;
        put_record(store, tables::RESOURCE_STATE_KEY.to_vec(), &state)
    }

    /// Adjust RAM held by `account` by `delta` bytes.
    pub fn add_ram_usage(&self, store: &mut dyn KeyValueStore, account: Name, delta: i64) -> ChainResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut usage = self.usage_record(store, account)?;
        let next = if delta < 0 {
            usage.ram_usage.checked_sub(delta.unsigned_abs()).ok_or_else(|| {
                ChainError::LedgerInconsistent(format!(
                    "ram usage of {account} would go negative ({} - {})",
                    usage.ram_usage,
                    delta.unsigned_abs()
                ))
            })?
        } else {
            let next = usage.ram_usage.saturating_add(delta.unsigned_abs());
            if let Some(quota) = self.limits_record(store, account)?.ram_bytes {
                if next > quota {
                    return Err(ChainError::RamExhausted {
                        account,
                        needed: next,
                        quota,
                    });
                }
            }
            next
        };
        usage.ram_usage = next;
        put_record(store, tables::usage_key(account), &usage)
    }

    /// Close the pending block: fold its totals into the block averages,
    /// step both elastic limits, and reset the accumulators. Runs once per
    /// block.
    pub fn process_block_usage(&self, store: &mut dyn KeyValueStore, block_num: u32) -> ChainResult<()> {
        let mut state = self.state(store)?;
        let ordinal = u64::from(block_num);
        let cpu = &self.config.cpu;
        let net = &self.config.net;

        state.average_block_cpu.add(&cpu.average_window(), ordinal, state.pending_block_cpu)?;
        let avg_cpu = state.average_block_cpu.average(&cpu.average_window(), ordinal);
        state.virtual_cpu_limit = meterchain_primitives::resource::update_elastic_limit(
            state.virtual_cpu_limit,
            avg_cpu,
            cpu,
        );

        state.average_block_net.add(&net.average_window(), ordinal, state.pending_block_net)?;
        let avg_net = state.average_block_net.average(&net.average_window(), ordinal);
        state.virtual_net_limit = meterchain_primitives::resource::update_elastic_limit(
            state.virtual_net_limit,
            avg_net,
            net,
        );

        tracing::debug!(
            block_num,
            block_cpu = state.pending_block_cpu,
            block_net = state.pending_block_net,
            avg_cpu,
            avg_net,
            virtual_cpu = state.virtual_cpu_limit,
            virtual_net = state.virtual_net_limit,
            "processed block usage"
        );

        state.pending_block_cpu = 0;
        state.pending_block_net = 0;
        put_record(store, tables::RESOURCE_STATE_KEY.to_vec(), &state)
    }
}

fn reweigh(total: u64, old: Option<u64>, new: Option<u64>) -> ChainResult<u64> {
    let without = total.checked_sub(old.unwrap_or(0)).ok_or_else(|| {
        ChainError::LedgerInconsistent("total weight below account weight".into())
    })?;
    Ok(without.saturating_add(new.unwrap_or(0)))
}
