//! Controller configuration.
//!
//! Every protocol constant that differs between deployments lives here:
//! per-transaction limits, elastic block limits, account usage windows, and
//! the producer slot shape. Values load from TOML and are checked once by
//! [`ControllerConfig::validate`]; nothing on the apply path re-validates
//! them.

use serde::{Deserialize, Serialize};

use meterchain_primitives::{
    crypto, name, ChainError, ChainResult, ElasticLimitParameters, Hash, Name, Ratio,
    WindowConfig,
};

/// Per-transaction and dispatch bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainLimits {
    /// Upper bound on CPU billed to a single transaction.
    pub max_transaction_cpu_usage_us: u32,
    /// Minimum CPU billed to any transaction.
    pub min_transaction_cpu_usage_us: u32,
    /// Fixed CPU charged per signature.
    pub per_signature_cpu_us: u32,
    /// Fixed CPU charged per action, including notifications and inlines.
    pub per_action_cpu_us: u32,
    /// Upper bound on NET billed to a single transaction, in bytes.
    pub max_transaction_net_usage: u64,
    /// NET bytes charged to every transaction on top of its size.
    pub base_per_transaction_net_usage: u32,
    /// Fraction of context-free data size billed as NET.
    pub context_free_discount_net_usage: Ratio,
    /// Farthest expiration accepted, relative to the pending block time.
    pub max_transaction_lifetime_ms: u64,
    /// Lifetime of a deferred entry past its `delay_until`.
    pub deferred_trx_expiration_window_ms: u64,
    pub max_transaction_delay_sec: u32,
    /// Nesting bound for inline actions.
    pub max_inline_action_depth: u32,
    /// Bound on dispatched actions per transaction.
    pub max_actions_per_transaction: u32,
}

impl Default for ChainLimits {
    fn default() -> Self {
        Self {
            max_transaction_cpu_usage_us: 150_000,
            min_transaction_cpu_usage_us: 100,
            per_signature_cpu_us: 50,
            per_action_cpu_us: 20,
            max_transaction_net_usage: 512 * 1024,
            base_per_transaction_net_usage: 12,
            context_free_discount_net_usage: Ratio::new(20, 100),
            max_transaction_lifetime_ms: 60 * 60 * 1000,
            deferred_trx_expiration_window_ms: 10 * 60 * 1000,
            max_transaction_delay_sec: 45 * 24 * 3600,
            max_inline_action_depth: 4,
            max_actions_per_transaction: 256,
        }
    }
}

/// Elastic block limits and account usage windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    /// Block CPU limit (`max` is the per-block cap and elastic floor), in us.
    pub cpu: ElasticLimitParameters,
    /// Block NET limit, in bytes.
    pub net: ElasticLimitParameters,
    pub account_cpu_window: WindowConfig,
    pub account_net_window: WindowConfig,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            cpu: ElasticLimitParameters {
                max: 200_000,
                target: Ratio::new(1, 10),
                periods: 120,
                max_multiplier: 1000,
                contract_rate: Ratio::new(99, 100),
                expand_rate: Ratio::new(1000, 999),
            },
            net: ElasticLimitParameters {
                max: 1024 * 1024,
                target: Ratio::new(1, 10),
                periods: 120,
                max_multiplier: 1000,
                contract_rate: Ratio::new(99, 100),
                expand_rate: Ratio::new(1000, 999),
            },
            account_cpu_window: WindowConfig::new(24, 7_200),
            account_net_window: WindowConfig::new(24, 7_200),
        }
    }
}

/// Producer slot shape and irreversibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub block_interval_ms: u64,
    /// Consecutive slots each producer keeps.
    pub producer_repetitions: u32,
    /// Blocks behind head that become irreversible after each commit.
    /// Zero leaves irreversibility to explicit calls.
    pub irreversible_confirmations: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: 500,
            producer_repetitions: 12,
            irreversible_confirmations: 0,
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Chain label; its SHA-256 is the chain id bound into signatures.
    pub chain_name: String,
    /// Privileged account owning the native actions.
    pub system_account: Name,
    pub limits: ChainLimits,
    pub resources: ResourceLimitsConfig,
    pub schedule: ScheduleConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            chain_name: "meterchain-local".into(),
            system_account: name("system"),
            limits: ChainLimits::default(),
            resources: ResourceLimitsConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> ChainResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ChainError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn chain_id(&self) -> Hash {
        crypto::hash_sha256(self.chain_name.as_bytes())
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> ChainResult<()> {
        let limits = &self.limits;
        if self.system_account.is_empty() {
            return Err(ChainError::InvalidConfig("system account must be set".into()));
        }
        if limits.min_transaction_cpu_usage_us > limits.max_transaction_cpu_usage_us {
            return Err(ChainError::InvalidConfig(
                "min transaction cpu exceeds max transaction cpu".into(),
            ));
        }
        if u64::from(limits.max_transaction_cpu_usage_us) > self.resources.cpu.max {
            return Err(ChainError::InvalidConfig(
                "max transaction cpu exceeds block cpu limit".into(),
            ));
        }
        if limits.max_transaction_net_usage > self.resources.net.max {
            return Err(ChainError::InvalidConfig(
                "max transaction net exceeds block net limit".into(),
            ));
        }
        if limits.context_free_discount_net_usage.denominator == 0 {
            return Err(ChainError::InvalidConfig("zero context-free discount denominator".into()));
        }
        if limits.max_actions_per_transaction == 0 {
            return Err(ChainError::InvalidConfig("max actions per transaction is zero".into()));
        }
        self.resources.cpu.validate()?;
        self.resources.net.validate()?;
        self.resources.account_cpu_window.validate()?;
        self.resources.account_net_window.validate()?;
        if self.schedule.block_interval_ms == 0 || self.schedule.producer_repetitions == 0 {
            return Err(ChainError::InvalidConfig(
                "block interval and producer repetitions must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
