//! `meterchain-engine` — deterministic, resource-metered transaction
//! execution and block assembly.
//!
//! Transactions run one at a time inside a pending block. Each one is
//! dispatched action by action, billed for CPU, NET, and RAM against the
//! resource ledger, and either committed, soft-failed (state undone, usage
//! billed), or rejected. Finalized blocks carry merkle roots over their
//! receipts and are tracked in a fork database until irreversible.
//!
//! ## Architecture
//!
//! - [`controller::Controller`] — block lifecycle, replay, fork switching
//! - [`transaction_context`] — one transaction's session, state machine, billing
//! - [`apply_context::ApplyContext`] — action dispatch and the host API
//! - [`host::ContractExecutor`] — seam to the sandboxed contract runtime
//! - [`registry::ApplyHandlerRegistry`] — native system actions
//! - [`resource_limits::ResourceLimitsLedger`] — usage windows and elastic limits
//! - [`checktime::DeadlineMonitor`] — wall-clock watchdog
//! - [`fork_database::ForkDatabase`] — candidate block tree
//! - [`validation`] — transaction and header checks

pub mod config;
pub mod tables;
pub mod resource_limits;
pub mod checktime;
pub mod host;
pub mod deferred;
pub mod registry;
pub mod apply_context;
pub mod transaction_context;
pub mod fork_database;
pub mod validation;
pub mod controller;

// Re-export key types for convenience
pub use checktime::DeadlineMonitor;
pub use config::{ChainLimits, ControllerConfig, ResourceLimitsConfig, ScheduleConfig};
pub use controller::{Controller, Genesis};
pub use fork_database::{BlockState, ForkChoice, ForkDatabase, LongestChain};
pub use host::{ContractExecutor, HostApi, NativeContractExecutor};
pub use registry::ApplyHandlerRegistry;
pub use resource_limits::{AccountLimits, ResourceLimitsLedger};
