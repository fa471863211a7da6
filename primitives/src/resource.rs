//! Fixed-point resource accounting primitives.
//!
//! Usage is tracked in bucketed, time-decayed windows and block-wide caps
//! follow an AIMD-style elastic recurrence. All arithmetic is integer-only:
//! every node must reach bit-identical limits from the same usage history.
//!
//! ## Usage window
//!
//! A window is a ring of `N` buckets, each covering `span` ordinals
//! (ordinal = block number). A bucket that is `age` buckets old contributes
//! with weight `N - age`, so usage fades linearly and drops out entirely
//! after `N * span` ordinals. There is no instantaneous reset.
//!
//! - `decayed_usage = Σ bucket·(N − age) / N` — windowed total, used for
//!   per-account caps. Adding `u` to the current bucket raises it by `u`.
//! - `average = Σ bucket·(N − age) / (N(N+1)/2)` — weighted per-bucket
//!   average; a constant per-bucket load `u` yields exactly `u`.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};

/// Resource discriminant. Ledger operations are free functions keyed by
/// this value rather than per-resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ResourceKind {
    Cpu = 0,
    Net = 1,
    Ram = 2,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Net => write!(f, "net"),
            Self::Ram => write!(f, "ram"),
        }
    }
}

/// Exact rational `numerator / denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self { numerator, denominator }
    }

    /// `value * numerator / denominator`, floored, saturating at `u64::MAX`.
    pub fn apply(&self, value: u64) -> u64 {
        if self.denominator == 0 {
            return u64::MAX;
        }
        let wide = value as u128 * self.numerator as u128 / self.denominator as u128;
        u64::try_from(wide).unwrap_or(u64::MAX)
    }

    /// `value * numerator / denominator`, rounded up.
    pub fn apply_ceil(&self, value: u64) -> u64 {
        if self.denominator == 0 {
            return u64::MAX;
        }
        let num = value as u128 * self.numerator as u128;
        let den = self.denominator as u128;
        u64::try_from(num.div_ceil(den)).unwrap_or(u64::MAX)
    }

    fn lt_one(&self) -> bool {
        self.numerator < self.denominator
    }

    fn gt_one(&self) -> bool {
        self.numerator > self.denominator
    }
}

/// Shape of a usage window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Number of buckets in the ring.
    pub bucket_count: u32,
    /// Ordinals (blocks) covered by each bucket.
    pub bucket_span: u32,
}

impl WindowConfig {
    pub const fn new(bucket_count: u32, bucket_span: u32) -> Self {
        Self { bucket_count, bucket_span }
    }

    /// Ordinals after which a contribution has fully decayed.
    pub fn horizon(&self) -> u64 {
        self.bucket_count as u64 * self.bucket_span as u64
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.bucket_count == 0 || self.bucket_span == 0 {
            return Err(ChainError::InvalidConfig(
                "usage window needs at least one bucket of non-zero span".into(),
            ));
        }
        Ok(())
    }
}

/// Bucketed, time-decayed moving sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageWindow {
    buckets: Vec<u64>,
    /// Absolute bucket index (ordinal / span) of the most recent bucket.
    head: u64,
}

impl UsageWindow {
    /// Create an empty window.
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            buckets: vec![0; config.bucket_count.max(1) as usize],
            head: 0,
        }
    }

    /// Rebuild a window from stored parts.
    pub fn from_parts(head: u64, buckets: Vec<u64>) -> ChainResult<Self> {
        if buckets.is_empty() {
            return Err(ChainError::Serialization("usage window without buckets".into()));
        }
        Ok(Self { buckets, head })
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    fn len(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn bucket_index(config: &WindowConfig, ordinal: u64) -> u64 {
        ordinal / config.bucket_span.max(1) as u64
    }

    /// Move the head forward to `ordinal`, clearing buckets that rolled out.
    /// Ordinals behind the head are ignored.
    pub fn advance(&mut self, config: &WindowConfig, ordinal: u64) {
        let target = Self::bucket_index(config, ordinal);
        if target <= self.head {
            return;
        }
        let n = self.len();
        if target - self.head >= n {
            self.buckets.iter_mut().for_each(|b| *b = 0);
        } else {
            for idx in (self.head + 1)..=target {
                self.buckets[(idx % n) as usize] = 0;
            }
        }
        self.head = target;
    }

    /// Record `units` at `ordinal`.
    pub fn add(&mut self, config: &WindowConfig, ordinal: u64, units: u64) -> ChainResult<()> {
        self.advance(config, ordinal);
        let n = self.len();
        let slot = &mut self.buckets[(self.head % n) as usize];
        *slot = slot.checked_add(units).ok_or_else(|| {
            ChainError::LedgerInconsistent("usage bucket overflow".into())
        })?;
        Ok(())
    }

    /// `Σ bucket · (N − age)` as seen from `ordinal`, without mutating.
    fn weighted_sum(&self, config: &WindowConfig, ordinal: u64) -> u128 {
        let n = self.len();
        let now = Self::bucket_index(config, ordinal).max(self.head);
        let oldest_live = self.head.saturating_sub(n - 1);
        let mut total: u128 = 0;
        for age in 0..n {
            let Some(idx) = now.checked_sub(age) else { break };
            if idx > self.head || idx < oldest_live {
                continue;
            }
            let value = self.buckets[(idx % n) as usize] as u128;
            total += value * (n - age) as u128;
        }
        total
    }

    /// Windowed total with linear decay (see module docs).
    pub fn decayed_usage(&self, config: &WindowConfig, ordinal: u64) -> u64 {
        let total = self.weighted_sum(config, ordinal) / self.len() as u128;
        u64::try_from(total).unwrap_or(u64::MAX)
    }

    /// Weighted per-bucket average (see module docs).
    pub fn average(&self, config: &WindowConfig, ordinal: u64) -> u64 {
        let n = self.len() as u128;
        let total = self.weighted_sum(config, ordinal) / (n * (n + 1) / 2);
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

/// Parameters of one elastic block-wide limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticLimitParameters {
    /// Base block limit; the elastic limit never drops below it.
    pub max: u64,
    /// Target utilization as a fraction of `max`.
    pub target: Ratio,
    /// Blocks averaged when measuring utilization.
    pub periods: u32,
    /// Ceiling is `max * max_multiplier`.
    pub max_multiplier: u32,
    /// Applied when average usage is above target (< 1).
    pub contract_rate: Ratio,
    /// Applied when average usage is at or below target (> 1).
    pub expand_rate: Ratio,
}

impl ElasticLimitParameters {
    /// Average-usage threshold separating contraction from expansion,
    /// a fraction of the `current` virtual limit.
    pub fn target_usage(&self, current: u64) -> u64 {
        self.target.apply(current)
    }

    pub fn floor(&self) -> u64 {
        self.max
    }

    pub fn ceiling(&self) -> u64 {
        self.max.saturating_mul(self.max_multiplier as u64)
    }

    /// Window used for the block-average of this resource.
    pub fn average_window(&self) -> WindowConfig {
        WindowConfig::new(self.periods, 1)
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.max == 0 || self.periods == 0 || self.max_multiplier == 0 {
            return Err(ChainError::InvalidConfig(
                "elastic limit needs non-zero max, periods and multiplier".into(),
            ));
        }
        for r in [self.target, self.contract_rate, self.expand_rate] {
            if r.denominator == 0 {
                return Err(ChainError::InvalidConfig("zero ratio denominator".into()));
            }
        }
        if self.target.numerator > self.target.denominator {
            return Err(ChainError::InvalidConfig("target above 100%".into()));
        }
        if !self.contract_rate.lt_one() || !self.expand_rate.gt_one() {
            return Err(ChainError::InvalidConfig(
                "contract rate must be < 1 and expand rate > 1".into(),
            ));
        }
        Ok(())
    }
}

/// One step of the elastic recurrence.
///
/// An average above `target` of the current limit contracts it, otherwise
/// it expands; the result is clamped to `[floor, ceiling]`. A step that
/// would round to no change moves by one unit instead, so consecutive over-
/// or under-target blocks are strictly monotone until the bound is reached.
pub fn update_elastic_limit(current: u64, average_usage: u64, params: &ElasticLimitParameters) -> u64 {
    let floor = params.floor();
    let ceiling = params.ceiling();
    let next = if average_usage > params.target_usage(current) {
        let contracted = params.contract_rate.apply(current);
        if contracted >= current { current.saturating_sub(1) } else { contracted }
    } else {
        let expanded = params.expand_rate.apply(current);
        if expanded <= current { current.saturating_add(1) } else { expanded }
    };
    next.clamp(floor, ceiling)
}
