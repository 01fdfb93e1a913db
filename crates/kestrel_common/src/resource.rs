//! Resource-metering value types: the fixed-point sliding-window usage
//! accumulator, elastic limit parameters and the per-account /
//! chain-wide resource rows.
//!
//! All arithmetic is integer-only. Averages are extracted with ceiling
//! division so that metering never systematically under-bills.

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::name::Name;

/// Fixed-point scale for windowed usage averages.
pub const RATE_LIMITING_PRECISION: u64 = 1_000_000;

/// `ceil(a / b)` in 128-bit space.
pub fn integer_divide_ceil(a: u128, b: u128) -> u128 {
    (a + b - 1) / b
}

/// An integral ratio; multiplication truncates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratio {
    pub numerator: u64,
    pub denominator: u64,
}

impl Ratio {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Ratio { numerator, denominator }
    }

    pub fn apply(&self, value: u64) -> u64 {
        ((value as u128 * self.numerator as u128) / self.denominator as u128) as u64
    }
}

/// Congestion-responsive limit parameters for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticLimitParams {
    /// Desired usage per window; above it the resource is congested.
    pub target: u64,
    /// Hard per-block maximum.
    pub max: u64,
    /// Number of aggregation periods contributing to the average.
    pub periods: u32,
    /// How far the virtual limit may oversell `max` when uncongested.
    pub max_multiplier: u32,
    /// Shrink rate while congested.
    pub contract_rate: Ratio,
    /// Grow rate while uncongested.
    pub expand_rate: Ratio,
}

impl ElasticLimitParams {
    /// Reject parameter combinations that would divide by zero later.
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.periods == 0 {
            return Err(ResourceError::InvalidLimitParameters(
                "'periods' cannot be zero",
            ));
        }
        if self.contract_rate.denominator == 0 {
            return Err(ResourceError::InvalidLimitParameters(
                "'contract_rate' is not a well-defined ratio",
            ));
        }
        if self.expand_rate.denominator == 0 {
            return Err(ResourceError::InvalidLimitParameters(
                "'expand_rate' is not a well-defined ratio",
            ));
        }
        Ok(())
    }
}

/// Shrink a congested limit, grow an uncongested one, clamp to
/// `[max, max * max_multiplier]`.
pub fn update_elastic_limit(current_limit: u64, average_usage: u64, params: &ElasticLimitParams) -> u64 {
    let result = if average_usage > params.target {
        params.contract_rate.apply(current_limit)
    } else {
        params.expand_rate.apply(current_limit)
    };
    result
        .max(params.max)
        .min(params.max.saturating_mul(params.max_multiplier as u64))
}

/// Exponential moving average over a configurable ordinal window, held
/// as a fixed-point integer (`value_ex` is scaled by
/// [`RATE_LIMITING_PRECISION`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAccumulator {
    /// Ordinal of the most recent sample.
    pub last_ordinal: u32,
    /// Average + pending usage at fixed-point scale.
    pub value_ex: u64,
    /// Total units consumed in the current window.
    pub consumed: u64,
}

impl UsageAccumulator {
    /// The windowed average in natural units (rounded up).
    pub fn average(&self) -> u64 {
        integer_divide_ceil(self.value_ex as u128, RATE_LIMITING_PRECISION as u128) as u64
    }

    /// Fold a sample into the window.
    ///
    /// A gap of `delta < window_size` ordinals decays the previous value
    /// by `(window_size - delta) / window_size`; a gap of `window_size`
    /// or more resets the average to just this sample. Samples at or
    /// before the current ordinal accumulate into the open slot without
    /// rewinding it.
    pub fn add(&mut self, units: u64, ordinal: u32, window_size: u32) {
        if ordinal > self.last_ordinal {
            if (self.last_ordinal as u64) + (window_size as u64) > ordinal as u64 {
                let delta = (ordinal - self.last_ordinal) as u128;
                let decayed =
                    self.value_ex as u128 * (window_size as u128 - delta) / window_size as u128;
                self.value_ex = decayed as u64;
            } else {
                self.value_ex = 0;
            }
            self.last_ordinal = ordinal;
            self.consumed = self.average();
        }
        self.consumed = self.consumed.saturating_add(units);
        self.value_ex = self.value_ex.saturating_add(integer_divide_ceil(
            units as u128 * RATE_LIMITING_PRECISION as u128,
            window_size as u128,
        ) as u64);
    }
}

/// Per-account resource allowances. `-1` means unlimited.
///
/// One "actual" row per account plus an optional "pending" shadow row
/// that is folded into the actual row at the block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub owner: Name,
    pub pending: bool,
    pub ram_bytes: i64,
    pub net_weight: i64,
    pub cpu_weight: i64,
}

impl ResourceLimits {
    pub fn unlimited(owner: Name) -> Self {
        ResourceLimits {
            owner,
            pending: false,
            ram_bytes: -1,
            net_weight: -1,
            cpu_weight: -1,
        }
    }
}

/// Per-account usage row: windowed NET/CPU plus exact RAM bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub owner: Name,
    pub net_usage: UsageAccumulator,
    pub cpu_usage: UsageAccumulator,
    pub ram_usage: u64,
}

impl ResourceUsage {
    pub fn new(owner: Name) -> Self {
        ResourceUsage { owner, ..Default::default() }
    }
}

/// Chain-wide (or per-shard) elastic limit state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsState {
    pub average_block_net_usage: UsageAccumulator,
    pub average_block_cpu_usage: UsageAccumulator,
    pub pending_net_usage: u64,
    pub pending_cpu_usage: u64,
    pub total_net_weight: u64,
    pub total_cpu_weight: u64,
    pub total_ram_bytes: u64,
    pub virtual_net_limit: u64,
    pub virtual_cpu_limit: u64,
}

impl ResourceLimitsState {
    pub fn update_virtual_cpu_limit(&mut self, config: &ResourceLimitsConfig) {
        self.virtual_cpu_limit = update_elastic_limit(
            self.virtual_cpu_limit,
            self.average_block_cpu_usage.average(),
            &config.cpu_limit_parameters,
        );
    }

    pub fn update_virtual_net_limit(&mut self, config: &ResourceLimitsConfig) {
        self.virtual_net_limit = update_elastic_limit(
            self.virtual_net_limit,
            self.average_block_net_usage.average(),
            &config.net_limit_parameters,
        );
    }
}

/// Chain-wide metering configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    pub cpu_limit_parameters: ElasticLimitParams,
    pub net_limit_parameters: ElasticLimitParams,
    /// Account usage windows, in block ordinals.
    pub account_cpu_usage_average_window: u32,
    pub account_net_usage_average_window: u32,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        ResourceLimitsConfig {
            cpu_limit_parameters: ElasticLimitParams {
                target: crate::config::DEFAULT_MAX_BLOCK_CPU_USAGE / 10,
                max: crate::config::DEFAULT_MAX_BLOCK_CPU_USAGE,
                periods: crate::config::BLOCK_CPU_USAGE_AVERAGE_WINDOW,
                max_multiplier: crate::config::MAX_ELASTIC_RESOURCE_MULTIPLIER,
                contract_rate: Ratio::new(99, 100),
                expand_rate: Ratio::new(1000, 999),
            },
            net_limit_parameters: ElasticLimitParams {
                target: crate::config::DEFAULT_MAX_BLOCK_NET_USAGE / 10,
                max: crate::config::DEFAULT_MAX_BLOCK_NET_USAGE,
                periods: crate::config::BLOCK_NET_USAGE_AVERAGE_WINDOW,
                max_multiplier: crate::config::MAX_ELASTIC_RESOURCE_MULTIPLIER,
                contract_rate: Ratio::new(99, 100),
                expand_rate: Ratio::new(1000, 999),
            },
            account_cpu_usage_average_window: crate::config::ACCOUNT_USAGE_AVERAGE_WINDOW,
            account_net_usage_average_window: crate::config::ACCOUNT_USAGE_AVERAGE_WINDOW,
        }
    }
}

/// Result row of the `get_account_*_limit_ex` queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResourceLimit {
    /// Quantity used in the current window.
    pub used: i64,
    /// Quantity still available under the fractional reserve.
    pub available: i64,
    /// Max per window under current congestion.
    pub max: i64,
    /// Ordinal of the last usage update.
    pub last_usage_update_time: u32,
    /// Usage projected to the caller-supplied current time.
    pub current_used: i64,
}

impl AccountResourceLimit {
    /// The "unlimited" marker row.
    pub fn unlimited(last_usage_update_time: u32) -> Self {
        AccountResourceLimit {
            used: -1,
            available: -1,
            max: -1,
            last_usage_update_time,
            current_used: -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target: u64, max: u64) -> ElasticLimitParams {
        ElasticLimitParams {
            target,
            max,
            periods: 120,
            max_multiplier: 1000,
            contract_rate: Ratio::new(99, 100),
            expand_rate: Ratio::new(1000, 999),
        }
    }

    // ── UsageAccumulator ──

    #[test]
    fn test_accumulator_first_sample() {
        let mut acc = UsageAccumulator::default();
        acc.add(100, 1, 10);
        assert_eq!(acc.last_ordinal, 1);
        assert_eq!(acc.average(), 10); // 100 spread over a 10-slot window
    }

    #[test]
    fn test_accumulator_ceiling_bias() {
        // One unit over a huge window still registers a nonzero average.
        let mut acc = UsageAccumulator::default();
        acc.add(1, 1, 172_800);
        assert!(acc.value_ex > 0);
        assert_eq!(acc.average(), 1);
    }

    #[test]
    fn test_accumulator_decays_toward_zero() {
        let mut acc = UsageAccumulator::default();
        acc.add(1000, 1, 10);
        let initial = acc.value_ex;
        acc.add(0, 6, 10); // half the window elapsed
        assert!(acc.value_ex < initial);
        assert!(acc.value_ex > 0);
    }

    #[test]
    fn test_accumulator_resets_after_full_window() {
        let mut acc = UsageAccumulator::default();
        acc.add(1000, 1, 10);
        acc.add(0, 11, 10); // >= window elapsed
        assert_eq!(acc.value_ex, 0);
        assert_eq!(acc.average(), 0);
    }

    #[test]
    fn test_accumulator_same_ordinal_accumulates() {
        let mut acc = UsageAccumulator::default();
        acc.add(50, 3, 10);
        acc.add(50, 3, 10);
        assert_eq!(acc.consumed, 100);
        assert_eq!(acc.average(), 10);
    }

    #[test]
    fn test_accumulator_consumed_resets_on_new_ordinal() {
        let mut acc = UsageAccumulator::default();
        acc.add(100, 1, 10); // value_ex = 10_000_000, consumed = 100
        acc.add(5, 2, 10); // decayed value_ex = 9_000_000, consumed = 9 + 5
        assert_eq!(acc.consumed, 14);
        assert_eq!(acc.last_ordinal, 2);
    }

    // ── Elastic limit ──

    #[test]
    fn test_elastic_contracts_under_congestion() {
        let p = params(100, 1000);
        let next = update_elastic_limit(10_000, 500, &p);
        assert_eq!(next, 9_900); // * 99/100
    }

    #[test]
    fn test_elastic_expands_when_idle() {
        let p = params(100, 1000);
        let next = update_elastic_limit(10_000, 50, &p);
        assert_eq!(next, 10_010); // * 1000/999
    }

    #[test]
    fn test_elastic_clamps_to_max() {
        let p = params(100, 1000);
        let next = update_elastic_limit(1000, 500, &p);
        assert_eq!(next, 1000); // cannot contract below max
    }

    #[test]
    fn test_elastic_clamps_to_max_multiplier() {
        let p = params(100, 1000);
        let ceiling = 1000 * 1000;
        let next = update_elastic_limit(ceiling, 50, &p);
        assert_eq!(next, ceiling);
    }

    #[test]
    fn test_sustained_congestion_monotonically_contracts() {
        let p = params(100, 1000);
        let mut limit = 500_000;
        for _ in 0..50 {
            let next = update_elastic_limit(limit, 500, &p);
            assert!(next <= limit);
            assert!(next >= p.max);
            limit = next;
        }
    }

    // ── Parameter validation ──

    #[test]
    fn test_validate_rejects_zero_periods() {
        let mut p = params(100, 1000);
        p.periods = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_denominator() {
        let mut p = params(100, 1000);
        p.contract_rate = Ratio::new(99, 0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = ResourceLimitsConfig::default();
        assert!(cfg.cpu_limit_parameters.validate().is_ok());
        assert!(cfg.net_limit_parameters.validate().is_ok());
        assert!(cfg.cpu_limit_parameters.target < cfg.cpu_limit_parameters.max);
    }
}
