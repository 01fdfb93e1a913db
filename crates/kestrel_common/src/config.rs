//! Chain-level constants and the deserializable state-layer configuration.
//!
//! The billable-size model is part of consensus: every node must charge
//! identical RAM for identical rows, so the per-row overheads below are
//! fixed constants, not tunables.

use serde::{Deserialize, Serialize};

use crate::resource::ResourceLimitsConfig;

/// Block interval in milliseconds; ordinals are counted in blocks.
pub const BLOCK_INTERVAL_MS: u64 = 500;

/// Hard per-block CPU budget in microseconds.
pub const DEFAULT_MAX_BLOCK_CPU_USAGE: u64 = 200_000;
/// Hard per-block NET budget in bytes.
pub const DEFAULT_MAX_BLOCK_NET_USAGE: u64 = 1024 * 1024;

/// Block usage averaging windows: one minute of blocks.
pub const BLOCK_CPU_USAGE_AVERAGE_WINDOW: u32 = (60_000 / BLOCK_INTERVAL_MS) as u32;
pub const BLOCK_NET_USAGE_AVERAGE_WINDOW: u32 = (60_000 / BLOCK_INTERVAL_MS) as u32;

/// Account usage averaging window: one day of blocks.
pub const ACCOUNT_USAGE_AVERAGE_WINDOW: u32 = (24 * 3600 * 1000 / BLOCK_INTERVAL_MS) as u32;

/// Upper bound on how far a virtual limit may oversell the block maximum.
pub const MAX_ELASTIC_RESOURCE_MULTIPLIER: u32 = 1000;

// ── Billable sizes ─────────────────────────────────────────────────────────

/// Bookkeeping overhead billed per row per index it participates in.
pub const OVERHEAD_PER_ROW_PER_INDEX: u64 = 32;

/// Table object: 44 bytes of fixed fields, 2 indexes (id; code/scope/table).
pub const BILLABLE_SIZE_TABLE: u64 = 44 + OVERHEAD_PER_ROW_PER_INDEX * 2;

/// Primary row: 44 bytes of fixed fields + value header, 2 indexes.
pub const BILLABLE_SIZE_PRIMARY_ROW: u64 = 32 + 8 + 4 + OVERHEAD_PER_ROW_PER_INDEX * 2;

/// Secondary rows: 24 bytes of fixed fields + key width, 3 indexes
/// (id; table/primary; table/secondary/primary).
pub const BILLABLE_SIZE_INDEX64: u64 = 24 + 8 + OVERHEAD_PER_ROW_PER_INDEX * 3;
pub const BILLABLE_SIZE_INDEX128: u64 = 24 + 16 + OVERHEAD_PER_ROW_PER_INDEX * 3;
pub const BILLABLE_SIZE_INDEX256: u64 = 24 + 32 + OVERHEAD_PER_ROW_PER_INDEX * 3;
pub const BILLABLE_SIZE_INDEX_F64: u64 = 24 + 8 + OVERHEAD_PER_ROW_PER_INDEX * 3;
pub const BILLABLE_SIZE_INDEX_F128: u64 = 24 + 16 + OVERHEAD_PER_ROW_PER_INDEX * 3;

/// Rows in the cross-shard shared store are replicated to every shard,
/// so every billed byte there costs a multiple of a private-store byte.
pub const DEFAULT_SHARED_BYTES_MULTIPLIER: u64 = 2;

/// State-layer configuration an embedding node deserializes from its
/// config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLayerConfig {
    /// Elastic limit parameters and account windows.
    #[serde(default)]
    pub resource: ResourceLimitsConfig,
    /// RAM multiplier applied to rows stored in the shared store.
    #[serde(default = "default_shared_bytes_multiplier")]
    pub shared_bytes_multiplier: u64,
    /// File name of the shard catalog inside the state directory.
    #[serde(default = "default_shard_catalog_file")]
    pub shard_catalog_file: String,
}

fn default_shared_bytes_multiplier() -> u64 {
    DEFAULT_SHARED_BYTES_MULTIPLIER
}

fn default_shard_catalog_file() -> String {
    "shards.dat".to_string()
}

impl Default for StateLayerConfig {
    fn default() -> Self {
        StateLayerConfig {
            resource: ResourceLimitsConfig::default(),
            shared_bytes_multiplier: DEFAULT_SHARED_BYTES_MULTIPLIER,
            shard_catalog_file: default_shard_catalog_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billable_sizes() {
        assert_eq!(BILLABLE_SIZE_TABLE, 108);
        assert_eq!(BILLABLE_SIZE_PRIMARY_ROW, 108);
        assert_eq!(BILLABLE_SIZE_INDEX64, 128);
        assert_eq!(BILLABLE_SIZE_INDEX128, 136);
        assert_eq!(BILLABLE_SIZE_INDEX256, 152);
    }

    #[test]
    fn test_windows_derive_from_block_interval() {
        assert_eq!(BLOCK_CPU_USAGE_AVERAGE_WINDOW, 120);
        assert_eq!(ACCOUNT_USAGE_AVERAGE_WINDOW, 172_800);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: StateLayerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.shared_bytes_multiplier, DEFAULT_SHARED_BYTES_MULTIPLIER);
        assert_eq!(cfg.shard_catalog_file, "shards.dat");
        assert!(cfg.resource.cpu_limit_parameters.validate().is_ok());
    }
}
