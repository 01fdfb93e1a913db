//! Multi-store transaction coordination: the main store, the cross-shard
//! shared store and N per-shard stores kept consistent under rollback,
//! plus the shard catalog bootstrap file.

pub mod catalog;
pub mod manager;

pub use catalog::{
    read_catalog, write_catalog, ShardCatalog, SHARD_CATALOG_MAGIC, SHARD_CATALOG_VERSION,
};
pub use manager::{AggregateSession, DatabaseManager};
