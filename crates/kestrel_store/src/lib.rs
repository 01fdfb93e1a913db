//! Versioned multi-index table store with nested reversible undo
//! sessions. One instance per {main, shared, each shard}.

pub mod objects;
pub mod session;
pub mod store;
pub mod versioned;

pub use objects::{
    KvRow, RowId, SecondaryKey, SecondaryRow, ShardRegistryEntry, TableId, TableMeta,
};
pub use session::{store_handle, StoreHandle, StoreSession};
pub use store::{SecondaryIndexStore, VersionedStore};
