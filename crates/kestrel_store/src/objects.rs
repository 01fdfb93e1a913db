//! Row types hosted by the versioned store.

use serde::{Deserialize, Serialize};

use kestrel_common::config;
use kestrel_common::name::Name;
use kestrel_common::softfloat::{SoftF128, SoftF64, U256};

use crate::store::{SecondaryIndexStore, VersionedStore};

/// Identity of one table within one store.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TableId(pub u64);

/// Store-scoped durable row identity. Monotone per store; never reused,
/// so a stale cursor can always be detected by an id mismatch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowId(pub u64);

/// Table object: (code, scope, table) identity plus payer and live row
/// count. Created lazily on first insert, removed when the count drops
/// to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: TableId,
    pub code: Name,
    pub scope: Name,
    pub table: Name,
    pub payer: Name,
    pub count: u32,
}

/// Primary row: opaque byte payload keyed by (table, primary key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRow {
    pub id: RowId,
    pub table: TableId,
    pub primary_key: u64,
    pub payer: Name,
    pub value: Vec<u8>,
}

/// Secondary-index row for key type `K`: resolvable both by
/// (table, primary) and by (table, secondary, primary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryRow<K> {
    pub id: RowId,
    pub table: TableId,
    pub primary_key: u64,
    pub payer: Name,
    pub secondary_key: K,
}

/// Shard registry row kept in the shared store; records that a shard
/// store exists and must be reopened on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRegistryEntry {
    pub name: Name,
    /// Requested store size in bytes; a sizing hint for reopening.
    pub size: u64,
}

/// A secondary key type the store maintains an ordered index family for.
///
/// One implementation per key type selects the matching index family on
/// the store (the monomorphized rendering of a per-type template) and
/// carries that family's deterministic billable row size.
pub trait SecondaryKey: Ord + Copy + Clone + std::fmt::Debug + 'static {
    /// Billable bytes per row of this index family.
    const BILLABLE_SIZE: u64;
    /// Family tag used in observer events.
    const FAMILY: &'static str;
    /// Least key under this type's deterministic order; range-scan floor.
    const MIN: Self;

    fn family(store: &VersionedStore) -> &SecondaryIndexStore<Self>;
    fn family_mut(store: &mut VersionedStore) -> &mut SecondaryIndexStore<Self>;
}

impl SecondaryKey for u64 {
    const BILLABLE_SIZE: u64 = config::BILLABLE_SIZE_INDEX64;
    const FAMILY: &'static str = "idx64";
    const MIN: Self = 0;

    fn family(store: &VersionedStore) -> &SecondaryIndexStore<Self> {
        &store.idx64
    }
    fn family_mut(store: &mut VersionedStore) -> &mut SecondaryIndexStore<Self> {
        &mut store.idx64
    }
}

impl SecondaryKey for u128 {
    const BILLABLE_SIZE: u64 = config::BILLABLE_SIZE_INDEX128;
    const FAMILY: &'static str = "idx128";
    const MIN: Self = 0;

    fn family(store: &VersionedStore) -> &SecondaryIndexStore<Self> {
        &store.idx128
    }
    fn family_mut(store: &mut VersionedStore) -> &mut SecondaryIndexStore<Self> {
        &mut store.idx128
    }
}

impl SecondaryKey for U256 {
    const BILLABLE_SIZE: u64 = config::BILLABLE_SIZE_INDEX256;
    const FAMILY: &'static str = "idx256";
    const MIN: Self = U256::MIN;

    fn family(store: &VersionedStore) -> &SecondaryIndexStore<Self> {
        &store.idx256
    }
    fn family_mut(store: &mut VersionedStore) -> &mut SecondaryIndexStore<Self> {
        &mut store.idx256
    }
}

impl SecondaryKey for SoftF64 {
    const BILLABLE_SIZE: u64 = config::BILLABLE_SIZE_INDEX_F64;
    const FAMILY: &'static str = "idx_double";
    const MIN: Self = SoftF64::from_bits(u64::MAX);

    fn family(store: &VersionedStore) -> &SecondaryIndexStore<Self> {
        &store.idx_double
    }
    fn family_mut(store: &mut VersionedStore) -> &mut SecondaryIndexStore<Self> {
        &mut store.idx_double
    }
}

impl SecondaryKey for SoftF128 {
    const BILLABLE_SIZE: u64 = config::BILLABLE_SIZE_INDEX_F128;
    const FAMILY: &'static str = "idx_long_double";
    const MIN: Self = SoftF128::from_bits(u128::MAX);

    fn family(store: &VersionedStore) -> &SecondaryIndexStore<Self> {
        &store.idx_long_double
    }
    fn family_mut(store: &mut VersionedStore) -> &mut SecondaryIndexStore<Self> {
        &mut store.idx_long_double
    }
}
