//! The versioned multi-index table store.
//!
//! One `VersionedStore` instance backs the main store, the cross-shard
//! shared store, and each per-shard store. It hosts every typed row
//! family of the state layer: contract tables and rows, the five
//! secondary-index families, resource accounting rows and the shard
//! registry, under a single nested undo-session stack, so that one
//! session rolls back every family consistently.
//!
//! # Undo model
//!
//! `begin_undo_session` pushes one undo layer on every member container
//! and bumps the store revision. The layer is resolved exactly once:
//! `push` keeps it for a later `commit`, `squash` folds it into the
//! enclosing layer, `undo` rolls it back. Sessions must resolve in
//! last-in-first-out order; out-of-order resolution is rejected rather
//! than silently corrupting the delta chain.

use std::ops::Bound;

use kestrel_common::error::StoreError;
use kestrel_common::name::Name;
use kestrel_common::resource::{
    ResourceLimits, ResourceLimitsConfig, ResourceLimitsState, ResourceUsage,
};
use tracing::debug;

use crate::objects::{
    KvRow, RowId, SecondaryKey, SecondaryRow, ShardRegistryEntry, TableId, TableMeta,
};
use crate::versioned::{Layered, VersionedCell, VersionedMap};

/// One secondary-index family: rows addressable by (table, primary) and
/// ordered by (table, secondary, primary).
#[derive(Debug, Clone)]
pub struct SecondaryIndexStore<K: Ord + Clone> {
    pub(crate) by_primary: VersionedMap<(TableId, u64), SecondaryRow<K>>,
    pub(crate) by_secondary: VersionedMap<(TableId, K, u64), RowId>,
}

impl<K: Ord + Clone> Default for SecondaryIndexStore<K> {
    fn default() -> Self {
        SecondaryIndexStore {
            by_primary: VersionedMap::new(),
            by_secondary: VersionedMap::new(),
        }
    }
}

impl<K: Ord + Clone> Layered for SecondaryIndexStore<K> {
    fn push_layer(&mut self) {
        self.by_primary.push_layer();
        self.by_secondary.push_layer();
    }
    fn undo_layer(&mut self) {
        self.by_primary.undo_layer();
        self.by_secondary.undo_layer();
    }
    fn squash_layer(&mut self) {
        self.by_primary.squash_layer();
        self.by_secondary.squash_layer();
    }
    fn commit_layers(&mut self, n: usize) {
        self.by_primary.commit_layers(n);
        self.by_secondary.commit_layers(n);
    }
    fn layer_count(&self) -> usize {
        self.by_primary.layer_count()
    }
}

/// A single versioned state store.
#[derive(Debug)]
pub struct VersionedStore {
    name: Name,
    /// Static open mode; never changes for the store's lifetime.
    read_only: bool,
    /// Dynamic guard toggled by the embedding application.
    read_only_mode: bool,
    revision: u64,
    /// Revision of each undo layer, bottom to top.
    layer_revisions: Vec<u64>,
    /// Revisions of sessions whose handle is still alive (not yet
    /// pushed, squashed or undone), bottom to top.
    live_sessions: Vec<u64>,

    next_table_id: VersionedCell<u64>,
    next_row_id: VersionedCell<u64>,

    table_ids: VersionedMap<(Name, Name, Name), TableId>,
    tables: VersionedMap<TableId, TableMeta>,
    kv: VersionedMap<(TableId, u64), KvRow>,

    pub(crate) idx64: SecondaryIndexStore<u64>,
    pub(crate) idx128: SecondaryIndexStore<u128>,
    pub(crate) idx256: SecondaryIndexStore<kestrel_common::softfloat::U256>,
    pub(crate) idx_double: SecondaryIndexStore<kestrel_common::softfloat::SoftF64>,
    pub(crate) idx_long_double: SecondaryIndexStore<kestrel_common::softfloat::SoftF128>,

    res_usage: VersionedMap<Name, ResourceUsage>,
    res_limits: VersionedMap<(bool, Name), ResourceLimits>,
    res_state: VersionedCell<Option<ResourceLimitsState>>,
    res_config: VersionedCell<Option<ResourceLimitsConfig>>,

    shard_registry: VersionedMap<Name, ShardRegistryEntry>,
}

impl VersionedStore {
    pub fn new(name: Name) -> Self {
        VersionedStore {
            name,
            read_only: false,
            read_only_mode: false,
            revision: 0,
            layer_revisions: Vec::new(),
            live_sessions: Vec::new(),
            next_table_id: VersionedCell::new(0),
            next_row_id: VersionedCell::new(0),
            table_ids: VersionedMap::new(),
            tables: VersionedMap::new(),
            kv: VersionedMap::new(),
            idx64: SecondaryIndexStore::default(),
            idx128: SecondaryIndexStore::default(),
            idx256: SecondaryIndexStore::default(),
            idx_double: SecondaryIndexStore::default(),
            idx_long_double: SecondaryIndexStore::default(),
            res_usage: VersionedMap::new(),
            res_limits: VersionedMap::new(),
            res_state: VersionedCell::new(None),
            res_config: VersionedCell::new(None),
            shard_registry: VersionedMap::new(),
        }
    }

    pub fn open_read_only(name: Name) -> Self {
        let mut store = Self::new(name);
        store.read_only = true;
        store.read_only_mode = true;
        store
    }

    pub fn name(&self) -> Name {
        self.name
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only || self.read_only_mode
    }

    pub fn set_read_only_mode(&mut self) {
        self.read_only_mode = true;
    }

    pub fn unset_read_only_mode(&mut self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly("unset read_only_mode"));
        }
        self.read_only_mode = false;
        Ok(())
    }

    fn check_writable(&self, op: &'static str) -> Result<(), StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly(op));
        }
        Ok(())
    }

    /// Every undo-layered member, in a fixed order.
    fn members(&mut self) -> [&mut dyn Layered; 15] {
        [
            &mut self.next_table_id,
            &mut self.next_row_id,
            &mut self.table_ids,
            &mut self.tables,
            &mut self.kv,
            &mut self.idx64,
            &mut self.idx128,
            &mut self.idx256,
            &mut self.idx_double,
            &mut self.idx_long_double,
            &mut self.res_usage,
            &mut self.res_limits,
            &mut self.res_state,
            &mut self.res_config,
            &mut self.shard_registry,
        ]
    }

    // ── Undo sessions ──────────────────────────────────────────────────────

    /// Open a nested undo session; returns the session revision.
    pub fn begin_undo_session(&mut self) -> Result<u64, StoreError> {
        self.check_writable("start_undo_session")?;
        self.revision += 1;
        let revision = self.revision;
        for m in self.members() {
            m.push_layer();
        }
        self.layer_revisions.push(revision);
        self.live_sessions.push(revision);
        debug!(store = %self.name, revision, "undo session started");
        Ok(revision)
    }

    fn expect_top_live(&self, revision: u64) -> Result<(), StoreError> {
        match self.live_sessions.last() {
            Some(&top) if top == revision => Ok(()),
            Some(&top) => Err(StoreError::SessionOrderViolation { expected: top, got: revision }),
            None => Err(StoreError::NoActiveSession),
        }
    }

    /// Detach the session, leaving its layer on the stack for a later
    /// `commit` (or a manager-level `undo`/`squash`).
    pub fn session_push(&mut self, revision: u64) -> Result<(), StoreError> {
        self.expect_top_live(revision)?;
        self.live_sessions.pop();
        Ok(())
    }

    /// Roll the session's layer back.
    pub fn session_undo(&mut self, revision: u64) -> Result<(), StoreError> {
        self.expect_top_live(revision)?;
        self.live_sessions.pop();
        self.undo_top()
    }

    /// Fold the session's layer into the enclosing one.
    pub fn session_squash(&mut self, revision: u64) -> Result<(), StoreError> {
        self.expect_top_live(revision)?;
        self.live_sessions.pop();
        self.squash_top()
    }

    fn undo_top(&mut self) -> Result<(), StoreError> {
        let revision = self.layer_revisions.pop().ok_or(StoreError::NoActiveSession)?;
        for m in self.members() {
            m.undo_layer();
        }
        self.revision -= 1;
        debug!(store = %self.name, revision, "undo session rolled back");
        Ok(())
    }

    fn squash_top(&mut self) -> Result<(), StoreError> {
        if self.layer_revisions.pop().is_none() {
            return Err(StoreError::NoActiveSession);
        }
        for m in self.members() {
            m.squash_layer();
        }
        self.revision -= 1;
        Ok(())
    }

    fn check_top_not_live(&self) -> Result<(), StoreError> {
        if let (Some(&live), Some(&layer)) =
            (self.live_sessions.last(), self.layer_revisions.last())
        {
            if live == layer {
                return Err(StoreError::SessionOrderViolation { expected: live, got: layer });
            }
        }
        Ok(())
    }

    /// Undo the most recent pending layer (one whose session has been
    /// pushed). Rejects the call while a live session owns the top layer.
    pub fn undo(&mut self) -> Result<(), StoreError> {
        self.check_writable("undo")?;
        self.check_top_not_live()?;
        self.undo_top()
    }

    /// Squash the two most recent pending layers.
    pub fn squash(&mut self) -> Result<(), StoreError> {
        self.check_writable("squash")?;
        self.check_top_not_live()?;
        self.squash_top()
    }

    /// Make every layer at or below `revision` permanent.
    pub fn commit(&mut self, revision: u64) -> Result<(), StoreError> {
        self.check_writable("commit")?;
        if let Some(&live) = self.live_sessions.first() {
            if live <= revision {
                return Err(StoreError::SessionOrderViolation { expected: live, got: revision });
            }
        }
        let n = self.layer_revisions.iter().take_while(|&&r| r <= revision).count();
        if n > 0 {
            self.layer_revisions.drain(..n);
            for m in self.members() {
                m.commit_layers(n);
            }
            debug!(store = %self.name, revision, layers = n, "layers committed");
        }
        Ok(())
    }

    /// Roll back every pending layer.
    pub fn undo_all(&mut self) -> Result<(), StoreError> {
        self.check_writable("undo_all")?;
        if let Some(&live) = self.live_sessions.last() {
            return Err(StoreError::SessionOrderViolation { expected: live, got: 0 });
        }
        while !self.layer_revisions.is_empty() {
            self.undo_top()?;
        }
        Ok(())
    }

    /// Force the revision counter; only legal with no pending layers.
    pub fn set_revision(&mut self, revision: u64) -> Result<(), StoreError> {
        self.check_writable("set_revision")?;
        if !self.layer_revisions.is_empty() {
            return Err(StoreError::NoActiveSession);
        }
        self.revision = revision;
        Ok(())
    }

    fn alloc_table_id(&mut self) -> TableId {
        let id = *self.next_table_id.get();
        self.next_table_id.set(id + 1);
        TableId(id)
    }

    fn alloc_row_id(&mut self) -> RowId {
        let id = *self.next_row_id.get();
        self.next_row_id.set(id + 1);
        RowId(id)
    }

    // ── Tables ─────────────────────────────────────────────────────────────

    pub fn find_table(&self, code: Name, scope: Name, table: Name) -> Option<&TableMeta> {
        let id = self.table_ids.get(&(code, scope, table))?;
        self.tables.get(id)
    }

    pub fn table_by_id(&self, id: TableId) -> Option<&TableMeta> {
        self.tables.get(&id)
    }

    pub fn create_table(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        payer: Name,
    ) -> Result<TableMeta, StoreError> {
        self.check_writable("create table")?;
        if self.table_ids.contains_key(&(code, scope, table)) {
            return Err(StoreError::DuplicateTable);
        }
        let id = self.alloc_table_id();
        let meta = TableMeta { id, code, scope, table, payer, count: 0 };
        self.table_ids.insert((code, scope, table), id);
        self.tables.insert(id, meta);
        Ok(meta)
    }

    /// Adjust a table's live row count; returns the new count.
    pub fn bump_table_count(&mut self, id: TableId, delta: i64) -> Result<u32, StoreError> {
        self.check_writable("modify table")?;
        let mut new_count = 0;
        let found = self.tables.modify(&id, |meta| {
            meta.count = (meta.count as i64 + delta) as u32;
            new_count = meta.count;
        });
        if !found {
            return Err(StoreError::TableNotFound);
        }
        Ok(new_count)
    }

    pub fn remove_table(&mut self, id: TableId) -> Result<TableMeta, StoreError> {
        self.check_writable("remove table")?;
        let meta = *self.tables.get(&id).ok_or(StoreError::TableNotFound)?;
        self.tables.remove(&id);
        self.table_ids.remove(&(meta.code, meta.scope, meta.table));
        Ok(meta)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.iter().map(|(_, meta)| meta)
    }

    // ── Primary rows ───────────────────────────────────────────────────────

    pub fn kv_find(&self, table: TableId, primary: u64) -> Option<&KvRow> {
        self.kv.get(&(table, primary))
    }

    pub fn kv_create(
        &mut self,
        table: TableId,
        primary: u64,
        payer: Name,
        value: Vec<u8>,
    ) -> Result<RowId, StoreError> {
        self.check_writable("create row")?;
        if self.kv.contains_key(&(table, primary)) {
            return Err(StoreError::DuplicateRow("primary key"));
        }
        let id = self.alloc_row_id();
        self.kv.insert((table, primary), KvRow { id, table, primary_key: primary, payer, value });
        Ok(id)
    }

    pub fn kv_modify(
        &mut self,
        table: TableId,
        primary: u64,
        payer: Name,
        value: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.check_writable("modify row")?;
        let found = self.kv.modify(&(table, primary), |row| {
            row.payer = payer;
            row.value = value;
        });
        if !found {
            return Err(StoreError::RowNotFound("primary key"));
        }
        Ok(())
    }

    pub fn kv_remove(&mut self, table: TableId, primary: u64) -> Result<KvRow, StoreError> {
        self.check_writable("remove row")?;
        self.kv.remove(&(table, primary)).ok_or(StoreError::RowNotFound("primary key"))
    }

    /// First row with primary key `>= primary`.
    pub fn kv_lower_bound(&self, table: TableId, primary: u64) -> Option<&KvRow> {
        self.kv
            .range((table, primary)..)
            .next()
            .filter(|(k, _)| k.0 == table)
            .map(|(_, row)| row)
    }

    /// First row with primary key `> primary`.
    pub fn kv_upper_bound(&self, table: TableId, primary: u64) -> Option<&KvRow> {
        self.kv
            .range((Bound::Excluded((table, primary)), Bound::Unbounded))
            .next()
            .filter(|(k, _)| k.0 == table)
            .map(|(_, row)| row)
    }

    /// Successor of (table, primary) within the table.
    pub fn kv_next(&self, table: TableId, primary: u64) -> Option<&KvRow> {
        self.kv_upper_bound(table, primary)
    }

    /// Predecessor of (table, primary) within the table.
    pub fn kv_prev(&self, table: TableId, primary: u64) -> Option<&KvRow> {
        self.kv
            .range(..(table, primary))
            .next_back()
            .filter(|(k, _)| k.0 == table)
            .map(|(_, row)| row)
    }

    /// Last row of the table in primary-key order.
    pub fn kv_last(&self, table: TableId) -> Option<&KvRow> {
        self.kv
            .range((table, 0)..=(table, u64::MAX))
            .next_back()
            .map(|(_, row)| row)
    }

    /// All primary rows in (table, primary) order; snapshot row walk.
    pub fn kv_rows(&self) -> impl Iterator<Item = &KvRow> {
        self.kv.iter().map(|(_, row)| row)
    }

    // ── Secondary rows ─────────────────────────────────────────────────────

    pub fn sec_find_by_primary<K: SecondaryKey>(
        &self,
        table: TableId,
        primary: u64,
    ) -> Option<&SecondaryRow<K>> {
        K::family(self).by_primary.get(&(table, primary))
    }

    /// First row with this exact secondary key (lowest primary).
    pub fn sec_find_by_secondary<K: SecondaryKey>(
        &self,
        table: TableId,
        key: K,
    ) -> Option<&SecondaryRow<K>> {
        let fam = K::family(self);
        let (&(t, _, primary), _) =
            fam.by_secondary.range((table, key, 0)..=(table, key, u64::MAX)).next()?;
        debug_assert_eq!(t, table);
        fam.by_primary.get(&(t, primary))
    }

    pub fn sec_create<K: SecondaryKey>(
        &mut self,
        table: TableId,
        primary: u64,
        payer: Name,
        key: K,
    ) -> Result<RowId, StoreError> {
        self.check_writable("create secondary row")?;
        if K::family(self).by_primary.contains_key(&(table, primary)) {
            return Err(StoreError::DuplicateRow("secondary index primary key"));
        }
        let id = self.alloc_row_id();
        let fam = K::family_mut(self);
        fam.by_primary.insert(
            (table, primary),
            SecondaryRow { id, table, primary_key: primary, payer, secondary_key: key },
        );
        fam.by_secondary.insert((table, key, primary), id);
        Ok(id)
    }

    pub fn sec_modify<K: SecondaryKey>(
        &mut self,
        table: TableId,
        primary: u64,
        payer: Name,
        key: K,
    ) -> Result<(), StoreError> {
        self.check_writable("modify secondary row")?;
        let fam = K::family_mut(self);
        let row = *fam
            .by_primary
            .get(&(table, primary))
            .ok_or(StoreError::RowNotFound("secondary index primary key"))?;
        if row.secondary_key != key {
            fam.by_secondary.remove(&(table, row.secondary_key, primary));
            fam.by_secondary.insert((table, key, primary), row.id);
        }
        fam.by_primary.modify(&(table, primary), |r| {
            r.secondary_key = key;
            r.payer = payer;
        });
        Ok(())
    }

    pub fn sec_remove<K: SecondaryKey>(
        &mut self,
        table: TableId,
        primary: u64,
    ) -> Result<SecondaryRow<K>, StoreError> {
        self.check_writable("remove secondary row")?;
        let fam = K::family_mut(self);
        let row = fam
            .by_primary
            .remove(&(table, primary))
            .ok_or(StoreError::RowNotFound("secondary index primary key"))?;
        fam.by_secondary.remove(&(table, row.secondary_key, primary));
        Ok(row)
    }

    /// First row with (secondary, primary) `>= (key, 0)`.
    pub fn sec_lower_bound<K: SecondaryKey>(
        &self,
        table: TableId,
        key: K,
    ) -> Option<&SecondaryRow<K>> {
        let fam = K::family(self);
        let (&(t, _, primary), _) = fam
            .by_secondary
            .range((table, key, 0)..)
            .next()
            .filter(|((t, _, _), _)| *t == table)?;
        fam.by_primary.get(&(t, primary))
    }

    /// First row with secondary key strictly greater than `key`.
    pub fn sec_upper_bound<K: SecondaryKey>(
        &self,
        table: TableId,
        key: K,
    ) -> Option<&SecondaryRow<K>> {
        let fam = K::family(self);
        let (&(t, _, primary), _) = fam
            .by_secondary
            .range((Bound::Excluded((table, key, u64::MAX)), Bound::Unbounded))
            .next()
            .filter(|((t, _, _), _)| *t == table)?;
        fam.by_primary.get(&(t, primary))
    }

    /// Successor in (secondary, primary) order within the table.
    pub fn sec_next<K: SecondaryKey>(
        &self,
        table: TableId,
        key: K,
        primary: u64,
    ) -> Option<&SecondaryRow<K>> {
        let fam = K::family(self);
        let (&(t, _, next_primary), _) = fam
            .by_secondary
            .range((Bound::Excluded((table, key, primary)), Bound::Unbounded))
            .next()
            .filter(|((t, _, _), _)| *t == table)?;
        fam.by_primary.get(&(t, next_primary))
    }

    /// Predecessor in (secondary, primary) order within the table.
    pub fn sec_prev<K: SecondaryKey>(
        &self,
        table: TableId,
        key: K,
        primary: u64,
    ) -> Option<&SecondaryRow<K>> {
        let fam = K::family(self);
        let (&(t, _, prev_primary), _) = fam
            .by_secondary
            .range(..(table, key, primary))
            .next_back()
            .filter(|((t, _, _), _)| *t == table)?;
        fam.by_primary.get(&(t, prev_primary))
    }

    /// Last row of the table in (secondary, primary) order.
    pub fn sec_last<K: SecondaryKey>(&self, table: TableId) -> Option<&SecondaryRow<K>> {
        let fam = K::family(self);
        let (&(t, _, primary), _) = fam
            .by_secondary
            .range((
                Bound::Included((table, K::MIN, 0)),
                Bound::Excluded((TableId(table.0 + 1), K::MIN, 0)),
            ))
            .next_back()?;
        fam.by_primary.get(&(t, primary))
    }

    /// First row with primary key `>= primary`, in primary-key order.
    pub fn sec_lower_bound_primary<K: SecondaryKey>(
        &self,
        table: TableId,
        primary: u64,
    ) -> Option<&SecondaryRow<K>> {
        K::family(self)
            .by_primary
            .range((table, primary)..)
            .next()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, row)| row)
    }

    /// First row with primary key `> primary`, in primary-key order.
    pub fn sec_upper_bound_primary<K: SecondaryKey>(
        &self,
        table: TableId,
        primary: u64,
    ) -> Option<&SecondaryRow<K>> {
        K::family(self)
            .by_primary
            .range((Bound::Excluded((table, primary)), Bound::Unbounded))
            .next()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, row)| row)
    }

    /// Predecessor in primary-key order within the table.
    pub fn sec_prev_primary<K: SecondaryKey>(
        &self,
        table: TableId,
        primary: u64,
    ) -> Option<&SecondaryRow<K>> {
        K::family(self)
            .by_primary
            .range(..(table, primary))
            .next_back()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, row)| row)
    }

    /// Last row of the table in primary-key order.
    pub fn sec_last_primary<K: SecondaryKey>(&self, table: TableId) -> Option<&SecondaryRow<K>> {
        K::family(self)
            .by_primary
            .range((table, 0)..=(table, u64::MAX))
            .next_back()
            .map(|(_, row)| row)
    }

    /// All rows of one family in (table, primary) order; snapshot walk.
    pub fn sec_rows<K: SecondaryKey>(&self) -> impl Iterator<Item = &SecondaryRow<K>> {
        K::family(self).by_primary.iter().map(|(_, row)| row)
    }

    // ── Resource rows ──────────────────────────────────────────────────────

    pub fn usage(&self, owner: Name) -> Option<&ResourceUsage> {
        self.res_usage.get(&owner)
    }

    /// Fetch-or-create the usage row, then mutate it.
    pub fn modify_usage(
        &mut self,
        owner: Name,
        f: impl FnOnce(&mut ResourceUsage),
    ) -> Result<ResourceUsage, StoreError> {
        self.check_writable("modify usage")?;
        if !self.res_usage.contains_key(&owner) {
            self.res_usage.insert(owner, ResourceUsage::new(owner));
        }
        self.res_usage.modify(&owner, f);
        self.res_usage
            .get(&owner)
            .copied()
            .ok_or(StoreError::RowNotFound("resource usage owner"))
    }

    pub fn create_usage(&mut self, owner: Name) -> Result<(), StoreError> {
        self.check_writable("create usage")?;
        if self.res_usage.contains_key(&owner) {
            return Err(StoreError::DuplicateRow("resource usage owner"));
        }
        self.res_usage.insert(owner, ResourceUsage::new(owner));
        Ok(())
    }

    pub fn usage_rows(&self) -> impl Iterator<Item = &ResourceUsage> {
        self.res_usage.iter().map(|(_, row)| row)
    }

    pub fn limits(&self, pending: bool, owner: Name) -> Option<&ResourceLimits> {
        self.res_limits.get(&(pending, owner))
    }

    pub fn insert_limits(&mut self, row: ResourceLimits) -> Result<(), StoreError> {
        self.check_writable("insert limits")?;
        if self.res_limits.contains_key(&(row.pending, row.owner)) {
            return Err(StoreError::DuplicateRow("resource limits owner"));
        }
        self.res_limits.insert((row.pending, row.owner), row);
        Ok(())
    }

    pub fn modify_limits(
        &mut self,
        pending: bool,
        owner: Name,
        f: impl FnOnce(&mut ResourceLimits),
    ) -> Result<(), StoreError> {
        self.check_writable("modify limits")?;
        if !self.res_limits.modify(&(pending, owner), f) {
            return Err(StoreError::RowNotFound("resource limits owner"));
        }
        Ok(())
    }

    pub fn remove_limits(
        &mut self,
        pending: bool,
        owner: Name,
    ) -> Result<ResourceLimits, StoreError> {
        self.check_writable("remove limits")?;
        self.res_limits
            .remove(&(pending, owner))
            .ok_or(StoreError::RowNotFound("resource limits owner"))
    }

    /// Lowest-named pending limits row, if any.
    pub fn first_pending_limits(&self) -> Option<ResourceLimits> {
        self.res_limits
            .range((true, Name::empty())..)
            .next()
            .filter(|((pending, _), _)| *pending)
            .map(|(_, row)| *row)
    }

    pub fn limits_rows(&self) -> impl Iterator<Item = &ResourceLimits> {
        self.res_limits.iter().map(|(_, row)| row)
    }

    pub fn res_state(&self) -> Option<&ResourceLimitsState> {
        self.res_state.get().as_ref()
    }

    pub fn set_res_state(&mut self, state: ResourceLimitsState) -> Result<(), StoreError> {
        self.check_writable("set resource state")?;
        self.res_state.set(Some(state));
        Ok(())
    }

    pub fn modify_res_state(
        &mut self,
        f: impl FnOnce(&mut ResourceLimitsState),
    ) -> Result<(), StoreError> {
        self.check_writable("modify resource state")?;
        if self.res_state.get().is_none() {
            return Err(StoreError::MissingSingleton("resource limits state"));
        }
        self.res_state.modify(|slot| {
            if let Some(state) = slot.as_mut() {
                f(state);
            }
        });
        Ok(())
    }

    pub fn res_config(&self) -> Option<&ResourceLimitsConfig> {
        self.res_config.get().as_ref()
    }

    pub fn set_res_config(&mut self, config: ResourceLimitsConfig) -> Result<(), StoreError> {
        self.check_writable("set resource config")?;
        self.res_config.set(Some(config));
        Ok(())
    }

    // ── Shard registry ─────────────────────────────────────────────────────

    pub fn shard_entry(&self, name: Name) -> Option<&ShardRegistryEntry> {
        self.shard_registry.get(&name)
    }

    pub fn register_shard(&mut self, entry: ShardRegistryEntry) -> Result<(), StoreError> {
        self.check_writable("register shard")?;
        self.shard_registry.insert(entry.name, entry);
        Ok(())
    }

    pub fn shard_entries(&self) -> impl Iterator<Item = &ShardRegistryEntry> {
        self.shard_registry.iter().map(|(_, entry)| entry)
    }
}
