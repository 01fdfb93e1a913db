//! Contract-facing CRUD and cursor API.
//!
//! One `TableEngine` is constructed per execution call, bound to the
//! executing contract (`receiver`) and to the store it mutates: a
//! shard's private store, or the cross-shard shared store (where every
//! billed byte costs a configured multiple). Every billable mutation
//! flows through the resource manager and emits one observer event.
//!
//! All mutators require a non-read-only execution context. Failures are
//! synchronous, named and fail-fast: they abort the current contract
//! action only, and the enclosing undo session discards the partial
//! writes.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_common::config::{BILLABLE_SIZE_PRIMARY_ROW, BILLABLE_SIZE_TABLE};
use kestrel_common::error::{KestrelResult, TableError};
use kestrel_common::name::Name;
use kestrel_common::observer::{LedgerObserver, RamEvent, RamKind};
use kestrel_resource::ResourceLimitsManager;
use kestrel_store::{KvRow, SecondaryKey, SecondaryRow, StoreHandle, TableMeta, VersionedStore};
use tracing::debug;

use crate::cursor::{IteratorCache, RowRef};

pub struct TableEngine {
    store: StoreHandle,
    shared: StoreHandle,
    resources: Arc<ResourceLimitsManager>,
    observer: Arc<dyn LedgerObserver>,
    /// The contract whose code is currently executing.
    receiver: Name,
    read_only: bool,
    /// 1 for private stores; the shared-store replication multiplier
    /// otherwise.
    bytes_multiplier: u64,
    keyval_cache: IteratorCache,
    sec_caches: HashMap<&'static str, IteratorCache>,
}

impl TableEngine {
    /// Engine over a shard's private store.
    pub fn new(
        store: StoreHandle,
        shared: StoreHandle,
        resources: Arc<ResourceLimitsManager>,
        observer: Arc<dyn LedgerObserver>,
        receiver: Name,
        read_only: bool,
    ) -> Self {
        TableEngine {
            store,
            shared,
            resources,
            observer,
            receiver,
            read_only,
            bytes_multiplier: 1,
            keyval_cache: IteratorCache::new(),
            sec_caches: HashMap::new(),
        }
    }

    /// Engine over the cross-shard shared store. Rows there are
    /// replicated to every shard, so RAM bills at `bytes_multiplier`.
    pub fn for_shared_store(
        shared: StoreHandle,
        resources: Arc<ResourceLimitsManager>,
        observer: Arc<dyn LedgerObserver>,
        receiver: Name,
        read_only: bool,
        bytes_multiplier: u64,
    ) -> Self {
        TableEngine {
            store: shared.clone(),
            shared,
            resources,
            observer,
            receiver,
            read_only,
            bytes_multiplier,
            keyval_cache: IteratorCache::new(),
            sec_caches: HashMap::new(),
        }
    }

    pub fn receiver(&self) -> Name {
        self.receiver
    }

    fn check_mutable(&self, op: &'static str) -> Result<(), TableError> {
        if self.read_only {
            return Err(TableError::ReadOnlyViolation(op));
        }
        Ok(())
    }

    fn bill(&self, bytes: u64) -> u64 {
        bytes * self.bytes_multiplier
    }

    fn sec_cache<K: SecondaryKey>(&mut self) -> &mut IteratorCache {
        self.sec_caches.entry(K::FAMILY).or_default()
    }

    /// Bill or refund `delta` bytes to `payer` and emit the observer
    /// event. Positive deltas are verified against the payer's RAM
    /// allowance immediately.
    fn update_db_usage(
        &self,
        db: &mut VersionedStore,
        payer: Name,
        delta: i64,
        category: &'static str,
        kind: RamKind,
        tag: &'static str,
    ) -> KestrelResult<()> {
        self.observer.ram_delta(&RamEvent { category, kind, tag, payer, delta });
        self.resources.add_pending_ram_usage(payer, delta, db)?;
        if delta > 0 {
            if StoreHandle::ptr_eq(&self.store, &self.shared) {
                self.resources.verify_account_ram_usage(payer, db, db)?;
            } else {
                let shared = self.shared.read();
                self.resources.verify_account_ram_usage(payer, db, &shared)?;
            }
        }
        Ok(())
    }

    fn find_or_create_table(
        &self,
        db: &mut VersionedStore,
        scope: Name,
        table: Name,
        payer: Name,
    ) -> KestrelResult<TableMeta> {
        if let Some(meta) = db.find_table(self.receiver, scope, table) {
            return Ok(*meta);
        }
        self.update_db_usage(
            db,
            payer,
            self.bill(BILLABLE_SIZE_TABLE) as i64,
            "table",
            RamKind::Add,
            "create_table",
        )?;
        let meta = db.create_table(self.receiver, scope, table, payer)?;
        debug!(code = %self.receiver, %scope, %table, %payer, "table created");
        Ok(meta)
    }

    fn remove_table(&self, db: &mut VersionedStore, meta: &TableMeta) -> KestrelResult<()> {
        self.update_db_usage(
            db,
            meta.payer,
            -(self.bill(BILLABLE_SIZE_TABLE) as i64),
            "table",
            RamKind::Remove,
            "remove_table",
        )?;
        db.remove_table(meta.id)?;
        debug!(code = %meta.code, scope = %meta.scope, table = %meta.table, "empty table removed");
        Ok(())
    }

    fn check_access(&self, meta: &TableMeta) -> Result<(), TableError> {
        if meta.code != self.receiver {
            return Err(TableError::AccessViolation {
                owner: meta.code,
                receiver: self.receiver,
            });
        }
        Ok(())
    }

    /// Re-locate a primary row from its cursor record, proving the row
    /// is still the one the cursor was created for.
    fn deref_kv(&self, db: &VersionedStore, rref: RowRef) -> Result<KvRow, TableError> {
        db.kv_find(rref.table, rref.primary_key)
            .filter(|row| row.id == rref.row_id)
            .cloned()
            .ok_or(TableError::InvalidIterator("dereference of deleted object"))
    }

    fn deref_sec<K: SecondaryKey>(
        &self,
        db: &VersionedStore,
        rref: RowRef,
    ) -> Result<SecondaryRow<K>, TableError> {
        db.sec_find_by_primary::<K>(rref.table, rref.primary_key)
            .filter(|row| row.id == rref.row_id)
            .copied()
            .ok_or(TableError::InvalidIterator("dereference of deleted object"))
    }

    // ── Primary-index surface ──────────────────────────────────────────────

    /// Insert a row, creating the table on first use. Bills `payer` for
    /// the payload, the row overhead and (if created) the table
    /// overhead. Returns a cursor to the new row.
    pub fn store(
        &mut self,
        scope: Name,
        table: Name,
        payer: Name,
        primary: u64,
        value: &[u8],
    ) -> KestrelResult<i32> {
        self.check_mutable("store")?;
        if payer.is_empty() {
            return Err(TableError::InvalidPayer.into());
        }
        let store = self.store.clone();
        let mut db = store.write();
        let tab = self.find_or_create_table(&mut db, scope, table, payer)?;
        let row_id = db.kv_create(tab.id, primary, payer, value.to_vec())?;
        db.bump_table_count(tab.id, 1)?;
        let billable = self.bill(value.len() as u64 + BILLABLE_SIZE_PRIMARY_ROW) as i64;
        self.update_db_usage(&mut db, payer, billable, "table_row", RamKind::Add, "primary_index_add")?;
        drop(db);
        self.keyval_cache.cache_table(&tab);
        Ok(self.keyval_cache.add(RowRef { row_id, table: tab.id, primary_key: primary }))
    }

    /// Replace a row's payload (and possibly payer). A payer change
    /// refunds the old payer in full and charges the new payer in full;
    /// otherwise only the size delta moves.
    pub fn update(&mut self, iterator: i32, payer: Name, value: &[u8]) -> KestrelResult<()> {
        self.check_mutable("update")?;
        let rref = self.keyval_cache.get(iterator)?;
        let meta = *self.keyval_cache.get_table(rref.table)?;
        self.check_access(&meta)?;
        let store = self.store.clone();
        let mut db = store.write();
        let row = self.deref_kv(&db, rref)?;

        let overhead = self.bill(BILLABLE_SIZE_PRIMARY_ROW) as i64;
        let old_size = self.bill(row.value.len() as u64) as i64 + overhead;
        let new_size = self.bill(value.len() as u64) as i64 + overhead;
        let payer = if payer.is_empty() { row.payer } else { payer };

        if row.payer != payer {
            self.update_db_usage(
                &mut db,
                row.payer,
                -old_size,
                "table_row",
                RamKind::Remove,
                "primary_index_update_remove_old_payer",
            )?;
            self.update_db_usage(
                &mut db,
                payer,
                new_size,
                "table_row",
                RamKind::Add,
                "primary_index_update_add_new_payer",
            )?;
        } else if old_size != new_size {
            self.update_db_usage(
                &mut db,
                payer,
                new_size - old_size,
                "table_row",
                RamKind::Update,
                "primary_index_update",
            )?;
        }
        db.kv_modify(rref.table, rref.primary_key, payer, value.to_vec())?;
        Ok(())
    }

    /// Delete a row, refunding its billed size. Deletes the table when
    /// its last row goes. The cursor is invalidated immediately.
    pub fn remove(&mut self, iterator: i32) -> KestrelResult<()> {
        self.check_mutable("remove")?;
        let rref = self.keyval_cache.get(iterator)?;
        let meta = *self.keyval_cache.get_table(rref.table)?;
        self.check_access(&meta)?;
        let store = self.store.clone();
        let mut db = store.write();
        let row = self.deref_kv(&db, rref)?;

        let refund = self.bill(row.value.len() as u64 + BILLABLE_SIZE_PRIMARY_ROW) as i64;
        self.update_db_usage(
            &mut db,
            row.payer,
            -refund,
            "table_row",
            RamKind::Remove,
            "primary_index_remove",
        )?;
        let count = db.bump_table_count(rref.table, -1)?;
        db.kv_remove(rref.table, rref.primary_key)?;
        if count == 0 {
            self.remove_table(&mut db, &meta)?;
        }
        drop(db);
        self.keyval_cache.remove(iterator)?;
        Ok(())
    }

    /// Copy the row's payload. An empty buffer asks for the required
    /// length; otherwise up to `buffer.len()` bytes are copied and the
    /// copied length returned.
    pub fn get(&self, iterator: i32, buffer: &mut [u8]) -> KestrelResult<usize> {
        let rref = self.keyval_cache.get(iterator)?;
        let db = self.store.read();
        let row = self.deref_kv(&db, rref)?;
        if buffer.is_empty() {
            return Ok(row.value.len());
        }
        let copied = buffer.len().min(row.value.len());
        buffer[..copied].copy_from_slice(&row.value[..copied]);
        Ok(copied)
    }

    /// Cursor to the exact row, the table's end cursor if the row is
    /// absent, or -1 if the table does not exist.
    pub fn find(&mut self, code: Name, scope: Name, table: Name, primary: u64) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok(-1),
        };
        let end = self.keyval_cache.cache_table(&tab);
        match db.kv_find(tab.id, primary) {
            None => Ok(end),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: primary };
                Ok(self.keyval_cache.add(rref))
            }
        }
    }

    pub fn lowerbound(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        primary: u64,
    ) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok(-1),
        };
        let end = self.keyval_cache.cache_table(&tab);
        match db.kv_lower_bound(tab.id, primary) {
            None => Ok(end),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                Ok(self.keyval_cache.add(rref))
            }
        }
    }

    pub fn upperbound(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        primary: u64,
    ) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok(-1),
        };
        let end = self.keyval_cache.cache_table(&tab);
        match db.kv_upper_bound(tab.id, primary) {
            None => Ok(end),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                Ok(self.keyval_cache.add(rref))
            }
        }
    }

    /// The table's end cursor, or -1 if the table does not exist.
    pub fn end(&mut self, code: Name, scope: Name, table: Name) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        match db.find_table(code, scope, table) {
            None => Ok(-1),
            Some(meta) => {
                let meta = *meta;
                Ok(self.keyval_cache.cache_table(&meta))
            }
        }
    }

    /// Step forward; past the last row yields the table's end cursor.
    /// Stepping an end cursor yields -1.
    pub fn next(&mut self, iterator: i32) -> KestrelResult<(i32, Option<u64>)> {
        if iterator < -1 {
            return Ok((-1, None)); // cannot increment past end
        }
        let rref = self.keyval_cache.get(iterator)?;
        let store = self.store.clone();
        let db = store.read();
        match db.kv_next(rref.table, rref.primary_key) {
            Some(row) => {
                let next = RowRef { row_id: row.id, table: rref.table, primary_key: row.primary_key };
                let primary = row.primary_key;
                Ok((self.keyval_cache.add(next), Some(primary)))
            }
            None => Ok((self.keyval_cache.get_end_iterator_by_table_id(rref.table)?, None)),
        }
    }

    /// Step backward; from the end cursor yields the last row, before
    /// the first row (or on an empty table) yields -1.
    pub fn previous(&mut self, iterator: i32) -> KestrelResult<(i32, Option<u64>)> {
        let store = self.store.clone();
        let db = store.read();
        if iterator < -1 {
            let tab = *self.keyval_cache.find_table_by_end_iterator(iterator)?;
            return match db.kv_last(tab.id) {
                None => Ok((-1, None)), // empty table
                Some(row) => {
                    let rref =
                        RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                    let primary = row.primary_key;
                    Ok((self.keyval_cache.add(rref), Some(primary)))
                }
            };
        }
        let rref = self.keyval_cache.get(iterator)?;
        match db.kv_prev(rref.table, rref.primary_key) {
            None => Ok((-1, None)), // cannot decrement past beginning
            Some(row) => {
                let prev = RowRef { row_id: row.id, table: rref.table, primary_key: row.primary_key };
                let primary = row.primary_key;
                Ok((self.keyval_cache.add(prev), Some(primary)))
            }
        }
    }

    // ── Secondary-index surface (one instantiation per key type) ──────────

    pub fn store_secondary<K: SecondaryKey>(
        &mut self,
        scope: Name,
        table: Name,
        payer: Name,
        primary: u64,
        key: K,
    ) -> KestrelResult<i32> {
        self.check_mutable("store")?;
        if payer.is_empty() {
            return Err(TableError::InvalidPayer.into());
        }
        let store = self.store.clone();
        let mut db = store.write();
        let tab = self.find_or_create_table(&mut db, scope, table, payer)?;
        let row_id = db.sec_create::<K>(tab.id, primary, payer, key)?;
        db.bump_table_count(tab.id, 1)?;
        self.update_db_usage(
            &mut db,
            payer,
            self.bill(K::BILLABLE_SIZE) as i64,
            "secondary_index",
            RamKind::Add,
            "secondary_index_add",
        )?;
        drop(db);
        let cache = self.sec_cache::<K>();
        cache.cache_table(&tab);
        Ok(cache.add(RowRef { row_id, table: tab.id, primary_key: primary }))
    }

    pub fn update_secondary<K: SecondaryKey>(
        &mut self,
        iterator: i32,
        payer: Name,
        key: K,
    ) -> KestrelResult<()> {
        self.check_mutable("update")?;
        let rref = self.sec_cache::<K>().get(iterator)?;
        let meta = *self.sec_cache::<K>().get_table(rref.table)?;
        self.check_access(&meta)?;
        let store = self.store.clone();
        let mut db = store.write();
        let row = self.deref_sec::<K>(&db, rref)?;

        let payer = if payer.is_empty() { row.payer } else { payer };
        let size = self.bill(K::BILLABLE_SIZE) as i64;
        if row.payer != payer {
            self.update_db_usage(
                &mut db,
                row.payer,
                -size,
                "secondary_index",
                RamKind::Remove,
                "secondary_index_remove",
            )?;
            self.update_db_usage(
                &mut db,
                payer,
                size,
                "secondary_index",
                RamKind::Add,
                "secondary_index_update_add_new_payer",
            )?;
        }
        db.sec_modify::<K>(rref.table, rref.primary_key, payer, key)?;
        Ok(())
    }

    pub fn remove_secondary<K: SecondaryKey>(&mut self, iterator: i32) -> KestrelResult<()> {
        self.check_mutable("remove")?;
        let rref = self.sec_cache::<K>().get(iterator)?;
        let meta = *self.sec_cache::<K>().get_table(rref.table)?;
        self.check_access(&meta)?;
        let store = self.store.clone();
        let mut db = store.write();
        let row = self.deref_sec::<K>(&db, rref)?;

        self.update_db_usage(
            &mut db,
            row.payer,
            -(self.bill(K::BILLABLE_SIZE) as i64),
            "secondary_index",
            RamKind::Remove,
            "secondary_index_remove",
        )?;
        let count = db.bump_table_count(rref.table, -1)?;
        db.sec_remove::<K>(rref.table, rref.primary_key)?;
        if count == 0 {
            self.remove_table(&mut db, &meta)?;
        }
        drop(db);
        self.sec_cache::<K>().remove(iterator)?;
        Ok(())
    }

    /// Cursor to the first row holding exactly `key` (+ its primary).
    pub fn find_secondary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        key: K,
    ) -> KestrelResult<(i32, Option<u64>)> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok((-1, None)),
        };
        let end = self.sec_cache::<K>().cache_table(&tab);
        match db.sec_find_by_secondary::<K>(tab.id, key) {
            None => Ok((end, None)),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                let primary = row.primary_key;
                Ok((self.sec_cache::<K>().add(rref), Some(primary)))
            }
        }
    }

    /// Cursor to the row with `primary` (+ its secondary key).
    pub fn find_primary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        primary: u64,
    ) -> KestrelResult<(i32, Option<K>)> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok((-1, None)),
        };
        let end = self.sec_cache::<K>().cache_table(&tab);
        match db.sec_find_by_primary::<K>(tab.id, primary) {
            None => Ok((end, None)),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: primary };
                let key = row.secondary_key;
                Ok((self.sec_cache::<K>().add(rref), Some(key)))
            }
        }
    }

    /// First row with secondary key `>= key`, with its (key, primary).
    pub fn lowerbound_secondary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        key: K,
    ) -> KestrelResult<(i32, Option<(K, u64)>)> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok((-1, None)),
        };
        let end = self.sec_cache::<K>().cache_table(&tab);
        match db.sec_lower_bound::<K>(tab.id, key) {
            None => Ok((end, None)),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                let out = (row.secondary_key, row.primary_key);
                Ok((self.sec_cache::<K>().add(rref), Some(out)))
            }
        }
    }

    /// First row with secondary key `> key`, with its (key, primary).
    pub fn upperbound_secondary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        key: K,
    ) -> KestrelResult<(i32, Option<(K, u64)>)> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok((-1, None)),
        };
        let end = self.sec_cache::<K>().cache_table(&tab);
        match db.sec_upper_bound::<K>(tab.id, key) {
            None => Ok((end, None)),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                let out = (row.secondary_key, row.primary_key);
                Ok((self.sec_cache::<K>().add(rref), Some(out)))
            }
        }
    }

    pub fn lowerbound_primary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        primary: u64,
    ) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok(-1),
        };
        let end = self.sec_cache::<K>().cache_table(&tab);
        match db.sec_lower_bound_primary::<K>(tab.id, primary) {
            None => Ok(end),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                Ok(self.sec_cache::<K>().add(rref))
            }
        }
    }

    pub fn upperbound_primary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
        primary: u64,
    ) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        let tab = match db.find_table(code, scope, table) {
            Some(meta) => *meta,
            None => return Ok(-1),
        };
        let end = self.sec_cache::<K>().cache_table(&tab);
        match db.sec_upper_bound_primary::<K>(tab.id, primary) {
            None => Ok(end),
            Some(row) => {
                let rref = RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                Ok(self.sec_cache::<K>().add(rref))
            }
        }
    }

    pub fn end_secondary<K: SecondaryKey>(
        &mut self,
        code: Name,
        scope: Name,
        table: Name,
    ) -> KestrelResult<i32> {
        let store = self.store.clone();
        let db = store.read();
        match db.find_table(code, scope, table) {
            None => Ok(-1),
            Some(meta) => {
                let meta = *meta;
                Ok(self.sec_cache::<K>().cache_table(&meta))
            }
        }
    }

    /// Step forward in (secondary, primary) order.
    pub fn next_secondary<K: SecondaryKey>(
        &mut self,
        iterator: i32,
    ) -> KestrelResult<(i32, Option<u64>)> {
        if iterator < -1 {
            return Ok((-1, None)); // cannot increment past end
        }
        let rref = self.sec_cache::<K>().get(iterator)?;
        let store = self.store.clone();
        let db = store.read();
        let row = self.deref_sec::<K>(&db, rref)?;
        match db.sec_next::<K>(rref.table, row.secondary_key, rref.primary_key) {
            Some(next) => {
                let nref = RowRef { row_id: next.id, table: rref.table, primary_key: next.primary_key };
                let primary = next.primary_key;
                Ok((self.sec_cache::<K>().add(nref), Some(primary)))
            }
            None => Ok((self.sec_cache::<K>().get_end_iterator_by_table_id(rref.table)?, None)),
        }
    }

    /// Step backward in (secondary, primary) order.
    pub fn previous_secondary<K: SecondaryKey>(
        &mut self,
        iterator: i32,
    ) -> KestrelResult<(i32, Option<u64>)> {
        let store = self.store.clone();
        let db = store.read();
        if iterator < -1 {
            let tab = *self.sec_cache::<K>().find_table_by_end_iterator(iterator)?;
            return match db.sec_last::<K>(tab.id) {
                None => Ok((-1, None)), // empty index
                Some(row) => {
                    let rref =
                        RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                    let primary = row.primary_key;
                    Ok((self.sec_cache::<K>().add(rref), Some(primary)))
                }
            };
        }
        let rref = self.sec_cache::<K>().get(iterator)?;
        let row = self.deref_sec::<K>(&db, rref)?;
        match db.sec_prev::<K>(rref.table, row.secondary_key, rref.primary_key) {
            None => Ok((-1, None)), // cannot decrement past beginning
            Some(prev) => {
                let pref = RowRef { row_id: prev.id, table: rref.table, primary_key: prev.primary_key };
                let primary = prev.primary_key;
                Ok((self.sec_cache::<K>().add(pref), Some(primary)))
            }
        }
    }

    /// Step forward in primary-key order.
    pub fn next_primary<K: SecondaryKey>(
        &mut self,
        iterator: i32,
    ) -> KestrelResult<(i32, Option<u64>)> {
        if iterator < -1 {
            return Ok((-1, None));
        }
        let rref = self.sec_cache::<K>().get(iterator)?;
        let store = self.store.clone();
        let db = store.read();
        match db.sec_upper_bound_primary::<K>(rref.table, rref.primary_key) {
            Some(next) => {
                let nref = RowRef { row_id: next.id, table: rref.table, primary_key: next.primary_key };
                let primary = next.primary_key;
                Ok((self.sec_cache::<K>().add(nref), Some(primary)))
            }
            None => Ok((self.sec_cache::<K>().get_end_iterator_by_table_id(rref.table)?, None)),
        }
    }

    /// Step backward in primary-key order.
    pub fn previous_primary<K: SecondaryKey>(
        &mut self,
        iterator: i32,
    ) -> KestrelResult<(i32, Option<u64>)> {
        let store = self.store.clone();
        let db = store.read();
        if iterator < -1 {
            let tab = *self.sec_cache::<K>().find_table_by_end_iterator(iterator)?;
            return match db.sec_last_primary::<K>(tab.id) {
                None => Ok((-1, None)),
                Some(row) => {
                    let rref =
                        RowRef { row_id: row.id, table: tab.id, primary_key: row.primary_key };
                    let primary = row.primary_key;
                    Ok((self.sec_cache::<K>().add(rref), Some(primary)))
                }
            };
        }
        let rref = self.sec_cache::<K>().get(iterator)?;
        match db.sec_prev_primary::<K>(rref.table, rref.primary_key) {
            None => Ok((-1, None)),
            Some(prev) => {
                let pref = RowRef { row_id: prev.id, table: rref.table, primary_key: prev.primary_key };
                let primary = prev.primary_key;
                Ok((self.sec_cache::<K>().add(pref), Some(primary)))
            }
        }
    }

    /// The row's (primary, secondary) pair.
    pub fn get_secondary<K: SecondaryKey>(&mut self, iterator: i32) -> KestrelResult<(u64, K)> {
        let rref = self.sec_cache::<K>().get(iterator)?;
        let db = self.store.read();
        let row = self.deref_sec::<K>(&db, rref)?;
        Ok((row.primary_key, row.secondary_key))
    }
}
