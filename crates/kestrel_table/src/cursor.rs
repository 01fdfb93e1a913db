//! Per-execution-call cursor cache.
//!
//! Contract code addresses rows through small integer cursors instead of
//! references. Non-negative cursors alias a live row; `-1` is the
//! invalid cursor (table absent, walked before begin); cursors below
//! `-1` are per-table "end" sentinels, bijective with the registered
//! table count via `index = -(cursor + 2)`.
//!
//! Rows are identified by their durable [`RowId`] rather than by
//! address, so a stale cursor is detected by an id mismatch instead of
//! dereferencing freed memory. `add` is idempotent per row identity:
//! repeated lookups of the same row reuse the same cursor in O(1), and
//! `remove` invalidates in O(1) without scanning other cursors.
//!
//! Cursors never outlive the execution call that created them and are
//! not thread-safe.

use std::collections::{BTreeMap, HashMap};

use kestrel_common::error::TableError;
use kestrel_store::{RowId, TableId, TableMeta};

/// Everything needed to re-locate a row and prove it is still the same
/// row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    pub row_id: RowId,
    pub table: TableId,
    pub primary_key: u64,
}

/// Cursor table for one index family within one execution call.
#[derive(Debug, Default)]
pub struct IteratorCache {
    table_cache: BTreeMap<TableId, (TableMeta, i32)>,
    end_iterator_to_table: Vec<TableMeta>,
    iterator_to_row: Vec<Option<RowRef>>,
    row_to_iterator: HashMap<RowId, i32>,
}

fn index_to_end_iterator(index: usize) -> i32 {
    -(index as i32 + 2)
}

fn end_iterator_to_index(end_iterator: i32) -> usize {
    (-end_iterator - 2) as usize
}

impl IteratorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table and return its end cursor.
    pub fn cache_table(&mut self, meta: &TableMeta) -> i32 {
        if let Some((_, end)) = self.table_cache.get(&meta.id) {
            return *end;
        }
        let end = index_to_end_iterator(self.end_iterator_to_table.len());
        self.end_iterator_to_table.push(*meta);
        self.table_cache.insert(meta.id, (*meta, end));
        end
    }

    /// The cached identity of a row's table.
    pub fn get_table(&self, id: TableId) -> Result<&TableMeta, TableError> {
        self.table_cache
            .get(&id)
            .map(|(meta, _)| meta)
            .ok_or(TableError::TableNotInCache)
    }

    pub fn get_end_iterator_by_table_id(&self, id: TableId) -> Result<i32, TableError> {
        self.table_cache
            .get(&id)
            .map(|(_, end)| *end)
            .ok_or(TableError::TableNotInCache)
    }

    /// Resolve an end cursor back to its table.
    pub fn find_table_by_end_iterator(&self, end_iterator: i32) -> Result<&TableMeta, TableError> {
        if end_iterator >= -1 {
            return Err(TableError::InvalidIterator("not an end iterator"));
        }
        self.end_iterator_to_table
            .get(end_iterator_to_index(end_iterator))
            .ok_or(TableError::InvalidIterator("not a valid end iterator"))
    }

    /// Dereference a live-row cursor.
    pub fn get(&self, iterator: i32) -> Result<RowRef, TableError> {
        if iterator == -1 {
            return Err(TableError::InvalidIterator("invalid iterator"));
        }
        if iterator < 0 {
            return Err(TableError::InvalidIterator("dereference of end iterator"));
        }
        match self.iterator_to_row.get(iterator as usize) {
            None => Err(TableError::InvalidIterator("iterator out of range")),
            Some(None) => Err(TableError::InvalidIterator("dereference of deleted object")),
            Some(Some(row)) => Ok(*row),
        }
    }

    /// Invalidate the cursor of a removed row.
    pub fn remove(&mut self, iterator: i32) -> Result<(), TableError> {
        if iterator == -1 {
            return Err(TableError::InvalidIterator("invalid iterator"));
        }
        if iterator < 0 {
            return Err(TableError::InvalidIterator("cannot call remove on end iterators"));
        }
        let slot = self
            .iterator_to_row
            .get_mut(iterator as usize)
            .ok_or(TableError::InvalidIterator("iterator out of range"))?;
        if let Some(row) = slot.take() {
            self.row_to_iterator.remove(&row.row_id);
        }
        Ok(())
    }

    /// Alias a row; idempotent per row identity.
    pub fn add(&mut self, row: RowRef) -> i32 {
        if let Some(&iterator) = self.row_to_iterator.get(&row.row_id) {
            return iterator;
        }
        let iterator = self.iterator_to_row.len() as i32;
        self.iterator_to_row.push(Some(row));
        self.row_to_iterator.insert(row.row_id, iterator);
        iterator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::name::name;

    fn meta(id: u64) -> TableMeta {
        TableMeta {
            id: TableId(id),
            code: name("code"),
            scope: name("scope"),
            table: name("tbl"),
            payer: name("alice"),
            count: 0,
        }
    }

    fn row(row_id: u64, table: u64, primary: u64) -> RowRef {
        RowRef { row_id: RowId(row_id), table: TableId(table), primary_key: primary }
    }

    #[test]
    fn test_end_iterator_bijection() {
        let mut cache = IteratorCache::new();
        let e0 = cache.cache_table(&meta(10));
        let e1 = cache.cache_table(&meta(11));
        assert_eq!(e0, -2);
        assert_eq!(e1, -3);
        // Re-caching returns the same sentinel.
        assert_eq!(cache.cache_table(&meta(10)), -2);
        assert_eq!(cache.find_table_by_end_iterator(e0).unwrap().id, TableId(10));
        assert_eq!(cache.find_table_by_end_iterator(e1).unwrap().id, TableId(11));
        assert_eq!(cache.get_end_iterator_by_table_id(TableId(11)).unwrap(), -3);
    }

    #[test]
    fn test_find_table_rejects_non_end_cursors() {
        let cache = IteratorCache::new();
        assert!(cache.find_table_by_end_iterator(-1).is_err());
        assert!(cache.find_table_by_end_iterator(0).is_err());
        assert!(cache.find_table_by_end_iterator(-99).is_err());
    }

    #[test]
    fn test_add_is_idempotent_by_row_identity() {
        let mut cache = IteratorCache::new();
        let a = cache.add(row(1, 10, 5));
        let b = cache.add(row(1, 10, 5));
        let c = cache.add(row(2, 10, 6));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.get(a).unwrap().primary_key, 5);
    }

    #[test]
    fn test_get_rejects_invalid_cursors() {
        let cache = IteratorCache::new();
        assert!(cache.get(-1).is_err());
        assert!(cache.get(-2).is_err());
        assert!(cache.get(0).is_err());
    }

    #[test]
    fn test_remove_invalidates_exactly_one_cursor() {
        let mut cache = IteratorCache::new();
        let a = cache.add(row(1, 10, 5));
        let b = cache.add(row(2, 10, 6));
        cache.remove(a).unwrap();
        assert!(cache.get(a).is_err());
        assert_eq!(cache.get(b).unwrap().row_id, RowId(2));
        // Removing twice is a no-op, not an error.
        cache.remove(a).unwrap();
    }

    #[test]
    fn test_remove_rejects_end_cursors() {
        let mut cache = IteratorCache::new();
        cache.cache_table(&meta(10));
        assert!(cache.remove(-2).is_err());
        assert!(cache.remove(-1).is_err());
    }

    #[test]
    fn test_removed_row_id_can_be_readded() {
        // Undo can restore a removed row; the cache then hands out a new
        // cursor for the same identity while the old one stays dead.
        let mut cache = IteratorCache::new();
        let a = cache.add(row(1, 10, 5));
        cache.remove(a).unwrap();
        let b = cache.add(row(1, 10, 5));
        assert_ne!(a, b);
        assert!(cache.get(a).is_err());
        assert!(cache.get(b).is_ok());
    }

    #[test]
    fn test_get_table_requires_caching() {
        let mut cache = IteratorCache::new();
        assert!(matches!(cache.get_table(TableId(1)), Err(TableError::TableNotInCache)));
        cache.cache_table(&meta(1));
        assert_eq!(cache.get_table(TableId(1)).unwrap().code, name("code"));
    }
}
