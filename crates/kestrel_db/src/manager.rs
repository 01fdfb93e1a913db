//! Multi-store transaction coordinator.
//!
//! Owns the main store, the cross-shard shared store and a name-keyed
//! set of per-shard stores created on demand. Undo sessions, commits and
//! rollbacks fan out to every store so that no store can retain a change
//! while a sibling rolls back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use kestrel_common::error::{DbError, KestrelResult};
use kestrel_common::name::Name;
use parking_lot::RwLock;
use tracing::{debug, info};

use kestrel_store::{store_handle, ShardRegistryEntry, StoreHandle, StoreSession, VersionedStore};

const MAIN_STORE: &str = "main";
const SHARED_STORE: &str = "shared";

/// The coordinated set of versioned stores.
pub struct DatabaseManager {
    main: StoreHandle,
    shared: StoreHandle,
    shards: RwLock<BTreeMap<Name, StoreHandle>>,
    /// Static open mode.
    read_only: bool,
    /// Dynamic guard; when set, every mutating operation fails fast.
    read_only_mode: AtomicBool,
}

impl DatabaseManager {
    pub fn new() -> Self {
        DatabaseManager {
            main: store_handle(VersionedStore::new(store_name(MAIN_STORE))),
            shared: store_handle(VersionedStore::new(store_name(SHARED_STORE))),
            shards: RwLock::new(BTreeMap::new()),
            read_only: false,
            read_only_mode: AtomicBool::new(false),
        }
    }

    pub fn open_read_only() -> Self {
        let mut dbm = Self::new();
        dbm.read_only = true;
        dbm.read_only_mode.store(true, Ordering::Relaxed);
        dbm.main.write().set_read_only_mode();
        dbm.shared.write().set_read_only_mode();
        dbm
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self, op: &'static str) -> Result<(), DbError> {
        if self.read_only_mode.load(Ordering::Relaxed) {
            return Err(DbError::ReadOnlyMode(op));
        }
        Ok(())
    }

    pub fn set_read_only_mode(&self) {
        self.read_only_mode.store(true, Ordering::Relaxed);
        self.main.write().set_read_only_mode();
        self.shared.write().set_read_only_mode();
        for store in self.shards.read().values() {
            store.write().set_read_only_mode();
        }
    }

    pub fn unset_read_only_mode(&self) -> KestrelResult<()> {
        if self.read_only {
            return Err(DbError::ReadOnlyMode("unset read_only_mode").into());
        }
        self.read_only_mode.store(false, Ordering::Relaxed);
        self.main.write().unset_read_only_mode()?;
        self.shared.write().unset_read_only_mode()?;
        for store in self.shards.read().values() {
            store.write().unset_read_only_mode()?;
        }
        Ok(())
    }

    // ── Store accessors ────────────────────────────────────────────────────

    pub fn main_db(&self) -> StoreHandle {
        self.main.clone()
    }

    pub fn shared_db(&self) -> StoreHandle {
        self.shared.clone()
    }

    pub fn find_shard_db(&self, name: Name) -> Option<StoreHandle> {
        self.shards.read().get(&name).cloned()
    }

    /// The shard's store; fails if the shard was never activated.
    pub fn shard_db(&self, name: Name) -> KestrelResult<StoreHandle> {
        self.find_shard_db(name).ok_or_else(|| DbError::ShardNotFound(name).into())
    }

    /// Idempotent lazy shard-store creation. Registers the shard in the
    /// shared store's registry so it is reopened after a restart.
    pub fn add_shard_db(&self, name: Name, size: u64) -> KestrelResult<StoreHandle> {
        self.check_writable("add_shard_db")?;
        if let Some(existing) = self.find_shard_db(name) {
            return Ok(existing);
        }
        let store = store_handle(VersionedStore::new(name));
        self.shards.write().insert(name, store.clone());
        self.shared.write().register_shard(ShardRegistryEntry { name, size })?;
        info!(shard = %name, size, "shard store created");
        Ok(store)
    }

    /// Recreate shard stores recorded by a previous run. Does not touch
    /// the shared-store registry: the catalog is a bootstrap hint and the
    /// registry rows are already part of persisted state.
    pub fn reopen_shards(&self, names: &[Name]) -> KestrelResult<()> {
        for &name in names {
            if self.find_shard_db(name).is_none() {
                self.shards.write().insert(name, store_handle(VersionedStore::new(name)));
                debug!(shard = %name, "shard store reopened");
            }
        }
        Ok(())
    }

    /// Every live shard store, in deterministic name order.
    pub fn shard_dbs(&self) -> Vec<(Name, StoreHandle)> {
        self.shards.read().iter().map(|(n, s)| (*n, s.clone())).collect()
    }

    /// Record the live shard set at shutdown. A bootstrap hint only;
    /// `error` carries the shutdown error message, empty when clean.
    pub fn write_shard_catalog(&self, path: &std::path::Path, error: &str) -> KestrelResult<()> {
        let shards = self.shards.read().keys().copied().collect();
        let catalog = crate::catalog::ShardCatalog { shards, error: error.to_string() };
        crate::catalog::write_catalog(path, &catalog)?;
        Ok(())
    }

    /// Reopen the shard stores recorded by a previous shutdown.
    pub fn reopen_from_catalog(&self, path: &std::path::Path) -> KestrelResult<Vec<Name>> {
        let catalog = crate::catalog::read_catalog(path)?;
        self.reopen_shards(&catalog.shards)?;
        Ok(catalog.shards)
    }

    pub fn revision(&self) -> u64 {
        self.main.read().revision()
    }

    // ── Coordinated sessions ───────────────────────────────────────────────

    /// Begin one child undo session on every currently-registered store.
    ///
    /// If the returned aggregate is dropped unresolved, every child rolls
    /// back; a sibling store can never keep changes the others undid.
    pub fn start_undo_session(&self, enabled: bool) -> KestrelResult<AggregateSession> {
        if enabled {
            self.check_writable("start_undo_session")?;
        }
        let mut sessions = Vec::with_capacity(2 + self.shards.read().len());
        sessions.push(StoreSession::begin(self.shared.clone(), enabled)?);
        sessions.push(StoreSession::begin(self.main.clone(), enabled)?);
        for (_, store) in self.shard_dbs() {
            sessions.push(StoreSession::begin(store, enabled)?);
        }
        Ok(AggregateSession { sessions })
    }

    /// Make all layers at or below `revision` permanent, on every store.
    pub fn commit(&self, revision: u64) -> KestrelResult<()> {
        self.check_writable("commit")?;
        self.shared.write().commit(revision)?;
        self.main.write().commit(revision)?;
        for (_, store) in self.shard_dbs() {
            store.write().commit(revision)?;
        }
        Ok(())
    }

    /// Undo the most recent pending layer on every store.
    pub fn undo(&self) -> KestrelResult<()> {
        self.check_writable("undo")?;
        self.shared.write().undo()?;
        self.main.write().undo()?;
        for (_, store) in self.shard_dbs() {
            store.write().undo()?;
        }
        Ok(())
    }

    /// Squash the two most recent pending layers on every store.
    pub fn squash(&self) -> KestrelResult<()> {
        self.check_writable("squash")?;
        self.shared.write().squash()?;
        self.main.write().squash()?;
        for (_, store) in self.shard_dbs() {
            store.write().squash()?;
        }
        Ok(())
    }

    /// Roll back every pending layer on every store.
    pub fn undo_all(&self) -> KestrelResult<()> {
        self.check_writable("undo_all")?;
        self.shared.write().undo_all()?;
        self.main.write().undo_all()?;
        for (_, store) in self.shard_dbs() {
            store.write().undo_all()?;
        }
        Ok(())
    }

    pub fn set_revision(&self, revision: u64) -> KestrelResult<()> {
        self.check_writable("set_revision")?;
        self.shared.write().set_revision(revision)?;
        self.main.write().set_revision(revision)?;
        for (_, store) in self.shard_dbs() {
            store.write().set_revision(revision)?;
        }
        Ok(())
    }
}

impl Default for DatabaseManager {
    fn default() -> Self {
        Self::new()
    }
}

fn store_name(label: &str) -> Name {
    label.parse().unwrap_or_else(|_| Name::empty())
}

/// One logical transaction's undo scope across every store.
///
/// Children are ordered shared, main, then shards in name order; drop of
/// an unresolved aggregate undoes them in reverse.
pub struct AggregateSession {
    sessions: Vec<StoreSession>,
}

impl AggregateSession {
    /// Keep every child layer for a later commit.
    pub fn push(&mut self) -> KestrelResult<()> {
        for session in &mut self.sessions {
            session.push()?;
        }
        Ok(())
    }

    /// Fold every child layer into its enclosing session.
    pub fn squash(&mut self) -> KestrelResult<()> {
        for session in &mut self.sessions {
            session.squash()?;
        }
        Ok(())
    }

    /// Roll every child layer back.
    pub fn undo(&mut self) -> KestrelResult<()> {
        for session in self.sessions.iter_mut().rev() {
            session.undo()?;
        }
        Ok(())
    }
}

impl Drop for AggregateSession {
    fn drop(&mut self) {
        // Resolved children ignore this; unresolved ones roll back.
        for session in self.sessions.iter_mut().rev() {
            let _ = session.undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::error::StoreError;
    use kestrel_common::name::name;
    use kestrel_store::TableId;

    fn seed_row(store: &StoreHandle, primary: u64) -> TableId {
        let mut s = store.write();
        let table = match s.find_table(name("c"), name("s"), name("t")) {
            Some(meta) => meta.id,
            None => s.create_table(name("c"), name("s"), name("t"), name("alice")).unwrap().id,
        };
        s.kv_create(table, primary, name("alice"), vec![primary as u8]).unwrap();
        table
    }

    #[test]
    fn test_shard_lazy_creation_is_idempotent() {
        let dbm = DatabaseManager::new();
        let a = dbm.add_shard_db(name("shard1"), 1024).unwrap();
        let b = dbm.add_shard_db(name("shard1"), 4096).unwrap();
        assert!(StoreHandle::ptr_eq(&a, &b));
        assert_eq!(dbm.shard_dbs().len(), 1);
        // Registered exactly once in the shared store.
        let shared = dbm.shared_db();
        let shared = shared.read();
        assert_eq!(shared.shard_entries().count(), 1);
        assert_eq!(shared.shard_entry(name("shard1")).unwrap().size, 1024);
    }

    #[test]
    fn test_shard_db_missing_is_error() {
        let dbm = DatabaseManager::new();
        assert!(dbm.find_shard_db(name("ghost")).is_none());
        let err = dbm.shard_db(name("ghost")).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_aggregate_undo_spans_all_stores() {
        let dbm = DatabaseManager::new();
        let shard = dbm.add_shard_db(name("shard1"), 0).unwrap();
        let main = dbm.main_db();
        let shared = dbm.shared_db();

        let mut session = dbm.start_undo_session(true).unwrap();
        let tm = seed_row(&main, 1);
        let ts = seed_row(&shared, 2);
        let th = seed_row(&shard, 3);
        session.undo().unwrap();

        assert!(main.read().kv_find(tm, 1).is_none());
        assert!(shared.read().kv_find(ts, 2).is_none());
        assert!(shard.read().kv_find(th, 3).is_none());
    }

    #[test]
    fn test_aggregate_drop_rolls_back_every_store() {
        let dbm = DatabaseManager::new();
        let shard = dbm.add_shard_db(name("shard1"), 0).unwrap();
        let main = dbm.main_db();

        let table;
        {
            let _session = dbm.start_undo_session(true).unwrap();
            table = seed_row(&main, 7);
            seed_row(&shard, 8);
        }
        assert!(main.read().kv_find(table, 7).is_none());
        assert!(shard.read().kv_rows().next().is_none());
    }

    #[test]
    fn test_push_then_commit_persists_across_stores() {
        let dbm = DatabaseManager::new();
        let shard = dbm.add_shard_db(name("shard1"), 0).unwrap();
        let main = dbm.main_db();

        let mut session = dbm.start_undo_session(true).unwrap();
        let tm = seed_row(&main, 1);
        let th = seed_row(&shard, 2);
        session.push().unwrap();
        dbm.commit(dbm.revision()).unwrap();

        assert!(main.read().kv_find(tm, 1).is_some());
        assert!(shard.read().kv_find(th, 2).is_some());
        // The committed layers are gone from every store.
        assert!(matches!(
            main.write().undo(),
            Err(StoreError::NoActiveSession)
        ));
    }

    #[test]
    fn test_nested_aggregate_squash() {
        let dbm = DatabaseManager::new();
        let main = dbm.main_db();

        let mut outer = dbm.start_undo_session(true).unwrap();
        let table = seed_row(&main, 1);
        let mut inner = dbm.start_undo_session(true).unwrap();
        seed_row(&main, 2);
        inner.squash().unwrap();
        outer.undo().unwrap();

        assert!(main.read().kv_find(table, 1).is_none());
        assert!(main.read().kv_find(table, 2).is_none());
    }

    #[test]
    fn test_disabled_session_changes_nothing() {
        let dbm = DatabaseManager::new();
        {
            let _session = dbm.start_undo_session(false).unwrap();
        }
        assert_eq!(dbm.revision(), 0);
    }

    #[test]
    fn test_read_only_mode_blocks_everything() {
        let dbm = DatabaseManager::new();
        dbm.set_read_only_mode();
        assert!(dbm.start_undo_session(true).is_err());
        assert!(dbm.add_shard_db(name("shard1"), 0).is_err());
        assert!(dbm.commit(1).is_err());
        assert!(dbm.undo_all().is_err());
        dbm.unset_read_only_mode().unwrap();
        assert!(dbm.start_undo_session(true).is_ok());
    }

    #[test]
    fn test_statically_read_only_cannot_be_unset() {
        let dbm = DatabaseManager::open_read_only();
        assert!(dbm.unset_read_only_mode().is_err());
    }

    #[test]
    fn test_set_revision_fans_out() {
        let dbm = DatabaseManager::new();
        let shard = dbm.add_shard_db(name("shard1"), 0).unwrap();
        dbm.set_revision(42).unwrap();
        assert_eq!(dbm.main_db().read().revision(), 42);
        assert_eq!(dbm.shared_db().read().revision(), 42);
        assert_eq!(shard.read().revision(), 42);
    }

    #[test]
    fn test_reopen_shards_skips_registry() {
        let dbm = DatabaseManager::new();
        dbm.reopen_shards(&[name("shard1"), name("shard2")]).unwrap();
        assert_eq!(dbm.shard_dbs().len(), 2);
        assert_eq!(dbm.shared_db().read().shard_entries().count(), 0);
    }

    #[test]
    fn test_catalog_round_trip_restores_shard_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.dat");

        let dbm = DatabaseManager::new();
        dbm.add_shard_db(name("shard1"), 0).unwrap();
        dbm.add_shard_db(name("shard2"), 0).unwrap();
        dbm.write_shard_catalog(&path, "").unwrap();

        let reopened = DatabaseManager::new();
        let shards = reopened.reopen_from_catalog(&path).unwrap();
        assert_eq!(shards, vec![name("shard1"), name("shard2")]);
        assert!(reopened.find_shard_db(name("shard1")).is_some());
        assert!(reopened.find_shard_db(name("shard2")).is_some());
    }
}
