//! RAII undo-session handles.
//!
//! A `StoreSession` owns one undo layer of one store. If the handle is
//! dropped without being pushed or squashed, the layer is rolled back:
//! a failed transaction can never leave changes behind by accident.

use std::sync::Arc;

use kestrel_common::error::StoreError;
use parking_lot::RwLock;
use tracing::warn;

use crate::store::VersionedStore;

/// Shared handle to a versioned store.
pub type StoreHandle = Arc<RwLock<VersionedStore>>;

/// Create a store behind the standard shared handle.
pub fn store_handle(store: VersionedStore) -> StoreHandle {
    Arc::new(RwLock::new(store))
}

enum SessionState {
    /// Owns a layer that will be undone on drop.
    Active { revision: u64 },
    /// Resolved (pushed, squashed or undone); drop is a no-op.
    Resolved,
    /// Created with `enabled = false`; never touched the store.
    Disabled,
}

/// One store's undo session.
pub struct StoreSession {
    store: StoreHandle,
    state: SessionState,
}

impl StoreSession {
    /// Begin a session on `store`. With `enabled = false` the session is
    /// inert: push/squash/undo succeed and do nothing.
    pub fn begin(store: StoreHandle, enabled: bool) -> Result<Self, StoreError> {
        let state = if enabled {
            let revision = store.write().begin_undo_session()?;
            SessionState::Active { revision }
        } else {
            SessionState::Disabled
        };
        Ok(StoreSession { store, state })
    }

    /// The session's revision, if it is active.
    pub fn revision(&self) -> Option<u64> {
        match self.state {
            SessionState::Active { revision } => Some(revision),
            _ => None,
        }
    }

    /// Keep the layer for a later commit.
    pub fn push(&mut self) -> Result<(), StoreError> {
        match std::mem::replace(&mut self.state, SessionState::Resolved) {
            SessionState::Active { revision } => self.store.write().session_push(revision),
            _ => Ok(()),
        }
    }

    /// Fold the layer into the enclosing session.
    pub fn squash(&mut self) -> Result<(), StoreError> {
        match std::mem::replace(&mut self.state, SessionState::Resolved) {
            SessionState::Active { revision } => self.store.write().session_squash(revision),
            _ => Ok(()),
        }
    }

    /// Roll the layer back.
    pub fn undo(&mut self) -> Result<(), StoreError> {
        match std::mem::replace(&mut self.state, SessionState::Resolved) {
            SessionState::Active { revision } => self.store.write().session_undo(revision),
            _ => Ok(()),
        }
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        if let SessionState::Active { revision } = self.state {
            if let Err(error) = self.store.write().session_undo(revision) {
                // Nothing to propagate from a destructor; the store has
                // already rejected the out-of-order resolution.
                warn!(revision, %error, "undo session dropped out of order");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::name::name;

    fn handle() -> StoreHandle {
        store_handle(VersionedStore::new(name("main")))
    }

    #[test]
    fn test_drop_rolls_back() {
        let store = handle();
        let table = store
            .write()
            .create_table(name("c"), name("s"), name("t"), name("alice"))
            .unwrap()
            .id;
        {
            let _session = StoreSession::begin(store.clone(), true).unwrap();
            store.write().kv_create(table, 1, name("alice"), vec![]).unwrap();
        }
        assert!(store.read().kv_find(table, 1).is_none());
        assert_eq!(store.read().revision(), 0);
    }

    #[test]
    fn test_push_preserves_changes() {
        let store = handle();
        let table = store
            .write()
            .create_table(name("c"), name("s"), name("t"), name("alice"))
            .unwrap()
            .id;
        {
            let mut session = StoreSession::begin(store.clone(), true).unwrap();
            store.write().kv_create(table, 1, name("alice"), vec![]).unwrap();
            session.push().unwrap();
        }
        assert!(store.read().kv_find(table, 1).is_some());
    }

    #[test]
    fn test_disabled_session_is_inert() {
        let store = handle();
        let mut session = StoreSession::begin(store.clone(), false).unwrap();
        assert_eq!(session.revision(), None);
        assert_eq!(store.read().revision(), 0);
        session.undo().unwrap();
    }

    #[test]
    fn test_double_resolution_is_a_noop() {
        let store = handle();
        let mut session = StoreSession::begin(store.clone(), true).unwrap();
        session.undo().unwrap();
        session.push().unwrap();
        session.squash().unwrap();
    }
}
