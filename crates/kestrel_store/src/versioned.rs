//! Undo-layered containers.
//!
//! A `VersionedMap` is an ordered map with a stack of undo layers. Each
//! layer records, for every key touched while it was on top, the value
//! the key had *before* the first touch (`None` = absent). Undoing a
//! layer replays those prior values; squashing folds a layer into the
//! one below it (the lower layer's first-touch records win); committing
//! discards layers from the bottom of the stack, making their changes
//! permanent.
//!
//! The containers know nothing about revisions or sessions; the store
//! aligns layer stacks across all of its members and owns the session
//! bookkeeping.

use std::collections::BTreeMap;
use std::ops::RangeBounds;

/// Uniform layer protocol the store drives across all member containers.
pub trait Layered {
    fn push_layer(&mut self);
    fn undo_layer(&mut self);
    fn squash_layer(&mut self);
    /// Drop `n` layers from the bottom of the stack, keeping their changes.
    fn commit_layers(&mut self, n: usize);
    fn layer_count(&self) -> usize;
}

/// Ordered map with undo layers.
#[derive(Debug, Clone)]
pub struct VersionedMap<K: Ord + Clone, V: Clone> {
    map: BTreeMap<K, V>,
    layers: Vec<BTreeMap<K, Option<V>>>,
}

impl<K: Ord + Clone, V: Clone> Default for VersionedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> VersionedMap<K, V> {
    pub fn new() -> Self {
        VersionedMap { map: BTreeMap::new(), layers: Vec::new() }
    }

    /// Record the key's pre-mutation value in the top layer, once.
    fn touch(&mut self, key: &K) {
        if let Some(top) = self.layers.last_mut() {
            if !top.contains_key(key) {
                top.insert(key.clone(), self.map.get(key).cloned());
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.touch(&key);
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.touch(key);
        self.map.remove(key)
    }

    /// Mutate an existing value in place. Returns false if absent.
    pub fn modify(&mut self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        self.touch(key);
        match self.map.get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl DoubleEndedIterator<Item = (&K, &V)> {
        self.map.range(range)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&K, &V)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Ord + Clone, V: Clone> Layered for VersionedMap<K, V> {
    fn push_layer(&mut self) {
        self.layers.push(BTreeMap::new());
    }

    fn undo_layer(&mut self) {
        if let Some(top) = self.layers.pop() {
            for (key, prior) in top {
                match prior {
                    Some(value) => {
                        self.map.insert(key, value);
                    }
                    None => {
                        self.map.remove(&key);
                    }
                }
            }
        }
    }

    fn squash_layer(&mut self) {
        if let Some(top) = self.layers.pop() {
            if let Some(below) = self.layers.last_mut() {
                for (key, prior) in top {
                    below.entry(key).or_insert(prior);
                }
            }
            // With no layer below, the undo records are simply dropped:
            // the changes become permanent.
        }
    }

    fn commit_layers(&mut self, n: usize) {
        let n = n.min(self.layers.len());
        self.layers.drain(..n);
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

/// A single undo-layered value (id counters, singleton rows).
#[derive(Debug, Clone, Default)]
pub struct VersionedCell<T: Clone> {
    value: T,
    layers: Vec<Option<T>>,
}

impl<T: Clone> VersionedCell<T> {
    pub fn new(value: T) -> Self {
        VersionedCell { value, layers: Vec::new() }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        self.touch();
        self.value = value;
    }

    pub fn modify(&mut self, f: impl FnOnce(&mut T)) {
        self.touch();
        f(&mut self.value);
    }

    fn touch(&mut self) {
        if let Some(top) = self.layers.last_mut() {
            if top.is_none() {
                *top = Some(self.value.clone());
            }
        }
    }
}

impl<T: Clone> Layered for VersionedCell<T> {
    fn push_layer(&mut self) {
        self.layers.push(None);
    }

    fn undo_layer(&mut self) {
        if let Some(Some(prior)) = self.layers.pop() {
            self.value = prior;
        }
    }

    fn squash_layer(&mut self) {
        if let Some(top) = self.layers.pop() {
            if let Some(below) = self.layers.last_mut() {
                if below.is_none() {
                    *below = top;
                }
            }
        }
    }

    fn commit_layers(&mut self, n: usize) {
        let n = n.min(self.layers.len());
        self.layers.drain(..n);
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_undo() {
        let mut m: VersionedMap<u64, &str> = VersionedMap::new();
        m.insert(1, "permanent");
        m.push_layer();
        m.insert(2, "ephemeral");
        m.insert(1, "overwritten");
        m.undo_layer();
        assert_eq!(m.get(&1), Some(&"permanent"));
        assert_eq!(m.get(&2), None);
    }

    #[test]
    fn test_remove_and_undo() {
        let mut m: VersionedMap<u64, &str> = VersionedMap::new();
        m.insert(1, "keep");
        m.push_layer();
        m.remove(&1);
        assert!(m.is_empty());
        m.undo_layer();
        assert_eq!(m.get(&1), Some(&"keep"));
    }

    #[test]
    fn test_first_touch_wins_within_layer() {
        let mut m: VersionedMap<u64, u32> = VersionedMap::new();
        m.insert(1, 10);
        m.push_layer();
        m.insert(1, 20);
        m.insert(1, 30);
        m.remove(&1);
        m.undo_layer();
        assert_eq!(m.get(&1), Some(&10));
    }

    #[test]
    fn test_nested_layers_undo_in_order() {
        let mut m: VersionedMap<u64, u32> = VersionedMap::new();
        m.insert(1, 10);
        m.push_layer();
        m.insert(1, 20);
        m.push_layer();
        m.insert(1, 30);
        m.undo_layer();
        assert_eq!(m.get(&1), Some(&20));
        m.undo_layer();
        assert_eq!(m.get(&1), Some(&10));
    }

    #[test]
    fn test_squash_preserves_outer_restore_point() {
        let mut m: VersionedMap<u64, u32> = VersionedMap::new();
        m.insert(1, 10);
        m.push_layer();
        m.insert(1, 20);
        m.push_layer();
        m.insert(1, 30);
        m.insert(2, 99);
        m.squash_layer();
        assert_eq!(m.layer_count(), 1);
        assert_eq!(m.get(&1), Some(&30));
        m.undo_layer();
        // Undo of the squashed layer restores to the outermost snapshot.
        assert_eq!(m.get(&1), Some(&10));
        assert_eq!(m.get(&2), None);
    }

    #[test]
    fn test_squash_bottom_layer_drops_undo_info() {
        let mut m: VersionedMap<u64, u32> = VersionedMap::new();
        m.push_layer();
        m.insert(1, 10);
        m.squash_layer();
        assert_eq!(m.layer_count(), 0);
        assert_eq!(m.get(&1), Some(&10));
    }

    #[test]
    fn test_commit_drops_bottom_layers() {
        let mut m: VersionedMap<u64, u32> = VersionedMap::new();
        m.push_layer();
        m.insert(1, 10);
        m.push_layer();
        m.insert(2, 20);
        m.commit_layers(1);
        assert_eq!(m.layer_count(), 1);
        // Undoing the remaining layer removes key 2 but key 1 is permanent.
        m.undo_layer();
        assert_eq!(m.get(&1), Some(&10));
        assert_eq!(m.get(&2), None);
    }

    #[test]
    fn test_range_iteration_order() {
        let mut m: VersionedMap<(u64, u64), u32> = VersionedMap::new();
        m.insert((1, 5), 0);
        m.insert((1, 7), 1);
        m.insert((2, 1), 2);
        let keys: Vec<_> = m.range((1, 0)..(2, 0)).map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![(1, 5), (1, 7)]);
    }

    #[test]
    fn test_cell_undo_and_squash() {
        let mut c = VersionedCell::new(1u64);
        c.push_layer();
        c.set(2);
        c.push_layer();
        c.set(3);
        c.squash_layer();
        c.undo_layer();
        assert_eq!(*c.get(), 1);
    }

    #[test]
    fn test_cell_untouched_layer_is_free() {
        let mut c = VersionedCell::new(7u64);
        c.push_layer();
        c.undo_layer();
        assert_eq!(*c.get(), 7);
    }

    #[test]
    fn test_cell_commit() {
        let mut c = VersionedCell::new(1u64);
        c.push_layer();
        c.set(2);
        c.commit_layers(1);
        assert_eq!(c.layer_count(), 0);
        assert_eq!(*c.get(), 2);
    }
}
