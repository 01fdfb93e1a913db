//! Injected observer for billable state mutations.
//!
//! Every billable mutation emits exactly one structured event through
//! this interface. Observation is one-way: an observer can never affect
//! execution, only record it.

use crate::name::Name;

/// What a RAM delta was charged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamKind {
    Add,
    Remove,
    Update,
}

/// One billable mutation.
#[derive(Debug, Clone, Copy)]
pub struct RamEvent {
    /// Broad category: "table", "table_row", "secondary_index", "account".
    pub category: &'static str,
    pub kind: RamKind,
    /// Fine-grained operation tag, e.g. "primary_index_add".
    pub tag: &'static str,
    pub payer: Name,
    pub delta: i64,
}

/// Observer over billable mutations and resource accounting.
pub trait LedgerObserver: Send + Sync {
    /// A RAM delta was billed or refunded.
    fn ram_delta(&self, event: &RamEvent);

    /// An account's windowed NET/CPU usage row changed.
    fn usage_updated(&self, account: Name, net_average: u64, cpu_average: u64) {
        let _ = (account, net_average, cpu_average);
    }

    /// An account's limits row changed (pending or applied).
    fn limits_updated(&self, account: Name, ram_bytes: i64, net_weight: i64, cpu_weight: i64) {
        let _ = (account, ram_bytes, net_weight, cpu_weight);
    }
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl LedgerObserver for NoopObserver {
    fn ram_delta(&self, _event: &RamEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::name;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<(String, i64)>>,
    }

    impl LedgerObserver for Recording {
        fn ram_delta(&self, event: &RamEvent) {
            self.events
                .lock()
                .unwrap()
                .push((event.tag.to_string(), event.delta));
        }
    }

    #[test]
    fn test_observer_records_events() {
        let obs = Recording::default();
        obs.ram_delta(&RamEvent {
            category: "table_row",
            kind: RamKind::Add,
            tag: "primary_index_add",
            payer: name("alice"),
            delta: 108,
        });
        let events = obs.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], ("primary_index_add".to_string(), 108));
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let obs = NoopObserver;
        obs.usage_updated(name("alice"), 1, 2);
        obs.limits_updated(name("alice"), -1, -1, -1);
    }
}
