//! Block-wide pending NET usage counter.
//!
//! NET is billed against one block-level budget shared by every shard,
//! so this is the single piece of genuinely shared mutable state in the
//! layer. It lives in a lock-guarded cell that is injected into every
//! component that needs it (never ambient global state) and is not
//! versioned: it must be exact and block-atomic, but it is fully
//! re-derived each block and never individually rolled back.

use kestrel_common::error::ResourceError;
use parking_lot::RwLock;

/// Lock-guarded block-wide pending NET usage.
///
/// Reads take the shared lock; additions and rollbacks take the
/// exclusive lock.
#[derive(Debug, Default)]
pub struct BlockPendingNet {
    pending: RwLock<u64>,
}

impl BlockPendingNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to zero at the start of a block.
    pub fn init(&self) {
        *self.pending.write() = 0;
    }

    pub fn get(&self) -> u64 {
        *self.pending.read()
    }

    /// Account a transaction's NET usage into the block.
    pub fn add(&self, usage: u64) -> Result<(), ResourceError> {
        let mut pending = self.pending.write();
        let next = pending
            .checked_add(usage)
            .ok_or(ResourceError::UsageOverflow("block pending net would overflow"))?;
        *pending = next;
        Ok(())
    }

    /// Roll back a failed transaction's NET usage.
    pub fn undo(&self, usage: u64) -> Result<(), ResourceError> {
        let mut pending = self.pending.write();
        let next = pending
            .checked_sub(usage)
            .ok_or(ResourceError::UsageOverflow("block pending net would underflow"))?;
        *pending = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_undo() {
        let net = BlockPendingNet::new();
        net.add(100).unwrap();
        net.add(50).unwrap();
        assert_eq!(net.get(), 150);
        net.undo(50).unwrap();
        assert_eq!(net.get(), 100);
    }

    #[test]
    fn test_init_resets() {
        let net = BlockPendingNet::new();
        net.add(999).unwrap();
        net.init();
        assert_eq!(net.get(), 0);
    }

    #[test]
    fn test_overflow_rejected() {
        let net = BlockPendingNet::new();
        net.add(u64::MAX).unwrap();
        assert!(net.add(1).is_err());
        assert_eq!(net.get(), u64::MAX);
    }

    #[test]
    fn test_underflow_rejected() {
        let net = BlockPendingNet::new();
        net.add(10).unwrap();
        assert!(net.undo(11).is_err());
        assert_eq!(net.get(), 10);
    }
}
