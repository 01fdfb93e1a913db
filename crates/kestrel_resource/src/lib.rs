//! Per-account elastic-limit accounting (RAM, CPU, NET) with
//! sliding-window usage and congestion control over the versioned store
//! set.

pub mod limits;
pub mod pending_net;

pub use limits::ResourceLimitsManager;
pub use pending_net::BlockPendingNet;
