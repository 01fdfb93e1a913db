//! Shared foundation for the Kestrel deterministic state layer.
//!
//! Everything in this crate is pure data and pure arithmetic: identifier
//! names, the error taxonomy, chain configuration, the resource-metering
//! value types, deterministic software floats and the mutation-observer
//! trait. No I/O, no locks, no clocks: every function here must compute
//! the same result on every node.

pub mod config;
pub mod error;
pub mod name;
pub mod observer;
pub mod resource;
pub mod softfloat;

pub use error::{ErrorKind, KestrelError, KestrelResult};
pub use name::Name;
