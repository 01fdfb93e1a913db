//! Contract-facing table/cursor engine: CRUD plus primary and
//! secondary-index iteration over the versioned store set, billed
//! through the resource limits manager.

pub mod cursor;
pub mod engine;

pub use cursor::{IteratorCache, RowRef};
pub use engine::TableEngine;
