//! Job record store boundary.
//!
//! The engine consumes durable storage only through `get`, `list_due`,
//! `list_by_scope`, `create` and a single-record `conditional_update`. No
//! multi-key transactions are assumed, so any key-value backend with a
//! compare-and-set on one record can host the engine.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobRecordStore, StoreError, load_required};
