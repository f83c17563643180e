//! Storage backends for the correlation engine
//!
//! The engine consumes any backend implementing the `EntityStore` trait.
//! The primary implementation is `SqliteStore` for persistent storage.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{
    find_by_quick_id, BulkInsertOutcome, EntityOps, EntityStore, MemberUpdate, OpenStore,
    StorageError, StorageResult, StoreSession,
};
