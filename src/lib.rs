//! Amalgam: Asset-Aggregation & Entity Correlation Engine
//!
//! Ingests per-adapter records ("adapter entities"), correlates them into
//! deduplicated merged entities, and keeps the corpus consistent through
//! merge (link), split (unlink), tagging, and deletion under concurrent
//! writers.
//!
//! # Core Concepts
//!
//! - **AdapterEntity**: one record as discovered by a single adapter
//!   connection, identified by its `quick_id`
//! - **MergedEntity**: the deduplicated real-world device or user built by
//!   correlating one or more adapter entities
//! - **Link / Unlink**: merge N entities known to be the same real thing,
//!   or split one adapter entity back out into its own document
//!
//! # Example
//!
//! ```
//! use amalgam::{CorrelationEngine, EngineSettings, OpenStore, SqliteStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(SqliteStore::open_in_memory().unwrap());
//! let engine = CorrelationEngine::new(store, EngineSettings::default());
//! // Engine is ready for ingestion, tagging, and correlation
//! ```

pub mod engine;
pub mod entity;
pub mod lock;
pub mod storage;

pub use engine::{
    CorrelateError, CorrelateResult, CorrelationEngine, CorrelationResult, EngineSettings,
    IngestError, IngestResult, TagError, TagResult,
};
pub use entity::{
    AdapterEntity, AdapterIdentity, EntityType, InternalAxonId, MergedEntity, PluginIdentity,
    QuickId, Tag, TagAction, TagType,
};
pub use lock::{IdentityGuard, IdentityLocks};
pub use storage::{
    EntityOps, EntityStore, OpenStore, SqliteStore, StorageError, StorageResult, StoreSession,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
