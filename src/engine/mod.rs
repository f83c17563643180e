//! Correlation engine service context
//!
//! `CorrelationEngine` bundles the storage handle, the per-identity lock
//! manager, and the in-process field catalogue into one explicitly
//! constructed context passed to every caller. The mutation surface lives
//! in the submodules: ingestion (`ingest`), tagging (`tagging`), the
//! link/unlink correlation core (`link`), and housekeeping (`pretty_id`,
//! `fields`).

pub mod fields;
pub mod ingest;
pub mod link;
pub mod pretty_id;
pub mod retry;
pub mod tagging;

pub use ingest::{IngestError, IngestResult};
pub use link::{CorrelateError, CorrelateResult, CorrelationResult};
pub use tagging::{TagError, TagResult};

use crate::engine::fields::FieldCatalogue;
use crate::lock::IdentityLocks;
use crate::storage::EntityStore;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Tunable knobs of the engine. Defaults mirror production behavior.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// When enabled, in-place member updates reject incoming records whose
    /// `last_seen` is older than the stored member's (stale-write rejection).
    pub last_seen_prioritized: bool,
    /// Hard ceiling on how many merged entities a single link may combine.
    /// Exceeding it is treated as a corruption guard, not a normal error.
    pub max_link_amount: usize,
    /// How many times a whole operation is retried on transient storage
    /// errors before the error propagates.
    pub storage_retries: u32,
    /// Fixed backoff between retries.
    pub retry_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            last_seen_prioritized: false,
            max_link_amount: 50,
            storage_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// The entity correlation and merge/split engine.
pub struct CorrelationEngine {
    store: Arc<dyn EntityStore>,
    locks: IdentityLocks,
    settings: EngineSettings,
    /// Plugin connections that have completed an ingestion batch in this
    /// process. Gates the bulk fast path per connection, which is only
    /// sound while the collection is known-empty for the writing adapter.
    ingested_plugins: DashMap<String, ()>,
    fields: FieldCatalogue,
}

impl CorrelationEngine {
    pub fn new(store: Arc<dyn EntityStore>, settings: EngineSettings) -> Self {
        Self {
            store,
            locks: IdentityLocks::new(),
            settings,
            ingested_plugins: DashMap::new(),
            fields: FieldCatalogue::new(),
        }
    }

    /// Whether `plugin_unique_name` may still take the bulk insert fast
    /// path: only before its first batch in this process.
    pub(crate) fn bulk_fast_path_armed(&self, plugin_unique_name: &str) -> bool {
        !self.ingested_plugins.contains_key(plugin_unique_name)
    }

    pub(crate) fn mark_plugin_ingested(&self, plugin_unique_name: &str) {
        self.ingested_plugins
            .insert(plugin_unique_name.to_string(), ());
    }

    pub fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Field-name catalogue accumulated by ingestion.
    pub fn fields(&self) -> &FieldCatalogue {
        &self.fields
    }

    /// Run `f` under the engine's bounded transient-error retry policy.
    pub(crate) fn with_retries<T, E>(
        &self,
        op: &str,
        f: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: retry::Transient + std::fmt::Display,
    {
        retry::retry_transient(
            self.settings.storage_retries,
            self.settings.retry_backoff,
            op,
            f,
        )
    }
}
