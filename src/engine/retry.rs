//! Bounded retry on transient storage errors.
//!
//! Retries happen at the operation-wrapper level, never inside the business
//! logic: a whole tag/link/ingest-record operation is re-run from scratch
//! against a fresh session. "Matched but not modified" style conflicts are
//! not retried here; those are logged and dropped by their callers.

use crate::storage::StorageError;
use std::time::Duration;
use tracing::warn;

/// Errors that may be worth retrying wholesale.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

/// Run `f`, retrying up to `attempts` times with a fixed `backoff` while it
/// fails transiently. The final error propagates unchanged.
pub fn retry_transient<T, E>(
    attempts: u32,
    backoff: Duration,
    op: &str,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
{
    let mut remaining = attempts;
    loop {
        match f() {
            Err(e) if e.is_transient() && remaining > 0 => {
                remaining -= 1;
                warn!("transient storage error in {op} ({remaining} retries left): {e}");
                std::thread::sleep(backoff);
            }
            other => return other,
        }
    }
}
