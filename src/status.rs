//! Shared status store.
//!
//! The backend, the HPC pipeline, and the FITS writer exchange status
//! through a process-shared table of string key/value pairs. The table is
//! always read and written as a whole: `update` stages entries locally and
//! `write` commits every staged entry in one step, so readers never observe
//! a half-applied publish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared status store handle.
///
/// The handle is cheaply clonable; clones refer to the same table. The
/// cooperating external processes hold their own handles (in the real system
/// the table lives in shared memory; here the sharing mechanism is opaque to
/// the core).
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    table: Arc<Mutex<HashMap<String, String>>>,
    staged: Arc<Mutex<HashMap<String, String>>>,
}

impl StatusStore {
    /// Creates an empty status store.
    pub fn new() -> StatusStore {
        StatusStore::default()
    }

    /// Returns a snapshot of the whole table.
    pub fn read(&self) -> HashMap<String, String> {
        self.table.lock().unwrap().clone()
    }

    /// Returns the value of one key from a fresh snapshot.
    pub fn get(&self, key: &str) -> Option<String> {
        self.table.lock().unwrap().get(key).cloned()
    }

    /// Stages one key/value pair for the next [`StatusStore::write`].
    pub fn update(&self, key: impl Into<String>, value: impl ToString) {
        self.staged
            .lock()
            .unwrap()
            .insert(key.into(), value.to_string());
    }

    /// Commits all staged entries to the table atomically.
    pub fn write(&self) {
        let staged = std::mem::take(&mut *self.staged.lock().unwrap());
        if staged.is_empty() {
            return;
        }
        tracing::debug!(entries = staged.len(), "status store publish");
        self.table.lock().unwrap().extend(staged);
    }

    /// Commits a single key/value pair immediately.
    ///
    /// Convenience for the external-process side of the contract (liveness
    /// and receive status keys), equivalent to `update` followed by `write`.
    pub fn put(&self, key: impl Into<String>, value: impl ToString) {
        self.table
            .lock()
            .unwrap()
            .insert(key.into(), value.to_string());
    }
}
