//! Storage - durable failure counters and processed-challenge records
//!
//! Each document is a small versioned JSON file rewritten in full on every
//! save (temp file + rename), so an interrupted save leaves the previous
//! version intact. Missing or unreadable files load as empty defaults.

mod store;

pub use store::{Document, FailureStore, JsonStore, ProcessedStore, SCHEMA_VERSION};

use std::path::Path;

/// Both state documents rooted in one directory.
pub struct StateStores {
    pub failures: FailureStore,
    pub processed: ProcessedStore,
}

impl StateStores {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            failures: FailureStore::in_dir(dir),
            processed: ProcessedStore::in_dir(dir),
        }
    }
}
