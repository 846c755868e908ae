// crates/storage/src/store.rs
//! Versioned JSON document store

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flagrun_common::{FailureCounters, FlagrunError, FlagrunResult, ProcessedSet};

/// Schema version written into every document.
pub const SCHEMA_VERSION: u32 = 1;

/// A state document persisted by [`JsonStore`].
pub trait Document: Serialize + DeserializeOwned + Default {
    /// File name inside the state directory.
    const FILE_NAME: &'static str;
}

impl Document for FailureCounters {
    const FILE_NAME: &'static str = "failure_counts.json";
}

impl Document for ProcessedSet {
    const FILE_NAME: &'static str = "processed_challenges.json";
}

#[derive(Serialize)]
struct EnvelopeRef<'a, D> {
    schema_version: u32,
    #[serde(flatten)]
    body: &'a D,
}

#[derive(Deserialize)]
struct Envelope<D> {
    #[serde(default)]
    schema_version: Option<u32>,
    #[serde(flatten)]
    body: D,
}

pub type FailureStore = JsonStore<FailureCounters>;
pub type ProcessedStore = JsonStore<ProcessedSet>;

/// Single-writer JSON store for one document type.
#[derive(Debug, Clone)]
pub struct JsonStore<D> {
    path: PathBuf,
    _doc: PhantomData<fn() -> D>,
}

impl<D: Document> JsonStore<D> {
    /// Store at `<dir>/<D::FILE_NAME>`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::at(dir.as_ref().join(D::FILE_NAME))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, falling back to the empty default.
    pub fn load(&self) -> D {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "state file missing, starting empty");
                return D::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file unreadable, starting empty");
                return D::default();
            }
        };

        match serde_json::from_slice::<Envelope<D>>(&bytes) {
            Ok(envelope) => {
                if let Some(version) = envelope.schema_version {
                    if version > SCHEMA_VERSION {
                        warn!(
                            path = %self.path.display(),
                            version,
                            "state file written by a newer schema, loading known fields"
                        );
                    }
                }
                envelope.body
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file corrupt, starting empty");
                D::default()
            }
        }
    }

    /// Overwrite the document atomically.
    pub fn save(&self, doc: &D) -> FlagrunResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let envelope = EnvelopeRef {
            schema_version: SCHEMA_VERSION,
            body: doc,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&temp_path).map_err(|e| {
                FlagrunError::Storage(format!("failed to create {}: {}", temp_path.display(), e))
            })?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            FlagrunError::Storage(format!("failed to finalize {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), size = bytes.len(), "state saved");
        Ok(())
    }
}
