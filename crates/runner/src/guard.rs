//! Memory initialization guard
//!
//! Agent memory for a challenge is wiped once, the first time any worker
//! picks that challenge up. Workers are separate processes, so the claim is
//! recorded twice: in an in-process set and, when a marker directory is
//! configured, as a marker file created with create-new semantics. The
//! filesystem decides the race between processes; only one creator wins.

use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct MemoryInitGuard {
    marker_dir: Option<PathBuf>,
    claimed: Mutex<HashSet<String>>,
}

impl MemoryInitGuard {
    /// Guard visible only to this process.
    pub fn in_process() -> Self {
        Self {
            marker_dir: None,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Guard shared by every process pointed at `dir`.
    pub fn shared(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            marker_dir: Some(dir),
            claimed: Mutex::new(HashSet::new()),
        })
    }

    pub fn marker_dir(&self) -> Option<&Path> {
        self.marker_dir.as_deref()
    }

    /// Returns `true` for exactly one caller per key; that caller owns the
    /// memory reset.
    pub fn try_claim(&self, key: &str) -> bool {
        let mut claimed = self.claimed.lock();
        if claimed.contains(key) {
            return false;
        }

        let won = match &self.marker_dir {
            None => true,
            Some(dir) => {
                let marker = dir.join(marker_name(key));
                match OpenOptions::new().write(true).create_new(true).open(&marker) {
                    Ok(_) => true,
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        debug!(key, "memory already initialized by another worker");
                        false
                    }
                    Err(e) => {
                        warn!(key, error = %e, "cannot record memory init marker, skipping reset");
                        false
                    }
                }
            }
        };

        claimed.insert(key.to_string());
        won
    }
}

fn marker_name(key: &str) -> String {
    format!("{}.init", hex::encode(Md5::digest(key.as_bytes())))
}
