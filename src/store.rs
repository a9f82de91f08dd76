//! The corpus store: every current chunk across the workspace.
//!
//! Chunks live in a `HashMap` keyed by file path behind
//! `std::sync::RwLock`; a file's subset is only ever replaced wholesale,
//! so readers never observe a partially merged chunk list. A monotonic
//! ticket counter makes concurrent re-indexes of the same file resolve
//! last-write-wins at merge time.
//!
//! Persistence is a single JSON snapshot (all chunks including their
//! embeddings). A missing, corrupt, or version-mismatched snapshot
//! loads as an empty corpus — the caller falls back to a full re-index.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::models::Chunk;

const SNAPSHOT_VERSION: u32 = 1;

struct FileEntry {
    /// Ticket of the run that last merged this file.
    applied_ticket: u64,
    chunks: Vec<Chunk>,
}

/// Thread-safe corpus of indexed chunks, keyed by file path.
pub struct CorpusStore {
    files: RwLock<HashMap<String, FileEntry>>,
    next_ticket: AtomicU64,
}

impl CorpusStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Reserve a merge ticket. Taken at selection time so that of two
    /// overlapping re-indexes of the same file, the later one wins.
    pub fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    /// Atomically replace a file's chunk subset.
    ///
    /// Returns `false` (and leaves the store untouched) when a newer
    /// run already merged this file — the caller's result is stale.
    pub fn replace_file(&self, file_path: &str, chunks: Vec<Chunk>, ticket: u64) -> bool {
        let mut files = self.files.write().expect("corpus lock poisoned");
        let entry = files.entry(file_path.to_string()).or_insert(FileEntry {
            applied_ticket: 0,
            chunks: Vec::new(),
        });

        if ticket < entry.applied_ticket {
            return false;
        }

        entry.applied_ticket = ticket;
        entry.chunks = chunks;
        true
    }

    /// Drop a file entirely (persistent embedding failure).
    pub fn remove_file(&self, file_path: &str) {
        self.files
            .write()
            .expect("corpus lock poisoned")
            .remove(file_path);
    }

    /// Stored embedding for an unchanged chunk: same file, same start
    /// line, same fingerprint. Content that moved lines misses by
    /// design — position is part of the key.
    pub fn lookup_embedding(
        &self,
        file_path: &str,
        line_start: usize,
        fp: &str,
    ) -> Option<Vec<f32>> {
        let files = self.files.read().expect("corpus lock poisoned");
        let entry = files.get(file_path)?;
        entry
            .chunks
            .iter()
            .find(|c| c.line_start == line_start && c.fingerprint == fp)
            .and_then(|c| c.embedding.clone())
    }

    /// Clone of every chunk, for search.
    pub fn snapshot_chunks(&self) -> Vec<Chunk> {
        let files = self.files.read().expect("corpus lock poisoned");
        files.values().flat_map(|e| e.chunks.iter().cloned()).collect()
    }

    /// Clone of one file's chunks.
    pub fn file_chunks(&self, file_path: &str) -> Vec<Chunk> {
        let files = self.files.read().expect("corpus lock poisoned");
        files
            .get(file_path)
            .map(|e| e.chunks.clone())
            .unwrap_or_default()
    }

    pub fn file_count(&self) -> usize {
        self.files.read().expect("corpus lock poisoned").len()
    }

    pub fn chunk_count(&self) -> usize {
        let files = self.files.read().expect("corpus lock poisoned");
        files.values().map(|e| e.chunks.len()).sum()
    }

    pub fn embedded_count(&self) -> usize {
        let files = self.files.read().expect("corpus lock poisoned");
        files
            .values()
            .flat_map(|e| e.chunks.iter())
            .filter(|c| c.embedding.is_some())
            .count()
    }

    /// Write the full snapshot to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let files = self.files.read().expect("corpus lock poisoned");
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            files: files
                .iter()
                .map(|(path, entry)| (path.clone(), entry.chunks.clone()))
                .collect(),
        };

        let json = serde_json::to_string(&snapshot)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write snapshot: {}", path.display()))?;
        Ok(())
    }

    /// Load a snapshot, treating missing/corrupt/outdated files as an
    /// empty corpus rather than an error.
    pub fn load(path: &Path) -> Self {
        let store = Self::new();

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return store,
        };

        let snapshot: Snapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                eprintln!(
                    "Warning: corrupt corpus snapshot {} ({}); starting empty",
                    path.display(),
                    e
                );
                return store;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            eprintln!(
                "Warning: corpus snapshot version {} != {}; starting empty",
                snapshot.version, SNAPSHOT_VERSION
            );
            return store;
        }

        let mut files = store.files.write().expect("corpus lock poisoned");
        for (file_path, chunks) in snapshot.files {
            files.insert(
                file_path,
                FileEntry {
                    applied_ticket: 0,
                    chunks,
                },
            );
        }
        drop(files);

        store
    }
}

impl Default for CorpusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    files: HashMap<String, Vec<Chunk>>,
}
