//! Content fingerprints and incremental-embedding bookkeeping.
//!
//! A chunk's fingerprint is the SHA-256 hex digest of its extracted code.
//! Together with the file path and start line it decides whether a stored
//! embedding can be reused on re-index; a per-run dedup map additionally
//! lets exact duplicates across files share one embed call.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// SHA-256 hex digest of a chunk's code text.
pub fn fingerprint(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fingerprint → embedding map scoped to one indexing run.
///
/// During a full re-index, the first occurrence of a fingerprint embeds
/// normally; every later exact duplicate (boilerplate copied between
/// files) reuses the vector instead of issuing another request.
#[derive(Debug, Default)]
pub struct RunDedup {
    seen: HashMap<String, Vec<f32>>,
}

impl RunDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector for an already-embedded fingerprint this run, if any.
    pub fn lookup(&self, fp: &str) -> Option<&Vec<f32>> {
        self.seen.get(fp)
    }

    /// Record a freshly computed (or cache-reused) embedding.
    pub fn record(&mut self, fp: &str, embedding: &[f32]) {
        self.seen
            .entry(fp.to_string())
            .or_insert_with(|| embedding.to_vec());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
