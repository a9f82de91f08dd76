//! Search: cosine ranking with thresholding, relative relevance
//! windowing, and dedup.
//!
//! # Ranking pipeline
//!
//! 1. Filter the corpus by include/exclude glob patterns (comma
//!    separated, case-insensitive; invalid patterns are logged and
//!    skipped rather than aborting the filter).
//! 2. Cosine similarity between the query vector and each chunk.
//! 3. Drop candidates below the similarity threshold.
//! 4. Drop dense/minified chunks (average non-whitespace chars per
//!    line above the cutoff) — they pollute results with unreadable code.
//! 5. Sort descending and keep only results within the relevance
//!    window of the top score, so a strong top match suppresses weak
//!    tail matches that cleared the absolute threshold.
//! 6. Dedup by `(file_path, fingerprint)`, first (highest) occurrence
//!    wins, stopping at `max_results`.
//!
//! An empty corpus or a query nothing matches returns an empty list,
//! never an error.

use globset::{GlobBuilder, GlobMatcher};

use crate::config::SearchConfig;
use crate::models::{Chunk, SearchResult};

/// Per-query knobs, combining config defaults with CLI overrides.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub similarity_threshold: f32,
    pub relevance_window: f32,
    pub max_results: usize,
    pub max_line_density: f32,
    /// Comma-separated glob patterns; a file must match at least one
    /// when any are given.
    pub include_pattern: Option<String>,
    /// Comma-separated glob patterns; matching any excludes the file.
    pub exclude_pattern: Option<String>,
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            similarity_threshold: config.similarity_threshold,
            relevance_window: config.relevance_window,
            max_results: config.max_results,
            max_line_density: config.max_line_density,
            include_pattern: None,
            exclude_pattern: None,
        }
    }
}

/// Rank the corpus against a query vector.
pub fn search_corpus(query_vec: &[f32], chunks: &[Chunk], opts: &SearchOptions) -> Vec<SearchResult> {
    let includes = compile_patterns(opts.include_pattern.as_deref());
    let excludes = compile_patterns(opts.exclude_pattern.as_deref());

    let mut scored: Vec<(&Chunk, f32)> = chunks
        .iter()
        .filter(|c| path_passes(&c.file_path, &includes, &excludes))
        .filter_map(|c| {
            let embedding = c.embedding.as_ref()?;
            let score = cosine_similarity(query_vec, embedding);
            (score >= opts.similarity_threshold).then_some((c, score))
        })
        .filter(|(c, _)| line_density(&c.code) <= opts.max_line_density)
        .collect();

    if scored.is_empty() {
        return Vec::new();
    }

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    // Relative relevance window: measured from the top score, not zero.
    let floor = scored[0].1 - opts.relevance_window;

    let mut seen: std::collections::HashSet<(&str, &str)> = std::collections::HashSet::new();
    let mut results = Vec::new();

    for (chunk, score) in scored {
        if score < floor {
            break;
        }
        if !seen.insert((chunk.file_path.as_str(), chunk.fingerprint.as_str())) {
            continue;
        }

        let snippet: String = chunk.code.chars().take(240).collect();
        results.push(SearchResult {
            file_path: chunk.file_path.clone(),
            line_start: chunk.line_start,
            line_end: chunk.line_end,
            name: chunk.name.clone(),
            kind: chunk.kind,
            fingerprint: chunk.fingerprint.clone(),
            score,
            snippet,
        });

        if results.len() >= opts.max_results {
            break;
        }
    }

    results
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty or
/// mismatched-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Average non-whitespace characters per line; minified one-liners
/// score in the thousands.
fn line_density(code: &str) -> f32 {
    let lines = code.lines().count().max(1);
    let non_ws = code.chars().filter(|c| !c.is_whitespace()).count();
    non_ws as f32 / lines as f32
}

/// Compile a comma-separated pattern list, skipping (and logging)
/// entries that fail to parse so one bad pattern never hides every
/// result.
fn compile_patterns(raw: Option<&str>) -> Vec<GlobMatcher> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            match GlobBuilder::new(p).case_insensitive(true).build() {
                Ok(glob) => Some(glob.compile_matcher()),
                Err(e) => {
                    eprintln!("Warning: ignoring invalid pattern '{}': {}", p, e);
                    None
                }
            }
        })
        .collect()
}

fn path_passes(path: &str, includes: &[GlobMatcher], excludes: &[GlobMatcher]) -> bool {
    if excludes.iter().any(|m| m.is_match(path)) {
        return false;
    }
    if includes.is_empty() {
        return true;
    }
    includes.iter().any(|m| m.is_match(path))
}
