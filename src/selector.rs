//! Chunk selection: symbol tree + document text → non-overlapping
//! embeddable regions.
//!
//! # Algorithm
//!
//! 1. Flatten the symbol tree depth-first with ancestor chains.
//! 2. Apply the size/significance filter: constructors and class-like
//!    nodes are kept up to `max_class_lines`; bare single-line bindings
//!    and sub-minimum symbols are dropped unless high-value.
//! 3. Sort candidates by ascending line span and sweep, accepting a
//!    candidate only when its overlap with every already-accepted chunk
//!    stays below the tolerance fraction of the smaller chunk's size.
//!    Earlier, smaller chunks win.
//! 4. Class-like nodes over the cap are not embedded whole; their
//!    significant children are selected instead, prefixed with the class
//!    name and exempt from the minimum-line filter.
//! 5. Oversized text gets a centered window of exactly
//!    `max_chunk_chars` characters, clamped inward at either edge.
//! 6. Context = redundancy-filtered ancestor chain plus up to N
//!    immediately preceding comment lines, capped at 200 chars.

use crate::config::IndexingConfig;
use crate::fingerprint::fingerprint;
use crate::models::{Chunk, SymbolKind, SymbolNode};
use crate::symbols::{flatten, FlatSymbol};

/// Selection tuning, lifted out of [`IndexingConfig`] so the selector
/// stays independent of config loading.
#[derive(Debug, Clone)]
pub struct SelectorOptions {
    pub max_chunk_chars: usize,
    pub max_class_lines: usize,
    pub min_symbol_lines: usize,
    pub overlap_tolerance: f64,
    pub context_max_chars: usize,
    pub context_comment_lines: usize,
}

impl SelectorOptions {
    pub fn from_config(config: &IndexingConfig) -> Self {
        Self {
            max_chunk_chars: config.max_chunk_chars,
            max_class_lines: config.max_class_lines,
            min_symbol_lines: config.min_symbol_lines,
            overlap_tolerance: config.overlap_tolerance,
            context_max_chars: config.context_max_chars,
            context_comment_lines: config.context_comment_lines,
        }
    }
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self::from_config(&IndexingConfig::default())
    }
}

struct Candidate<'a> {
    node: &'a SymbolNode,
    ancestors: Vec<&'a SymbolNode>,
    /// Expanded child of an oversized class: bypasses the minimum-line
    /// filter and carries the class-prefixed name.
    display_name: String,
}

/// Select the ordered, non-overlapping chunk list for one file.
pub fn select_chunks(
    file_path: &str,
    symbols: &[SymbolNode],
    text: &str,
    opts: &SelectorOptions,
) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let flat = flatten(symbols);
    let mut candidates: Vec<Candidate<'_>> = Vec::new();

    for flat_symbol in &flat {
        let FlatSymbol { node, ancestors } = flat_symbol;
        let node = *node;
        let span = node.range.line_count();

        if node.kind.is_class_like() && span > opts.max_class_lines {
            // Covered by its expanded children below.
            continue;
        }

        let oversized_parent = nearest_oversized_class(ancestors, opts.max_class_lines);

        if let Some(class) = oversized_parent {
            // Fallback expansion: significant children of an oversized
            // class are always selected, bypassing the size filter.
            if matches!(
                node.kind,
                SymbolKind::Constructor | SymbolKind::Method | SymbolKind::Function
            ) {
                candidates.push(Candidate {
                    node,
                    ancestors: ancestors.clone(),
                    display_name: format!("{}.{}", class.name, node.name),
                });
            }
            continue;
        }

        // Trivial single-line bindings are bare identifiers, not code.
        if node.kind.is_binding() && span == 1 {
            continue;
        }

        if span < opts.min_symbol_lines && !node.kind.is_high_value() {
            continue;
        }

        candidates.push(Candidate {
            node,
            ancestors: ancestors.clone(),
            display_name: node.name.clone(),
        });
    }

    // Smaller spans first; ties resolve by position for determinism.
    candidates.sort_by_key(|c| (c.node.range.line_count(), c.node.range.start_line));

    let mut accepted: Vec<&Candidate<'_>> = Vec::new();
    'sweep: for cand in &candidates {
        let span = cand.node.range.line_count();
        for prior in &accepted {
            let overlap = overlap_lines(cand.node, prior.node);
            if overlap == 0 {
                continue;
            }
            // Fraction of the smaller chunk's size, so a wide candidate
            // can never swallow an already-accepted small chunk.
            let denom = span.min(prior.node.range.line_count());
            if (overlap as f64) / (denom as f64) >= opts.overlap_tolerance {
                continue 'sweep;
            }
        }
        accepted.push(cand);
    }

    accepted.sort_by_key(|c| c.node.range.start_line);

    let mut chunks = Vec::with_capacity(accepted.len());
    for cand in accepted {
        let range = cand.node.range;
        if range.start_line == 0 || range.start_line > lines.len() {
            continue;
        }
        let end = range.end_line.min(lines.len());

        let full = lines[range.start_line - 1..end].join("\n");
        let code = centered_window(&full, opts.max_chunk_chars).to_string();
        if code.trim().is_empty() {
            continue;
        }

        let context = build_context(cand, &lines, opts);

        chunks.push(Chunk {
            file_path: file_path.to_string(),
            line_start: range.start_line,
            line_end: end,
            fingerprint: fingerprint(&code),
            code,
            context,
            kind: cand.node.kind,
            name: cand.display_name.clone(),
            embedding: None,
        });
    }

    chunks
}

fn nearest_oversized_class<'a>(
    ancestors: &[&'a SymbolNode],
    max_class_lines: usize,
) -> Option<&'a SymbolNode> {
    ancestors
        .iter()
        .rev()
        .find(|a| a.kind.is_class_like() && a.range.line_count() > max_class_lines)
        .copied()
}

fn overlap_lines(a: &SymbolNode, b: &SymbolNode) -> usize {
    let start = a.range.start_line.max(b.range.start_line);
    let end = a.range.end_line.min(b.range.end_line);
    end.saturating_sub(start).saturating_add(if end >= start { 1 } else { 0 })
}

/// Extract a window of exactly `max_chars` characters centered on the
/// text's midpoint, shifted inward at either boundary. Shorter text is
/// returned whole.
pub fn centered_window(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars || max_chars == 0 {
        return text;
    }

    let mut start_char = (total / 2).saturating_sub(max_chars / 2);
    if start_char + max_chars > total {
        start_char = total - max_chars;
    }

    let mut iter = text.char_indices();
    let start_byte = iter
        .nth(start_char)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let end_byte = text[start_byte..]
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| start_byte + i)
        .unwrap_or(text.len());

    &text[start_byte..end_byte]
}

/// Ancestor chain plus preceding comment lines, capped.
fn build_context(cand: &Candidate<'_>, lines: &[&str], opts: &SelectorOptions) -> String {
    // Drop an ancestor when its name is already contained in a more
    // specific name further down the chain (avoids "Foo > FooBar").
    let mut names: Vec<&str> = cand.ancestors.iter().map(|a| a.name.as_str()).collect();
    names.push(&cand.display_name);

    let mut kept: Vec<&str> = Vec::new();
    for (i, &name) in names.iter().enumerate().take(names.len() - 1) {
        let redundant = names[i + 1..]
            .iter()
            .any(|more_specific| more_specific.contains(name));
        if !redundant && !name.is_empty() {
            kept.push(name);
        }
    }

    let mut parts = Vec::new();
    if !kept.is_empty() {
        parts.push(kept.join(" > "));
    }

    let comments = preceding_comments(lines, cand.node.range.start_line, opts.context_comment_lines);
    if !comments.is_empty() {
        parts.push(comments.join(" "));
    }

    truncate_chars(&parts.join(" "), opts.context_max_chars)
}

const COMMENT_MARKERS: &[&str] = &["///", "//", "#", "--", "/*", "*", "<!--"];

/// Up to `max` comment lines immediately above `start_line`, in source
/// order.
fn preceding_comments(lines: &[&str], start_line: usize, max: usize) -> Vec<String> {
    let mut collected = Vec::new();
    let mut line = start_line.saturating_sub(1); // 1-based line above the symbol

    while line >= 1 && collected.len() < max {
        let trimmed = lines[line - 1].trim();
        let is_comment = COMMENT_MARKERS.iter().any(|m| trimmed.starts_with(m));
        if !is_comment {
            break;
        }
        collected.push(trimmed.to_string());
        line -= 1;
    }

    collected.reverse();
    collected
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}
