//! Core data models used throughout Quarry.
//!
//! These types represent the symbol trees supplied by the structure
//! provider, the chunks that flow through the indexing pipeline, and the
//! ranked results returned by search.

use serde::{Deserialize, Serialize};

/// Symbol classification, as reported by the structure provider.
///
/// Unknown kind strings deserialize to [`SymbolKind::Other`] so a
/// collaborator speaking a newer dialect degrades to the default filter
/// rules instead of failing the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Module,
    Namespace,
    Class,
    Struct,
    Enum,
    Interface,
    Constructor,
    Method,
    Function,
    Property,
    Field,
    Variable,
    Constant,
    /// Markup element produced by the fallback tree walker.
    Element,
    #[serde(other)]
    Other,
}

impl SymbolKind {
    /// Container kinds whose children are themselves embeddable.
    pub fn is_class_like(self) -> bool {
        matches!(
            self,
            SymbolKind::Class
                | SymbolKind::Struct
                | SymbolKind::Enum
                | SymbolKind::Interface
                | SymbolKind::Namespace
        )
    }

    /// Kinds worth embedding even when they span fewer than the minimum
    /// line count.
    pub fn is_high_value(self) -> bool {
        matches!(
            self,
            SymbolKind::Constructor | SymbolKind::Method | SymbolKind::Function
        ) || self.is_class_like()
    }

    /// Kinds that describe a single binding rather than a body of code.
    pub fn is_binding(self) -> bool {
        matches!(
            self,
            SymbolKind::Variable | SymbolKind::Constant | SymbolKind::Field | SymbolKind::Property
        )
    }
}

/// Inclusive 1-based line range of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolRange {
    pub start_line: usize,
    pub end_line: usize,
}

impl SymbolRange {
    /// Number of lines the range spans (inclusive).
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }
}

/// A node in the structure provider's symbol tree.
///
/// Matches the collaborator's JSON contract:
/// `{"name", "kind", "range": {"startLine", "endLine"}, "children": []}`.
/// Read-only input to the chunk selector; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolNode {
    pub name: String,
    pub kind: SymbolKind,
    pub range: SymbolRange,
    #[serde(default)]
    pub children: Vec<SymbolNode>,
}

/// A contiguous code region selected for embedding.
///
/// Identity within the corpus is `(file_path, fingerprint)`. The
/// `embedding` field is `None` between selection and a successful embed
/// call (or cache hit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub file_path: String,
    /// Inclusive 1-based start line.
    pub line_start: usize,
    /// Inclusive 1-based end line.
    pub line_end: usize,
    /// Extracted source text, bounded by the configured character budget.
    pub code: String,
    /// Ancestor name chain plus nearby comment lines, capped at 200 chars.
    pub context: String,
    /// SHA-256 hex digest of `code`.
    pub fingerprint: String,
    pub kind: SymbolKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Number of lines this chunk covers.
    pub fn line_count(&self) -> usize {
        self.line_end.saturating_sub(self.line_start) + 1
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub file_path: String,
    pub line_start: usize,
    pub line_end: usize,
    pub name: String,
    pub kind: SymbolKind,
    pub fingerprint: String,
    /// Cosine similarity against the query vector, in `[-1.0, 1.0]`.
    pub score: f32,
    /// Text excerpt for display.
    pub snippet: String,
}
