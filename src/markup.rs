//! Lightweight tree walker for markup files.
//!
//! Markup and document formats usually have no editor structure
//! provider, so element boundaries stand in for symbol ranges and the
//! opening tag's attribute string becomes the chunk context. The walker
//! is deliberately lenient: malformed markup ends the walk early and
//! whatever was collected so far is returned.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::models::{SymbolKind, SymbolNode, SymbolRange};
use crate::symbols::StructureProvider;

/// Structure provider for markup files (HTML, XML, SVG, ...).
pub struct MarkupProvider;

#[async_trait]
impl StructureProvider for MarkupProvider {
    fn name(&self) -> &str {
        "markup"
    }

    async fn symbols(&self, _path: &Path, text: &str) -> Result<Vec<SymbolNode>> {
        Ok(walk_markup(text))
    }
}

/// Does this path's extension route to the markup walker?
pub fn is_markup_path(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|m| m.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

struct OpenElement {
    name: String,
    attrs: String,
    start_line: usize,
    children: Vec<SymbolNode>,
}

/// Walk markup text and build a symbol tree from element boundaries.
pub fn walk_markup(text: &str) -> Vec<SymbolNode> {
    let line_starts = line_start_offsets(text);

    let mut reader = quick_xml::Reader::from_str(text);
    reader.config_mut().check_end_names = false;

    let mut roots: Vec<SymbolNode> = Vec::new();
    let mut stack: Vec<OpenElement> = Vec::new();

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                let attrs = attribute_string(&e);
                stack.push(OpenElement {
                    name,
                    attrs,
                    start_line: offset_to_line(&line_starts, pos),
                    children: Vec::new(),
                });
            }
            Ok(quick_xml::events::Event::End(_)) => {
                let end_line = offset_to_line(&line_starts, reader.buffer_position() as usize);
                if let Some(open) = stack.pop() {
                    let node = SymbolNode {
                        name: if open.attrs.is_empty() {
                            open.name
                        } else {
                            format!("{} {}", open.name, open.attrs)
                        },
                        kind: SymbolKind::Element,
                        range: SymbolRange {
                            start_line: open.start_line,
                            end_line,
                        },
                        children: open.children,
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => roots.push(node),
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            // Malformed markup: keep what we have.
            Err(_) => break,
            Ok(_) => {}
        }
    }

    // Unclosed elements at EOF close at the last line.
    let last_line = line_starts.len();
    while let Some(open) = stack.pop() {
        let node = SymbolNode {
            name: if open.attrs.is_empty() {
                open.name
            } else {
                format!("{} {}", open.name, open.attrs)
            },
            kind: SymbolKind::Element,
            range: SymbolRange {
                start_line: open.start_line,
                end_line: last_line,
            },
            children: open.children,
        };
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    roots
}

fn attribute_string(e: &quick_xml::events::BytesStart<'_>) -> String {
    let mut parts = Vec::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        parts.push(format!("{}=\"{}\"", key, value));
    }
    parts.join(" ")
}

/// Byte offset of the first character of each line.
fn line_start_offsets(text: &str) -> Vec<usize> {
    let mut starts = vec![0usize];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            starts.push(i + 1);
        }
    }
    starts
}

/// 1-based line containing the byte at `offset`.
fn offset_to_line(line_starts: &[usize], offset: usize) -> usize {
    match line_starts.binary_search(&offset) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_nested_elements() {
        let html = "<div class=\"panel\">\n  <section id=\"a\">\n    <p>text</p>\n  </section>\n</div>\n";
        let roots = walk_markup(html);
        assert_eq!(roots.len(), 1);

        let div = &roots[0];
        assert!(div.name.starts_with("div"));
        assert!(div.name.contains("class=\"panel\""));
        assert_eq!(div.kind, SymbolKind::Element);
        assert_eq!(div.range.start_line, 1);
        assert_eq!(div.range.end_line, 5);

        assert_eq!(div.children.len(), 1);
        let section = &div.children[0];
        assert!(section.name.contains("id=\"a\""));
        assert_eq!(section.children.len(), 1);
    }

    #[test]
    fn test_unclosed_element_closes_at_eof() {
        let html = "<article>\n<p>dangling\n";
        let roots = walk_markup(html);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].range.end_line, 3);
    }

    #[test]
    fn test_is_markup_path() {
        let exts = vec!["html".to_string(), "xml".to_string()];
        assert!(is_markup_path(Path::new("a/b/index.HTML"), &exts));
        assert!(!is_markup_path(Path::new("a/b/main.rs"), &exts));
        assert!(!is_markup_path(Path::new("Makefile"), &exts));
    }

    #[test]
    fn test_offset_to_line() {
        let text = "ab\ncd\nef";
        let starts = line_start_offsets(text);
        assert_eq!(offset_to_line(&starts, 0), 1);
        assert_eq!(offset_to_line(&starts, 1), 1);
        assert_eq!(offset_to_line(&starts, 3), 2);
        assert_eq!(offset_to_line(&starts, 7), 3);
    }
}
