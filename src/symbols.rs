//! Structure-provider seam and symbol tree utilities.
//!
//! The editor-side collaborator owns parsing; Quarry only consumes its
//! symbol tree. [`StructureProvider`] is the seam: the shipped
//! [`CommandProvider`] shells out to a configured command that prints the
//! tree as JSON, and [`crate::markup::MarkupProvider`] covers markup
//! files that have no provider at all.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;

use crate::models::SymbolNode;

/// Supplies the symbol tree for a file.
///
/// Implementations must be `Send + Sync`; the indexer holds one behind a
/// trait object for the whole run.
#[async_trait]
pub trait StructureProvider: Send + Sync {
    /// Provider name for diagnostics.
    fn name(&self) -> &str;

    /// Symbol tree for `path`. An empty vec means the file contributes
    /// zero chunks; errors are isolated per-file by the caller.
    async fn symbols(&self, path: &Path, text: &str) -> Result<Vec<SymbolNode>>;
}

/// Runs the collaborator command configured as `provider.symbol_cmd` and
/// parses its stdout as a JSON symbol tree.
///
/// The command receives the file path as its final argument and must
/// print either a JSON array of nodes or `{"symbols": [...]}`.
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(symbol_cmd: &str) -> Result<Self> {
        let mut parts = symbol_cmd.split_whitespace();
        let program = match parts.next() {
            Some(p) => p.to_string(),
            None => bail!("provider.symbol_cmd is empty"),
        };
        Ok(Self {
            program,
            args: parts.map(str::to_string).collect(),
        })
    }
}

#[async_trait]
impl StructureProvider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    async fn symbols(&self, path: &Path, _text: &str) -> Result<Vec<SymbolNode>> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()
            .await
            .with_context(|| format!("Failed to run symbol provider: {}", self.program))?;

        if !output.status.success() {
            bail!(
                "Symbol provider exited with {} for {}",
                output.status,
                path.display()
            );
        }

        parse_symbol_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the collaborator's JSON output.
///
/// Blank output is treated as "no symbols", matching the policy that a
/// file without structure contributes zero chunks.
pub fn parse_symbol_json(raw: &str) -> Result<Vec<SymbolNode>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value =
        serde_json::from_str(trimmed).context("Symbol provider output is not valid JSON")?;

    let nodes = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        serde_json::Value::Object(ref map) if map.contains_key("symbols") => {
            serde_json::from_value(map["symbols"].clone())?
        }
        _ => bail!("Symbol provider output must be an array or {{\"symbols\": [...]}}"),
    };

    Ok(nodes)
}

/// A symbol paired with its ancestor chain, outermost first.
#[derive(Debug)]
pub struct FlatSymbol<'a> {
    pub node: &'a SymbolNode,
    pub ancestors: Vec<&'a SymbolNode>,
}

/// Flatten a symbol tree depth-first into `(node, ancestors)` pairs.
pub fn flatten(roots: &[SymbolNode]) -> Vec<FlatSymbol<'_>> {
    let mut out = Vec::new();
    let mut stack = Vec::new();
    for root in roots {
        walk(root, &mut stack, &mut out);
    }
    out
}

fn walk<'a>(
    node: &'a SymbolNode,
    ancestors: &mut Vec<&'a SymbolNode>,
    out: &mut Vec<FlatSymbol<'a>>,
) {
    out.push(FlatSymbol {
        node,
        ancestors: ancestors.clone(),
    });
    ancestors.push(node);
    for child in &node.children {
        walk(child, ancestors, out);
    }
    ancestors.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SymbolKind, SymbolRange};

    fn node(name: &str, kind: SymbolKind, start: usize, end: usize) -> SymbolNode {
        SymbolNode {
            name: name.to_string(),
            kind,
            range: SymbolRange {
                start_line: start,
                end_line: end,
            },
            children: Vec::new(),
        }
    }

    #[test]
    fn test_flatten_depth_first_with_ancestors() {
        let mut class = node("Widget", SymbolKind::Class, 1, 30);
        let mut method = node("render", SymbolKind::Method, 5, 20);
        method.children.push(node("helper", SymbolKind::Function, 8, 12));
        class.children.push(method);
        class.children.push(node("size", SymbolKind::Field, 25, 25));

        let flat = flatten(std::slice::from_ref(&class));
        let names: Vec<&str> = flat.iter().map(|f| f.node.name.as_str()).collect();
        assert_eq!(names, vec!["Widget", "render", "helper", "size"]);

        let helper = &flat[2];
        let chain: Vec<&str> = helper.ancestors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(chain, vec!["Widget", "render"]);

        // Siblings do not inherit each other as ancestors.
        assert_eq!(flat[3].ancestors.len(), 1);
    }

    #[test]
    fn test_parse_symbol_json_array_and_wrapper() {
        let array = r#"[{"name": "f", "kind": "function", "range": {"startLine": 1, "endLine": 4}}]"#;
        assert_eq!(parse_symbol_json(array).unwrap().len(), 1);

        let wrapped = r#"{"symbols": [{"name": "f", "kind": "function", "range": {"startLine": 1, "endLine": 4}}]}"#;
        assert_eq!(parse_symbol_json(wrapped).unwrap().len(), 1);

        assert!(parse_symbol_json("").unwrap().is_empty());
        assert!(parse_symbol_json("not json").is_err());
    }
}
