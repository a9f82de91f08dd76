//! Indexing pipeline orchestration.
//!
//! Coordinates the full flow: file discovery → structure provider →
//! chunk selection → fingerprint cache filter → batch embedding →
//! atomic merge into the corpus store → snapshot save.
//!
//! Failure isolation follows the per-file rule: a file whose provider
//! misbehaves contributes zero chunks, a file whose embedding fails
//! persistently is dropped and counted, and neither aborts its
//! siblings. Only a service that cannot reach `Ready` at all aborts the
//! whole run, since nothing downstream can proceed without it.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::Config;
use crate::embed::{self, EmbeddingBackend, HttpEmbedClient};
use crate::fingerprint::RunDedup;
use crate::markup::{self, MarkupProvider};
use crate::models::Chunk;
use crate::progress::{IndexProgressEvent, ProgressReporter};
use crate::selector::{select_chunks, SelectorOptions};
use crate::service::ServiceSupervisor;
use crate::store::CorpusStore;
use crate::symbols::{CommandProvider, StructureProvider};

/// Counts reported at the end of an indexing run.
#[derive(Debug, Default, Clone)]
pub struct IndexSummary {
    pub files_scanned: u64,
    pub files_indexed: u64,
    pub files_failed: u64,
    pub chunks_selected: u64,
    pub cache_hits: u64,
    pub dedup_hits: u64,
    pub chunks_embedded: u64,
}

/// Per-file outcome folded into the [`IndexSummary`].
#[derive(Debug, Default)]
struct FileOutcome {
    selected: u64,
    cache_hits: u64,
    dedup_hits: u64,
    embedded: u64,
}

/// Drives index and re-index operations over one corpus store.
pub struct Indexer {
    config: Config,
    store: Arc<CorpusStore>,
    backend: Arc<dyn EmbeddingBackend>,
    provider: Option<Arc<dyn StructureProvider>>,
    supervisor: Option<Arc<ServiceSupervisor>>,
}

impl Indexer {
    pub fn new(
        config: Config,
        store: Arc<CorpusStore>,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Result<Self> {
        let provider: Option<Arc<dyn StructureProvider>> =
            match config.provider.symbol_cmd.as_deref() {
                Some(cmd) => Some(Arc::new(CommandProvider::new(cmd)?)),
                None => None,
            };

        Ok(Self {
            config,
            store,
            backend,
            provider,
            supervisor: None,
        })
    }

    /// Substitute the structure provider (tests, embedded hosts).
    pub fn with_provider(mut self, provider: Arc<dyn StructureProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Attach the supervisor so runs are bracketed with the
    /// `Ready ⇄ Indexing` transitions and the remote index is synced.
    pub fn with_supervisor(mut self, supervisor: Arc<ServiceSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn store(&self) -> &Arc<CorpusStore> {
        &self.store
    }

    /// Full-workspace (re)index.
    ///
    /// `extra_exclude` is the CLI's comma-separated exclude pattern
    /// list, layered on top of the configured globs.
    pub async fn index_workspace(
        &self,
        extra_exclude: Option<&str>,
        reporter: &dyn ProgressReporter,
    ) -> Result<IndexSummary> {
        let root = self.config.indexing.root.clone();
        reporter.report(IndexProgressEvent::Scanning {
            root: root.display().to_string(),
        });

        let files = self.discover_files(&root, extra_exclude)?;
        let total = files.len() as u64;

        // Service-level failure aborts the run before any file work.
        if let Some(supervisor) = &self.supervisor {
            supervisor
                .start()
                .await
                .context("embedding service unavailable")?;
            supervisor.mark_indexing();
        }

        let mut summary = IndexSummary {
            files_scanned: total,
            ..Default::default()
        };
        let mut dedup = RunDedup::new();

        for (n, path) in files.iter().enumerate() {
            let ticket = self.store.ticket();
            match self.index_file(&root, path, ticket, Some(&mut dedup)).await {
                Ok(outcome) => {
                    summary.files_indexed += 1;
                    summary.chunks_selected += outcome.selected;
                    summary.cache_hits += outcome.cache_hits;
                    summary.dedup_hits += outcome.dedup_hits;
                    summary.chunks_embedded += outcome.embedded;
                }
                Err(e) => {
                    eprintln!("Warning: indexing failed for {}: {}", path.display(), e);
                    summary.files_failed += 1;
                }
            }
            reporter.report(IndexProgressEvent::Indexing {
                n: n as u64 + 1,
                total,
            });
        }

        if let Some(supervisor) = &self.supervisor {
            self.push_remote_index(supervisor).await;
            supervisor.mark_ready();
        }

        self.save_snapshot()?;
        Ok(summary)
    }

    /// Re-index a single file (the editor-save path).
    ///
    /// The merge ticket is reserved before any embedding happens, so
    /// when two saves of the same file race, the later save's merge
    /// wins even if the earlier one finishes last.
    pub async fn reindex_file(&self, path: &Path) -> Result<IndexSummary> {
        let root = self.config.indexing.root.clone();

        if let Some(supervisor) = &self.supervisor {
            supervisor
                .start()
                .await
                .context("embedding service unavailable")?;
            supervisor.mark_indexing();
        }

        let ticket = self.store.ticket();
        let result = self.index_file(&root, path, ticket, None).await;

        if let Some(supervisor) = &self.supervisor {
            supervisor.mark_ready();
        }

        let outcome = result?;
        self.save_snapshot()?;

        Ok(IndexSummary {
            files_scanned: 1,
            files_indexed: 1,
            chunks_selected: outcome.selected,
            cache_hits: outcome.cache_hits,
            dedup_hits: outcome.dedup_hits,
            chunks_embedded: outcome.embedded,
            ..Default::default()
        })
    }

    async fn index_file(
        &self,
        root: &Path,
        path: &Path,
        ticket: u64,
        mut dedup: Option<&mut RunDedup>,
    ) -> Result<FileOutcome> {
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            // Unreadable or binary files contribute zero chunks.
            Err(_) => {
                self.store.replace_file(&rel, Vec::new(), ticket);
                return Ok(FileOutcome::default());
            }
        };

        let symbols = if markup::is_markup_path(path, &self.config.indexing.markup_extensions) {
            MarkupProvider.symbols(path, &text).await.unwrap_or_default()
        } else {
            match &self.provider {
                Some(provider) => match provider.symbols(path, &text).await {
                    Ok(symbols) => symbols,
                    Err(e) => {
                        // Missing/malformed structure input: the file
                        // contributes zero chunks, indexing continues.
                        eprintln!("Warning: no symbols for {}: {}", rel, e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        };

        let opts = SelectorOptions::from_config(&self.config.indexing);
        let chunks = select_chunks(&rel, &symbols, &text, &opts);
        let selected = chunks.len() as u64;

        let mut outcome = FileOutcome {
            selected,
            ..Default::default()
        };

        // Split cache hits from chunks that genuinely need the service.
        let mut ready: Vec<Chunk> = Vec::new();
        let mut pending: Vec<Chunk> = Vec::new();

        for mut chunk in chunks {
            if let Some(vector) =
                self.store
                    .lookup_embedding(&rel, chunk.line_start, &chunk.fingerprint)
            {
                chunk.embedding = Some(vector);
                outcome.cache_hits += 1;
                ready.push(chunk);
            } else if let Some(vector) = dedup
                .as_deref()
                .and_then(|d| d.lookup(&chunk.fingerprint))
            {
                chunk.embedding = Some(vector.clone());
                outcome.dedup_hits += 1;
                ready.push(chunk);
            } else {
                pending.push(chunk);
            }
        }

        if !pending.is_empty() {
            if let Err(e) =
                embed::embed_chunks(Arc::clone(&self.backend), &self.config.embedding, &mut pending)
                    .await
            {
                // Persistent embedding failure removes the file's chunks.
                self.store.remove_file(&rel);
                return Err(e);
            }
            outcome.embedded = pending.len() as u64;
        }

        if let Some(dedup) = dedup.as_deref_mut() {
            for chunk in ready.iter().chain(pending.iter()) {
                if let Some(embedding) = &chunk.embedding {
                    dedup.record(&chunk.fingerprint, embedding);
                }
            }
        }

        ready.extend(pending);
        ready.sort_by_key(|c| c.line_start);
        self.store.replace_file(&rel, ready, ticket);

        Ok(outcome)
    }

    /// Best-effort mirror of the corpus into the service's own index
    /// via the bulk upsert endpoint.
    async fn push_remote_index(&self, supervisor: &ServiceSupervisor) {
        let Some(base_url) = supervisor.state().base_url() else {
            return;
        };

        let chunks = self.store.snapshot_chunks();
        if chunks.is_empty() {
            return;
        }

        let client = HttpEmbedClient::new(base_url, self.config.embedding.timeout_secs);
        if let Err(e) = client.update_file_embeddings(&chunks).await {
            eprintln!("Warning: remote index sync failed: {}", e);
        }
    }

    fn save_snapshot(&self) -> Result<()> {
        self.store.save(&self.config.store.path)
    }

    fn discover_files(&self, root: &Path, extra_exclude: Option<&str>) -> Result<Vec<PathBuf>> {
        if !root.exists() {
            bail!("Workspace root does not exist: {}", root.display());
        }

        let include_set = build_globset(&self.config.indexing.include_globs)?;

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(self.config.indexing.exclude_globs.clone());
        if let Some(extra) = extra_exclude {
            excludes.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string),
            );
        }
        let exclude_set = build_lenient_globset(&excludes);

        let mut files = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if !include_set.is_match(&rel_str) {
                continue;
            }

            files.push(path.to_path_buf());
        }

        // Deterministic ordering.
        files.sort();
        Ok(files)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Like [`build_globset`], but an invalid pattern is logged and skipped
/// (fail-open) — user-supplied exclude lists must never abort the run.
fn build_lenient_globset(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => eprintln!("Warning: ignoring invalid pattern '{}': {}", pattern, e),
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SymbolKind, SymbolNode, SymbolRange};
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves canned symbol trees keyed by file name.
    struct FixtureProvider {
        trees: HashMap<String, Vec<SymbolNode>>,
    }

    #[async_trait]
    impl StructureProvider for FixtureProvider {
        fn name(&self) -> &str {
            "fixture"
        }

        async fn symbols(&self, path: &Path, _text: &str) -> Result<Vec<SymbolNode>> {
            let key = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(self.trees.get(&key).cloned().unwrap_or_default())
        }
    }

    /// Counts embed calls; returns a constant unit vector per text.
    struct CountingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl crate::embed::EmbeddingBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn function_node(name: &str, start: usize, end: usize) -> SymbolNode {
        SymbolNode {
            name: name.to_string(),
            kind: SymbolKind::Function,
            range: SymbolRange {
                start_line: start,
                end_line: end,
            },
            children: Vec::new(),
        }
    }

    fn ten_line_fn(name: &str) -> String {
        let mut body = format!("fn {}() {{\n", name);
        for i in 0..8 {
            body.push_str(&format!("    step_{}();\n", i));
        }
        body.push_str("}\n");
        body
    }

    fn test_indexer(root: &Path, trees: HashMap<String, Vec<SymbolNode>>) -> (Indexer, Arc<CorpusStore>) {
        let mut config = Config::default();
        config.indexing.root = root.to_path_buf();
        config.store.path = root.join(".quarry/corpus.json");

        let store = Arc::new(CorpusStore::new());
        let backend = Arc::new(CountingBackend {
            calls: AtomicU32::new(0),
        });
        let indexer = Indexer::new(config, Arc::clone(&store), backend)
            .unwrap()
            .with_provider(Arc::new(FixtureProvider { trees }));
        (indexer, store)
    }

    #[tokio::test]
    async fn test_index_workspace_selects_and_embeds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), ten_line_fn("alpha")).unwrap();
        std::fs::write(dir.path().join("b.rs"), "const X: u32 = 1;\n").unwrap();

        let mut trees = HashMap::new();
        trees.insert("a.rs".to_string(), vec![function_node("alpha", 1, 10)]);
        trees.insert("b.rs".to_string(), Vec::new());

        let (indexer, store) = test_indexer(dir.path(), trees);
        let summary = indexer.index_workspace(None, &NoProgress).await.unwrap();

        assert_eq!(summary.files_scanned, 2);
        assert_eq!(summary.files_indexed, 2);
        assert_eq!(summary.chunks_selected, 1);
        assert_eq!(summary.chunks_embedded, 1);
        assert_eq!(store.chunk_count(), 1);
        assert_eq!(store.file_chunks("a.rs").len(), 1);
        assert!(store.file_chunks("b.rs").is_empty());
    }

    #[tokio::test]
    async fn test_reindex_unchanged_file_hits_cache_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, ten_line_fn("alpha")).unwrap();

        let mut trees = HashMap::new();
        trees.insert("a.rs".to_string(), vec![function_node("alpha", 1, 10)]);

        let mut config = Config::default();
        config.indexing.root = dir.path().to_path_buf();
        config.store.path = dir.path().join(".quarry/corpus.json");

        let store = Arc::new(CorpusStore::new());
        let backend = Arc::new(CountingBackend {
            calls: AtomicU32::new(0),
        });
        let calls = Arc::clone(&backend);
        let indexer = Indexer::new(config, Arc::clone(&store), backend)
            .unwrap()
            .with_provider(Arc::new(FixtureProvider { trees }));

        indexer.index_workspace(None, &NoProgress).await.unwrap();
        let first_run_calls = calls.calls.load(Ordering::SeqCst);
        assert!(first_run_calls > 0);
        let before = store.file_chunks("a.rs");

        // Unchanged content at the same position: cache hits only.
        let summary = indexer.reindex_file(&file).await.unwrap();
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.chunks_embedded, 0);
        assert_eq!(calls.calls.load(Ordering::SeqCst), first_run_calls);

        let after = store.file_chunks("a.rs");
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].fingerprint, after[0].fingerprint);
        assert_eq!(before[0].embedding, after[0].embedding);
    }

    #[tokio::test]
    async fn test_cross_file_dedup_embeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let body = ten_line_fn("same");
        std::fs::write(dir.path().join("a.rs"), &body).unwrap();
        std::fs::write(dir.path().join("b.rs"), &body).unwrap();

        let mut trees = HashMap::new();
        trees.insert("a.rs".to_string(), vec![function_node("same", 1, 10)]);
        trees.insert("b.rs".to_string(), vec![function_node("same", 1, 10)]);

        let mut config = Config::default();
        config.indexing.root = dir.path().to_path_buf();
        config.store.path = dir.path().join(".quarry/corpus.json");

        let store = Arc::new(CorpusStore::new());
        let backend = Arc::new(CountingBackend {
            calls: AtomicU32::new(0),
        });
        let calls = Arc::clone(&backend);
        let indexer = Indexer::new(config, Arc::clone(&store), backend)
            .unwrap()
            .with_provider(Arc::new(FixtureProvider { trees }));

        let summary = indexer.index_workspace(None, &NoProgress).await.unwrap();
        assert_eq!(summary.chunks_embedded, 1);
        assert_eq!(summary.dedup_hits, 1);
        assert_eq!(calls.calls.load(Ordering::SeqCst), 1);

        // Both occurrences carry the vector.
        assert!(store.file_chunks("a.rs")[0].embedding.is_some());
        assert!(store.file_chunks("b.rs")[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_failing_backend_isolates_file_and_drops_chunks() {
        struct FailingBackend;

        #[async_trait]
        impl crate::embed::EmbeddingBackend for FailingBackend {
            fn name(&self) -> &str {
                "failing"
            }

            async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                bail!("service unavailable")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), ten_line_fn("alpha")).unwrap();

        let mut trees = HashMap::new();
        trees.insert("a.rs".to_string(), vec![function_node("alpha", 1, 10)]);

        let mut config = Config::default();
        config.indexing.root = dir.path().to_path_buf();
        config.store.path = dir.path().join(".quarry/corpus.json");
        config.embedding.max_retries = 1;

        let store = Arc::new(CorpusStore::new());
        let indexer = Indexer::new(config, Arc::clone(&store), Arc::new(FailingBackend))
            .unwrap()
            .with_provider(Arc::new(FixtureProvider { trees }));

        let summary = indexer.index_workspace(None, &NoProgress).await.unwrap();
        assert_eq!(summary.files_failed, 1);
        assert_eq!(store.chunk_count(), 0);
    }

    #[tokio::test]
    async fn test_markup_file_uses_tree_walker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page.html"),
            "<main role=\"doc\">\n  <section>\n    <p>alpha</p>\n    <p>beta</p>\n  </section>\n</main>\n",
        )
        .unwrap();

        let (indexer, store) = test_indexer(dir.path(), HashMap::new());
        let summary = indexer.index_workspace(None, &NoProgress).await.unwrap();

        assert_eq!(summary.files_indexed, 1);
        assert!(summary.chunks_selected > 0);
        let chunks = store.file_chunks("page.html");
        assert!(chunks.iter().all(|c| c.kind == SymbolKind::Element));
    }

    #[tokio::test]
    async fn test_exclude_pattern_skips_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vendor")).unwrap();
        std::fs::write(dir.path().join("a.rs"), ten_line_fn("alpha")).unwrap();
        std::fs::write(dir.path().join("vendor/v.rs"), ten_line_fn("vend")).unwrap();

        let mut trees = HashMap::new();
        trees.insert("a.rs".to_string(), vec![function_node("alpha", 1, 10)]);
        trees.insert("v.rs".to_string(), vec![function_node("vend", 1, 10)]);

        let (indexer, store) = test_indexer(dir.path(), trees);
        indexer
            .index_workspace(Some("vendor/**"), &NoProgress)
            .await
            .unwrap();

        assert_eq!(store.file_chunks("a.rs").len(), 1);
        assert!(store.file_chunks("vendor/v.rs").is_empty());
    }
}
