use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Chunk selection tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Workspace root to index.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Character budget per chunk; longer symbols get a centered window.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Class-like symbols above this line count are expanded per-child.
    #[serde(default = "default_max_class_lines")]
    pub max_class_lines: usize,
    /// Symbols spanning fewer lines are dropped unless high-value.
    #[serde(default = "default_min_symbol_lines")]
    pub min_symbol_lines: usize,
    /// Fraction of a candidate's own size below which a line-range overlap
    /// with an already-accepted chunk is tolerated.
    #[serde(default = "default_overlap_tolerance")]
    pub overlap_tolerance: f64,
    /// Cap on the derived context string.
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    /// How many immediately preceding comment lines feed the context.
    #[serde(default = "default_context_comment_lines")]
    pub context_comment_lines: usize,
    /// Extensions routed to the markup tree walker instead of the
    /// structure provider.
    #[serde(default = "default_markup_extensions")]
    pub markup_extensions: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_chunk_chars: default_max_chunk_chars(),
            max_class_lines: default_max_class_lines(),
            min_symbol_lines: default_min_symbol_lines(),
            overlap_tolerance: default_overlap_tolerance(),
            context_max_chars: default_context_max_chars(),
            context_comment_lines: default_context_comment_lines(),
            markup_extensions: default_markup_extensions(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.rs".to_string(),
        "**/*.ts".to_string(),
        "**/*.tsx".to_string(),
        "**/*.js".to_string(),
        "**/*.py".to_string(),
        "**/*.go".to_string(),
        "**/*.java".to_string(),
        "**/*.html".to_string(),
        "**/*.xml".to_string(),
    ]
}
fn default_max_chunk_chars() -> usize {
    1000
}
fn default_max_class_lines() -> usize {
    100
}
fn default_min_symbol_lines() -> usize {
    3
}
fn default_overlap_tolerance() -> f64 {
    0.3
}
fn default_context_max_chars() -> usize {
    200
}
fn default_context_comment_lines() -> usize {
    5
}
fn default_markup_extensions() -> Vec<String> {
    vec![
        "html".to_string(),
        "htm".to_string(),
        "xml".to_string(),
        "svg".to_string(),
        "vue".to_string(),
    ]
}

/// Structure provider (the editor-side collaborator).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    /// External command that prints the symbol tree for a file as JSON.
    /// The file path is appended as the final argument.
    #[serde(default)]
    pub symbol_cmd: Option<String>,
}

/// Supervised inference service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    /// Path to the inference service entry point.
    #[serde(default = "default_service_script")]
    pub script: PathBuf,
    /// State directory holding the virtual environment.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Requirements file installed into the venv when the import probe fails.
    #[serde(default)]
    pub requirements: Option<PathBuf>,
    /// Pin the service port instead of picking a free one.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_attempts")]
    pub health_attempts: u32,
    /// Manage a virtual environment and install dependencies on demand.
    /// Turn off to run `python_bin` against an existing environment.
    #[serde(default = "default_manage_env")]
    pub manage_env: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            python_bin: default_python_bin(),
            script: default_service_script(),
            state_dir: default_state_dir(),
            requirements: None,
            port: None,
            health_interval_secs: default_health_interval_secs(),
            health_attempts: default_health_attempts(),
            manage_env: default_manage_env(),
        }
    }
}

fn default_python_bin() -> String {
    "python3".to_string()
}
fn default_service_script() -> PathBuf {
    PathBuf::from("service/main.py")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".quarry")
}
fn default_health_interval_secs() -> u64 {
    2
}
fn default_health_attempts() -> u32 {
    30
}
fn default_manage_env() -> bool {
    true
}

/// Batch embedding tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Texts per `/embed` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent in-flight batches.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-call timeout; kept well under the operation ceiling so batch
    /// retries can run before the caller gives up.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallelism: default_parallelism(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    16
}
fn default_parallelism() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Search ranking tuning.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Results further than this below the top score are dropped.
    #[serde(default = "default_relevance_window")]
    pub relevance_window: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Average non-whitespace chars per line above which a chunk is
    /// treated as minified and excluded from results.
    #[serde(default = "default_max_line_density")]
    pub max_line_density: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            relevance_window: default_relevance_window(),
            max_results: default_max_results(),
            max_line_density: default_max_line_density(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.2
}
fn default_relevance_window() -> f32 {
    0.08
}
fn default_max_results() -> usize {
    12
}
fn default_max_line_density() -> f32 {
    300.0
}

/// Corpus snapshot location.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".quarry/corpus.json")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.indexing.max_chunk_chars == 0 {
        anyhow::bail!("indexing.max_chunk_chars must be > 0");
    }

    if !(0.0..1.0).contains(&config.indexing.overlap_tolerance) {
        anyhow::bail!("indexing.overlap_tolerance must be in [0.0, 1.0)");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.embedding.parallelism == 0 {
        anyhow::bail!("embedding.parallelism must be > 0");
    }

    if config.search.max_results < 1 {
        anyhow::bail!("search.max_results must be >= 1");
    }

    if config.search.relevance_window < 0.0 {
        anyhow::bail!("search.relevance_window must be >= 0.0");
    }

    if config.service.health_attempts == 0 {
        anyhow::bail!("service.health_attempts must be > 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.indexing.max_chunk_chars, 1000);
        assert_eq!(config.indexing.max_class_lines, 100);
        assert!((config.indexing.overlap_tolerance - 0.3).abs() < 1e-9);
        assert_eq!(config.service.health_attempts, 30);
        assert!((config.search.relevance_window - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [search]
            similarity_threshold = 0.5
            max_results = 3

            [embedding]
            batch_size = 8
            "#,
        )
        .unwrap();
        assert!((config.search.similarity_threshold - 0.5).abs() < 1e-6);
        assert_eq!(config.search.max_results, 3);
        assert_eq!(config.embedding.batch_size, 8);
        // Untouched sections keep defaults.
        assert_eq!(config.embedding.parallelism, 4);
    }
}
