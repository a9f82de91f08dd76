//! Batch embedding orchestration against the inference service.
//!
//! [`EmbeddingBackend`] is the pluggable seam: the production
//! [`ServiceBackend`] talks HTTP to the supervised local service, and
//! tests substitute stubs. The orchestrator turns a file's chunk list
//! into rate-limited batches, fans them out with bounded parallelism,
//! and merges vectors back **by batch index** — order preservation is a
//! correctness requirement, not an optimization, because the service
//! returns one vector per input in request order.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::models::{Chunk, SearchResult};
use crate::retry::RetryPolicy;
use crate::service::ServiceSupervisor;

/// Anything that can turn texts into vectors, one per input, in order.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Embed a batch. Implementations must return exactly one vector
    /// per input text, positionally matched.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// The text actually sent for embedding: context line first, then code.
pub fn embed_text(chunk: &Chunk) -> String {
    if chunk.context.is_empty() {
        chunk.code.clone()
    } else {
        format!("{}\n{}", chunk.context, chunk.code)
    }
}

// ============ HTTP client for the inference service ============

/// Raw HTTP surface of the inference service.
///
/// | Endpoint | Use |
/// |----------|-----|
/// | `POST /embed` | batch embedding |
/// | `POST /search` | optional server-side ranking variant |
/// | `POST /update_file_embeddings` | bulk upsert after a full re-index |
pub struct HttpEmbedClient {
    base_url: String,
    http: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct RemoteSearchResponse {
    results: Vec<RemoteHit>,
}

#[derive(Deserialize)]
struct RemoteHit {
    #[serde(flatten)]
    chunk: Chunk,
    #[serde(default)]
    score: f32,
}

impl HttpEmbedClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn embed_codes(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "codes": texts });
        let resp = self
            .http
            .post(format!("{}/embed", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("embed request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("embed endpoint returned {}: {}", status, body_text);
        }

        let parsed: EmbedResponse = resp.json().await.context("invalid embed response")?;
        if parsed.embeddings.len() != texts.len() {
            bail!(
                "embed endpoint returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            );
        }
        Ok(parsed.embeddings)
    }

    /// Server-side search variant: ranking happens in the service.
    pub async fn search_remote(
        &self,
        query: &str,
        max_results: usize,
        similarity_threshold: f32,
        include_pattern: Option<&str>,
        exclude_pattern: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let body = serde_json::json!({
            "query": query,
            "max_results": max_results,
            "similarity_threshold": similarity_threshold,
            "inclusion_pattern": include_pattern,
            "exclusion_pattern": exclude_pattern,
        });

        let resp = self
            .http
            .post(format!("{}/search", self.base_url))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .context("remote search request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("search endpoint returned {}: {}", status, body_text);
        }

        let parsed: RemoteSearchResponse =
            resp.json().await.context("invalid search response")?;
        Ok(parsed
            .results
            .into_iter()
            .map(|hit| {
                let snippet: String = hit.chunk.code.chars().take(240).collect();
                SearchResult {
                    file_path: hit.chunk.file_path,
                    line_start: hit.chunk.line_start,
                    line_end: hit.chunk.line_end,
                    name: hit.chunk.name,
                    kind: hit.chunk.kind,
                    fingerprint: hit.chunk.fingerprint,
                    score: hit.score,
                    snippet,
                }
            })
            .collect())
    }

    /// Bulk upsert used by full re-index: one document per chunk, with
    /// the chunk record as metadata.
    pub async fn update_file_embeddings(&self, chunks: &[Chunk]) -> Result<()> {
        let documents: Vec<serde_json::Value> = chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "document": embed_text(c),
                    "metadata": serde_json::to_value(c).unwrap_or_default(),
                })
            })
            .collect();

        let resp = self
            .http
            .post(format!("{}/update_file_embeddings", self.base_url))
            .timeout(self.timeout)
            .json(&serde_json::json!({ "documents": documents }))
            .send()
            .await
            .context("bulk upsert request failed")?;

        if !resp.status().is_success() {
            bail!("bulk upsert returned {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbedClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_codes(texts).await
    }
}

// ============ Supervised-service backend ============

/// Production backend: ensures the supervised service is `Ready` (an
/// idempotent `start()`), then calls its `/embed` endpoint.
pub struct ServiceBackend {
    supervisor: Arc<ServiceSupervisor>,
    timeout_secs: u64,
}

impl ServiceBackend {
    pub fn new(supervisor: Arc<ServiceSupervisor>, timeout_secs: u64) -> Self {
        Self {
            supervisor,
            timeout_secs,
        }
    }

    /// The service handle's base URL after ensuring startup.
    pub async fn ensure_ready(&self) -> Result<String> {
        let state = self.supervisor.start().await?;
        state
            .base_url()
            .ok_or_else(|| anyhow::anyhow!("service reported ready without a bound port"))
    }
}

#[async_trait]
impl EmbeddingBackend for ServiceBackend {
    fn name(&self) -> &str {
        "service"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let base_url = self.ensure_ready().await?;
        HttpEmbedClient::new(base_url, self.timeout_secs)
            .embed_codes(texts)
            .await
    }
}

// ============ Batch orchestration ============

/// Embed every chunk in place, batching and fanning out.
///
/// Chunks are partitioned into `batch_size` groups; up to `parallelism`
/// batches are in flight at once. Each batch retries transient failures
/// with exponential backoff before the whole call fails — per-file
/// isolation is the caller's job.
pub async fn embed_chunks(
    backend: Arc<dyn EmbeddingBackend>,
    config: &EmbeddingConfig,
    chunks: &mut [Chunk],
) -> Result<()> {
    if chunks.is_empty() {
        return Ok(());
    }

    let batches: Vec<Vec<String>> = chunks
        .chunks(config.batch_size)
        .map(|batch| batch.iter().map(embed_text).collect())
        .collect();

    let mut vectors_by_batch: Vec<Option<Vec<Vec<f32>>>> = vec![None; batches.len()];
    let retry = RetryPolicy::exponential(config.max_retries.max(1), Duration::from_secs(1));

    // Fan out in waves bounded by the parallelism limit; tasks carry
    // their batch index so completion order never matters.
    for wave in (0..batches.len()).collect::<Vec<_>>().chunks(config.parallelism) {
        let mut join_set = tokio::task::JoinSet::new();

        for &batch_idx in wave {
            let texts = batches[batch_idx].clone();
            let backend = Arc::clone(&backend);
            join_set.spawn(async move {
                let result = retry.run(|_| backend.embed(&texts)).await;
                (batch_idx, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (batch_idx, result) = joined.context("embed batch task panicked")?;
            let vectors = result.with_context(|| format!("embed batch {} failed", batch_idx))?;
            if vectors.len() != batches[batch_idx].len() {
                bail!(
                    "backend returned {} vectors for batch of {}",
                    vectors.len(),
                    batches[batch_idx].len()
                );
            }
            vectors_by_batch[batch_idx] = Some(vectors);
        }
    }

    for (batch_idx, batch) in chunks.chunks_mut(config.batch_size).enumerate() {
        let vectors = vectors_by_batch[batch_idx]
            .take()
            .ok_or_else(|| anyhow::anyhow!("missing vectors for batch {}", batch_idx))?;
        for (chunk, vector) in batch.iter_mut().zip(vectors) {
            chunk.embedding = Some(vector);
        }
    }

    Ok(())
}

/// Embed a single query text (for search).
pub async fn embed_query(backend: Arc<dyn EmbeddingBackend>, text: &str) -> Result<Vec<f32>> {
    let vectors = backend.embed(&[text.to_string()]).await?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::models::SymbolKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn chunk(code: &str) -> Chunk {
        Chunk {
            file_path: "a.rs".to_string(),
            line_start: 1,
            line_end: 5,
            code: code.to_string(),
            context: String::new(),
            fingerprint: fingerprint(code),
            kind: SymbolKind::Function,
            name: "f".to_string(),
            embedding: None,
        }
    }

    /// Encodes each input's length as its vector, and completes later
    /// batches faster than earlier ones to shuffle completion order.
    struct ShufflingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingBackend for ShufflingBackend {
        fn name(&self) -> &str {
            "shuffling"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // First batch sleeps longest.
            tokio::time::sleep(Duration::from_millis(30u64.saturating_sub(call as u64 * 10)))
                .await;
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }
    }

    #[tokio::test]
    async fn test_vectors_match_inputs_despite_completion_order() {
        let mut chunks: Vec<Chunk> = vec![
            chunk("a"),
            chunk("bb"),
            chunk("ccc"),
            chunk("dddd"),
            chunk("eeeee"),
            chunk("ffffff"),
        ];
        let config = EmbeddingConfig {
            batch_size: 2,
            parallelism: 3,
            max_retries: 1,
            timeout_secs: 5,
        };

        let backend = Arc::new(ShufflingBackend {
            calls: AtomicU32::new(0),
        });
        embed_chunks(backend, &config, &mut chunks).await.unwrap();

        for c in &chunks {
            let got = c.embedding.as_ref().unwrap()[0];
            assert_eq!(got, c.code.len() as f32, "vector mismatched for {:?}", c.code);
        }
    }

    struct FlakyBackend {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
            {
                bail!("transient failure");
            }
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_retries_transient_failures() {
        let mut chunks = vec![chunk("a"), chunk("b")];
        let config = EmbeddingConfig {
            batch_size: 4,
            parallelism: 1,
            max_retries: 3,
            timeout_secs: 5,
        };
        let backend = Arc::new(FlakyBackend {
            failures_left: AtomicU32::new(2),
        });
        embed_chunks(backend, &config, &mut chunks).await.unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_some()));
    }

    struct ShortBackend;

    #[async_trait]
    impl EmbeddingBackend for ShortBackend {
        fn name(&self) -> &str {
            "short"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            // One vector too few: an order-preservation violation.
            Ok(texts.iter().skip(1).map(|_| vec![0.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_vector_count_mismatch_is_an_error() {
        let mut chunks = vec![chunk("a"), chunk("b")];
        let config = EmbeddingConfig {
            batch_size: 4,
            parallelism: 1,
            max_retries: 1,
            timeout_secs: 5,
        };
        let result = embed_chunks(Arc::new(ShortBackend), &config, &mut chunks).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_embed_text_prefixes_context() {
        let mut c = chunk("fn f() {}");
        assert_eq!(embed_text(&c), "fn f() {}");
        c.context = "Widget > render".to_string();
        assert_eq!(embed_text(&c), "Widget > render\nfn f() {}");
    }
}
