//! Embedding provider seam.
//!
//! The runtime consumes "embed one or many texts" as an interface; the
//! concrete backend is swappable.  Calls are synchronous from the caller's
//! perspective — every call site offloads through
//! `tokio::task::spawn_blocking` so the transport event loop never stalls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::EmbedderConfig;
use crate::error::{KernelError, KernelResult};

/// Blocking embedding provider.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; one vector per input, in order.
    fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> KernelResult<Vec<f32>> {
        let mut out = self.embed_batch(std::slice::from_ref(&text.to_string()))?;
        out.pop()
            .ok_or_else(|| KernelError::EmbedderUnavailable("empty batch response".into()))
    }

    /// Vector dimension, once known.  Discovered from the first successful
    /// call and fixed per index thereafter.
    fn dimension(&self) -> Option<usize>;
}

// ── HTTP embedder ───────────────────────────────────────────

/// OpenAI-compatible `/embeddings` client with exponential-backoff retry.
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_retries: usize,
    dimension: AtomicUsize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    index: usize,
}

impl HttpEmbedder {
    pub fn new(cfg: &EmbedderConfig, api_key: Option<String>) -> KernelResult<Self> {
        let endpoint = cfg
            .endpoint
            .clone()
            .ok_or_else(|| KernelError::EmbedderUnavailable("no endpoint configured".into()))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| KernelError::EmbedderUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            model: cfg.model.clone().unwrap_or_else(|| "default".into()),
            api_key,
            max_retries: cfg.max_retries.max(1),
            dimension: AtomicUsize::new(0),
        })
    }

    fn request_once(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        let mut req = self.client.post(&self.endpoint).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .map_err(|e| KernelError::EmbedderUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(KernelError::EmbedderUnavailable(format!(
                "embedder returned {}",
                resp.status()
            )));
        }
        let body: EmbeddingsResponse = resp
            .json()
            .map_err(|e| KernelError::EmbedderUnavailable(e.to_string()))?;

        let mut items = body.data;
        items.sort_by_key(|i| i.index);
        if items.len() != texts.len() {
            return Err(KernelError::EmbedderUnavailable(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                items.len()
            )));
        }
        Ok(items.into_iter().map(|i| i.embedding).collect())
    }
}

impl Embedder for HttpEmbedder {
    fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut delay = Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.request_once(texts) {
                Ok(vecs) => {
                    if let Some(first) = vecs.first() {
                        self.dimension.store(first.len(), Ordering::Relaxed);
                    }
                    return Ok(vecs);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "embedder call failed");
                    last_err = Some(e);
                    if attempt < self.max_retries {
                        std::thread::sleep(delay);
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| KernelError::EmbedderUnavailable("no attempts made".into())))
    }

    fn dimension(&self) -> Option<usize> {
        match self.dimension.load(Ordering::Relaxed) {
            0 => None,
            d => Some(d),
        }
    }
}

// ── Deterministic embedder ──────────────────────────────────

/// Hash-bucket embedder producing stable, content-sensitive vectors.
///
/// Used by tests and by `route --offline` diagnostics; tokens sharing
/// words land near each other, which is all the routing tests need.
pub struct StaticEmbedder {
    dim: usize,
}

impl StaticEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    fn fold(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text.to_lowercase().split_whitespace() {
            let mut h: u64 = 1469598103934665603;
            for b in token.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            let bucket = (h % self.dim as u64) as usize;
            v[bucket] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for StaticEmbedder {
    fn embed_batch(&self, texts: &[String]) -> KernelResult<Vec<Vec<f32>>> {
        debug!(count = texts.len(), "static embed batch");
        Ok(texts.iter().map(|t| self.fold(t)).collect())
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_embedder_is_deterministic() {
        let e = StaticEmbedder::new(64);
        let a = e.embed("commit my changes").unwrap();
        let b = e.embed("commit my changes").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn static_embedder_shared_words_score_closer() {
        let e = StaticEmbedder::new(128);
        let base = e.embed("git commit changes").unwrap();
        let near = e.embed("commit staged changes").unwrap();
        let far = e.embed("crawl a web page").unwrap();
        let cos = |a: &[f32], b: &[f32]| -> f32 {
            a.iter().zip(b).map(|(x, y)| x * y).sum()
        };
        assert!(cos(&base, &near) > cos(&base, &far));
    }

    #[test]
    fn empty_batch_short_circuits() {
        let e = StaticEmbedder::new(32);
        assert!(e.embed_batch(&[]).unwrap().is_empty());
    }
}
