// src/index/embed.rs
//! Embedding boundary. How vectors are computed is an external capability;
//! the index only needs "texts in, vectors out" plus cosine similarity.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ForecastConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Remote embedding service client (OpenAI-compatible `/embeddings` shape).
pub struct HttpEmbedder {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(cfg: &ForecastConfig, endpoint: Option<&str>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("earnings-forecast-agent/0.1")
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint: endpoint
                .map(str::to_string)
                .or_else(|| std::env::var("EMBEDDING_ENDPOINT").ok())
                .unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: "text-embedding-3-small".to_string(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            input: &'a [String],
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<Item>,
        }
        #[derive(Deserialize)]
        struct Item {
            embedding: Vec<f32>,
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&Req {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: Resp = resp.json().await?;
        Ok(body.data.into_iter().map(|i| i.embedding).collect())
    }
}

/// Deterministic bag-of-words hashing embedder. No network; similar word
/// sets map to similar vectors, which is enough for tests and offline runs.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_vector(t, self.dims)).collect())
    }
}

fn hash_vector(text: &str, dims: usize) -> Vec<f32> {
    use sha2::{Digest, Sha256};

    let mut v = vec![0.0f32; dims];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.to_ascii_lowercase().as_bytes());
        let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
        // A second digest byte decides the sign so unrelated tokens cancel.
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket % dims] += sign;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Always-failing embedder for degradation tests.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("simulated embedding failure")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_bounds_and_identity() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        let b = vec![-1.0, -2.0, -3.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_word_sensitive() {
        let e = HashEmbedder::default();
        let texts = vec![
            "revenue growth outlook".to_string(),
            "revenue growth outlook".to_string(),
            "unrelated penguin habitat words".to_string(),
        ];
        let vs = e.embed(&texts).await.unwrap();
        assert!((cosine_similarity(&vs[0], &vs[1]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&vs[0], &vs[2]) < 0.9);
    }

    #[tokio::test]
    async fn shared_words_raise_similarity() {
        let e = HashEmbedder::default();
        let vs = e
            .embed(&[
                "management outlook and guidance for growth".to_string(),
                "outlook guidance growth next year".to_string(),
                "penguins prefer colder water in winter".to_string(),
            ])
            .await
            .unwrap();
        assert!(cosine_similarity(&vs[0], &vs[1]) > cosine_similarity(&vs[0], &vs[2]));
    }
}
