// src/index/mod.rs
//! Semantic retrieval index over chunked transcript text.
//!
//! Owns the append-mostly chunk store: ingestion chunks, scores, classifies
//! and embeds documents; queries rank by a weighted fusion of cosine
//! similarity and heuristic quality. Degradation is deliberate — an empty
//! index or an embedding failure yields an empty result, never an error.

pub mod chunk;
pub mod embed;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ForecastConfig;
use chunk::{split_into_candidates, ChunkCategory};
use embed::{cosine_similarity, Embedder};

/// One-time metrics registration (so series show up on a consumer's
/// /metrics endpoint if an exporter is installed).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "index_chunks_added_total",
            "Chunks committed to the retrieval index."
        );
        describe_counter!(
            "index_docs_rejected_total",
            "Documents rejected for being below the minimum length."
        );
        describe_counter!(
            "index_docs_deduped_total",
            "Documents skipped as duplicates of already-ingested content."
        );
        describe_counter!("index_searches_total", "Search queries served.");
    });
}

/// Immutable span stored once per unique (entity, date, content hash).
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptChunk {
    pub id: String,
    pub entity_id: String,
    pub date: String,
    pub text: String,
    pub category: ChunkCategory,
    pub speaker: String,
    /// Heuristic quality in [0,1].
    pub quality: f32,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub metadata: HashMap<String, String>,
}

/// Ephemeral per-query ranking entry.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Arc<TranscriptChunk>,
    /// Cosine similarity in [-1,1].
    pub similarity: f32,
    /// Weighted fusion of similarity and quality; the ranking key.
    pub combined_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub chunks_per_entity: HashMap<String, usize>,
    pub category_counts: HashMap<&'static str, usize>,
    pub document_dates: Vec<String>,
}

// Paraphrased query sets for category-oriented retrieval. Several
// formulations of the same intent raise recall beyond any single query.
const OUTLOOK_QUERIES: &[&str] = &[
    "management outlook future guidance",
    "forward looking statements expectations",
    "business outlook next quarter year",
    "growth expectations management guidance",
];
const RISK_QUERIES: &[&str] = &[
    "risks challenges headwinds concerns",
    "competitive pressure market challenges",
    "regulatory risks compliance issues",
    "economic uncertainty market volatility",
];
const OPPORTUNITY_QUERIES: &[&str] = &[
    "growth opportunities expansion plans",
    "new markets investment opportunities",
    "technology investments innovation",
    "strategic initiatives new services",
];

type DocKey = (String, String, String);

#[derive(Default)]
struct Inner {
    chunks: Vec<Arc<TranscriptChunk>>,
    seen: HashSet<DocKey>,
}

/// The only persistent, potentially multi-writer resource in the pipeline.
/// Embeddings are computed before the write lock is taken, so the
/// check-then-write dedup sequence is atomic under the lock and concurrent
/// ingestion of identical content cannot duplicate chunks.
pub struct TranscriptIndex {
    cfg: ForecastConfig,
    embedder: Arc<dyn Embedder>,
    inner: RwLock<Inner>,
}

impl TranscriptIndex {
    pub fn new(cfg: ForecastConfig, embedder: Arc<dyn Embedder>) -> Self {
        ensure_metrics_described();
        Self {
            cfg,
            embedder,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Chunk, score, embed and store one document. Returns the number of
    /// chunks added. Rejections (too short), duplicates and embedding
    /// failures all return 0 without mutating chunk storage.
    pub async fn add_document(
        &self,
        text: &str,
        entity_id: &str,
        date: &str,
        metadata: HashMap<String, String>,
    ) -> usize {
        if text.chars().count() < self.cfg.min_document_chars {
            debug!(entity = entity_id, "document below minimum length; rejected");
            counter!("index_docs_rejected_total").increment(1);
            return 0;
        }

        let content_hash = content_hash(text);
        let key: DocKey = (
            entity_id.to_string(),
            date.to_string(),
            content_hash.clone(),
        );
        {
            let inner = self.inner.read().expect("index lock poisoned");
            if inner.seen.contains(&key) {
                info!(entity = entity_id, date, "document already ingested; no-op");
                counter!("index_docs_deduped_total").increment(1);
                return 0;
            }
        }

        let candidates = split_into_candidates(text, &self.cfg);
        if candidates.is_empty() {
            // Nothing passed the quality gate; remember the document so
            // re-ingestion stays a no-op.
            let mut inner = self.inner.write().expect("index lock poisoned");
            inner.seen.insert(key);
            return 0;
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let embeddings = match self.embedder.embed(&texts).await {
            Ok(e) if e.len() == candidates.len() => e,
            Ok(_) => {
                warn!(entity = entity_id, "embedder returned mismatched vector count");
                return 0;
            }
            Err(e) => {
                warn!(entity = entity_id, error = ?e, "embedding failed; document not ingested");
                return 0;
            }
        };

        let mut inner = self.inner.write().expect("index lock poisoned");
        // Re-check under the write lock: a concurrent ingestion of the same
        // content may have won the race.
        if !inner.seen.insert(key) {
            counter!("index_docs_deduped_total").increment(1);
            return 0;
        }
        let added = candidates.len();
        for (i, (candidate, embedding)) in candidates.into_iter().zip(embeddings).enumerate() {
            inner.chunks.push(Arc::new(TranscriptChunk {
                id: format!("{entity_id}_{date}_{content_hash}_{i}"),
                entity_id: entity_id.to_string(),
                date: date.to_string(),
                text: candidate.text,
                category: candidate.category,
                speaker: candidate.speaker,
                quality: candidate.quality.clamp(0.0, 1.0),
                embedding,
                content_hash: content_hash.clone(),
                metadata: metadata.clone(),
            }));
        }
        drop(inner);

        info!(entity = entity_id, date, added, "ingested document");
        counter!("index_chunks_added_total").increment(added as u64);
        added
    }

    /// Ranked semantic search. An empty index, an unknown entity or an
    /// embedding failure returns an empty list, never an error.
    pub async fn search(
        &self,
        query: &str,
        entity_id: Option<&str>,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<RetrievalResult> {
        counter!("index_searches_total").increment(1);

        let query_embedding = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.remove(0),
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!(error = ?e, "query embedding failed; returning empty result");
                return Vec::new();
            }
        };

        let mut results: Vec<RetrievalResult> = {
            let inner = self.inner.read().expect("index lock poisoned");
            inner
                .chunks
                .iter()
                .filter(|c| entity_id.is_none_or(|e| c.entity_id == e))
                .map(|c| {
                    let similarity = cosine_similarity(&query_embedding, &c.embedding);
                    RetrievalResult {
                        similarity,
                        combined_score: combined_score(&self.cfg, similarity, c.quality),
                        chunk: Arc::clone(c),
                    }
                })
                .filter(|r| r.similarity >= min_similarity)
                .collect()
        };

        results.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);
        results
    }

    /// Fan-out/fan-in retrieval: issue each paraphrase, merge, dedup by
    /// chunk id (first occurrence wins), re-sort by combined score and
    /// truncate to `n_results`.
    pub async fn search_multi(
        &self,
        queries: &[&str],
        entity_id: Option<&str>,
        n_results: usize,
    ) -> Vec<RetrievalResult> {
        let per_query = (n_results / 2).max(1);
        let mut merged: Vec<RetrievalResult> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();

        for query in queries {
            for result in self
                .search(query, entity_id, per_query, self.cfg.min_similarity)
                .await
            {
                if seen_ids.insert(result.chunk.id.clone()) {
                    merged.push(result);
                }
            }
        }

        merged.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(n_results);
        merged
    }

    /// Spans about management outlook and forward guidance.
    pub async fn management_outlook(
        &self,
        entity_id: &str,
        n_results: usize,
    ) -> Vec<RetrievalResult> {
        self.search_multi(OUTLOOK_QUERIES, Some(entity_id), n_results)
            .await
    }

    /// Spans about risks, challenges and concerns.
    pub async fn risk_factors(&self, entity_id: &str, n_results: usize) -> Vec<RetrievalResult> {
        self.search_multi(RISK_QUERIES, Some(entity_id), n_results)
            .await
    }

    /// Spans about growth opportunities and investments.
    pub async fn growth_opportunities(
        &self,
        entity_id: &str,
        n_results: usize,
    ) -> Vec<RetrievalResult> {
        self.search_multi(OPPORTUNITY_QUERIES, Some(entity_id), n_results)
            .await
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.read().expect("index lock poisoned").chunks.len()
    }

    pub fn chunk_count_for_entity(&self, entity_id: &str) -> usize {
        self.inner
            .read()
            .expect("index lock poisoned")
            .chunks
            .iter()
            .filter(|c| c.entity_id == entity_id)
            .count()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().expect("index lock poisoned");
        let mut chunks_per_entity: HashMap<String, usize> = HashMap::new();
        let mut category_counts: HashMap<&'static str, usize> = HashMap::new();
        let mut dates: HashSet<String> = HashSet::new();
        for c in &inner.chunks {
            *chunks_per_entity.entry(c.entity_id.clone()).or_default() += 1;
            *category_counts.entry(c.category.as_str()).or_default() += 1;
            dates.insert(c.date.clone());
        }
        let mut document_dates: Vec<String> = dates.into_iter().collect();
        document_dates.sort();
        IndexStats {
            total_chunks: inner.chunks.len(),
            chunks_per_entity,
            category_counts,
            document_dates,
        }
    }
}

/// `combined = w_sim * similarity + w_quality * quality`; monotone in both
/// inputs as long as the weights are non-negative.
pub fn combined_score(cfg: &ForecastConfig, similarity: f32, quality: f32) -> f32 {
    cfg.weight_similarity * similarity + cfg.weight_quality * quality
}

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}
