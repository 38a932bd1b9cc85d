// tests/ingest_dedup.rs
// Ingestion invariants of the retrieval index through the public API:
// length gate, idempotent re-ingestion, and concurrent duplicate safety.

use std::collections::HashMap;
use std::sync::Arc;

use earnings_forecast_agent::index::embed::HashEmbedder;
use earnings_forecast_agent::{ForecastConfig, TranscriptIndex};

fn index() -> Arc<TranscriptIndex> {
    Arc::new(TranscriptIndex::new(
        ForecastConfig::default(),
        Arc::new(HashEmbedder::default()),
    ))
}

fn transcript() -> String {
    [
        "CEO: We reported revenue growth of 12% this quarter with strong margin performance \
         across all segments, and we expect continued growth going forward as client demand \
         for our services stays healthy into the next quarter and beyond.",
        "CFO: Operating margin expanded and net profit improved, while earnings per share \
         rose in line with guidance; cash flow generation remains a highlight of the quarter.",
        "Analyst: Could you talk about the main risks, headwinds and competitive pressure \
         you see, including regulatory uncertainty and any concern around pricing?",
    ]
    .join("\n")
}

#[tokio::test]
async fn below_minimum_length_documents_never_mutate_the_index() {
    let idx = index();
    assert_eq!(
        idx.add_document("way too short", "ACME", "2025-07-10", HashMap::new())
            .await,
        0
    );
    assert_eq!(idx.chunk_count(), 0);
}

#[tokio::test]
async fn repeat_ingestion_of_identical_content_is_a_no_op() {
    let idx = index();
    let doc = transcript();

    let first = idx
        .add_document(&doc, "ACME", "2025-07-10", HashMap::new())
        .await;
    assert!(first > 0);

    let second = idx
        .add_document(&doc, "ACME", "2025-07-10", HashMap::new())
        .await;
    assert_eq!(second, 0);
    assert_eq!(idx.chunk_count_for_entity("ACME"), first);
}

#[tokio::test]
async fn concurrent_identical_ingestion_cannot_duplicate_chunks() {
    let idx = index();
    let doc = Arc::new(transcript());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let idx = Arc::clone(&idx);
        let doc = Arc::clone(&doc);
        handles.push(tokio::spawn(async move {
            idx.add_document(&doc, "ACME", "2025-07-10", HashMap::new())
                .await
        }));
    }

    let mut added_total = 0;
    let mut winners = 0;
    for h in handles {
        let added = h.await.unwrap();
        added_total += added;
        if added > 0 {
            winners += 1;
        }
    }

    // Exactly one ingestion wins; the index holds its chunks and no more.
    assert_eq!(winners, 1);
    assert_eq!(idx.chunk_count(), added_total);
}

#[tokio::test]
async fn stats_track_entities_categories_and_dates() {
    let idx = index();
    idx.add_document(&transcript(), "ACME", "2025-07-10", HashMap::new())
        .await;
    idx.add_document(&transcript(), "GLOBEX", "2025-04-02", HashMap::new())
        .await;

    let stats = idx.stats();
    assert_eq!(
        stats.total_chunks,
        idx.chunk_count_for_entity("ACME") + idx.chunk_count_for_entity("GLOBEX")
    );
    assert_eq!(stats.chunks_per_entity.len(), 2);
    assert_eq!(
        stats.document_dates,
        vec!["2025-04-02".to_string(), "2025-07-10".to_string()]
    );
    assert!(stats.category_counts.values().sum::<usize>() == stats.total_chunks);
}
