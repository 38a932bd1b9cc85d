// src/acquire.rs
//! Document acquisition boundary. Discovery and download live outside this
//! crate; the pipeline only sees the narrow `DocumentSource` interface and
//! normalizes whatever text comes back. An empty fetch result is a normal,
//! non-error outcome.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What kind of source document a fetch returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Quarterly/annual report text (metric extraction input).
    Report,
    /// Earnings call transcript (retrieval index input).
    Transcript,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub text: String,
    /// Source document date, e.g. "2025-07-10".
    pub date: String,
    pub kind: DocumentKind,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Fetch the latest available documents for an entity. Empty is fine.
    async fn fetch(&self, entity_id: &str) -> Result<Vec<SourceDocument>>;
}

/// Normalize acquired text: decode HTML entities, strip tags, collapse
/// whitespace per line while keeping line structure (the chunker splits on
/// lines, so newlines are preserved).
pub fn normalize_document(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(&decoded, "").to_string();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"[ \t]+").unwrap());

    stripped
        .lines()
        .map(|line| re_ws.replace_all(line.trim(), " ").to_string())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// No-documents source for tests and offline runs.
pub struct EmptyDocumentSource;

#[async_trait]
impl DocumentSource for EmptyDocumentSource {
    async fn fetch(&self, _entity_id: &str) -> Result<Vec<SourceDocument>> {
        Ok(Vec::new())
    }
}

/// Serves a fixed document list; used by integration tests.
pub struct StaticDocumentSource {
    pub documents: Vec<SourceDocument>,
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn fetch(&self, _entity_id: &str) -> Result<Vec<SourceDocument>> {
        Ok(self.documents.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_tags_and_entities() {
        let s = "<p>Revenue &amp; margins</p>\n  grew   strongly  ";
        assert_eq!(normalize_document(s), "Revenue & margins\ngrew strongly");
    }

    #[test]
    fn normalize_preserves_line_structure_for_chunking() {
        let s = "CEO: Good   morning\nCFO: Thank  you";
        assert_eq!(normalize_document(s), "CEO: Good morning\nCFO: Thank you");
    }
}
