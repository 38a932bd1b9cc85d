// src/index/chunk.rs
//! Heuristic chunking, classification and quality scoring for transcript
//! text. Splitting follows structural cues (speaker labels, section
//! keywords) with a line cap and overlap on forced cuts; every candidate
//! span must pass a quality gate before it reaches the index.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ForecastConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkCategory {
    Outlook,
    Risk,
    Opportunity,
    Financial,
    General,
}

impl ChunkCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkCategory::Outlook => "outlook",
            ChunkCategory::Risk => "risk",
            ChunkCategory::Opportunity => "opportunity",
            ChunkCategory::Financial => "financial",
            ChunkCategory::General => "general",
        }
    }
}

/// A candidate span that passed the quality gate. Becomes a
/// `TranscriptChunk` once the index attaches identity and an embedding.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub text: String,
    pub speaker: String,
    pub category: ChunkCategory,
    pub quality: f32,
}

// Vocabulary driving classification and quality scoring. Forward-looking
// growth language votes for `outlook`; the opportunity vocabulary is
// expansion/investment-centric.
const OUTLOOK_TERMS: &[&str] = &[
    "outlook",
    "expect",
    "anticipate",
    "forecast",
    "guidance",
    "going forward",
    "continued",
    "next quarter",
    "next year",
];
const RISK_TERMS: &[&str] = &[
    "risk",
    "challenge",
    "headwind",
    "concern",
    "pressure",
    "uncertainty",
    "volatility",
    "obstacle",
];
const OPPORTUNITY_TERMS: &[&str] = &[
    "opportunity",
    "opportunities",
    "expansion",
    "investment",
    "launch",
    "initiative",
    "new market",
    "innovation",
];
const FINANCIAL_TERMS: &[&str] = &[
    "revenue",
    "profit",
    "margin",
    "earnings",
    "ebitda",
    "income",
    "cash flow",
    "dividend",
    "performance",
];
const FORWARD_TERMS: &[&str] = &[
    "expect",
    "anticipate",
    "outlook",
    "guidance",
    "forecast",
    "growth",
    "going forward",
    "plan",
    "target",
    "pipeline",
];

const SECTION_KEYWORDS: &[&str] = &[
    "financial highlights",
    "business update",
    "outlook",
    "guidance",
    "q&a",
    "questions",
    "closing remarks",
];

fn speaker_regex() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^([A-Z][A-Za-z .'\-]{0,40}):").expect("speaker regex"))
}

fn count_hits(text_lower: &str, terms: &[&str]) -> usize {
    terms.iter().map(|t| text_lower.matches(t).count()).sum()
}

/// Keyword-density vote across the four named categories. A strict winner
/// takes the chunk; ties or zero votes default to `general`.
pub fn classify(text: &str) -> ChunkCategory {
    let lower = text.to_lowercase();
    let votes = [
        (ChunkCategory::Outlook, count_hits(&lower, OUTLOOK_TERMS)),
        (ChunkCategory::Risk, count_hits(&lower, RISK_TERMS)),
        (
            ChunkCategory::Opportunity,
            count_hits(&lower, OPPORTUNITY_TERMS),
        ),
        (ChunkCategory::Financial, count_hits(&lower, FINANCIAL_TERMS)),
    ];

    let max = votes.iter().map(|(_, n)| *n).max().unwrap_or(0);
    if max == 0 {
        return ChunkCategory::General;
    }
    let mut winners = votes.iter().filter(|(_, n)| *n == max);
    let (category, _) = winners.next().expect("max exists");
    if winners.next().is_some() {
        return ChunkCategory::General;
    }
    *category
}

/// Quality in [0,1]: length fit peaked at the ideal word band, plus the
/// density of financial terms and forward-looking terms.
pub fn score_quality(text: &str, cfg: &ForecastConfig) -> f32 {
    let lower = text.to_lowercase();
    let words = word_count(text);
    if words == 0 {
        return 0.0;
    }

    let length_fit = if words < cfg.ideal_words_min {
        words as f32 / cfg.ideal_words_min as f32
    } else if words <= cfg.ideal_words_max {
        1.0
    } else {
        let over = (words - cfg.ideal_words_max) as f32;
        (1.0 - over / (2.0 * cfg.ideal_words_max as f32)).max(0.0)
    };

    let financial_density =
        (count_hits(&lower, FINANCIAL_TERMS) as f32 / words as f32 * 20.0).min(1.0);
    let forward_density = (count_hits(&lower, FORWARD_TERMS) as f32 / words as f32 * 20.0).min(1.0);

    (cfg.weight_length_fit * length_fit
        + cfg.weight_financial_density * financial_density
        + cfg.weight_forward_density * forward_density)
        .clamp(0.0, 1.0)
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn has_domain_keyword(text_lower: &str) -> bool {
    count_hits(text_lower, OUTLOOK_TERMS) > 0
        || count_hits(text_lower, RISK_TERMS) > 0
        || count_hits(text_lower, OPPORTUNITY_TERMS) > 0
        || count_hits(text_lower, FINANCIAL_TERMS) > 0
        || count_hits(text_lower, FORWARD_TERMS) > 0
}

fn is_section_change(line: &str) -> bool {
    let lower = line.to_lowercase();
    SECTION_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Split a document into gated chunk candidates. Cuts happen on speaker
/// changes, section-keyword lines, and the line cap; cap cuts carry the
/// trailing overlap lines into the next chunk to preserve context.
pub fn split_into_candidates(text: &str, cfg: &ForecastConfig) -> Vec<ChunkCandidate> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_speaker: Option<String> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let speaker_match = speaker_regex().captures(line).map(|c| c[1].to_string());
        let is_speaker_line = speaker_match.is_some();
        let section_change = is_section_change(line);
        let at_cap = current.len() >= cfg.chunk_line_cap;

        if (is_speaker_line || section_change || at_cap) && !current.is_empty() {
            // Only size-cap cuts preserve context via overlap; structural
            // cuts start clean because the topic changed.
            let keep_overlap = at_cap && !is_speaker_line;
            current = flush_span(&mut out, cfg, &current, &current_speaker, keep_overlap);
        }

        if let Some(name) = speaker_match {
            current_speaker = Some(name);
        }
        current.push(line);
    }

    if !current.is_empty() {
        flush_span(&mut out, cfg, &current, &current_speaker, false);
    }

    out
}

/// Gate and emit one accumulated span; returns the overlap lines the next
/// span starts from (empty unless `keep_overlap`).
fn flush_span<'a>(
    out: &mut Vec<ChunkCandidate>,
    cfg: &ForecastConfig,
    lines: &[&'a str],
    speaker: &Option<String>,
    keep_overlap: bool,
) -> Vec<&'a str> {
    let joined = lines.join(" ");
    let lower = joined.to_lowercase();
    if word_count(&joined) >= cfg.min_chunk_words && has_domain_keyword(&lower) {
        out.push(ChunkCandidate {
            category: classify(&joined),
            quality: score_quality(&joined, cfg),
            text: joined,
            speaker: speaker.clone().unwrap_or_else(|| "unknown".to_string()),
        });
    }
    if keep_overlap && lines.len() > cfg.chunk_overlap_lines {
        lines[lines.len() - cfg.chunk_overlap_lines..].to_vec()
    } else {
        Vec::new()
    }
}
