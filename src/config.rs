// src/config.rs
//! Tunable pipeline constants.
//!
//! The thresholds here (confidence floor, score-fusion weights, word bands)
//! are empirically tuned values, not invariants, so they live in a config
//! struct with serde defaults instead of being buried as literals. Load
//! order: $FORECAST_CONFIG_PATH, then `config/forecast.toml`, then defaults.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const ENV_CONFIG_PATH: &str = "FORECAST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/forecast.toml";

fn default_min_document_chars() -> usize {
    200
}
fn default_chunk_line_cap() -> usize {
    15
}
fn default_chunk_overlap_lines() -> usize {
    2
}
fn default_min_chunk_words() -> usize {
    10
}
fn default_ideal_words_min() -> usize {
    40
}
fn default_ideal_words_max() -> usize {
    120
}
fn default_weight_length_fit() -> f32 {
    0.3
}
fn default_weight_financial_density() -> f32 {
    0.4
}
fn default_weight_forward_density() -> f32 {
    0.3
}
fn default_weight_similarity() -> f32 {
    0.7
}
fn default_weight_quality() -> f32 {
    0.3
}
fn default_min_similarity() -> f32 {
    0.0
}
fn default_insight_confidence_floor() -> f32 {
    0.3
}
fn default_max_outlook_insights() -> usize {
    5
}
fn default_max_risk_insights() -> usize {
    4
}
fn default_max_opportunity_insights() -> usize {
    4
}
fn default_sentiment_excerpt_chunks() -> usize {
    3
}
fn default_category_fanout_results() -> usize {
    6
}
fn default_revenue_growth_assumption() -> f64 {
    1.03
}
fn default_margin_improvement() -> f64 {
    0.5
}
fn default_healthy_margin_pct() -> f64 {
    20.0
}
fn default_connect_timeout_secs() -> u64 {
    4
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    /// Documents shorter than this are rejected at ingestion (returns 0).
    #[serde(default = "default_min_document_chars")]
    pub min_document_chars: usize,
    /// Flush a chunk once it accumulates this many lines.
    #[serde(default = "default_chunk_line_cap")]
    pub chunk_line_cap: usize,
    /// Lines carried over into the next chunk when the size cap forces a cut.
    #[serde(default = "default_chunk_overlap_lines")]
    pub chunk_overlap_lines: usize,
    /// Quality gate: candidate spans below this word count are discarded.
    #[serde(default = "default_min_chunk_words")]
    pub min_chunk_words: usize,
    /// Length-fit bonus peaks inside [ideal_words_min, ideal_words_max].
    #[serde(default = "default_ideal_words_min")]
    pub ideal_words_min: usize,
    #[serde(default = "default_ideal_words_max")]
    pub ideal_words_max: usize,

    // Quality score fusion (clamped to [0,1] after summing).
    #[serde(default = "default_weight_length_fit")]
    pub weight_length_fit: f32,
    #[serde(default = "default_weight_financial_density")]
    pub weight_financial_density: f32,
    #[serde(default = "default_weight_forward_density")]
    pub weight_forward_density: f32,

    // Retrieval score fusion: similarity is weighted higher than quality.
    #[serde(default = "default_weight_similarity")]
    pub weight_similarity: f32,
    #[serde(default = "default_weight_quality")]
    pub weight_quality: f32,
    /// Results below this similarity are filtered out of search results.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,

    /// Insights at or below this confidence are dropped, never surfaced.
    #[serde(default = "default_insight_confidence_floor")]
    pub insight_confidence_floor: f32,
    #[serde(default = "default_max_outlook_insights")]
    pub max_outlook_insights: usize,
    #[serde(default = "default_max_risk_insights")]
    pub max_risk_insights: usize,
    #[serde(default = "default_max_opportunity_insights")]
    pub max_opportunity_insights: usize,
    /// How many top spans are concatenated into the sentiment excerpt.
    #[serde(default = "default_sentiment_excerpt_chunks")]
    pub sentiment_excerpt_chunks: usize,
    /// Result count requested by category-oriented multi-query retrieval.
    #[serde(default = "default_category_fanout_results")]
    pub category_fanout_results: usize,

    // Trend stage projection constants.
    #[serde(default = "default_revenue_growth_assumption")]
    pub revenue_growth_assumption: f64,
    #[serde(default = "default_margin_improvement")]
    pub margin_improvement: f64,
    #[serde(default = "default_healthy_margin_pct")]
    pub healthy_margin_pct: f64,

    // External call timeouts (completion + embedding HTTP clients).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        // Round-trips through serde so the field defaults stay the single
        // source of truth.
        toml::from_str("").expect("empty config deserializes via defaults")
    }
}

impl ForecastConfig {
    /// Load from an explicit TOML path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut cfg: ForecastConfig = toml::from_str(&content)?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Load using $FORECAST_CONFIG_PATH, then `config/forecast.toml`,
    /// then built-in defaults. A broken file logs a warning and falls back.
    pub fn load_default() -> Self {
        let candidate = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        if candidate.exists() {
            match Self::load_from(&candidate) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(error = ?e, path = %candidate.display(), "config load failed; using defaults");
                }
            }
        }
        Self::default()
    }

    /// Keep loaded values inside their documented ranges.
    fn sanitize(&mut self) {
        self.insight_confidence_floor = self.insight_confidence_floor.clamp(0.0, 1.0);
        self.min_similarity = self.min_similarity.clamp(-1.0, 1.0);
        if self.ideal_words_min > self.ideal_words_max {
            std::mem::swap(&mut self.ideal_words_min, &mut self.ideal_words_max);
        }
        if self.chunk_overlap_lines >= self.chunk_line_cap {
            self.chunk_overlap_lines = default_chunk_overlap_lines();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = ForecastConfig::default();
        assert_eq!(cfg.min_document_chars, 200);
        assert!((cfg.insight_confidence_floor - 0.3).abs() < 1e-6);
        assert!(cfg.weight_similarity > cfg.weight_quality);
        assert!((cfg.revenue_growth_assumption - 1.03).abs() < 1e-9);
    }

    #[test]
    fn partial_toml_fills_missing_fields() {
        let cfg: ForecastConfig = toml::from_str("min_document_chars = 500").unwrap();
        assert_eq!(cfg.min_document_chars, 500);
        assert_eq!(cfg.chunk_line_cap, 15);
    }

    #[test]
    fn sanitize_swaps_inverted_word_band() {
        let mut cfg: ForecastConfig =
            toml::from_str("ideal_words_min = 120\nideal_words_max = 40").unwrap();
        cfg.sanitize();
        assert_eq!(cfg.ideal_words_min, 40);
        assert_eq!(cfg.ideal_words_max, 120);
    }
}
