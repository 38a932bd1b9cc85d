// src/error.rs
//! Error taxonomy for the forecast pipeline.
//!
//! Only `ProviderUnavailable` is ever fatal, and only at the synthesis step.
//! Everything else degrades: stages become `None`, parses fall back to
//! defaults, and empty retrieval returns empty lists.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    /// Every completion candidate was tried (or skipped for missing
    /// credentials) and none passed its probe.
    #[error("no completion backend available: {0}")]
    ProviderUnavailable(String),

    /// A subsystem returned nothing for this entity. Non-fatal; the owning
    /// stage degrades to `None`.
    #[error("stage data unavailable: {0}")]
    StageDataUnavailable(&'static str),

    /// Generative output did not match the expected schema. Non-fatal;
    /// resolved by the documented defaults.
    #[error("response parse failure: {0}")]
    ResponseParseFailure(String),

    /// No retrievable content for an entity. Non-fatal; queries return
    /// empty lists instead.
    #[error("no indexed content for entity {0}")]
    IndexEmpty(String),
}

impl ForecastError {
    /// True for the only condition that may surface as `success=false`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForecastError::ProviderUnavailable(_))
    }
}
