// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod acquire;
pub mod config;
pub mod error;
pub mod financials;
pub mod insight;
pub mod market;
pub mod orchestrator;
pub mod parse;
pub mod provider;

// Retrieval index (chunking, embeddings, search)
pub mod index;

// ---- Re-exports for stable public API ----
pub use crate::config::ForecastConfig;
pub use crate::error::ForecastError;
pub use crate::index::TranscriptIndex;
pub use crate::orchestrator::{ForecastAgent, ForecastResult};
pub use crate::provider::{CompletionBackend, ProviderManager};
