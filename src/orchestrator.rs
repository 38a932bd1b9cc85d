// src/orchestrator.rs
//! Pipeline orchestrator: runs the four analysis stages in isolation,
//! folds whatever survived into a deterministic labeled digest, and asks
//! the bound backend for one synthesis completion.
//!
//! Degradation is the default: a failed stage becomes a missing section in
//! the digest, and an unusable synthesis response falls back to the
//! documented neutral/hold result. Only provider exhaustion at synthesis
//! marks the run unsuccessful, and even then every stage payload that did
//! complete is returned.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::acquire::{normalize_document, DocumentKind, DocumentSource, SourceDocument};
use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::financials::{extract_financial_metrics, FinancialMetrics};
use crate::index::TranscriptIndex;
use crate::insight::{InsightEngine, QualitativeAnalysis};
use crate::market::{derive_market_context, MarketContext, MarketDataSource};
use crate::parse::{defaults_from, parse_structured};
use crate::provider::ProviderManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outlook {
    Positive,
    Negative,
    Neutral,
}

impl Outlook {
    fn from_str_or_neutral(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "positive" => Outlook::Positive,
            "negative" => Outlook::Negative,
            _ => Outlook::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Buy,
    Hold,
    Sell,
}

impl Recommendation {
    fn from_str_or_hold(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "buy" => Recommendation::Buy,
            "sell" => Recommendation::Sell,
            _ => Recommendation::Hold,
        }
    }
}

/// Deterministic next-quarter projection from the metric stage.
#[derive(Debug, Clone, Serialize)]
pub struct QuarterlyTrends {
    pub projected_revenue: Option<f64>,
    pub projected_operating_margin: Option<f64>,
    pub margin_healthy: Option<bool>,
    /// 0.8 when metrics backed the projection, 0.6 for the base assumption.
    pub confidence: f32,
}

/// Complete forecast output; optional stage payloads reflect degradation.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastResult {
    pub entity_id: String,
    pub analysis_period: String,
    pub generated_at: DateTime<Utc>,
    pub financial_metrics: Option<FinancialMetrics>,
    pub qualitative: Option<QualitativeAnalysis>,
    pub market: Option<MarketContext>,
    pub trends: Option<QuarterlyTrends>,
    pub outlook: Outlook,
    pub confidence: f32,
    pub recommendation: Recommendation,
    pub key_drivers: Vec<String>,
    pub rationale: String,
    pub risks: Vec<String>,
    pub opportunities: Vec<String>,
    pub elapsed_seconds: f64,
    pub success: bool,
    pub error_message: Option<String>,
}

pub struct ForecastAgent {
    cfg: ForecastConfig,
    provider: Arc<ProviderManager>,
    index: Arc<TranscriptIndex>,
    insight: InsightEngine,
    documents: Arc<dyn DocumentSource>,
    market: Arc<dyn MarketDataSource>,
}

impl ForecastAgent {
    pub fn new(
        cfg: ForecastConfig,
        provider: Arc<ProviderManager>,
        index: Arc<TranscriptIndex>,
        documents: Arc<dyn DocumentSource>,
        market: Arc<dyn MarketDataSource>,
    ) -> Self {
        let insight = InsightEngine::new(cfg.clone(), Arc::clone(&index), Arc::clone(&provider));
        Self {
            cfg,
            provider,
            index,
            insight,
            documents,
            market,
        }
    }

    /// Run the full pipeline for one entity and period. Always returns a
    /// `ForecastResult`; `success` is false only when synthesis itself had
    /// no backend to run on.
    pub async fn generate_forecast(&self, entity_id: &str, period: &str) -> ForecastResult {
        let started = Instant::now();
        info!(entity = entity_id, period, "forecast run started");

        let documents = self.fetch_documents(entity_id).await;

        let financial_metrics = self.metrics_stage(entity_id, &documents).await;
        let qualitative = self.qualitative_stage(entity_id, period, &documents).await;
        let market = self.market_stage(entity_id).await;
        let trends = Some(self.trend_stage(financial_metrics.as_ref()));

        let digest = build_digest(
            entity_id,
            period,
            financial_metrics.as_ref(),
            qualitative.as_ref(),
            market.as_ref(),
            trends.as_ref(),
        );

        let synthesis = self.synthesis_stage(entity_id, &digest).await;
        let elapsed_seconds = started.elapsed().as_secs_f64();

        let (outlook, confidence, recommendation, key_drivers, rationale, risks, opportunities, error_message) =
            match synthesis {
                Ok(s) => (
                    s.outlook,
                    s.confidence,
                    s.recommendation,
                    s.key_drivers,
                    s.rationale,
                    s.risks,
                    s.opportunities,
                    None,
                ),
                Err(e) => {
                    warn!(entity = entity_id, error = %e, "synthesis unavailable");
                    let f = Synthesis::fallback();
                    (
                        f.outlook,
                        f.confidence,
                        f.recommendation,
                        f.key_drivers,
                        f.rationale,
                        f.risks,
                        f.opportunities,
                        Some(e.to_string()),
                    )
                }
            };

        let success = error_message.is_none();
        info!(
            entity = entity_id,
            success, elapsed_seconds, "forecast run finished"
        );

        ForecastResult {
            entity_id: entity_id.to_string(),
            analysis_period: period.to_string(),
            generated_at: Utc::now(),
            financial_metrics,
            qualitative,
            market,
            trends,
            outlook,
            confidence,
            recommendation,
            key_drivers,
            rationale,
            risks,
            opportunities,
            elapsed_seconds,
            success,
            error_message,
        }
    }

    async fn fetch_documents(&self, entity_id: &str) -> Vec<SourceDocument> {
        match self.documents.fetch(entity_id).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(entity = entity_id, error = ?e, "document fetch failed");
                Vec::new()
            }
        }
    }

    async fn metrics_stage(
        &self,
        entity_id: &str,
        documents: &[SourceDocument],
    ) -> Option<FinancialMetrics> {
        match extract_financial_metrics(&self.provider, documents, entity_id).await {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(entity = entity_id, error = %e, "metrics stage degraded");
                None
            }
        }
    }

    /// Qualitative stage with on-demand ingestion: when the index holds
    /// nothing for the entity, transcript-kind documents are normalized and
    /// ingested first.
    async fn qualitative_stage(
        &self,
        entity_id: &str,
        period: &str,
        documents: &[SourceDocument],
    ) -> Option<QualitativeAnalysis> {
        if self.index.chunk_count_for_entity(entity_id) == 0 {
            let mut ingested = 0usize;
            for doc in documents.iter().filter(|d| d.kind == DocumentKind::Transcript) {
                let text = normalize_document(&doc.text);
                ingested += self
                    .index
                    .add_document(&text, entity_id, &doc.date, Default::default())
                    .await;
            }
            if ingested == 0 {
                warn!(entity = entity_id, "no transcript content; qualitative stage unavailable");
                return None;
            }
            info!(entity = entity_id, ingested, "on-demand transcript ingestion");
        }

        match self.insight.analyze(entity_id, period).await {
            Ok(q) => Some(q),
            Err(e) => {
                warn!(entity = entity_id, error = %e, "qualitative stage degraded");
                None
            }
        }
    }

    async fn market_stage(&self, entity_id: &str) -> Option<MarketContext> {
        match self.market.fetch(entity_id).await {
            Ok(Some(snapshot)) => Some(derive_market_context(&snapshot)),
            Ok(None) => {
                warn!(entity = entity_id, "no market data; market stage unavailable");
                None
            }
            Err(e) => {
                warn!(entity = entity_id, error = ?e, "market stage degraded");
                None
            }
        }
    }

    fn trend_stage(&self, metrics: Option<&FinancialMetrics>) -> QuarterlyTrends {
        let Some(m) = metrics else {
            return QuarterlyTrends {
                projected_revenue: None,
                projected_operating_margin: None,
                margin_healthy: None,
                confidence: 0.6,
            };
        };
        let projected_revenue = m.revenue.map(|r| r * self.cfg.revenue_growth_assumption);
        let projected_operating_margin =
            m.operating_margin.map(|om| om + self.cfg.margin_improvement);
        QuarterlyTrends {
            projected_revenue,
            projected_operating_margin,
            margin_healthy: projected_operating_margin.map(|om| om > self.cfg.healthy_margin_pct),
            confidence: 0.8,
        }
    }

    async fn synthesis_stage(
        &self,
        entity_id: &str,
        digest: &str,
    ) -> Result<Synthesis, ForecastError> {
        let prompt = synthesis_prompt(digest, entity_id);
        let response = self.provider.complete(&prompt).await?;

        let defaults = defaults_from(
            r#"{"outlook": "neutral", "confidence": 0.5, "recommendation": "hold",
                "key_drivers": ["Business fundamentals"],
                "rationale": "Limited data available for analysis",
                "risks": ["Market volatility"],
                "opportunities": ["Growth initiatives"]}"#,
        );
        let parsed = parse_structured(&response, &defaults);
        if !parsed.was_parsed() {
            warn!(entity = entity_id, "synthesis response unparseable; defaults applied");
        }

        Ok(Synthesis {
            outlook: Outlook::from_str_or_neutral(parsed.str_field("outlook").unwrap_or("")),
            confidence: parsed
                .f64_field("confidence")
                .map(|v| v.clamp(0.0, 1.0) as f32)
                .unwrap_or(0.5),
            recommendation: Recommendation::from_str_or_hold(
                parsed.str_field("recommendation").unwrap_or(""),
            ),
            key_drivers: parsed.str_list_field("key_drivers"),
            rationale: parsed
                .str_field("rationale")
                .unwrap_or("Limited data available for analysis")
                .to_string(),
            risks: parsed.str_list_field("risks"),
            opportunities: parsed.str_list_field("opportunities"),
        })
    }
}

struct Synthesis {
    outlook: Outlook,
    confidence: f32,
    recommendation: Recommendation,
    key_drivers: Vec<String>,
    rationale: String,
    risks: Vec<String>,
    opportunities: Vec<String>,
}

impl Synthesis {
    /// The documented result when synthesis has no backend at all.
    fn fallback() -> Self {
        Self {
            outlook: Outlook::Neutral,
            confidence: 0.5,
            recommendation: Recommendation::Hold,
            key_drivers: vec!["Business fundamentals".to_string()],
            rationale: "Limited data available for analysis".to_string(),
            risks: vec!["Market volatility".to_string()],
            opportunities: vec!["Growth initiatives".to_string()],
        }
    }
}

const NOT_AVAILABLE: &str = "Not available";

/// Deterministic labeled digest; each missing stage contributes a fixed
/// placeholder so the synthesis prompt shape never varies.
fn build_digest(
    entity_id: &str,
    period: &str,
    metrics: Option<&FinancialMetrics>,
    qualitative: Option<&QualitativeAnalysis>,
    market: Option<&MarketContext>,
    trends: Option<&QuarterlyTrends>,
) -> String {
    let mut out = Vec::new();
    out.push(format!("COMPANY: {entity_id}"));
    out.push(format!("ANALYSIS PERIOD: {period}"));

    out.push("\nFINANCIAL METRICS:".to_string());
    match metrics {
        Some(m) => {
            out.push(format!("- Revenue: {}", fmt_opt(m.revenue, "M")));
            out.push(format!("- Net profit: {}", fmt_opt(m.net_profit, "M")));
            out.push(format!(
                "- Operating margin: {}",
                fmt_opt(m.operating_margin, "%")
            ));
            out.push(format!("- Net margin: {}", fmt_opt(m.net_margin, "%")));
        }
        None => out.push(NOT_AVAILABLE.to_string()),
    }

    out.push("\nQUALITATIVE ANALYSIS:".to_string());
    match qualitative {
        Some(q) => {
            out.push(format!(
                "- Management tone: {:?} (optimism {:.2})",
                q.sentiment.overall_tone, q.sentiment.optimism_score
            ));
            out.push(format!(
                "- Insights: {} (avg confidence {:.2})",
                q.total_insights, q.average_confidence
            ));
            for i in q.business_outlook.iter().take(3) {
                out.push(format!("- Outlook: {}", i.text));
            }
            for i in q.risk_factors.iter().take(3) {
                out.push(format!("- Risk: {}", i.text));
            }
            for i in q.growth_opportunities.iter().take(3) {
                out.push(format!("- Opportunity: {}", i.text));
            }
        }
        None => out.push(NOT_AVAILABLE.to_string()),
    }

    out.push("\nMARKET CONTEXT:".to_string());
    match market {
        Some(m) => {
            out.push(format!(
                "- Valuation: {:?}, momentum: {:?}, risk: {:?}",
                m.valuation, m.momentum, m.risk_level
            ));
            for obs in &m.key_observations {
                out.push(format!("- {obs}"));
            }
        }
        None => out.push(NOT_AVAILABLE.to_string()),
    }

    out.push("\nTREND PROJECTION:".to_string());
    match trends {
        Some(t) => {
            out.push(format!(
                "- Projected revenue: {}",
                fmt_opt(t.projected_revenue, "M")
            ));
            out.push(format!(
                "- Projected operating margin: {}",
                fmt_opt(t.projected_operating_margin, "%")
            ));
            out.push(format!(
                "- Projection confidence: {:.1}",
                t.confidence
            ));
        }
        None => out.push(NOT_AVAILABLE.to_string()),
    }

    out.join("\n")
}

fn fmt_opt(v: Option<f64>, suffix: &str) -> String {
    match v {
        Some(x) => format!("{x:.1}{suffix}"),
        None => NOT_AVAILABLE.to_string(),
    }
}

fn synthesis_prompt(digest: &str, entity_id: &str) -> String {
    format!(
        r#"You are a senior financial analyst producing a forecast for {entity_id}.

ANALYSIS DIGEST:
{digest}

TASK: Synthesize the digest into a forward-looking forecast.

RESPOND IN THIS EXACT JSON FORMAT:
{{
    "outlook": "<positive|negative|neutral>",
    "confidence": <0.0_to_1.0>,
    "recommendation": "<buy|hold|sell>",
    "key_drivers": ["driver1", "driver2"],
    "rationale": "<2-3 sentence justification>",
    "risks": ["risk1", "risk2"],
    "opportunities": ["opportunity1", "opportunity2"]
}}

GUIDELINES:
- Base the outlook only on the digest above; sections marked "Not available" carry no signal
- confidence reflects both conviction and how much of the digest was available
- key_drivers: the 2-4 most decisive factors (max 4)
- Be conservative when data is sparse"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::EmptyDocumentSource;
    use crate::index::embed::HashEmbedder;
    use crate::market::UnavailableMarketSource;
    use crate::provider::{FailingBackend, MockBackend};

    fn agent(reply: &str) -> ForecastAgent {
        let cfg = ForecastConfig::default();
        ForecastAgent::new(
            cfg.clone(),
            Arc::new(ProviderManager::new(vec![Arc::new(MockBackend::new(
                "mock", reply,
            ))])),
            Arc::new(TranscriptIndex::new(cfg, Arc::new(HashEmbedder::default()))),
            Arc::new(EmptyDocumentSource),
            Arc::new(UnavailableMarketSource),
        )
    }

    #[tokio::test]
    async fn degraded_run_still_succeeds_with_neutral_hold() {
        // No documents, no market data, and a backend that never answers in
        // JSON: every optional stage is absent yet the run succeeds.
        let agent = agent("not json");
        let result = agent.generate_forecast("ACME", "Q2-2025").await;

        assert!(result.success);
        assert!(result.error_message.is_none());
        assert!(result.financial_metrics.is_none());
        assert!(result.qualitative.is_none());
        assert!(result.market.is_none());
        assert_eq!(result.outlook, Outlook::Neutral);
        assert_eq!(result.recommendation, Recommendation::Hold);
        assert!((result.confidence - 0.5).abs() < 1e-6);
        assert!(result.elapsed_seconds >= 0.0);
    }

    #[tokio::test]
    async fn provider_exhaustion_marks_run_unsuccessful() {
        let cfg = ForecastConfig::default();
        let agent = ForecastAgent::new(
            cfg.clone(),
            Arc::new(ProviderManager::new(vec![Arc::new(FailingBackend::new(
                "down",
            ))])),
            Arc::new(TranscriptIndex::new(cfg, Arc::new(HashEmbedder::default()))),
            Arc::new(EmptyDocumentSource),
            Arc::new(UnavailableMarketSource),
        );
        let result = agent.generate_forecast("ACME", "Q2-2025").await;

        assert!(!result.success);
        assert!(result.error_message.is_some());
        // The fallback synthesis is still a complete, usable result.
        assert_eq!(result.outlook, Outlook::Neutral);
        assert_eq!(result.recommendation, Recommendation::Hold);
        assert!(result.elapsed_seconds >= 0.0);
        // Trend stage is deterministic and survives total provider loss.
        assert!((result.trends.unwrap().confidence - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn well_formed_synthesis_is_adopted() {
        let reply = r#"{"outlook": "positive", "confidence": 0.82, "recommendation": "buy",
                        "key_drivers": ["Revenue growth", "Margin expansion"],
                        "rationale": "Strong quarter with improving margins.",
                        "risks": ["FX exposure"], "opportunities": ["New markets"]}"#;
        let result = agent(reply).generate_forecast("ACME", "Q2-2025").await;

        assert!(result.success);
        assert_eq!(result.outlook, Outlook::Positive);
        assert_eq!(result.recommendation, Recommendation::Buy);
        assert!((result.confidence - 0.82).abs() < 1e-6);
        assert_eq!(result.key_drivers.len(), 2);
        assert_eq!(result.risks, vec!["FX exposure"]);
    }

    #[test]
    fn trend_projection_applies_documented_constants() {
        let cfg = ForecastConfig::default();
        let agent = agent("{}");
        let metrics = FinancialMetrics {
            entity_id: "ACME".into(),
            source_date: "2025-07-10".into(),
            revenue: Some(1000.0),
            net_profit: Some(180.0),
            operating_margin: Some(22.0),
            net_margin: Some(18.0),
            confidence: 0.9,
        };
        let t = agent.trend_stage(Some(&metrics));
        assert!((t.projected_revenue.unwrap() - 1000.0 * cfg.revenue_growth_assumption).abs() < 1e-9);
        assert!((t.projected_operating_margin.unwrap() - 22.5).abs() < 1e-9);
        assert_eq!(t.margin_healthy, Some(true));
        assert!((t.confidence - 0.8).abs() < 1e-6);

        let base = agent.trend_stage(None);
        assert!(base.projected_revenue.is_none());
        assert!((base.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn digest_uses_fixed_placeholders_for_missing_stages() {
        let digest = build_digest("ACME", "Q2-2025", None, None, None, None);
        assert!(digest.contains("COMPANY: ACME"));
        assert_eq!(digest.matches(NOT_AVAILABLE).count(), 4);
    }
}
