// src/financials.rs
//! Structured financial-metric extraction from the most recent report-kind
//! document. One completion per forecast run; the structured parser absorbs
//! malformed output, and a response carrying no actual figures leaves the
//! stage unavailable rather than fabricating zeros.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::acquire::{DocumentKind, SourceDocument};
use crate::error::ForecastError;
use crate::parse::{defaults_from, parse_structured};
use crate::provider::ProviderManager;

/// Report text beyond this many characters adds cost without adding the
/// headline figures, which sit at the top of every filing.
const REPORT_EXCERPT_CHARS: usize = 4000;

/// Headline figures pulled from one report.
#[derive(Debug, Clone, Serialize)]
pub struct FinancialMetrics {
    pub entity_id: String,
    /// Date of the report the figures came from.
    pub source_date: String,
    /// Revenue in millions, if stated.
    pub revenue: Option<f64>,
    /// Net profit in millions, if stated.
    pub net_profit: Option<f64>,
    pub operating_margin: Option<f64>,
    pub net_margin: Option<f64>,
    /// Extraction confidence reported by the model, clamped to [0,1].
    pub confidence: f32,
}

/// Extract metrics from the newest `Report` document. Every failure mode
/// maps to a taxonomy variant the orchestrator degrades on: no report is
/// `StageDataUnavailable`, an unusable response is `ResponseParseFailure`,
/// and provider exhaustion propagates as-is.
pub async fn extract_financial_metrics(
    provider: &ProviderManager,
    documents: &[SourceDocument],
    entity_id: &str,
) -> Result<FinancialMetrics, ForecastError> {
    let Some(report) = documents
        .iter()
        .filter(|d| d.kind == DocumentKind::Report)
        .max_by(|a, b| a.date.cmp(&b.date))
    else {
        return Err(ForecastError::StageDataUnavailable("no report document"));
    };

    let excerpt: String = report.text.chars().take(REPORT_EXCERPT_CHARS).collect();
    let prompt = extraction_prompt(&excerpt, entity_id);
    let response = provider.complete(&prompt).await?;

    let defaults = defaults_from(
        r#"{"revenue": null, "net_profit": null, "operating_margin": null,
            "net_margin": null, "confidence": 0.5}"#,
    );
    let parsed = parse_structured(&response, &defaults);
    if !parsed.was_parsed() {
        warn!(entity = entity_id, "metric response unparseable");
        return Err(ForecastError::ResponseParseFailure(
            "metric response had no structured region".to_string(),
        ));
    }

    let metrics = FinancialMetrics {
        entity_id: entity_id.to_string(),
        source_date: report.date.clone(),
        revenue: optional_number(parsed.fields().get("revenue")),
        net_profit: optional_number(parsed.fields().get("net_profit")),
        operating_margin: optional_number(parsed.fields().get("operating_margin")),
        net_margin: optional_number(parsed.fields().get("net_margin")),
        confidence: parsed
            .f64_field("confidence")
            .map(|v| v.clamp(0.0, 1.0) as f32)
            .unwrap_or(0.5),
    };

    if metrics.revenue.is_none()
        && metrics.net_profit.is_none()
        && metrics.operating_margin.is_none()
        && metrics.net_margin.is_none()
    {
        warn!(entity = entity_id, "no figures in metric response");
        return Err(ForecastError::ResponseParseFailure(
            "metric response contained no figures".to_string(),
        ));
    }

    info!(
        entity = entity_id,
        date = metrics.source_date,
        "extracted financial metrics"
    );
    Ok(metrics)
}

/// Number, numeric string ("12,345.6" included), anything else → None.
fn optional_number(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64().or_else(|| {
        v.as_str()
            .and_then(|s| s.trim().replace(',', "").parse().ok())
    })
}

fn extraction_prompt(excerpt: &str, entity_id: &str) -> String {
    format!(
        r#"You are extracting headline financial figures from a {entity_id} financial report.

REPORT TEXT:
{excerpt}

TASK: Extract the figures below. Use null for any figure the text does not state.

RESPOND IN THIS EXACT JSON FORMAT:
{{
    "revenue": <revenue_in_millions_or_null>,
    "net_profit": <net_profit_in_millions_or_null>,
    "operating_margin": <operating_margin_percent_or_null>,
    "net_margin": <net_margin_percent_or_null>,
    "confidence": <0.0_to_1.0>
}}

GUIDELINES:
- Report figures in millions of the reported currency
- Margins as percentages (e.g. 23.5 for 23.5%)
- confidence: how confident you are the figures are correctly read
- Never guess a figure that is not in the text"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockBackend;
    use std::sync::Arc;

    fn report(date: &str, text: &str) -> SourceDocument {
        SourceDocument {
            text: text.to_string(),
            date: date.to_string(),
            kind: DocumentKind::Report,
        }
    }

    fn transcript(date: &str) -> SourceDocument {
        SourceDocument {
            text: "CEO: welcome".to_string(),
            date: date.to_string(),
            kind: DocumentKind::Transcript,
        }
    }

    fn provider(reply: &str) -> ProviderManager {
        ProviderManager::new(vec![Arc::new(MockBackend::new("mock", reply))])
    }

    #[tokio::test]
    async fn extracts_figures_and_repairs_separators() {
        let reply = r#"{"revenue": 12,345.5, "net_profit": 2,100, "operating_margin": 23.5,
                        "net_margin": 17.0, "confidence": 0.9}"#;
        let p = provider(reply);
        let docs = [report("2025-07-10", "Revenue was 12,345.5 million.")];
        let m = extract_financial_metrics(&p, &docs, "ACME").await.unwrap();
        assert_eq!(m.revenue, Some(12345.5));
        assert_eq!(m.net_profit, Some(2100.0));
        assert!((m.confidence - 0.9).abs() < 1e-6);
        assert_eq!(m.source_date, "2025-07-10");
    }

    #[tokio::test]
    async fn picks_most_recent_report_and_ignores_transcripts() {
        let reply = r#"{"revenue": 500, "net_profit": null, "operating_margin": null,
                        "net_margin": null, "confidence": 0.7}"#;
        let p = provider(reply);
        let docs = [
            report("2025-01-10", "old"),
            transcript("2025-09-01"),
            report("2025-07-10", "new"),
        ];
        let m = extract_financial_metrics(&p, &docs, "ACME").await.unwrap();
        assert_eq!(m.source_date, "2025-07-10");
    }

    #[tokio::test]
    async fn no_report_means_stage_data_unavailable() {
        let p = provider("{}");
        let docs = [transcript("2025-07-10")];
        let err = extract_financial_metrics(&p, &docs, "ACME")
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::StageDataUnavailable(_)));
    }

    #[tokio::test]
    async fn unparseable_or_figure_free_responses_are_parse_failures() {
        let docs = [report("2025-07-10", "text")];
        let p = provider("no json at all");
        let err = extract_financial_metrics(&p, &docs, "ACME")
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::ResponseParseFailure(_)));
        assert!(!err.is_fatal());

        let empty = r#"{"revenue": null, "net_profit": null, "operating_margin": null,
                        "net_margin": null, "confidence": 0.9}"#;
        let p = provider(empty);
        let err = extract_financial_metrics(&p, &docs, "ACME")
            .await
            .unwrap_err();
        assert!(matches!(err, ForecastError::ResponseParseFailure(_)));
    }

    #[tokio::test]
    async fn numeric_strings_are_accepted() {
        let reply = r#"{"revenue": "1,200", "net_profit": "300", "operating_margin": "25",
                        "net_margin": "18", "confidence": "0.8"}"#;
        let p = provider(reply);
        let docs = [report("2025-07-10", "text")];
        let m = extract_financial_metrics(&p, &docs, "ACME").await.unwrap();
        assert_eq!(m.revenue, Some(1200.0));
        assert!((m.confidence - 0.8).abs() < 1e-6);
    }
}
