// src/market.rs
//! Market data boundary and threshold-based context derivation.
//!
//! The data itself comes from an external collaborator behind
//! `MarketDataSource`; this module owns the fixed valuation / momentum /
//! risk thresholds applied on top of a snapshot.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Live market snapshot for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_percent: f64,
    pub volume: u64,
    /// Market capitalization, if reported.
    pub market_cap: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub week_52_high: f64,
    pub week_52_low: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Valuation {
    Undervalued,
    FairlyValued,
    Overvalued,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    Bullish,
    Neutral,
    Bearish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Derived analysis over a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub symbol: String,
    pub valuation: Valuation,
    pub momentum: Momentum,
    pub risk_level: RiskLevel,
    pub key_observations: Vec<String>,
    /// Percent the price sits below the 52-week high.
    pub percent_below_52w_high: f64,
    /// Percent the price sits above the 52-week low.
    pub percent_above_52w_low: f64,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// `Ok(None)` means the provider had nothing for this entity; the
    /// market stage degrades rather than failing the pipeline.
    async fn fetch(&self, entity_id: &str) -> Result<Option<MarketSnapshot>>;
}

/// Apply the fixed thresholds:
/// valuation pe<20 / pe>30, momentum ±1.0%, risk from the 52-week range
/// position (>40% below high → medium, <20% above low → high, else low).
pub fn derive_market_context(snapshot: &MarketSnapshot) -> MarketContext {
    let percent_below_high = if snapshot.week_52_high > 0.0 {
        (snapshot.week_52_high - snapshot.current_price) / snapshot.week_52_high * 100.0
    } else {
        0.0
    };
    let percent_above_low = if snapshot.week_52_low > 0.0 {
        (snapshot.current_price - snapshot.week_52_low) / snapshot.week_52_low * 100.0
    } else {
        0.0
    };

    let valuation = match snapshot.pe_ratio {
        Some(pe) if pe < 20.0 => Valuation::Undervalued,
        Some(pe) if pe > 30.0 => Valuation::Overvalued,
        Some(_) => Valuation::FairlyValued,
        None => Valuation::Unknown,
    };

    let momentum = if snapshot.price_change_percent > 1.0 {
        Momentum::Bullish
    } else if snapshot.price_change_percent < -1.0 {
        Momentum::Bearish
    } else {
        Momentum::Neutral
    };

    let risk_level = if percent_below_high > 40.0 {
        RiskLevel::Medium
    } else if percent_above_low < 20.0 {
        RiskLevel::High
    } else {
        RiskLevel::Low
    };

    let mut key_observations = vec![
        format!("Trading {percent_below_high:.0}% below 52-week high"),
        format!("Trading {percent_above_low:.0}% above 52-week low"),
    ];
    if let Some(pe) = snapshot.pe_ratio {
        key_observations.push(format!(
            "P/E ratio of {pe:.1} suggests {} stock",
            match valuation {
                Valuation::Undervalued => "an undervalued",
                Valuation::FairlyValued => "a fairly valued",
                Valuation::Overvalued => "an overvalued",
                Valuation::Unknown => "an unrated",
            }
        ));
    }

    MarketContext {
        symbol: snapshot.symbol.clone(),
        valuation,
        momentum,
        risk_level,
        key_observations,
        percent_below_52w_high: percent_below_high,
        percent_above_52w_low: percent_above_low,
    }
}

/// No-data source for tests and offline runs.
pub struct UnavailableMarketSource;

#[async_trait]
impl MarketDataSource for UnavailableMarketSource {
    async fn fetch(&self, _entity_id: &str) -> Result<Option<MarketSnapshot>> {
        Ok(None)
    }
}

/// Serves a fixed snapshot; used by integration tests.
pub struct StaticMarketSource {
    pub snapshot: MarketSnapshot,
}

#[async_trait]
impl MarketDataSource for StaticMarketSource {
    async fn fetch(&self, _entity_id: &str) -> Result<Option<MarketSnapshot>> {
        Ok(Some(self.snapshot.clone()))
    }
}
