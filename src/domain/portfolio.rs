//! Portfolio analysis output types. The `PortfolioBrief` is the structured
//! product of the portfolio node; display formatting lives in the HTTP
//! interface layer.

use crate::domain::types::ExecutionMode;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub asset_symbol: String,
    pub qty: Decimal,
    pub usd_value: Decimal,
    pub current_price: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRow {
    pub asset_symbol: String,
    pub pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub concentration_pct_top1: f64,
    pub concentration_pct_top3: f64,
    pub volatility_proxy: Option<f64>,
    pub diversification_score: Option<f64>,
    pub risk_level: String,
}

impl RiskSnapshot {
    pub fn unknown() -> Self {
        Self {
            concentration_pct_top1: 0.0,
            concentration_pct_top3: 0.0,
            volatility_proxy: None,
            diversification_score: None,
            risk_level: "UNKNOWN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSummary {
    pub window_days: u32,
    pub total_trades: usize,
    pub total_notional_usd: Decimal,
    pub avg_trade_usd: Decimal,
    pub buys: usize,
    pub sells: usize,
    pub top_assets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRecommendation {
    pub category: String,
    pub priority: String,
    pub title: String,
    pub description: String,
    pub action_required: bool,
}

/// Pointers from the brief back to the tool_calls rows that produced its
/// inputs. Every number in the brief is traceable through these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceRefs {
    pub accounts_call_id: Option<String>,
    pub prices_call_ids: Vec<String>,
    pub orders_call_id: Option<String>,
}

impl EvidenceRefs {
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(id) = &self.accounts_call_id {
            ids.push(id.clone());
        }
        ids.extend(self.prices_call_ids.iter().cloned());
        if let Some(id) = &self.orders_call_id {
            ids.push(id.clone());
        }
        ids
    }
}

/// Structured failure carried inside a brief when analysis could not run.
/// A failed brief never invents holdings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefFailure {
    pub error_code: String,
    pub error_message: String,
    pub recoverable: bool,
    pub suggested_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioBrief {
    pub mode: ExecutionMode,
    pub as_of: DateTime<Utc>,
    pub total_value_usd: Decimal,
    pub cash_usd: Decimal,
    pub holdings: Vec<Holding>,
    pub allocation: Vec<AllocationRow>,
    pub risk: RiskSnapshot,
    pub trade_summary: Option<TradeSummary>,
    pub recommendations: Vec<PortfolioRecommendation>,
    pub warnings: Vec<String>,
    pub evidence_refs: EvidenceRefs,
    #[serde(default)]
    pub failure: Option<BriefFailure>,
}

impl PortfolioBrief {
    pub fn failed(mode: ExecutionMode, failure: BriefFailure) -> Self {
        Self {
            mode,
            as_of: Utc::now(),
            total_value_usd: Decimal::ZERO,
            cash_usd: Decimal::ZERO,
            holdings: Vec::new(),
            allocation: Vec::new(),
            risk: RiskSnapshot::unknown(),
            trade_summary: None,
            recommendations: Vec::new(),
            warnings: Vec::new(),
            evidence_refs: EvidenceRefs::default(),
            failure: Some(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_evidence_refs_flattening() {
        let refs = EvidenceRefs {
            accounts_call_id: Some("tool_a".to_string()),
            prices_call_ids: vec!["tool_b".to_string(), "tool_c".to_string()],
            orders_call_id: None,
        };
        assert_eq!(refs.all_ids(), vec!["tool_a", "tool_b", "tool_c"]);
    }

    #[test]
    fn test_failed_brief_has_no_holdings() {
        let brief = PortfolioBrief::failed(
            ExecutionMode::Live,
            BriefFailure {
                error_code: "NO_CREDENTIALS".to_string(),
                error_message: "No API credentials configured".to_string(),
                recoverable: true,
                suggested_action: "Configure COINBASE_API_KEY_NAME".to_string(),
            },
        );
        assert!(brief.holdings.is_empty());
        assert_eq!(brief.total_value_usd, dec!(0));
        assert!(brief.failure.is_some());
    }
}
