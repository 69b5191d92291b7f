//! Unified trade preflight.
//!
//! The only gate between parser output and confirmation issuance. Applies
//! the same fee estimate across every check so min-notional and balance
//! validation agree with the numbers shown in the confirmation prompt.

use crate::application::intent::templates::ESTIMATED_FEE_RATE;
use crate::domain::errors::PreflightRejectReason;
use crate::domain::ports::{ExecutionProvider, MarketDataProvider};
use crate::domain::symbols::to_product_id;
use crate::domain::types::{AssetClass, AutoSellProposal, ExecutionMode, OrderSide};
use crate::infrastructure::paper::PaperExecution;
use crate::infrastructure::persistence::Database;
use crate::infrastructure::persistence::repositories::portfolio::PortfolioRepo;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Coinbase generally allows orders down to $1 of notional.
const DEFAULT_MIN_NOTIONAL: Decimal = dec!(1);

#[derive(Debug, Clone)]
pub struct PreflightRequest {
    pub tenant_id: String,
    pub side: OrderSide,
    pub asset: String,
    pub amount_usd: Decimal,
    pub asset_class: AssetClass,
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub valid: bool,
    pub reason_code: Option<PreflightRejectReason>,
    pub message: String,
    pub remediation: Option<String>,
    pub requested_usd: Decimal,
    pub estimated_fee: Decimal,
    pub effective_min_notional: Option<Decimal>,
    pub available_balance: Option<Decimal>,
    pub available_usd: Option<Decimal>,
    pub requires_auto_sell: bool,
    pub auto_sell_proposal: Option<AutoSellProposal>,
}

impl PreflightResult {
    fn ok(requested_usd: Decimal, estimated_fee: Decimal) -> Self {
        Self {
            valid: true,
            reason_code: None,
            message: "Preflight passed".to_string(),
            remediation: None,
            requested_usd,
            estimated_fee,
            effective_min_notional: None,
            available_balance: None,
            available_usd: None,
            requires_auto_sell: false,
            auto_sell_proposal: None,
        }
    }

    fn reject(
        reason: PreflightRejectReason,
        message: String,
        remediation: String,
        requested_usd: Decimal,
        estimated_fee: Decimal,
    ) -> Self {
        Self {
            valid: false,
            reason_code: Some(reason),
            message,
            remediation: Some(remediation),
            requested_usd,
            estimated_fee,
            effective_min_notional: None,
            available_balance: None,
            available_usd: None,
            requires_auto_sell: false,
            auto_sell_proposal: None,
        }
    }
}

pub struct PreflightValidator {
    market_data: Arc<dyn MarketDataProvider>,
    live_execution: Option<Arc<dyn ExecutionProvider>>,
    portfolio: PortfolioRepo,
}

impl PreflightValidator {
    pub fn new(
        database: Database,
        market_data: Arc<dyn MarketDataProvider>,
        live_execution: Option<Arc<dyn ExecutionProvider>>,
    ) -> Self {
        Self {
            market_data,
            live_execution,
            portfolio: PortfolioRepo::new(database),
        }
    }

    /// Resolve a percentage sale ("sell 25%") to a USD notional from the
    /// tenant's current holdings.
    pub async fn sell_percentage_notional(
        &self,
        tenant_id: &str,
        asset: &str,
        pct: f64,
    ) -> Result<Decimal> {
        use rust_decimal::prelude::FromPrimitive;

        let balances = self.balances(tenant_id).await?;
        let held = balances
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO);
        if held <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let Some(price) = self.price_estimate(asset).await else {
            return Ok(Decimal::ZERO);
        };
        let fraction = Decimal::from_f64(pct / 100.0).unwrap_or(Decimal::ZERO);
        Ok((held * price * fraction).round_dp(2))
    }

    pub async fn run(&self, request: &PreflightRequest) -> Result<PreflightResult> {
        let estimated_fee = request.amount_usd * ESTIMATED_FEE_RATE;

        // 1. Min notional: requested notional plus fee must clear the
        //    product minimum. Stale cache or provider errors fall back to
        //    the default rather than blocking the trade.
        let min_notional = self.effective_min_notional(&request.asset, request.asset_class).await;
        if request.amount_usd + estimated_fee < min_notional {
            let mut result = PreflightResult::reject(
                PreflightRejectReason::MinNotionalTooLow,
                format!(
                    "Order of ${} is below the minimum of ${} for {} (including ~${:.2} estimated fees).",
                    request.amount_usd, min_notional, request.asset, estimated_fee
                ),
                format!("Increase the order size to at least ${}.", min_notional),
                request.amount_usd,
                estimated_fee,
            );
            result.effective_min_notional = Some(min_notional);
            return Ok(result);
        }

        match request.side {
            OrderSide::Sell => self.check_sell_balance(request, estimated_fee).await,
            OrderSide::Buy => self.check_buy_cash(request, estimated_fee).await,
        }
    }

    async fn effective_min_notional(&self, asset: &str, asset_class: AssetClass) -> Decimal {
        if asset_class == AssetClass::Stock || asset == "AUTO" {
            return DEFAULT_MIN_NOTIONAL;
        }
        match self.market_data.get_product(&to_product_id(asset)).await {
            Ok(product) => product.min_market_funds.unwrap_or(DEFAULT_MIN_NOTIONAL),
            Err(e) => {
                warn!("Min notional lookup failed for {}, using default: {}", asset, e);
                DEFAULT_MIN_NOTIONAL
            }
        }
    }

    /// Balances from the live broker when credentials exist, else from the
    /// latest paper snapshot (seeded if none).
    async fn balances(&self, tenant_id: &str) -> Result<HashMap<String, Decimal>> {
        if let Some(live) = &self.live_execution {
            match live.get_balances(tenant_id).await {
                Ok(balances) => return Ok(balances),
                Err(e) => warn!("Live balance fetch failed, falling back to snapshot: {}", e),
            }
        }
        match self.portfolio.latest_snapshot(tenant_id).await? {
            Some(snapshot) => Ok(snapshot.balances),
            None => Ok(PaperExecution::seed_balances()),
        }
    }

    async fn price_estimate(&self, asset: &str) -> Option<Decimal> {
        self.market_data
            .get_price(&to_product_id(asset))
            .await
            .ok()
            .filter(|p| *p > Decimal::ZERO)
    }

    async fn check_sell_balance(
        &self,
        request: &PreflightRequest,
        estimated_fee: Decimal,
    ) -> Result<PreflightResult> {
        // AUTO resolves after selection; balance is checked then.
        if request.asset == "AUTO" {
            return Ok(PreflightResult::ok(request.amount_usd, estimated_fee));
        }

        let balances = self.balances(&request.tenant_id).await?;
        let available = balances
            .get(&request.asset.to_uppercase())
            .copied()
            .unwrap_or(Decimal::ZERO);

        let available_usd = match self.price_estimate(&request.asset).await {
            Some(price) => available * price,
            None => available, // no price: treat qty as its own USD proxy
        };

        if available_usd < request.amount_usd {
            let mut result = PreflightResult::reject(
                PreflightRejectReason::InsufficientBalance,
                format!(
                    "You hold {} {} (~${:.2}), which is less than the requested ${}.",
                    available, request.asset, available_usd, request.amount_usd
                ),
                format!(
                    "Reduce the sell amount to at most ${:.2} or buy more {} first.",
                    available_usd, request.asset
                ),
                request.amount_usd,
                estimated_fee,
            );
            result.available_balance = Some(available);
            result.available_usd = Some(available_usd);
            return Ok(result);
        }

        let mut result = PreflightResult::ok(request.amount_usd, estimated_fee);
        result.available_balance = Some(available);
        result.available_usd = Some(available_usd);
        Ok(result)
    }

    async fn check_buy_cash(
        &self,
        request: &PreflightRequest,
        estimated_fee: Decimal,
    ) -> Result<PreflightResult> {
        let balances = self.balances(&request.tenant_id).await?;
        let cash = balances.get("USD").copied().unwrap_or(Decimal::ZERO);
        let required = request.amount_usd + estimated_fee;

        if cash >= required {
            let mut result = PreflightResult::ok(request.amount_usd, estimated_fee);
            result.available_usd = Some(cash);
            return Ok(result);
        }

        // Cash is short. If non-target holdings can cover the gap, propose
        // an auto-sell instead of rejecting.
        let shortfall = required - cash;
        let target = request.asset.to_uppercase();
        let mut candidates: Vec<(String, Decimal)> = Vec::new();

        for (symbol, qty) in &balances {
            if symbol == "USD" || *symbol == target || *qty <= Decimal::ZERO {
                continue;
            }
            if let Some(price) = self.price_estimate(symbol).await {
                candidates.push((symbol.clone(), *qty * price));
            }
        }

        // Minimum disturbance: the smallest holding that still covers the
        // shortfall with the sell-side fee included.
        let sell_amount = shortfall * (Decimal::ONE + ESTIMATED_FEE_RATE);
        candidates.sort_by(|a, b| a.1.cmp(&b.1));
        let cover = candidates.iter().find(|(_, value)| *value >= sell_amount);

        if let Some((symbol, _)) = cover {
            let proposal = AutoSellProposal {
                sell_base_symbol: symbol.clone(),
                sell_product_id: to_product_id(symbol),
                sell_amount_usd: sell_amount.round_dp(2),
            };
            info!(
                "auto_sell_required: tenant={} sell={} amount=${} to fund BUY ${} of {}",
                request.tenant_id,
                proposal.sell_base_symbol,
                proposal.sell_amount_usd,
                request.amount_usd,
                request.asset
            );
            let mut result = PreflightResult::ok(request.amount_usd, estimated_fee);
            result.available_usd = Some(cash);
            result.requires_auto_sell = true;
            result.auto_sell_proposal = Some(proposal);
            return Ok(result);
        }

        let mut result = PreflightResult::reject(
            PreflightRejectReason::InsufficientCash,
            format!(
                "You have ${:.2} in cash, but this order needs ${:.2} (including ~${:.2} estimated fees).",
                cash, required, estimated_fee
            ),
            format!("Deposit funds or reduce the order below ${:.2}.", cash),
            request.amount_usd,
            estimated_fee,
        );
        result.available_usd = Some(cash);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::MarketDataError;
    use crate::domain::types::{Candle, Granularity, Product};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct StubMarketData {
        price: Decimal,
        min_notional: Decimal,
    }

    #[async_trait]
    impl MarketDataProvider for StubMarketData {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn list_products(&self, _quote: &str) -> Result<Vec<Product>, MarketDataError> {
            Ok(Vec::new())
        }

        async fn get_candles(
            &self,
            _product_id: &str,
            _granularity: Granularity,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, MarketDataError> {
            Ok(Vec::new())
        }

        async fn get_price(&self, _product_id: &str) -> Result<Decimal, MarketDataError> {
            Ok(self.price)
        }

        async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError> {
            Ok(Product {
                product_id: product_id.to_string(),
                base_currency: crate::domain::symbols::to_base(product_id),
                quote_currency: "USD".to_string(),
                status: "online".to_string(),
                volume_24h: 0.0,
                min_market_funds: Some(self.min_notional),
            })
        }
    }

    async fn validator(price: Decimal, min_notional: Decimal) -> PreflightValidator {
        let db = Database::in_memory().await.unwrap();
        PreflightValidator::new(
            db,
            Arc::new(StubMarketData { price, min_notional }),
            None,
        )
    }

    fn request(side: OrderSide, asset: &str, amount: Decimal) -> PreflightRequest {
        PreflightRequest {
            tenant_id: "t1".to_string(),
            side,
            asset: asset.to_string(),
            amount_usd: amount,
            asset_class: AssetClass::Crypto,
            mode: ExecutionMode::Paper,
        }
    }

    #[tokio::test]
    async fn test_min_notional_rejection_includes_fee() {
        let validator = validator(dec!(50000), dec!(5)).await;
        let result = validator
            .run(&request(OrderSide::Buy, "BTC", dec!(2)))
            .await
            .unwrap();

        assert!(!result.valid);
        assert_eq!(result.reason_code, Some(PreflightRejectReason::MinNotionalTooLow));
        assert_eq!(result.effective_min_notional, Some(dec!(5)));
        assert!(result.remediation.is_some());
    }

    #[tokio::test]
    async fn test_buy_within_seeded_cash_passes() {
        let validator = validator(dec!(50000), dec!(1)).await;
        let result = validator
            .run(&request(OrderSide::Buy, "BTC", dec!(100)))
            .await
            .unwrap();

        assert!(result.valid);
        assert!(!result.requires_auto_sell);
        assert_eq!(result.available_usd, Some(dec!(10000)));
    }

    #[tokio::test]
    async fn test_buy_beyond_cash_proposes_auto_sell() {
        // Seed ledger: $10,000 USD + 0.5 BTC + 5 ETH at $50,000 each proxy price
        let validator = validator(dec!(50000), dec!(1)).await;
        let result = validator
            .run(&request(OrderSide::Buy, "SOL", dec!(12000)))
            .await
            .unwrap();

        assert!(result.valid);
        assert!(result.requires_auto_sell);
        let proposal = result.auto_sell_proposal.unwrap();
        assert_ne!(proposal.sell_base_symbol, "SOL");
        assert!(proposal.sell_amount_usd > dec!(2000));
    }

    #[tokio::test]
    async fn test_sell_more_than_held_is_rejected() {
        let validator = validator(dec!(100), dec!(1)).await;
        let result = validator
            .run(&request(OrderSide::Sell, "BTC", dec!(1000000)))
            .await
            .unwrap();

        assert!(!result.valid);
        assert_eq!(result.reason_code, Some(PreflightRejectReason::InsufficientBalance));
        assert_eq!(result.available_balance, Some(dec!(0.5)));
    }

    #[tokio::test]
    async fn test_auto_asset_skips_balance_check() {
        let validator = validator(dec!(100), dec!(1)).await;
        let result = validator
            .run(&request(OrderSide::Sell, "AUTO", dec!(10)))
            .await
            .unwrap();
        assert!(result.valid);
    }
}
