//! Paper trading execution provider.
//!
//! Fills simulated orders at the live market price against a ledger kept in
//! `portfolio_snapshots`. A tenant with no snapshot starts from the
//! deterministic seed: $10,000 USD, 0.5 BTC, 5 ETH.

use crate::domain::ids::new_id;
use crate::domain::ports::{ExecutionProvider, MarketDataProvider, OrderAck, OrderRequest};
use crate::domain::symbols::{to_base, to_product_id};
use crate::domain::types::{Fill, OrderSide};
use crate::infrastructure::persistence::Database;
use crate::infrastructure::persistence::repositories::orders::OrdersRepo;
use crate::infrastructure::persistence::repositories::portfolio::PortfolioRepo;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

// Fee estimate shared with preflight: 0.6% taker fee on market orders.
pub const PAPER_FEE_RATE: Decimal = dec!(0.006);

pub struct PaperExecution {
    portfolio: PortfolioRepo,
    orders: OrdersRepo,
    market_data: Arc<dyn MarketDataProvider>,
}

impl PaperExecution {
    pub fn new(database: Database, market_data: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            portfolio: PortfolioRepo::new(database.clone()),
            orders: OrdersRepo::new(database),
            market_data,
        }
    }

    /// Deterministic seed ledger for tenants with no prior snapshot.
    pub fn seed_balances() -> HashMap<String, Decimal> {
        let mut balances = HashMap::new();
        balances.insert("USD".to_string(), dec!(10000));
        balances.insert("BTC".to_string(), dec!(0.5));
        balances.insert("ETH".to_string(), dec!(5));
        balances
    }

    async fn load_ledger(
        &self,
        tenant_id: &str,
    ) -> Result<(HashMap<String, Decimal>, HashMap<String, Decimal>)> {
        match self.portfolio.latest_snapshot(tenant_id).await? {
            Some(snapshot) => Ok((snapshot.balances, snapshot.positions)),
            None => {
                let seed = Self::seed_balances();
                let positions: HashMap<String, Decimal> = seed
                    .iter()
                    .filter(|(k, _)| k.as_str() != "USD")
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                Ok((seed, positions))
            }
        }
    }

    async fn ledger_total_value(
        &self,
        balances: &HashMap<String, Decimal>,
        positions: &HashMap<String, Decimal>,
    ) -> Decimal {
        let mut total = balances.get("USD").copied().unwrap_or(Decimal::ZERO);
        for (symbol, qty) in positions {
            if let Ok(price) = self.market_data.get_price(&to_product_id(symbol)).await {
                total += *qty * price;
            }
        }
        total
    }
}

#[async_trait]
impl ExecutionProvider for PaperExecution {
    fn name(&self) -> &'static str {
        "paper_provider"
    }

    async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let price = self
            .market_data
            .get_price(&request.product_id)
            .await
            .context("Paper fill needs a live price")?;
        if price <= Decimal::ZERO {
            bail!("Paper fill price for {} is not positive", request.product_id);
        }

        let fees = request.notional_usd * PAPER_FEE_RATE;
        let qty = (request.notional_usd - fees) / price;
        let base = to_base(&request.product_id);

        // The ledger mutation is derived from the ack we return; a FILLED
        // ack always carries positive qty and price.
        let tenant_id = "t_default";
        let (mut balances, mut positions) = self.load_ledger(tenant_id).await?;
        let usd = balances.get("USD").copied().unwrap_or(Decimal::ZERO);

        match request.side {
            OrderSide::Buy => {
                if usd < request.notional_usd {
                    bail!(
                        "Paper ledger has ${} USD, order needs ${}",
                        usd,
                        request.notional_usd
                    );
                }
                balances.insert("USD".to_string(), usd - request.notional_usd);
                let held = positions.get(&base).copied().unwrap_or(Decimal::ZERO);
                positions.insert(base.clone(), held + qty);
                balances.insert(base.clone(), held + qty);
            }
            OrderSide::Sell => {
                let held = positions.get(&base).copied().unwrap_or(Decimal::ZERO);
                if held < qty {
                    bail!("Paper ledger holds {} {}, order needs {}", held, base, qty);
                }
                balances.insert("USD".to_string(), usd + request.notional_usd - fees);
                positions.insert(base.clone(), held - qty);
                balances.insert(base.clone(), held - qty);
            }
        }

        let total_value = self.ledger_total_value(&balances, &positions).await;
        self.portfolio
            .save_snapshot(None, tenant_id, &balances, &positions, total_value)
            .await?;

        info!(
            "PaperExecution: Filled {} {} ${} at {} (qty {})",
            request.side, request.product_id, request.notional_usd, price, qty
        );

        Ok(OrderAck {
            broker_order_id: new_id("paper_"),
            status: "FILLED".to_string(),
            filled_qty: Some(qty),
            avg_fill_price: Some(price),
            fees: Some(fees),
        })
    }

    async fn get_balances(&self, tenant_id: &str) -> Result<HashMap<String, Decimal>> {
        let (balances, _) = self.load_ledger(tenant_id).await?;
        Ok(balances)
    }

    async fn get_fills(&self, broker_order_id: &str) -> Result<Vec<Fill>> {
        // Paper fills are synchronous; the ack already carried the fill.
        let _ = broker_order_id;
        Ok(Vec::new())
    }

    async fn get_recent_orders(
        &self,
        tenant_id: &str,
        _window_days: u32,
    ) -> Result<Vec<serde_json::Value>> {
        let orders = self.orders.list_recent_for_tenant(tenant_id, 200).await?;
        Ok(orders
            .into_iter()
            .map(|o| {
                serde_json::json!({
                    "order_id": o.order_id,
                    "product_id": o.symbol,
                    "side": o.side.to_string(),
                    "filled_value": o.notional_usd.to_string(),
                    "status": o.status,
                    "created_time": o.created_at.to_rfc3339(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::MarketDataError;
    use crate::domain::types::{Candle, Granularity, Product};
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    struct FixedPrice(Decimal);

    #[async_trait]
    impl MarketDataProvider for FixedPrice {
        fn name(&self) -> &'static str {
            "fixed_price"
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
            Ok(self.0)
        }

        async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError> {
            Ok(Product {
                product_id: product_id.to_string(),
                base_currency: to_base(product_id),
                quote_currency: "USD".to_string(),
                status: "online".to_string(),
                volume_24h: 0.0,
                min_market_funds: None,
            })
        }
    }

    #[tokio::test]
    async fn test_paper_buy_fills_with_positive_qty_and_price() {
        let db = Database::in_memory().await.unwrap();
        let paper = PaperExecution::new(db, Arc::new(FixedPrice(dec!(50000))));

        let ack = paper
            .place_market_order(&OrderRequest {
                client_order_id: "cli_1".to_string(),
                product_id: "BTC-USD".to_string(),
                side: OrderSide::Buy,
                notional_usd: dec!(10),
            })
            .await
            .unwrap();

        assert_eq!(ack.status, "FILLED");
        assert!(ack.filled_qty.unwrap() > dec!(0));
        assert!(ack.avg_fill_price.unwrap() > dec!(0));
    }

    #[tokio::test]
    async fn test_paper_buy_debits_cash() {
        let db = Database::in_memory().await.unwrap();
        let paper = PaperExecution::new(db, Arc::new(FixedPrice(dec!(50000))));

        paper
            .place_market_order(&OrderRequest {
                client_order_id: "cli_1".to_string(),
                product_id: "BTC-USD".to_string(),
                side: OrderSide::Buy,
                notional_usd: dec!(100),
            })
            .await
            .unwrap();

        let balances = paper.get_balances("t_default").await.unwrap();
        assert_eq!(balances.get("USD"), Some(&dec!(9900)));
        assert!(balances.get("BTC").copied().unwrap_or_default() > dec!(0.5));
    }

    #[tokio::test]
    async fn test_paper_sell_more_than_held_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let paper = PaperExecution::new(db, Arc::new(FixedPrice(dec!(100))));

        let result = paper
            .place_market_order(&OrderRequest {
                client_order_id: "cli_1".to_string(),
                product_id: "SOL-USD".to_string(),
                side: OrderSide::Sell,
                notional_usd: dec!(10000),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_seed_ledger_is_deterministic() {
        let seed = PaperExecution::seed_balances();
        assert_eq!(seed.get("USD"), Some(&dec!(10000)));
        assert_eq!(seed.get("BTC"), Some(&dec!(0.5)));
        assert_eq!(seed.get("ETH"), Some(&dec!(5)));
    }
}
