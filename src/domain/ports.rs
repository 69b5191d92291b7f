use crate::domain::errors::MarketDataError;
use crate::domain::types::{Candle, Fill, Granularity, OrderSide, Product};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read-only market data: product listings, candles, prices.
///
/// Two implementations exist: the crypto exchange provider and the EOD
/// stock provider. Nodes record every call through the audit log.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider label recorded in the tool-call audit rows.
    fn name(&self) -> &'static str;

    /// List products for a quote currency, status included. Implementations
    /// cache this behind a short TTL.
    async fn list_products(&self, quote: &str) -> Result<Vec<Product>, MarketDataError>;

    async fn get_candles(
        &self,
        product_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError>;

    async fn get_price(&self, product_id: &str) -> Result<Decimal, MarketDataError>;

    /// Broker metadata probe for the second level of the tradability gate.
    /// Returns the product metadata, or an error carrying the HTTP status.
    async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub product_id: String,
    pub side: OrderSide,
    pub notional_usd: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub status: String,
    pub filled_qty: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub fees: Option<Decimal>,
}

/// Order placement and account state against the brokerage (or the paper
/// ledger).
#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Non-zero balances per asset symbol, USD cash included.
    async fn get_balances(&self, tenant_id: &str) -> Result<HashMap<String, Decimal>>;

    async fn get_fills(&self, broker_order_id: &str) -> Result<Vec<Fill>>;

    /// Recent order history for trade-behavior summaries.
    async fn get_recent_orders(&self, tenant_id: &str, window_days: u32) -> Result<Vec<serde_json::Value>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub action: String,
    pub title: String,
    pub message: String,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationStatus {
    Sent,
    Failed,
    Skipped,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Best-effort outbound push. Implementations must never return an error to
/// the caller; delivery outcomes are recorded for audit instead.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> NotificationStatus;
}
