//! Polygon EOD stock data provider.
//!
//! Stocks only get end-of-day aggregates; the watchlist is small and the
//! free tier is heavily rate limited, so there is no product discovery.
//! Listings are synthesized from the configured watchlist.

use crate::domain::errors::MarketDataError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::symbols::to_base;
use crate::domain::types::{Candle, Granularity, Product};
use crate::infrastructure::api_stats::ApiCallStats;
use crate::infrastructure::http_client_factory::HttpClientFactory;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Arc;
use tracing::debug;

pub struct PolygonMarketData {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    watchlist: Vec<String>,
    stats: Arc<ApiCallStats>,
}

impl PolygonMarketData {
    pub fn new(
        base_url: String,
        api_key: String,
        watchlist: Vec<String>,
        stats: Arc<ApiCallStats>,
    ) -> Self {
        Self {
            client: HttpClientFactory::create_plain_client(10),
            base_url,
            api_key,
            watchlist,
            stats,
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, MarketDataError> {
        self.stats.record_call();
        let response = self.client.get(url).send().await.map_err(|e| {
            self.stats.record_failure();
            if e.is_timeout() {
                MarketDataError::Timeout { retries: 0 }
            } else {
                MarketDataError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 429 {
            self.stats.record_429();
            self.stats.record_failure();
            return Err(MarketDataError::RateLimited { retries: 0 });
        }
        if status >= 400 {
            self.stats.record_failure();
            return Err(MarketDataError::Api {
                status,
                message: response.text().await.unwrap_or_default(),
            });
        }

        self.stats.record_success();
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| MarketDataError::InvalidResponse(format!("JSON parse failed: {}", e)))
    }
}

#[async_trait]
impl MarketDataProvider for PolygonMarketData {
    fn name(&self) -> &'static str {
        "polygon_market_data"
    }

    async fn list_products(&self, quote: &str) -> Result<Vec<Product>, MarketDataError> {
        // The stock universe is the configured watchlist, not an exchange
        // listing. All entries are treated as online USD products.
        Ok(self
            .watchlist
            .iter()
            .map(|ticker| Product {
                product_id: format!("{}-{}", ticker, quote.to_uppercase()),
                base_currency: ticker.clone(),
                quote_currency: quote.to_uppercase(),
                status: "online".to_string(),
                volume_24h: 0.0,
                min_market_funds: Some(Decimal::ONE),
            })
            .collect())
    }

    async fn get_candles(
        &self,
        product_id: &str,
        _granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let ticker = to_base(product_id);
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/1/day/{}/{}?adjusted=true&sort=asc&apiKey={}",
            self.base_url,
            ticker,
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            self.api_key
        );

        let data = self.get_json(&url).await?;
        let candles: Vec<Candle> = data
            .get("results")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let ts_ms = row.get("t")?.as_i64()?;
                        let start = Utc.timestamp_millis_opt(ts_ms).single()?;
                        Some(Candle {
                            start,
                            end: start + chrono::Duration::days(1),
                            open: Decimal::from_f64(row.get("o")?.as_f64()?)?,
                            high: Decimal::from_f64(row.get("h")?.as_f64()?)?,
                            low: Decimal::from_f64(row.get("l")?.as_f64()?)?,
                            close: Decimal::from_f64(row.get("c")?.as_f64()?)?,
                            volume: row
                                .get("v")
                                .and_then(|v| v.as_f64())
                                .and_then(Decimal::from_f64)
                                .unwrap_or(Decimal::ZERO),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            "PolygonMarketData: Fetched {} EOD bars for {}",
            candles.len(),
            ticker
        );
        Ok(candles)
    }

    async fn get_price(&self, product_id: &str) -> Result<Decimal, MarketDataError> {
        let ticker = to_base(product_id);
        let url = format!(
            "{}/v2/aggs/ticker/{}/prev?adjusted=true&apiKey={}",
            self.base_url, ticker, self.api_key
        );
        let data = self.get_json(&url).await?;
        data.pointer("/results/0/c")
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64)
            .ok_or_else(|| {
                MarketDataError::InvalidResponse(format!("No previous close for {}", ticker))
            })
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError> {
        let base = to_base(product_id);
        if self.watchlist.iter().any(|t| t == &base) {
            Ok(Product {
                product_id: product_id.to_string(),
                base_currency: base,
                quote_currency: "USD".to_string(),
                status: "online".to_string(),
                volume_24h: 0.0,
                min_market_funds: Some(Decimal::ONE),
            })
        } else {
            Err(MarketDataError::Api {
                status: 404,
                message: format!("{} not in stock watchlist", base),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::api_stats::ApiCallStats;

    fn provider() -> PolygonMarketData {
        PolygonMarketData::new(
            "https://api.polygon.test".to_string(),
            "test-key".to_string(),
            vec!["AAPL".to_string(), "MSFT".to_string()],
            Arc::new(ApiCallStats::new()),
        )
    }

    #[tokio::test]
    async fn test_list_products_from_watchlist() {
        let products = provider().list_products("USD").await.unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].product_id, "AAPL-USD");
        assert!(products.iter().all(|p| p.is_online()));
    }

    #[tokio::test]
    async fn test_get_product_rejects_unknown_ticker() {
        let err = provider().get_product("TSLA-USD").await.unwrap_err();
        match err {
            MarketDataError::Api { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
