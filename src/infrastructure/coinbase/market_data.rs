//! Coinbase market data service.
//!
//! Uses the public Exchange API for read-only market data (candles, prices,
//! product listings). Runs its own retry loop with exponential backoff and
//! jitter so that rate limits and transient server errors are absorbed
//! locally and counted in the API call statistics.

use crate::domain::errors::MarketDataError;
use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{Candle, Granularity, Product};
use crate::infrastructure::api_stats::ApiCallStats;
use crate::infrastructure::http_client_factory::{HttpClientFactory, build_url_with_query};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BASE_BACKOFF_SECONDS: f64 = 1.0;
const MAX_BACKOFF_SECONDS: f64 = 10.0;
// Retries are suppressed under test to keep the suite fast and deterministic.
#[cfg(not(test))]
const MAX_RETRIES: u32 = 3;
#[cfg(test)]
const MAX_RETRIES: u32 = 0;

/// Product list cache TTL per quote currency.
const PRODUCTS_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct CoinbaseMarketData {
    client: reqwest::Client,
    public_url: String,
    stats: Arc<ApiCallStats>,
    products_cache: Mutex<HashMap<String, (Vec<Product>, Instant)>>,
}

impl CoinbaseMarketData {
    pub fn builder() -> CoinbaseMarketDataBuilder {
        CoinbaseMarketDataBuilder::default()
    }

    pub fn stats(&self) -> Arc<ApiCallStats> {
        self.stats.clone()
    }

    /// GET with retry on 429 / 5xx / timeout. 4xx (except 429) is returned
    /// to the caller immediately.
    async fn get_with_retry(&self, url: &str) -> Result<serde_json::Value, MarketDataError> {
        let mut attempt: u32 = 0;
        loop {
            self.stats.record_call();
            let response = self.client.get(url).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 429 || status >= 500 {
                        if status == 429 {
                            self.stats.record_429();
                        }
                        if attempt < MAX_RETRIES {
                            let wait = backoff_with_jitter(attempt, status == 429);
                            warn!(
                                "Coinbase API {} for {}, retrying in {:.2}s (attempt {}/{})",
                                status,
                                url,
                                wait.as_secs_f64(),
                                attempt + 1,
                                MAX_RETRIES
                            );
                            self.stats.record_retry();
                            tokio::time::sleep(wait).await;
                            attempt += 1;
                            continue;
                        }
                        self.stats.record_failure();
                        return Err(if status == 429 {
                            MarketDataError::RateLimited { retries: attempt }
                        } else {
                            MarketDataError::Api {
                                status,
                                message: resp.text().await.unwrap_or_default(),
                            }
                        });
                    }
                    if !resp.status().is_success() {
                        self.stats.record_failure();
                        return Err(MarketDataError::Api {
                            status,
                            message: resp.text().await.unwrap_or_default(),
                        });
                    }
                    self.stats.record_success();
                    return resp.json::<serde_json::Value>().await.map_err(|e| {
                        MarketDataError::InvalidResponse(format!("JSON parse failed: {}", e))
                    });
                }
                Err(e) if e.is_timeout() => {
                    self.stats.record_timeout();
                    if attempt < MAX_RETRIES {
                        let wait = backoff_with_jitter(attempt, false);
                        warn!("Coinbase API timeout for {}, retrying in {:.2}s", url, wait.as_secs_f64());
                        self.stats.record_retry();
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    self.stats.record_failure();
                    return Err(MarketDataError::Timeout { retries: attempt });
                }
                Err(e) if e.is_connect() => {
                    if attempt < MAX_RETRIES {
                        let wait = backoff_with_jitter(attempt, false);
                        self.stats.record_retry();
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    self.stats.record_failure();
                    return Err(MarketDataError::Connection(e.to_string()));
                }
                Err(e) => {
                    self.stats.record_failure();
                    return Err(MarketDataError::Connection(e.to_string()));
                }
            }
        }
    }
}

fn backoff_with_jitter(attempt: u32, jitter: bool) -> Duration {
    let base = (BASE_BACKOFF_SECONDS * 2f64.powi(attempt as i32)).min(MAX_BACKOFF_SECONDS);
    let extra = if jitter {
        use rand::Rng;
        rand::rng().random_range(0.0..base * 0.3)
    } else {
        0.0
    };
    Duration::from_secs_f64(base + extra)
}

fn parse_product(value: &serde_json::Value) -> Option<Product> {
    let product_id = value.get("id")?.as_str()?.to_string();
    Some(Product {
        product_id,
        base_currency: value
            .get("base_currency")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        quote_currency: value
            .get("quote_currency")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        status: value
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        volume_24h: value
            .get("volume_24h")
            .and_then(parse_f64)
            .unwrap_or(0.0),
        min_market_funds: value
            .get("min_market_funds")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok()),
    })
}

fn parse_f64(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
}

/// Exchange API candle rows are `[time, low, high, open, close, volume]`,
/// newest first.
fn parse_candles(data: &serde_json::Value, granularity: Granularity) -> Vec<Candle> {
    let Some(rows) = data.as_array() else {
        return Vec::new();
    };

    let mut candles: Vec<Candle> = rows
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            if arr.len() < 5 {
                return None;
            }
            let ts = arr[0].as_i64()?;
            let start = Utc.timestamp_opt(ts, 0).single()?;
            let end = Utc.timestamp_opt(ts + granularity.seconds(), 0).single()?;
            Some(Candle {
                start,
                end,
                low: Decimal::from_f64(parse_f64(&arr[1])?)?,
                high: Decimal::from_f64(parse_f64(&arr[2])?)?,
                open: Decimal::from_f64(parse_f64(&arr[3])?)?,
                close: Decimal::from_f64(parse_f64(&arr[4])?)?,
                volume: arr
                    .get(5)
                    .and_then(parse_f64)
                    .and_then(Decimal::from_f64)
                    .unwrap_or(Decimal::ZERO),
            })
        })
        .collect();

    candles.sort_by_key(|c| c.start);
    candles
}

#[async_trait]
impl MarketDataProvider for CoinbaseMarketData {
    fn name(&self) -> &'static str {
        "coinbase_market_data"
    }

    async fn list_products(&self, quote: &str) -> Result<Vec<Product>, MarketDataError> {
        {
            let cache = self
                .products_cache
                .lock()
                .map_err(|e| MarketDataError::InvalidResponse(format!("cache lock poisoned: {}", e)))?;
            if let Some((products, cached_at)) = cache.get(quote)
                && cached_at.elapsed() < PRODUCTS_CACHE_TTL
            {
                self.stats.record_cache_hit();
                return Ok(products.clone());
            }
        }

        info!("CoinbaseMarketData: Fetching product list for quote={}", quote);
        let url = format!("{}/products", self.public_url);
        let data = self.get_with_retry(&url).await?;

        let products: Vec<Product> = data
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(parse_product)
                    .filter(|p| p.quote_currency.eq_ignore_ascii_case(quote))
                    .collect()
            })
            .unwrap_or_default();

        info!(
            "CoinbaseMarketData: Found {} {} products",
            products.len(),
            quote
        );

        {
            let mut cache = self
                .products_cache
                .lock()
                .map_err(|e| MarketDataError::InvalidResponse(format!("cache lock poisoned: {}", e)))?;
            cache.insert(quote.to_string(), (products.clone(), Instant::now()));
        }

        Ok(products)
    }

    async fn get_candles(
        &self,
        product_id: &str,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let base = format!("{}/products/{}/candles", self.public_url, product_id);
        let url = build_url_with_query(
            &base,
            &[
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("granularity", &granularity.seconds().to_string()),
            ],
        );
        let data = self.get_with_retry(&url).await?;
        let candles = parse_candles(&data, granularity);
        debug!(
            "CoinbaseMarketData: Fetched {} candles for {}",
            candles.len(),
            product_id
        );
        Ok(candles)
    }

    async fn get_price(&self, product_id: &str) -> Result<Decimal, MarketDataError> {
        let url = format!("{}/products/{}/ticker", self.public_url, product_id);
        let data = self.get_with_retry(&url).await?;
        data.get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .ok_or_else(|| {
                MarketDataError::InvalidResponse(format!("No price in ticker for {}", product_id))
            })
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError> {
        let url = format!("{}/products/{}", self.public_url, product_id);
        let data = self.get_with_retry(&url).await?;
        parse_product(&data).ok_or_else(|| {
            MarketDataError::InvalidResponse(format!("Malformed product response for {}", product_id))
        })
    }
}

#[derive(Default)]
pub struct CoinbaseMarketDataBuilder {
    public_url: Option<String>,
    stats: Option<Arc<ApiCallStats>>,
}

impl CoinbaseMarketDataBuilder {
    pub fn public_url(mut self, url: String) -> Self {
        self.public_url = Some(url);
        self
    }

    pub fn stats(mut self, stats: Arc<ApiCallStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> CoinbaseMarketData {
        CoinbaseMarketData {
            client: HttpClientFactory::create_plain_client(10),
            public_url: self
                .public_url
                .unwrap_or_else(|| "https://api.exchange.coinbase.com".to_string()),
            stats: self.stats.unwrap_or_default(),
            products_cache: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_candles_sorted_ascending() {
        // Exchange API returns newest first
        let data = json!([
            [1700003600, 99.0, 102.0, 100.0, 101.0, 12.5],
            [1700000000, 98.0, 101.0, 99.0, 100.0, 10.0]
        ]);
        let candles = parse_candles(&data, Granularity::OneHour);
        assert_eq!(candles.len(), 2);
        assert!(candles[0].start < candles[1].start);
        assert_eq!(candles[0].open, Decimal::from_f64(99.0).unwrap());
        assert_eq!(candles[1].close, Decimal::from_f64(101.0).unwrap());
        assert_eq!(
            (candles[0].end - candles[0].start).num_seconds(),
            Granularity::OneHour.seconds()
        );
    }

    #[test]
    fn test_parse_candles_skips_malformed_rows() {
        let data = json!([
            [1700000000, 98.0, 101.0, 99.0, 100.0, 10.0],
            [1700003600, 98.0],
            "garbage"
        ]);
        let candles = parse_candles(&data, Granularity::OneHour);
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn test_parse_product_with_string_fields() {
        let value = json!({
            "id": "BTC-USD",
            "base_currency": "BTC",
            "quote_currency": "USD",
            "status": "online",
            "volume_24h": "123456.78",
            "min_market_funds": "1"
        });
        let product = parse_product(&value).unwrap();
        assert_eq!(product.product_id, "BTC-USD");
        assert!(product.is_online());
        assert!((product.volume_24h - 123456.78).abs() < 1e-6);
        assert_eq!(product.min_market_funds, Some(Decimal::ONE));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let wait = backoff_with_jitter(10, false);
        assert!(wait.as_secs_f64() <= MAX_BACKOFF_SECONDS + 0.01);
    }
}
