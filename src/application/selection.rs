//! Asset selection engine for natural-language screening.
//!
//! Ranks a candidate universe over a lookback window and applies the
//! two-level tradability gate before anything is offered for confirmation.
//! Refusals are deterministic: when no candidate has data or none is
//! tradeable, the caller gets a typed error and the user gets REJECTED.
//! There is no fallback to a default asset.

use crate::domain::errors::{MarketDataError, SelectionError};
use crate::domain::ports::MarketDataProvider;
use crate::domain::types::{AssetClass, Granularity, Product, compute_return_pct};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Major crypto assets (top by market cap).
const MAJOR_CRYPTOS: &[&str] = &[
    "BTC", "ETH", "SOL", "XRP", "DOGE", "ADA", "AVAX", "DOT", "LINK", "MATIC", "ATOM", "LTC",
    "UNI", "BCH",
];

/// Stablecoins are never selection candidates.
const STABLECOINS: &[&str] = &[
    "USDC", "USDT", "DAI", "BUSD", "TUSD", "USDP", "GUSD", "FRAX", "USDD", "PYUSD",
];

const MAX_CONCURRENT_FETCHES: usize = 10;
const TOP_BY_VOLUME: usize = 25;

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub criteria: String,
    pub lookback_hours: f64,
    pub universe_constraint: String,
    pub threshold_pct: Option<f64>,
    pub asset_class: AssetClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub selected_symbol: String,
    pub selected_product_id: String,
    pub selected_return_pct: f64,
    pub top_candidates: Vec<CandidateSummary>,
    pub universe_description: String,
    pub window_description: String,
    pub why_explanation: String,
    pub lookback_hours: f64,
    pub universe_size: usize,
    pub evaluated_count: usize,
    pub data_coverage_pct: f64,
    pub ranking_confidence: f64,
    pub exclusions_count: usize,
    pub exclusion_reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub symbol: String,
    pub product_id: String,
    pub return_pct: f64,
    pub first_price: f64,
    pub last_price: f64,
}

#[derive(Debug, Clone)]
struct CandidateMetrics {
    symbol: String,
    product_id: String,
    return_pct: f64,
    first_price: f64,
    last_price: f64,
}

/// Convert hours to a human-readable window description.
pub fn humanize_window(hours: f64) -> String {
    if hours < 1.0 {
        let minutes = (hours * 60.0).round() as i64;
        format!("last {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else if hours == 1.0 {
        "last hour".to_string()
    } else if hours < 24.0 {
        let h = hours as i64;
        format!("last {} hour{}", h, if h == 1 { "" } else { "s" })
    } else if hours == 24.0 {
        "last 24 hours".to_string()
    } else if hours < 168.0 {
        let days = (hours / 24.0) as i64;
        format!("last {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours == 168.0 {
        "last week".to_string()
    } else {
        let weeks = (hours / 168.0) as i64;
        format!("last {} week{}", weeks, if weeks == 1 { "" } else { "s" })
    }
}

fn is_falling_criteria(criteria: &str) -> bool {
    matches!(
        criteria,
        "lowest performing" | "worst return" | "falling" | "worst performing"
    )
}

pub struct AssetSelectionEngine {
    crypto_data: Arc<dyn MarketDataProvider>,
    stock_data: Arc<dyn MarketDataProvider>,
}

impl AssetSelectionEngine {
    pub fn new(
        crypto_data: Arc<dyn MarketDataProvider>,
        stock_data: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self {
            crypto_data,
            stock_data,
        }
    }

    fn provider_for(&self, asset_class: AssetClass) -> &Arc<dyn MarketDataProvider> {
        match asset_class {
            AssetClass::Stock => &self.stock_data,
            _ => &self.crypto_data,
        }
    }

    /// The authoritative tradability set: products listed with status
    /// online and a USD quote.
    pub async fn tradeable_product_ids(&self, asset_class: AssetClass) -> HashSet<String> {
        match self.provider_for(asset_class).list_products("USD").await {
            Ok(products) => products
                .into_iter()
                .filter(|p| p.is_online())
                .map(|p| p.product_id)
                .collect(),
            Err(e) => {
                warn!("Failed to fetch tradeable products: {}", e);
                HashSet::new()
            }
        }
    }

    /// Two-level tradability gate.
    ///
    /// Level 1 is the exchange listing (authoritative). Level 2 is a broker
    /// metadata probe; a 401 there means the metadata service has auth
    /// issues, not that the product is untradeable, so it does not block.
    pub async fn verify_product_tradeable(&self, product_id: &str, asset_class: AssetClass) -> bool {
        let tradeable = self.tradeable_product_ids(asset_class).await;
        if !tradeable.contains(product_id) {
            info!("TRADABILITY_FAIL: {} not in exchange product list", product_id);
            return false;
        }

        match self.provider_for(asset_class).get_product(product_id).await {
            Ok(_) => {
                info!("TRADABILITY_PASS: {} verified via broker metadata", product_id);
                true
            }
            Err(MarketDataError::Api { status: 401, .. }) => {
                info!(
                    "TRADABILITY_PASS_EXCHANGE_ONLY: {} listed on exchange (broker metadata 401, allowing)",
                    product_id
                );
                true
            }
            Err(MarketDataError::Api { status, message }) => {
                warn!(
                    "TRADABILITY_FAIL_L2: {} broker metadata error {}: {}",
                    product_id, status, message
                );
                false
            }
            Err(e) => {
                // Transient broker failure: trust the exchange listing
                warn!(
                    "TRADABILITY_PASS_EXCHANGE_ONLY: {} broker check error (allowing): {}",
                    product_id, e
                );
                true
            }
        }
    }

    pub async fn select_asset(
        &self,
        request: &SelectionRequest,
    ) -> Result<SelectionResult, SelectionError> {
        let provider = self.provider_for(request.asset_class).clone();
        let window_desc = humanize_window(request.lookback_hours);

        // 1. Candidate universe
        let products = provider
            .list_products("USD")
            .await
            .map_err(|e| SelectionError::Provider(anyhow::anyhow!(e)))?;
        let (universe, universe_desc) = build_universe(products, &request.universe_constraint);

        if universe.is_empty() {
            return Err(SelectionError::NoMarketData {
                window: window_desc,
                universe_size: 0,
                exclusions: 0,
            });
        }
        let universe_size = universe.len();

        // 2. Granularity from the window
        let granularity = Granularity::for_lookback_hours(request.lookback_hours);
        let end = Utc::now();
        let start = end - Duration::seconds((request.lookback_hours * 3600.0) as i64);

        // 3. Parallel candle fetches, bounded to protect rate limits
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES));
        let mut tasks = Vec::with_capacity(universe.len());
        for product in &universe {
            let provider = provider.clone();
            let semaphore = semaphore.clone();
            let product = product.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let candles = provider
                    .get_candles(&product.product_id, granularity, start, end)
                    .await;
                (product, candles)
            }));
        }

        let mut rankings: Vec<CandidateMetrics> = Vec::new();
        let mut exclusions_count = 0usize;
        let mut exclusion_reasons: Vec<String> = Vec::new();

        for task in futures::future::join_all(tasks).await {
            let Ok((product, candles)) = task else {
                exclusions_count += 1;
                exclusion_reasons.push("task_panicked".to_string());
                continue;
            };
            let candles = match candles {
                Ok(candles) => candles,
                Err(e) => {
                    exclusions_count += 1;
                    exclusion_reasons.push(format!("fetch_error: {}", e.drop_reason()));
                    continue;
                }
            };
            if candles.len() < 2 {
                exclusions_count += 1;
                exclusion_reasons.push("insufficient_candles".to_string());
                continue;
            }
            // Zero aggregate volume marks synthetic/illiquid tokens
            let avg_volume: f64 =
                candles.iter().map(|c| c.volume_f64()).sum::<f64>() / candles.len() as f64;
            if avg_volume <= 0.0 {
                exclusions_count += 1;
                exclusion_reasons.push("zero_volume".to_string());
                continue;
            }

            let return_pct = compute_return_pct(&candles);

            // 4. Threshold filter ("up 20%")
            if let Some(threshold) = request.threshold_pct {
                let falling = is_falling_criteria(&request.criteria);
                if (!falling && return_pct < threshold) || (falling && return_pct > -threshold) {
                    exclusions_count += 1;
                    exclusion_reasons.push("below_threshold".to_string());
                    continue;
                }
            }

            rankings.push(CandidateMetrics {
                symbol: product.base_currency.clone(),
                product_id: product.product_id.clone(),
                return_pct,
                first_price: candles[0].open_f64(),
                last_price: candles[candles.len() - 1].close_f64(),
            });
        }

        let data_coverage_pct = (rankings.len() as f64 / universe_size as f64) * 100.0;

        if rankings.is_empty() {
            warn!(
                "No valid rankings after fetching candles for {} products",
                universe_size
            );
            return Err(SelectionError::NoMarketData {
                window: window_desc,
                universe_size,
                exclusions: exclusions_count,
            });
        }

        // 5. Sort by return
        if is_falling_criteria(&request.criteria) {
            rankings.sort_by(|a, b| a.return_pct.partial_cmp(&b.return_pct).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            rankings.sort_by(|a, b| b.return_pct.partial_cmp(&a.return_pct).unwrap_or(std::cmp::Ordering::Equal));
        }

        // 6. Tradability gate, top-down. First candidate passing both
        //    levels is the selection.
        let mut selected: Option<CandidateMetrics> = None;
        let mut skipped_non_tradeable: Vec<String> = Vec::new();
        for candidate in &rankings {
            if self
                .verify_product_tradeable(&candidate.product_id, request.asset_class)
                .await
            {
                selected = Some(candidate.clone());
                break;
            }
            warn!(
                "TRADABILITY_SKIP: {} ({}) failed tradability check, trying next",
                candidate.symbol, candidate.product_id
            );
            skipped_non_tradeable.push(candidate.symbol.clone());
        }

        let Some(selected) = selected else {
            return Err(SelectionError::NoTradeableAsset {
                evaluated: rankings.len(),
                skipped: skipped_non_tradeable
                    .iter()
                    .take(5)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        };

        if !skipped_non_tradeable.is_empty() {
            info!(
                "TRADABILITY_FALLBACK: Skipped {} non-tradeable assets, selected {} instead",
                skipped_non_tradeable.len(),
                selected.symbol
            );
        }

        // Ranking confidence: gap between the selection and the next
        // candidate, normalized with a 10% cap.
        let ranking_confidence = rankings
            .iter()
            .find(|r| r.product_id != selected.product_id)
            .map(|runner_up| ((selected.return_pct - runner_up.return_pct).abs() / 10.0).min(1.0))
            .unwrap_or(1.0);

        let direction = if selected.return_pct >= 0.0 { "up" } else { "down" };
        let mut why_explanation = format!(
            "{} was selected as the top performer from {} assets in the {}. It returned {:.2}% ({}), moving from ${:.4} to ${:.4}.",
            selected.symbol,
            rankings.len(),
            window_desc,
            selected.return_pct.abs(),
            direction,
            selected.first_price,
            selected.last_price,
        );
        if rankings.len() >= 2 {
            let runner_up = &rankings[1];
            why_explanation.push_str(&format!(
                " Runner-up: {} at {:+.2}%.",
                runner_up.symbol, runner_up.return_pct
            ));
        }

        let top_candidates = rankings
            .iter()
            .take(3)
            .map(|r| CandidateSummary {
                symbol: r.symbol.clone(),
                product_id: r.product_id.clone(),
                return_pct: (r.return_pct * 100.0).round() / 100.0,
                first_price: r.first_price,
                last_price: r.last_price,
            })
            .collect();

        exclusion_reasons.truncate(5);

        Ok(SelectionResult {
            selected_symbol: selected.symbol.clone(),
            selected_product_id: selected.product_id.clone(),
            selected_return_pct: (selected.return_pct * 100.0).round() / 100.0,
            top_candidates,
            universe_description: universe_desc,
            window_description: window_desc,
            why_explanation,
            lookback_hours: request.lookback_hours,
            universe_size,
            evaluated_count: rankings.len(),
            data_coverage_pct: (data_coverage_pct * 10.0).round() / 10.0,
            ranking_confidence: (ranking_confidence * 100.0).round() / 100.0,
            exclusions_count,
            exclusion_reasons,
        })
    }
}

fn build_universe(products: Vec<Product>, constraint: &str) -> (Vec<Product>, String) {
    let online: Vec<Product> = products.into_iter().filter(|p| p.is_online()).collect();

    match constraint {
        "majors_only" => (
            online
                .into_iter()
                .filter(|p| MAJOR_CRYPTOS.contains(&p.base_currency.to_uppercase().as_str()))
                .collect(),
            "major cryptocurrencies".to_string(),
        ),
        "exclude_stablecoins" => (
            online
                .into_iter()
                .filter(|p| !STABLECOINS.contains(&p.base_currency.to_uppercase().as_str()))
                .collect(),
            "cryptocurrencies (excluding stablecoins)".to_string(),
        ),
        _ => {
            let mut filtered: Vec<Product> = online
                .into_iter()
                .filter(|p| {
                    !p.base_currency.is_empty()
                        && !STABLECOINS.contains(&p.base_currency.to_uppercase().as_str())
                })
                .collect();
            // Sort by 24h volume descending to surface liquid majors and
            // push obscure low-liquidity tokens off the end.
            filtered.sort_by(|a, b| {
                b.volume_24h
                    .partial_cmp(&a.volume_24h)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            filtered.truncate(TOP_BY_VOLUME);
            (filtered, "top 25 cryptocurrencies by 24h volume".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Candle;
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;
    use std::collections::HashMap;

    struct StubProvider {
        products: Vec<Product>,
        // product_id -> (first_open, last_close, volume)
        series: HashMap<String, (f64, f64, f64)>,
        metadata_failures: HashMap<String, u16>,
    }

    impl StubProvider {
        fn product(id: &str, base: &str, volume: f64) -> Product {
            Product {
                product_id: id.to_string(),
                base_currency: base.to_string(),
                quote_currency: "USD".to_string(),
                status: "online".to_string(),
                volume_24h: volume,
                min_market_funds: Some(Decimal::ONE),
            }
        }
    }

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn list_products(&self, _quote: &str) -> Result<Vec<Product>, MarketDataError> {
            Ok(self.products.clone())
        }

        async fn get_candles(
            &self,
            product_id: &str,
            _granularity: Granularity,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, MarketDataError> {
            let Some((open, close, volume)) = self.series.get(product_id) else {
                return Ok(Vec::new());
            };
            let mid = start + (end - start) / 2;
            let mk = |s: DateTime<Utc>, o: f64, c: f64| Candle {
                start: s,
                end: s,
                open: Decimal::from_f64(o).unwrap(),
                high: Decimal::from_f64(o.max(c)).unwrap(),
                low: Decimal::from_f64(o.min(c)).unwrap(),
                close: Decimal::from_f64(c).unwrap(),
                volume: Decimal::from_f64(*volume).unwrap(),
            };
            Ok(vec![mk(start, *open, *open), mk(mid, *open, *close)])
        }

        async fn get_price(&self, _product_id: &str) -> Result<Decimal, MarketDataError> {
            Ok(Decimal::ONE)
        }

        async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError> {
            if let Some(status) = self.metadata_failures.get(product_id) {
                return Err(MarketDataError::Api {
                    status: *status,
                    message: "stub failure".to_string(),
                });
            }
            Ok(Self::product(product_id, &crate::domain::symbols::to_base(product_id), 0.0))
        }
    }

    fn engine(stub: StubProvider) -> AssetSelectionEngine {
        let provider: Arc<dyn MarketDataProvider> = Arc::new(stub);
        AssetSelectionEngine::new(provider.clone(), provider)
    }

    fn request() -> SelectionRequest {
        SelectionRequest {
            criteria: "highest performing".to_string(),
            lookback_hours: 24.0,
            universe_constraint: "top_25_volume".to_string(),
            threshold_pct: None,
            asset_class: AssetClass::Crypto,
        }
    }

    #[tokio::test]
    async fn test_selects_top_performer() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("BTC-USD", "BTC", 1000.0),
                StubProvider::product("ETH-USD", "ETH", 900.0),
                StubProvider::product("SOL-USD", "SOL", 800.0),
            ],
            series: HashMap::from([
                ("BTC-USD".to_string(), (100.0, 102.0, 10.0)),
                ("ETH-USD".to_string(), (100.0, 110.0, 10.0)),
                ("SOL-USD".to_string(), (100.0, 95.0, 10.0)),
            ]),
            metadata_failures: HashMap::new(),
        };

        let result = engine(stub).select_asset(&request()).await.unwrap();
        assert_eq!(result.selected_symbol, "ETH");
        assert_eq!(result.selected_product_id, "ETH-USD");
        assert!(result.selected_return_pct > 9.0);
        assert_eq!(result.evaluated_count, 3);
        assert_eq!(result.top_candidates[0].symbol, "ETH");
        assert!(result.why_explanation.contains("ETH"));
        assert!(result.why_explanation.contains("Runner-up"));
    }

    #[tokio::test]
    async fn test_stablecoins_are_excluded() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("USDT-USD", "USDT", 9999.0),
                StubProvider::product("BTC-USD", "BTC", 1000.0),
            ],
            series: HashMap::from([
                ("USDT-USD".to_string(), (1.0, 1.2, 10.0)),
                ("BTC-USD".to_string(), (100.0, 101.0, 10.0)),
            ]),
            metadata_failures: HashMap::new(),
        };

        let result = engine(stub).select_asset(&request()).await.unwrap();
        assert_eq!(result.selected_symbol, "BTC");
        assert_eq!(result.universe_size, 1);
    }

    #[tokio::test]
    async fn test_no_candle_data_is_typed_refusal() {
        let stub = StubProvider {
            products: vec![StubProvider::product("BTC-USD", "BTC", 1000.0)],
            series: HashMap::new(),
            metadata_failures: HashMap::new(),
        };

        let err = engine(stub).select_asset(&request()).await.unwrap_err();
        assert_eq!(err.reason_code(), "NO_MARKET_DATA");
    }

    #[tokio::test]
    async fn test_zero_volume_candidates_dropped() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("AAA-USD", "AAA", 500.0),
                StubProvider::product("BTC-USD", "BTC", 1000.0),
            ],
            series: HashMap::from([
                // AAA has the best return but zero volume (synthetic token)
                ("AAA-USD".to_string(), (1.0, 2.0, 0.0)),
                ("BTC-USD".to_string(), (100.0, 101.0, 10.0)),
            ]),
            metadata_failures: HashMap::new(),
        };

        let result = engine(stub).select_asset(&request()).await.unwrap();
        assert_eq!(result.selected_symbol, "BTC");
        assert!(result.exclusion_reasons.contains(&"zero_volume".to_string()));
    }

    #[tokio::test]
    async fn test_tradability_gate_walks_down_rankings() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("AAA-USD", "AAA", 500.0),
                StubProvider::product("BTC-USD", "BTC", 1000.0),
            ],
            series: HashMap::from([
                ("AAA-USD".to_string(), (1.0, 2.0, 10.0)),
                ("BTC-USD".to_string(), (100.0, 101.0, 10.0)),
            ]),
            // Broker metadata hard-fails for the top performer
            metadata_failures: HashMap::from([("AAA-USD".to_string(), 404u16)]),
        };

        let result = engine(stub).select_asset(&request()).await.unwrap();
        assert_eq!(result.selected_symbol, "BTC");
    }

    #[tokio::test]
    async fn test_metadata_401_is_non_blocking() {
        let stub = StubProvider {
            products: vec![StubProvider::product("AAA-USD", "AAA", 500.0)],
            series: HashMap::from([("AAA-USD".to_string(), (1.0, 2.0, 10.0))]),
            metadata_failures: HashMap::from([("AAA-USD".to_string(), 401u16)]),
        };

        let result = engine(stub).select_asset(&request()).await.unwrap();
        assert_eq!(result.selected_symbol, "AAA");
    }

    #[tokio::test]
    async fn test_all_candidates_untradeable_is_typed_refusal() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("AAA-USD", "AAA", 500.0),
                StubProvider::product("BBB-USD", "BBB", 400.0),
            ],
            series: HashMap::from([
                ("AAA-USD".to_string(), (1.0, 2.0, 10.0)),
                ("BBB-USD".to_string(), (1.0, 1.5, 10.0)),
            ]),
            metadata_failures: HashMap::from([
                ("AAA-USD".to_string(), 404u16),
                ("BBB-USD".to_string(), 404u16),
            ]),
        };

        let err = engine(stub).select_asset(&request()).await.unwrap_err();
        assert_eq!(err.reason_code(), "NO_TRADEABLE_TOP_PERFORMER");
        assert!(err.to_string().contains("AAA"));
    }

    #[tokio::test]
    async fn test_threshold_filter() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("BTC-USD", "BTC", 1000.0),
                StubProvider::product("ETH-USD", "ETH", 900.0),
            ],
            series: HashMap::from([
                ("BTC-USD".to_string(), (100.0, 105.0, 10.0)), // +5%
                ("ETH-USD".to_string(), (100.0, 130.0, 10.0)), // +30%
            ]),
            metadata_failures: HashMap::new(),
        };

        let mut req = request();
        req.threshold_pct = Some(20.0);
        let result = engine(stub).select_asset(&req).await.unwrap();
        assert_eq!(result.selected_symbol, "ETH");
        assert_eq!(result.evaluated_count, 1);
        assert!(result.exclusion_reasons.contains(&"below_threshold".to_string()));
    }

    #[tokio::test]
    async fn test_falling_criteria_sorts_ascending() {
        let stub = StubProvider {
            products: vec![
                StubProvider::product("BTC-USD", "BTC", 1000.0),
                StubProvider::product("ETH-USD", "ETH", 900.0),
            ],
            series: HashMap::from([
                ("BTC-USD".to_string(), (100.0, 105.0, 10.0)),
                ("ETH-USD".to_string(), (100.0, 80.0, 10.0)),
            ]),
            metadata_failures: HashMap::new(),
        };

        let mut req = request();
        req.criteria = "lowest performing".to_string();
        let result = engine(stub).select_asset(&req).await.unwrap();
        assert_eq!(result.selected_symbol, "ETH");
        assert!(result.selected_return_pct < 0.0);
    }

    #[test]
    fn test_humanize_window() {
        assert_eq!(humanize_window(0.167), "last 10 minutes");
        assert_eq!(humanize_window(1.0), "last hour");
        assert_eq!(humanize_window(6.0), "last 6 hours");
        assert_eq!(humanize_window(24.0), "last 24 hours");
        assert_eq!(humanize_window(72.0), "last 3 days");
        assert_eq!(humanize_window(168.0), "last week");
        assert_eq!(humanize_window(1176.0), "last 7 weeks");
    }
}
