//! Coinbase brokerage execution service: order placement, balances, fills.
//!
//! Requests are signed with HMAC-SHA256 access headers. Secrets never leave
//! this module; audit rows are written by the calling node through the
//! redacting tool-call log.

use crate::domain::ids::new_id;
use crate::domain::ports::{ExecutionProvider, OrderAck, OrderRequest};
use crate::domain::types::Fill;
use crate::infrastructure::http_client_factory::HttpClientFactory;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::collections::HashMap;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

pub struct CoinbaseExecution {
    client: reqwest::Client,
    base_url: String,
    api_key_name: String,
    api_private_key: String,
}

impl CoinbaseExecution {
    pub fn new(base_url: String, api_key_name: String, api_private_key: String) -> Self {
        Self {
            client: HttpClientFactory::create_plain_client(15),
            base_url,
            api_key_name,
            api_private_key,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        let payload = format!("{}{}{}{}", timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(self.api_private_key.as_bytes())
            .context("Invalid API private key")?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let timestamp = Utc::now().timestamp().to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body_str)?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .header("CB-ACCESS-KEY", &self.api_key_name)
            .header("CB-ACCESS-SIGN", signature)
            .header("CB-ACCESS-TIMESTAMP", timestamp)
            .header("Content-Type", "application/json");

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.context("Coinbase request failed")?;
        let status = response.status();
        let data: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse Coinbase response")?;

        if !status.is_success() {
            bail!("Coinbase API error ({}): {}", status.as_u16(), data);
        }
        Ok(data)
    }
}

fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    value
        .as_str()
        .and_then(|s| s.parse::<Decimal>().ok())
        .or_else(|| value.as_f64().and_then(rust_decimal::prelude::FromPrimitive::from_f64))
}

#[async_trait]
impl ExecutionProvider for CoinbaseExecution {
    fn name(&self) -> &'static str {
        "coinbase_provider"
    }

    async fn place_market_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let body = serde_json::json!({
            "client_order_id": request.client_order_id,
            "product_id": request.product_id,
            "side": request.side.to_string(),
            "order_configuration": {
                "market_market_ioc": { "quote_size": request.notional_usd.to_string() }
            }
        });

        let data = self
            .signed_request(reqwest::Method::POST, "/orders", Some(&body))
            .await?;

        let success = data
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !success {
            let reason = data
                .get("error_response")
                .map(|e| e.to_string())
                .unwrap_or_else(|| data.to_string());
            bail!("Order rejected: {}", reason);
        }

        let broker_order_id = data
            .pointer("/success_response/order_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        info!(
            "CoinbaseExecution: Order placed {} {} ${} -> {}",
            request.side, request.product_id, request.notional_usd, broker_order_id
        );

        Ok(OrderAck {
            broker_order_id,
            status: "SUBMITTED".to_string(),
            filled_qty: None,
            avg_fill_price: None,
            fees: None,
        })
    }

    async fn get_balances(&self, _tenant_id: &str) -> Result<HashMap<String, Decimal>> {
        let data = self
            .signed_request(reqwest::Method::GET, "/accounts", None)
            .await?;

        let mut balances = HashMap::new();
        if let Some(accounts) = data.get("accounts").and_then(|v| v.as_array()) {
            for account in accounts {
                let currency = account
                    .get("currency")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let available = account
                    .pointer("/available_balance/value")
                    .and_then(parse_decimal)
                    .unwrap_or(Decimal::ZERO);
                if !currency.is_empty() && available > Decimal::ZERO {
                    balances.insert(currency.to_string(), available);
                }
            }
        }
        Ok(balances)
    }

    async fn get_fills(&self, broker_order_id: &str) -> Result<Vec<Fill>> {
        let path = format!("/orders/historical/fills?order_id={}", broker_order_id);
        let data = self
            .signed_request(reqwest::Method::GET, &path, None)
            .await?;

        let fills = data
            .get("fills")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        Some(Fill {
                            fill_id: row
                                .get("entry_id")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| new_id("fill_")),
                            order_id: broker_order_id.to_string(),
                            run_id: String::new(),
                            symbol: row
                                .get("product_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            qty: row.get("size").and_then(parse_decimal)?,
                            price: row.get("price").and_then(parse_decimal)?,
                            fee: row
                                .get("commission")
                                .and_then(parse_decimal)
                                .unwrap_or(Decimal::ZERO),
                            ts: Utc::now(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(fills)
    }

    async fn get_recent_orders(
        &self,
        _tenant_id: &str,
        window_days: u32,
    ) -> Result<Vec<serde_json::Value>> {
        let start = (Utc::now() - chrono::Duration::days(window_days as i64)).to_rfc3339();
        let path = format!("/orders/historical/batch?start_date={}", start);
        let data = self
            .signed_request(reqwest::Method::GET, &path, None)
            .await?;

        Ok(data
            .get("orders")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let exec = CoinbaseExecution::new(
            "https://example.test".to_string(),
            "key".to_string(),
            "secret".to_string(),
        );
        let a = exec.sign("1700000000", "POST", "/orders", "{}").unwrap();
        let b = exec.sign("1700000000", "POST", "/orders", "{}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex-encoded SHA256

        // Different payloads must produce different signatures
        let c = exec.sign("1700000001", "POST", "/orders", "{}").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_decimal_variants() {
        assert_eq!(
            parse_decimal(&serde_json::json!("12.5")),
            Some(Decimal::new(125, 1))
        );
        assert!(parse_decimal(&serde_json::json!(12.5)).is_some());
        assert_eq!(parse_decimal(&serde_json::json!(null)), None);
    }
}
