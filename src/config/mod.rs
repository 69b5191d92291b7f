//! Configuration module for Execdesk.
//!
//! Structured configuration loading from environment variables, organized
//! by domain: Broker, Trading, Server, and Notifications.

mod broker_config;
mod server_config;
mod trading_config;

pub use broker_config::{BrokerEnvConfig, CoinbaseConfig, OpenAiConfig, PolygonConfig, PushoverConfig};
pub use server_config::ServerEnvConfig;
pub use trading_config::TradingEnvConfig;

use crate::domain::types::ExecutionMode;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Main application configuration.
///
/// Aggregates all configuration from sub-modules and provides flat field
/// access for the rest of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // Trading
    pub execution_mode_default: ExecutionMode,
    pub enable_live_trading: bool,
    pub trading_disable_live: bool,
    pub force_paper_mode: bool,
    pub max_notional_per_order_usd: Decimal,
    pub symbol_allowlist: Vec<String>,
    pub stock_watchlist: Vec<String>,

    // Broker
    pub coinbase_api_key_name: String,
    pub coinbase_api_private_key: String,
    pub coinbase_base_url: String,
    pub coinbase_public_url: String,
    pub polygon_api_key: String,
    pub polygon_base_url: String,

    // Notifications
    pub pushover_token: String,
    pub pushover_user_key: String,
    pub pushover_enabled: bool,

    // Optional LLM explanation layer
    pub openai_api_key: String,
    pub openai_model: String,

    // Server
    pub bind_address: String,
    pub database_url: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let trading = TradingEnvConfig::from_env().context("Failed to load trading config")?;
        let broker = BrokerEnvConfig::from_env();
        let server = ServerEnvConfig::from_env();

        Ok(Self {
            execution_mode_default: trading.execution_mode_default,
            enable_live_trading: trading.enable_live_trading,
            trading_disable_live: trading.trading_disable_live,
            force_paper_mode: trading.force_paper_mode,
            max_notional_per_order_usd: trading.max_notional_per_order_usd,
            symbol_allowlist: trading.symbol_allowlist,
            stock_watchlist: trading.stock_watchlist,

            coinbase_api_key_name: broker.coinbase.api_key_name,
            coinbase_api_private_key: broker.coinbase.api_private_key,
            coinbase_base_url: broker.coinbase.base_url,
            coinbase_public_url: broker.coinbase.public_url,
            polygon_api_key: broker.polygon.api_key,
            polygon_base_url: broker.polygon.base_url,

            pushover_token: broker.pushover.token,
            pushover_user_key: broker.pushover.user_key,
            pushover_enabled: broker.pushover.enabled,

            openai_api_key: broker.openai.api_key,
            openai_model: broker.openai.model,

            bind_address: server.bind_address,
            database_url: server.database_url,
        })
    }

    /// Whether LIVE Coinbase credentials are present.
    pub fn has_live_credentials(&self) -> bool {
        !self.coinbase_api_key_name.is_empty() && !self.coinbase_api_private_key.is_empty()
    }

    /// Resolve the execution mode a new run should use: the configured
    /// default, downgraded to PAPER when credentials are missing or paper
    /// mode is forced.
    pub fn resolve_execution_mode(&self) -> ExecutionMode {
        if self.force_paper_mode {
            return ExecutionMode::Paper;
        }
        match self.execution_mode_default {
            ExecutionMode::Live if self.has_live_credentials() => ExecutionMode::Live,
            _ => ExecutionMode::Paper,
        }
    }
}

pub(crate) fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

pub(crate) fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(&raw).with_context(|| format!("Invalid decimal in {}: {}", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env_defaults() {
        let config = Config::from_env().expect("Should parse with defaults");
        assert_eq!(config.execution_mode_default, ExecutionMode::Paper);
        assert_eq!(config.max_notional_per_order_usd.to_string(), "1000");
        assert!(!config.stock_watchlist.is_empty());
    }

    #[test]
    fn test_resolve_mode_without_credentials_is_paper() {
        let mut config = Config::from_env().unwrap();
        config.execution_mode_default = ExecutionMode::Live;
        config.coinbase_api_key_name = String::new();
        config.coinbase_api_private_key = String::new();
        config.force_paper_mode = false;
        assert_eq!(config.resolve_execution_mode(), ExecutionMode::Paper);
    }

    #[test]
    fn test_force_paper_mode_wins() {
        let mut config = Config::from_env().unwrap();
        config.execution_mode_default = ExecutionMode::Live;
        config.coinbase_api_key_name = "key".to_string();
        config.coinbase_api_private_key = "pem".to_string();
        config.force_paper_mode = true;
        assert_eq!(config.resolve_execution_mode(), ExecutionMode::Paper);
    }
}
