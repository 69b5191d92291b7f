use super::{env_bool, env_decimal, env_list};
use crate::domain::types::ExecutionMode;
use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

/// Trading behavior switches and limits.
#[derive(Debug, Clone)]
pub struct TradingEnvConfig {
    pub execution_mode_default: ExecutionMode,
    pub enable_live_trading: bool,
    /// Global kill switch: blocks CONFIRM on LIVE proposals outright.
    pub trading_disable_live: bool,
    pub force_paper_mode: bool,
    pub max_notional_per_order_usd: Decimal,
    pub symbol_allowlist: Vec<String>,
    pub stock_watchlist: Vec<String>,
}

impl TradingEnvConfig {
    pub fn from_env() -> Result<Self> {
        let mode_str = env::var("EXECUTION_MODE_DEFAULT").unwrap_or_else(|_| "PAPER".to_string());
        let execution_mode_default = ExecutionMode::from_str(&mode_str)?;

        let mut stock_watchlist = env_list("STOCK_WATCHLIST");
        if stock_watchlist.is_empty() {
            stock_watchlist = ["AAPL", "MSFT", "NVDA", "TSLA", "SPY"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        Ok(Self {
            execution_mode_default,
            enable_live_trading: env_bool("ENABLE_LIVE_TRADING", false),
            trading_disable_live: env_bool("TRADING_DISABLE_LIVE", false),
            force_paper_mode: env_bool("FORCE_PAPER_MODE", false),
            max_notional_per_order_usd: env_decimal("MAX_NOTIONAL_PER_ORDER_USD", "1000")?,
            symbol_allowlist: env_list("SYMBOL_ALLOWLIST"),
            stock_watchlist,
        })
    }
}
