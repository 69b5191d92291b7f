use thiserror::Error;
use rust_decimal::Decimal;

/// Reasons preflight can refuse to stage a trade. Every variant maps to a
/// structured rejection with a remediation string for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightRejectReason {
    MinNotionalTooLow,
    InsufficientBalance,
    InsufficientCash,
    ProductNotTradeable,
    NoLastPurchase,
    LiveDisabled,
}

impl PreflightRejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            PreflightRejectReason::MinNotionalTooLow => "MIN_NOTIONAL_TOO_LOW",
            PreflightRejectReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
            PreflightRejectReason::InsufficientCash => "INSUFFICIENT_CASH",
            PreflightRejectReason::ProductNotTradeable => "PRODUCT_NOT_TRADEABLE",
            PreflightRejectReason::NoLastPurchase => "NO_LAST_PURCHASE",
            PreflightRejectReason::LiveDisabled => "LIVE_DISABLED",
        }
    }
}

/// Deterministic refusals from the asset selection engine. These are not
/// transient errors; they surface to the user as REJECTED responses and
/// never fall back to a default asset.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(
        "Unable to compute top performer for the {window} (no candle data available for {universe_size} candidates). Exclusions: {exclusions}."
    )]
    NoMarketData {
        window: String,
        universe_size: usize,
        exclusions: usize,
    },

    #[error(
        "None of the top {evaluated} performers are tradeable. Skipped: {skipped}. Try a different timeframe or universe."
    )]
    NoTradeableAsset { evaluated: usize, skipped: String },

    #[error("Market data provider error: {0}")]
    Provider(#[from] anyhow::Error),
}

impl SelectionError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            SelectionError::NoMarketData { .. } => "NO_MARKET_DATA",
            SelectionError::NoTradeableAsset { .. } => "NO_TRADEABLE_TOP_PERFORMER",
            SelectionError::Provider(_) => "SELECTION_PROVIDER_ERROR",
        }
    }
}

/// Errors related to market data and connectivity. Retryable variants are
/// recovered locally by the providers; the rest propagate to the node,
/// which records a categorized drop.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("Rate limited (429) after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("Timeout after {retries} retries")]
    Timeout { retries: u32 },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl MarketDataError {
    /// Categorized drop reason used in research summaries and failure artifacts.
    pub fn drop_reason(&self) -> String {
        match self {
            MarketDataError::RateLimited { .. } => "rate_limited".to_string(),
            MarketDataError::Timeout { .. } => "timeout".to_string(),
            MarketDataError::Api { status, .. } => format!("api_error_{}", status),
            MarketDataError::Connection(_) => "api_error_connection".to_string(),
            MarketDataError::InvalidResponse(_) => "api_error_invalid_response".to_string(),
        }
    }
}

/// Errors related to trade execution against the brokerage.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Insufficient funds: need ${need}, available ${available}")]
    InsufficientFunds { need: Decimal, available: Decimal },

    #[error("Order rejected by broker: {reason}")]
    OrderRejected { reason: String },

    #[error("Tradability not verified for {product_id}; refusing LIVE order")]
    TradabilityUnverified { product_id: String },

    #[error("Kill switch enabled for tenant {tenant_id}; no new orders")]
    KillSwitch { tenant_id: String },
}

/// Errors surfaced by the command dispatcher with an HTTP mapping.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("A trade is currently executing. Wait for it to complete.")]
    RunAlreadyActive { active_run_id: String },

    #[error("LIVE trading is disabled via TRADING_DISABLE_LIVE")]
    LiveDisabled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::RunAlreadyActive { .. } => "RUN_ALREADY_ACTIVE",
            CommandError::LiveDisabled => "LIVE_DISABLED",
            CommandError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CommandError::RunAlreadyActive { .. } => 409,
            CommandError::LiveDisabled => 403,
            CommandError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_error_reason_codes() {
        let err = SelectionError::NoMarketData {
            window: "last 10 minutes".to_string(),
            universe_size: 25,
            exclusions: 25,
        };
        assert_eq!(err.reason_code(), "NO_MARKET_DATA");
        assert!(err.to_string().contains("last 10 minutes"));
        assert!(err.to_string().contains("25 candidates"));

        let err = SelectionError::NoTradeableAsset {
            evaluated: 3,
            skipped: "AAA, BBB".to_string(),
        };
        assert_eq!(err.reason_code(), "NO_TRADEABLE_TOP_PERFORMER");
        assert!(err.to_string().contains("AAA, BBB"));
    }

    #[test]
    fn test_command_error_http_mapping() {
        let err = CommandError::RunAlreadyActive {
            active_run_id: "run_1".to_string(),
        };
        assert_eq!(err.http_status(), 409);
        assert_eq!(CommandError::LiveDisabled.http_status(), 403);
        assert_eq!(CommandError::LiveDisabled.code(), "LIVE_DISABLED");
    }

    #[test]
    fn test_preflight_reason_codes() {
        assert_eq!(
            PreflightRejectReason::MinNotionalTooLow.code(),
            "MIN_NOTIONAL_TOO_LOW"
        );
        assert_eq!(
            PreflightRejectReason::InsufficientBalance.code(),
            "INSUFFICIENT_BALANCE"
        );
    }
}
