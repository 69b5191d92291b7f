use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Intent taxonomy - single source of truth for command classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentType {
    Greeting,
    CapabilitiesHelp,
    FinanceAnalysis,
    TradeExecution,
    Portfolio,
    PortfolioAnalysis,
    AppDiagnostics,
    OutOfScope,
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntentType::Greeting => "GREETING",
            IntentType::CapabilitiesHelp => "CAPABILITIES_HELP",
            IntentType::FinanceAnalysis => "FINANCE_ANALYSIS",
            IntentType::TradeExecution => "TRADE_EXECUTION",
            IntentType::Portfolio => "PORTFOLIO",
            IntentType::PortfolioAnalysis => "PORTFOLIO_ANALYSIS",
            IntentType::AppDiagnostics => "APP_DIAGNOSTICS",
            IntentType::OutOfScope => "OUT_OF_SCOPE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            _ => anyhow::bail!("Invalid order side: {}", s),
        }
    }
}

/// Execution modes: simulation, real orders, manual ticket, artifact replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Paper,
    Live,
    AssistedLive,
    Replay,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Paper => "PAPER",
            ExecutionMode::Live => "LIVE",
            ExecutionMode::AssistedLive => "ASSISTED_LIVE",
            ExecutionMode::Replay => "REPLAY",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PAPER" => Ok(ExecutionMode::Paper),
            "LIVE" => Ok(ExecutionMode::Live),
            "ASSISTED_LIVE" => Ok(ExecutionMode::AssistedLive),
            "REPLAY" => Ok(ExecutionMode::Replay),
            _ => anyhow::bail!(
                "Invalid execution mode: {}. Must be PAPER, LIVE, ASSISTED_LIVE or REPLAY",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetClass {
    Crypto,
    Stock,
    /// Parser could not decide between crypto and stock keywords.
    Ambiguous,
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetClass::Crypto => "CRYPTO",
            AssetClass::Stock => "STOCK",
            AssetClass::Ambiguous => "AMBIGUOUS",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AssetClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CRYPTO" => Ok(AssetClass::Crypto),
            "STOCK" => Ok(AssetClass::Stock),
            "AMBIGUOUS" => Ok(AssetClass::Ambiguous),
            _ => anyhow::bail!("Invalid asset class: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Created => "CREATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Paused => "PAUSED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(RunStatus::Created),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "PAUSED" => Ok(RunStatus::Paused),
            _ => anyhow::bail!("Invalid run status: {}", s),
        }
    }
}

/// Lifecycle of a pending trade confirmation. PENDING is the only
/// non-terminal state; exactly one transition out of it ever succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfirmationStatus::Pending => "PENDING",
            ConfirmationStatus::Confirmed => "CONFIRMED",
            ConfirmationStatus::Cancelled => "CANCELLED",
            ConfirmationStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ConfirmationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ConfirmationStatus::Pending),
            "CONFIRMED" => Ok(ConfirmationStatus::Confirmed),
            "CANCELLED" => Ok(ConfirmationStatus::Cancelled),
            "EXPIRED" => Ok(ConfirmationStatus::Expired),
            _ => anyhow::bail!("Invalid confirmation status: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Pending,
    Executed,
    Cancelled,
    Expired,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TicketStatus::Pending => "PENDING",
            TicketStatus::Executed => "EXECUTED",
            TicketStatus::Cancelled => "CANCELLED",
            TicketStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn open_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.open.to_f64().unwrap_or(0.0)
    }

    pub fn close_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.close.to_f64().unwrap_or(0.0)
    }

    pub fn volume_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.volume.to_f64().unwrap_or(0.0)
    }
}

/// Percent return over an ascending candle series: (last_close - first_open) / first_open.
pub fn compute_return_pct(candles: &[Candle]) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let first_open = candles[0].open_f64();
    let last_close = candles[candles.len() - 1].close_f64();
    if first_open <= 0.0 {
        return 0.0;
    }
    ((last_close - first_open) / first_open) * 100.0
}

/// Candle granularity supported by the market data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    OneMinute,
    FiveMinute,
    FifteenMinute,
    OneHour,
    SixHour,
    OneDay,
}

impl Granularity {
    pub fn seconds(&self) -> i64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinute => 300,
            Granularity::FifteenMinute => 900,
            Granularity::OneHour => 3600,
            Granularity::SixHour => 21600,
            Granularity::OneDay => 86400,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinute => "5m",
            Granularity::FifteenMinute => "15m",
            Granularity::OneHour => "1h",
            Granularity::SixHour => "6h",
            Granularity::OneDay => "1d",
        }
    }

    /// Pick the granularity that gives a usable series for a lookback window.
    pub fn for_lookback_hours(hours: f64) -> Self {
        if hours <= 1.0 {
            Granularity::OneMinute
        } else if hours <= 6.0 {
            Granularity::FiveMinute
        } else if hours <= 24.0 {
            Granularity::FifteenMinute
        } else if hours <= 168.0 {
            Granularity::OneHour
        } else {
            Granularity::SixHour
        }
    }
}

/// A product listed on the exchange, as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub status: String,
    pub volume_24h: f64,
    pub min_market_funds: Option<Decimal>,
}

impl Product {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

/// The staged trade a confirmation protects. Sealed onto the confirmation
/// row at staging time; CONFIRM consumes it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub side: OrderSide,
    pub asset: String,
    pub amount_usd: Decimal,
    pub mode: ExecutionMode,
    pub asset_class: AssetClass,
    pub lookback_hours: f64,
    pub is_most_profitable: bool,
    pub news_enabled: bool,
    #[serde(default)]
    pub locked_product_id: Option<String>,
    /// Set when the staging-time tradability preflight passed; copied onto
    /// the run at CONFIRM so execution can trust it.
    #[serde(default)]
    pub tradability_verified: bool,
    #[serde(default)]
    pub auto_sell: Option<AutoSellProposal>,
    #[serde(default)]
    pub selection_result: Option<serde_json::Value>,
}

/// Sell-to-fund instruction produced by preflight when cash is short but
/// non-target holdings can cover the gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSellProposal {
    pub sell_base_symbol: String,
    pub sell_product_id: String,
    pub sell_amount_usd: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub run_id: String,
    pub tenant_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub notional_usd: Decimal,
    pub status: String,
    pub filled_qty: Option<Decimal>,
    pub avg_fill_price: Option<Decimal>,
    pub fees: Option<Decimal>,
    pub client_order_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: String,
    pub run_id: String,
    pub symbol: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
}

/// A single end-to-end execution of the ordered-node pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub tenant_id: String,
    pub execution_mode: ExecutionMode,
    pub source_run_id: Option<String>,
    pub asset_class: AssetClass,
    pub news_enabled: bool,
    pub locked_product_id: Option<String>,
    pub tradability_verified: bool,
    pub command_text: String,
    pub intent: String,
    pub status: RunStatus,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Policy node verdicts. BLOCKED is a hard stop: no orders are ever placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    Allowed,
    Blocked,
    RequiresApproval,
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyDecision::Allowed => "ALLOWED",
            PolicyDecision::Blocked => "BLOCKED",
            PolicyDecision::RequiresApproval => "REQUIRES_APPROVAL",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, close: Decimal) -> Candle {
        Candle {
            start: Utc::now(),
            end: Utc::now(),
            open,
            high: close,
            low: open,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn test_compute_return_pct() {
        let candles = vec![candle(dec!(100), dec!(101)), candle(dec!(101), dec!(110))];
        let ret = compute_return_pct(&candles);
        assert!((ret - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_return_requires_two_candles() {
        assert_eq!(compute_return_pct(&[candle(dec!(100), dec!(110))]), 0.0);
        assert_eq!(compute_return_pct(&[]), 0.0);
    }

    #[test]
    fn test_compute_return_zero_open_is_zero() {
        let candles = vec![candle(dec!(0), dec!(1)), candle(dec!(1), dec!(2))];
        assert_eq!(compute_return_pct(&candles), 0.0);
    }

    #[test]
    fn test_granularity_for_lookback() {
        assert_eq!(Granularity::for_lookback_hours(0.167), Granularity::OneMinute);
        assert_eq!(Granularity::for_lookback_hours(4.0), Granularity::FiveMinute);
        assert_eq!(Granularity::for_lookback_hours(24.0), Granularity::FifteenMinute);
        assert_eq!(Granularity::for_lookback_hours(168.0), Granularity::OneHour);
        assert_eq!(Granularity::for_lookback_hours(1176.0), Granularity::SixHour);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("paper".parse::<ExecutionMode>().unwrap(), ExecutionMode::Paper);
        assert_eq!(
            "ASSISTED_LIVE".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::AssistedLive
        );
        assert!("margin".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Created.is_terminal());
    }
}
