//! Trade command parser: free text to structured fields.
//!
//! Recognizes dollar amounts, percentage sales, natural-language lookback
//! windows, asset aliases, execution modes, and the "most profitable" /
//! "sell last purchase" command forms.

use crate::domain::symbols::{normalize_text, resolve_asset_alias, to_product_id};
use crate::domain::types::{AssetClass, ExecutionMode, OrderSide};
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub side: Option<OrderSide>,
    pub asset: Option<String>,
    pub venue_symbol: Option<String>,
    pub asset_class: AssetClass,
    pub amount_usd: Option<Decimal>,
    /// Quantity given in the base asset ("0.01 BTC") instead of USD.
    pub base_size: Option<Decimal>,
    pub sell_pct: Option<f64>,
    pub mode: ExecutionMode,
    pub is_most_profitable: bool,
    pub is_sell_last_purchase: bool,
    pub lookback_hours: f64,
    pub selection_criteria: Option<String>,
    pub threshold_pct: Option<f64>,
    pub universe_constraint: Option<String>,
}

impl ParsedCommand {
    pub fn is_missing_amount(&self) -> bool {
        self.amount_usd.is_none() && self.base_size.is_none() && self.sell_pct.is_none()
    }

    pub fn is_missing_asset(&self) -> bool {
        self.asset.is_none() && !self.is_most_profitable && !self.is_sell_last_purchase
    }
}

const MOST_PROFITABLE_PHRASES: &[&str] = &[
    "most profitable",
    "top performer",
    "top performing",
    "best return",
    "best performing",
    "best performer",
    "highest performing",
    "highest return",
    "top gainer",
    "biggest gainer",
    "worst performing",
    "lowest performing",
    "worst return",
    "biggest loser",
    "top loser",
];

const FALLING_PHRASES: &[&str] = &[
    "worst performing",
    "lowest performing",
    "worst return",
    "biggest loser",
    "top loser",
    "falling",
];

pub fn parse_trade_command(text: &str) -> ParsedCommand {
    let normalized = normalize_text(text);

    let side = parse_side(&normalized);
    let amount_usd = parse_dollar_amount(text);
    let base_size = parse_base_size(&normalized);
    let sell_pct = parse_sell_percentage(&normalized, side);
    let is_most_profitable = MOST_PROFITABLE_PHRASES.iter().any(|p| normalized.contains(p));
    let is_sell_last_purchase = parse_sell_last_purchase(&normalized);
    let lookback_hours = parse_lookback_hours(&normalized).unwrap_or(24.0);
    let asset_class = parse_asset_class(&normalized);
    let asset = parse_asset(text, &normalized, asset_class);

    let mode = if asset_class == AssetClass::Stock {
        // Stocks are never auto-executed; they go through order tickets.
        ExecutionMode::AssistedLive
    } else if normalized.contains("live") {
        ExecutionMode::Live
    } else {
        ExecutionMode::Paper
    };

    let selection_criteria = if is_most_profitable {
        if FALLING_PHRASES.iter().any(|p| normalized.contains(p)) {
            Some("lowest performing".to_string())
        } else {
            Some("highest performing".to_string())
        }
    } else {
        None
    };

    let universe_constraint = if is_most_profitable {
        if normalized.contains("major") {
            Some("majors_only".to_string())
        } else if normalized.contains("stablecoin") {
            Some("exclude_stablecoins".to_string())
        } else {
            Some("top_25_volume".to_string())
        }
    } else {
        None
    };

    let venue_symbol = asset.as_deref().map(to_product_id);

    ParsedCommand {
        side,
        asset,
        venue_symbol,
        asset_class,
        amount_usd,
        base_size,
        sell_pct,
        mode,
        is_most_profitable,
        is_sell_last_purchase,
        lookback_hours,
        selection_criteria,
        threshold_pct: parse_threshold_pct(&normalized),
        universe_constraint,
    }
}

fn parse_side(normalized: &str) -> Option<OrderSide> {
    // "sell" wins over "buy" when both appear ("sell BTC to buy ETH" is a sell)
    if normalized.contains("sell") {
        Some(OrderSide::Sell)
    } else if normalized.contains("buy") || normalized.contains("purchase") {
        Some(OrderSide::Buy)
    } else if normalized.contains("order") || normalized.contains("execute") || normalized.contains("trade") {
        Some(OrderSide::Buy)
    } else {
        None
    }
}

/// First `$<number>` in the raw text, e.g. "$10" or "$10.50".
fn parse_dollar_amount(text: &str) -> Option<Decimal> {
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'$' {
            let rest = &text[i + 1..];
            let number: String = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
                .filter(|c| *c != ',')
                .collect();
            if !number.is_empty()
                && let Ok(amount) = Decimal::from_str(&number)
            {
                return Some(amount);
            }
        }
    }
    None
}

/// Base-asset quantity forms: "0.01 BTC", "buy 2 eth".
fn parse_base_size(normalized: &str) -> Option<Decimal> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        if resolve_asset_alias(token).is_some()
            && i > 0
            && let Ok(size) = Decimal::from_str(tokens[i - 1])
            && size > Decimal::ZERO
        {
            return Some(size);
        }
    }
    None
}

/// "sell 25%" / "sell 25 percent" forms.
fn parse_sell_percentage(normalized: &str, side: Option<OrderSide>) -> Option<f64> {
    if side != Some(OrderSide::Sell) {
        return None;
    }
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        if let Some(stripped) = token.strip_suffix('%')
            && let Ok(pct) = stripped.parse::<f64>()
        {
            return Some(pct);
        }
        if *token == "percent"
            && i > 0
            && let Ok(pct) = tokens[i - 1].parse::<f64>()
        {
            return Some(pct);
        }
    }
    None
}

fn parse_sell_last_purchase(normalized: &str) -> bool {
    normalized.contains("sell")
        && (normalized.contains("last purchase")
            || normalized.contains("last buy")
            || normalized.contains("what i just bought")
            || normalized.contains("my recent purchase"))
}

/// Natural-language lookback windows:
/// "last 10 minutes" -> 0.167h, "last week" -> 168h, "last 7 weeks" -> 1176h.
pub fn parse_lookback_hours(normalized: &str) -> Option<f64> {
    let tokens: Vec<&str> = normalized
        .split(|c: char| !c.is_alphanumeric() && c != '.')
        .filter(|t| !t.is_empty())
        .collect();

    for (i, token) in tokens.iter().enumerate() {
        if *token != "last" && *token != "past" {
            continue;
        }
        let (count, unit_idx) = match tokens.get(i + 1).and_then(|t| t.parse::<f64>().ok()) {
            Some(n) => (n, i + 2),
            None => (1.0, i + 1),
        };
        let Some(unit) = tokens.get(unit_idx) else {
            continue;
        };
        let hours = match *unit {
            "minute" | "minutes" | "min" | "mins" => count / 60.0,
            "hour" | "hours" | "hr" | "hrs" => count,
            "day" | "days" => count * 24.0,
            "week" | "weeks" => count * 168.0,
            "month" | "months" => count * 720.0,
            _ => continue,
        };
        return Some((hours * 1000.0).round() / 1000.0);
    }

    if normalized.contains("today") || normalized.contains("24h") {
        return Some(24.0);
    }
    if normalized.contains("this week") {
        return Some(168.0);
    }
    None
}

/// "up 20%" / "up at least 20%" threshold filters.
fn parse_threshold_pct(normalized: &str) -> Option<f64> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    for (i, token) in tokens.iter().enumerate() {
        if (*token == "up" || *token == "down")
            && let Some(next) = tokens[i + 1..]
                .iter()
                .take(3)
                .find(|t| t.ends_with('%'))
            && let Ok(pct) = next.trim_end_matches('%').parse::<f64>()
        {
            return Some(pct);
        }
    }
    None
}

fn parse_asset_class(normalized: &str) -> AssetClass {
    let stock_words = ["stock", "stocks", "equity", "equities", "shares"];
    let crypto_words = ["crypto", "cryptocurrency", "coin", "token"];

    let has_stock = stock_words.iter().any(|w| normalized.contains(w));
    let has_crypto = crypto_words.iter().any(|w| normalized.contains(w))
        || normalized
            .split(|c: char| !c.is_alphanumeric())
            .any(|w| resolve_asset_alias(w).is_some());

    match (has_stock, has_crypto) {
        (true, true) => AssetClass::Ambiguous,
        (true, false) => AssetClass::Stock,
        _ => AssetClass::Crypto,
    }
}

fn parse_asset(raw: &str, normalized: &str, asset_class: AssetClass) -> Option<String> {
    // Crypto aliases first (full names and tickers, case-insensitive)
    for word in normalized.split(|c: char| !c.is_alphanumeric()) {
        if let Some(symbol) = resolve_asset_alias(word) {
            return Some(symbol.to_string());
        }
    }

    // Stock tickers are uppercase tokens in the raw text (AAPL, MSFT)
    if asset_class == AssetClass::Stock {
        for token in raw.split(|c: char| !c.is_ascii_alphanumeric()) {
            if token.len() >= 2
                && token.len() <= 5
                && token.chars().all(|c| c.is_ascii_uppercase())
            {
                return Some(token.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_simple_buy() {
        let parsed = parse_trade_command("Buy $10 of BTC");
        assert_eq!(parsed.side, Some(OrderSide::Buy));
        assert_eq!(parsed.asset.as_deref(), Some("BTC"));
        assert_eq!(parsed.venue_symbol.as_deref(), Some("BTC-USD"));
        assert_eq!(parsed.amount_usd, Some(dec!(10)));
        assert_eq!(parsed.mode, ExecutionMode::Paper);
        assert_eq!(parsed.asset_class, AssetClass::Crypto);
        assert!(!parsed.is_most_profitable);
    }

    #[test]
    fn test_decimal_amount_and_alias() {
        let parsed = parse_trade_command("purchase $10.50 of ethereum in LIVE mode");
        assert_eq!(parsed.amount_usd, Some(dec!(10.50)));
        assert_eq!(parsed.asset.as_deref(), Some("ETH"));
        assert_eq!(parsed.mode, ExecutionMode::Live);
    }

    #[test]
    fn test_sell_percentage() {
        let parsed = parse_trade_command("sell 25% of my SOL");
        assert_eq!(parsed.side, Some(OrderSide::Sell));
        assert_eq!(parsed.sell_pct, Some(25.0));
        assert!(parsed.amount_usd.is_none());
        assert!(!parsed.is_missing_amount());
    }

    #[test]
    fn test_most_profitable_with_minutes_window() {
        let parsed = parse_trade_command("Buy $2 of highest performing crypto in last 10 minutes");
        assert!(parsed.is_most_profitable);
        assert!(parsed.asset.is_none());
        assert!(!parsed.is_missing_asset());
        assert!((parsed.lookback_hours - 0.167).abs() < 1e-3);
        assert_eq!(parsed.selection_criteria.as_deref(), Some("highest performing"));
        assert_eq!(parsed.universe_constraint.as_deref(), Some("top_25_volume"));
    }

    #[test]
    fn test_lookback_windows() {
        assert_eq!(parse_lookback_hours("last week"), Some(168.0));
        assert_eq!(parse_lookback_hours("last 7 weeks"), Some(1176.0));
        assert_eq!(parse_lookback_hours("the last 24 hours"), Some(24.0));
        assert_eq!(parse_lookback_hours("past 3 days"), Some(72.0));
        assert_eq!(parse_lookback_hours("last hour"), Some(1.0));
        assert_eq!(parse_lookback_hours("nothing here"), None);
    }

    #[test]
    fn test_missing_amount() {
        let parsed = parse_trade_command("buy some BTC");
        assert!(parsed.is_missing_amount());
    }

    #[test]
    fn test_missing_asset() {
        let parsed = parse_trade_command("buy $50");
        assert!(parsed.is_missing_asset());
    }

    #[test]
    fn test_ambiguous_asset_class() {
        let parsed = parse_trade_command("buy $50 of crypto stocks");
        assert_eq!(parsed.asset_class, AssetClass::Ambiguous);
    }

    #[test]
    fn test_stock_ticket_mode() {
        let parsed = parse_trade_command("Buy $50 of AAPL stock");
        assert_eq!(parsed.asset_class, AssetClass::Stock);
        assert_eq!(parsed.asset.as_deref(), Some("AAPL"));
        assert_eq!(parsed.mode, ExecutionMode::AssistedLive);
    }

    #[test]
    fn test_sell_last_purchase() {
        let parsed = parse_trade_command("sell my last purchase");
        assert!(parsed.is_sell_last_purchase);
        assert_eq!(parsed.side, Some(OrderSide::Sell));
        assert!(!parsed.is_missing_asset());
    }

    #[test]
    fn test_threshold() {
        let parsed = parse_trade_command("buy $5 of any crypto up 20% in the last day");
        assert_eq!(parsed.threshold_pct, Some(20.0));
        assert_eq!(parsed.lookback_hours, 24.0);
    }

    #[test]
    fn test_worst_performer_criteria() {
        let parsed = parse_trade_command("buy $5 of the worst performing crypto today");
        assert!(parsed.is_most_profitable);
        assert_eq!(parsed.selection_criteria.as_deref(), Some("lowest performing"));
    }
}
