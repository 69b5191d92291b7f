//! Intent classification with deterministic rules and hard guardrails.
//!
//! Pure functions over normalized text. The decision order matters:
//! portfolio-analysis requests must be recognized before trade execution,
//! because "analyze" queries routinely mention tradeable symbols.

use crate::domain::symbols::{CRYPTO_WORDS, normalize_text, resolve_asset_alias};
use crate::domain::types::IntentType;

const GREETING_STARTS: &[&str] = &[
    "hi", "hello", "hey", "yo", "sup", "howdy", "greetings", "good morning", "good afternoon",
    "good evening", "good day", "how are you", "what's up", "whats up",
];

const CAPABILITIES_KEYWORDS: &[&str] = &[
    "capabilities",
    "what can you do",
    "what do you do",
    "help",
    "examples",
    "example",
    "how do i use",
    "how to use",
    "commands",
    "supported queries",
    "features",
    "what are you",
    "who are you",
    "introduce yourself",
];

/// Hard out-of-scope phrases: politics, geography, sports, entertainment,
/// general trivia.
const OUT_OF_SCOPE_PHRASES: &[&str] = &[
    "who is the president",
    "who is president",
    "prime minister",
    "senator",
    "governor",
    "mayor",
    "election",
    "voting",
    "ballot",
    "campaign",
    "democrat",
    "republican",
    "capital of",
    "history of",
    "who won the game",
    "who won the match",
    "who won the championship",
    "sports score",
    "game score",
    "nfl",
    "nba",
    "mlb",
    "nhl",
    "fifa",
    "olympics",
    "celebrity",
    "actor",
    "actress",
    "singer",
    "movie",
    "film",
    "tv show",
    "who starred",
    "who played",
    "who sang",
    "what is the tallest",
    "what is the biggest",
    "what is the smallest",
    "what is the longest",
];

/// Out-of-scope phrase pairs: both parts must appear.
const OUT_OF_SCOPE_PAIRS: &[(&str, &str)] = &[
    ("how many", "in the world"),
    ("where is", "located"),
    ("when was", "born"),
    ("when was", "founded"),
    ("when was", "invented"),
];

const FINANCE_KEYWORDS: &[&str] = &[
    "buy", "sell", "trade", "order", "execute", "purchase", "portfolio", "pnl", "profit", "loss",
    "gain", "return", "risk", "volatility", "drawdown", "sharpe", "allocation", "exposure", "btc",
    "eth", "sol", "ada", "crypto", "bitcoin", "ethereum", "candles", "ohlc", "price", "volume",
    "market cap", "technical", "indicator", "moving average", "rsi", "macd", "bullish", "bearish",
    "trend", "support", "resistance", "most profitable", "top gainer", "top loser",
    "best performer", "analyze", "analysis", "compare", "comparison", "slippage", "limit",
    "market order", "stop loss",
];

const TRADE_EXECUTION_KEYWORDS: &[&str] = &[
    "buy", "sell", "purchase", "order", "execute", "trade", "long", "short", "position",
];

const PORTFOLIO_KEYWORDS: &[&str] = &[
    "portfolio",
    "holdings",
    "positions",
    "allocation",
    "exposure",
    "pnl",
    "profit and loss",
    "performance",
    "returns",
    "diversification",
    "risk",
    "drawdown",
];

const APP_DIAGNOSTIC_KEYWORDS: &[&str] = &[
    "telemetry",
    "evals",
    "evaluations",
    "run history",
    "steps panel",
    "trace",
    "latency",
    "errors",
    "logs",
    "why was",
    "what happened",
    "debug",
    "charts",
    "visualization",
];

pub fn is_greeting(text: &str) -> bool {
    let normalized = normalize_text(text);
    GREETING_STARTS.iter().any(|start| {
        normalized == *start
            || normalized.starts_with(&format!("{} ", start))
            || normalized.starts_with(&format!("{},", start))
            || normalized.starts_with(&format!("{}!", start))
    })
}

pub fn is_capabilities_help(text: &str) -> bool {
    let normalized = normalize_text(text);
    CAPABILITIES_KEYWORDS.iter().any(|kw| normalized.contains(kw))
}

fn finance_keyword_count(normalized: &str) -> usize {
    FINANCE_KEYWORDS.iter().filter(|kw| normalized.contains(*kw)).count()
}

pub fn is_out_of_scope(text: &str) -> bool {
    let normalized = normalize_text(text);

    let matches_pattern = OUT_OF_SCOPE_PHRASES.iter().any(|p| normalized.contains(p))
        || OUT_OF_SCOPE_PAIRS
            .iter()
            .any(|(a, b)| normalized.contains(a) && normalized.contains(b));

    if matches_pattern {
        // Escape hatch: "how could an election affect BTC volatility" is a
        // finance question despite the politics phrasing.
        if finance_keyword_count(&normalized) >= 2 {
            return false;
        }
        return true;
    }
    false
}

pub fn has_trade_execution_keywords(text: &str) -> bool {
    let normalized = normalize_text(text);
    TRADE_EXECUTION_KEYWORDS.iter().any(|kw| normalized.contains(kw))
}

pub fn has_portfolio_keywords(text: &str) -> bool {
    let normalized = normalize_text(text);
    PORTFOLIO_KEYWORDS.iter().any(|kw| normalized.contains(kw))
}

pub fn has_finance_keywords(text: &str) -> bool {
    finance_keyword_count(&normalize_text(text)) >= 1
}

pub fn has_app_diagnostic_keywords(text: &str) -> bool {
    let normalized = normalize_text(text);
    APP_DIAGNOSTIC_KEYWORDS.iter().any(|kw| normalized.contains(kw))
}

/// Explicit portfolio-analysis requests, not just portfolio mentions.
pub fn is_portfolio_analysis_request(text: &str) -> bool {
    let normalized = normalize_text(text);

    let pairs: &[(&str, &str)] = &[
        ("analyze", "portfolio"),
        ("analyze", "holdings"),
        ("analyze", "positions"),
        ("analyze", "allocation"),
        ("risk analysis", "portfolio"),
        ("how is", "portfolio"),
    ];
    if pairs.iter().any(|(a, b)| normalized.contains(a) && normalized.contains(b)) {
        return true;
    }

    let phrases = [
        "portfolio analysis",
        "portfolio health",
        "portfolio summary",
        "portfolio breakdown",
        "trading behavior analysis",
        "trading summary",
    ];
    phrases.iter().any(|p| normalized.contains(p))
}

/// Specific-asset balance questions that need live data.
///
/// "How much BTC do I own?" is a holdings query; "What's the price of BTC?"
/// is not.
pub fn is_holdings_query(text: &str) -> bool {
    let normalized = normalize_text(text);

    // Price queries are never holdings queries
    if normalized.contains("price") || normalized.contains("worth") {
        return false;
    }

    let mentions_crypto = CRYPTO_WORDS.iter().any(|w| contains_word(&normalized, w));
    if !mentions_crypto {
        return false;
    }

    let balance_phrasing = normalized.contains("balance")
        || normalized.contains("holding")
        || normalized.contains("holdings");
    let ownership_phrasing = (normalized.contains("how much") || normalized.contains("do i"))
        && (normalized.contains("own") || normalized.contains("have"));

    balance_phrasing || ownership_phrasing
}

/// Extract the asset a holdings query asks about, as a canonical base symbol.
pub fn extract_holdings_asset(text: &str) -> Option<String> {
    let normalized = normalize_text(text);
    for word in normalized.split(|c: char| !c.is_alphanumeric()) {
        if CRYPTO_WORDS.contains(&word)
            && let Some(symbol) = resolve_asset_alias(word)
        {
            return Some(symbol.to_string());
        }
    }
    None
}

fn contains_word(normalized: &str, word: &str) -> bool {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .any(|w| w == word)
}

/// Classify user intent using deterministic rules.
///
/// Priority order:
/// 1. GREETING (high precision)
/// 2. CAPABILITIES_HELP
/// 3. OUT_OF_SCOPE (hard block, with finance-context escape)
/// 4. APP_DIAGNOSTICS
/// 5. PORTFOLIO_ANALYSIS (explicit request or holdings query; checked
///    before TRADE_EXECUTION on purpose)
/// 6. TRADE_EXECUTION
/// 7. PORTFOLIO vs FINANCE_ANALYSIS
/// 8. OUT_OF_SCOPE (default fallback)
pub fn classify_intent(text: &str) -> IntentType {
    if text.trim().is_empty() {
        return IntentType::OutOfScope;
    }

    if is_greeting(text) {
        return IntentType::Greeting;
    }

    if is_capabilities_help(text) {
        return IntentType::CapabilitiesHelp;
    }

    if is_out_of_scope(text) {
        return IntentType::OutOfScope;
    }

    if has_app_diagnostic_keywords(text) {
        return IntentType::AppDiagnostics;
    }

    if is_portfolio_analysis_request(text) || is_holdings_query(text) {
        return IntentType::PortfolioAnalysis;
    }

    if has_trade_execution_keywords(text) {
        return IntentType::TradeExecution;
    }

    let is_portfolio = has_portfolio_keywords(text);
    let is_finance = has_finance_keywords(text);

    if is_portfolio && is_finance {
        // Symbol mentions turn a portfolio-flavored question into
        // comparative analysis ("Compare ETH vs BTC returns")
        let normalized = normalize_text(text);
        let symbol_count = ["btc", "eth", "sol", "ada", "dot", "matic", "avax", "bitcoin", "ethereum"]
            .iter()
            .filter(|s| normalized.contains(*s))
            .count();
        if symbol_count >= 1 {
            return IntentType::FinanceAnalysis;
        }
        return IntentType::Portfolio;
    }

    if is_portfolio {
        return IntentType::Portfolio;
    }

    if is_finance {
        return IntentType::FinanceAnalysis;
    }

    IntentType::OutOfScope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greetings() {
        assert_eq!(classify_intent("Hi"), IntentType::Greeting);
        assert_eq!(classify_intent("hello there"), IntentType::Greeting);
        assert_eq!(classify_intent("Good morning!"), IntentType::Greeting);
        assert_eq!(classify_intent("how are you?"), IntentType::Greeting);
    }

    #[test]
    fn test_capabilities() {
        assert_eq!(classify_intent("What can you do?"), IntentType::CapabilitiesHelp);
        assert_eq!(classify_intent("show me some examples"), IntentType::CapabilitiesHelp);
    }

    #[test]
    fn test_out_of_scope() {
        assert_eq!(classify_intent("Who is the president?"), IntentType::OutOfScope);
        assert_eq!(classify_intent("capital of France"), IntentType::OutOfScope);
        assert_eq!(classify_intent("who won the game last night"), IntentType::OutOfScope);
        assert_eq!(classify_intent(""), IntentType::OutOfScope);
        assert_eq!(classify_intent("   "), IntentType::OutOfScope);
    }

    #[test]
    fn test_finance_context_escape_hatch() {
        // Election phrasing, but two finance keywords (btc, volatility)
        assert_eq!(
            classify_intent("How could an election affect BTC volatility?"),
            IntentType::FinanceAnalysis
        );
    }

    #[test]
    fn test_trade_execution() {
        assert_eq!(classify_intent("Buy $10 of BTC"), IntentType::TradeExecution);
        assert_eq!(classify_intent("sell 25% of my ETH"), IntentType::TradeExecution);
        assert_eq!(
            classify_intent("Buy $2 of highest performing crypto in last 10 minutes"),
            IntentType::TradeExecution
        );
    }

    #[test]
    fn test_portfolio_analysis_beats_trade_execution() {
        // "analyze" appears alongside tradeable symbols; must not become a trade
        assert_eq!(classify_intent("Analyze my portfolio"), IntentType::PortfolioAnalysis);
        assert_eq!(
            classify_intent("portfolio risk analysis"),
            IntentType::PortfolioAnalysis
        );
        assert_eq!(
            classify_intent("analyze my crypto portfolio"),
            IntentType::PortfolioAnalysis
        );
    }

    #[test]
    fn test_holdings_queries() {
        assert_eq!(classify_intent("How much BTC do I own?"), IntentType::PortfolioAnalysis);
        assert_eq!(classify_intent("What is my ETH balance?"), IntentType::PortfolioAnalysis);
        assert_eq!(classify_intent("do I have any solana?"), IntentType::PortfolioAnalysis);
    }

    #[test]
    fn test_price_query_is_not_holdings() {
        assert!(!is_holdings_query("What's the price of BTC?"));
        assert!(!is_holdings_query("how much is BTC worth"));
    }

    #[test]
    fn test_extract_holdings_asset() {
        assert_eq!(extract_holdings_asset("How much BTC do I own?"), Some("BTC".to_string()));
        assert_eq!(
            extract_holdings_asset("what is my bitcoin balance"),
            Some("BTC".to_string())
        );
        assert_eq!(
            extract_holdings_asset("Do I have any ethereum?"),
            Some("ETH".to_string())
        );
        assert_eq!(extract_holdings_asset("how much do I own?"), None);
    }

    #[test]
    fn test_portfolio_vs_finance() {
        assert_eq!(
            classify_intent("show my portfolio allocation and exposure"),
            IntentType::Portfolio
        );
        assert_eq!(classify_intent("compare ETH vs BTC returns"), IntentType::FinanceAnalysis);
        assert_eq!(
            classify_intent("what was bitcoin volatility this week"),
            IntentType::FinanceAnalysis
        );
    }

    #[test]
    fn test_app_diagnostics() {
        assert_eq!(classify_intent("show me the telemetry"), IntentType::AppDiagnostics);
        assert_eq!(
            classify_intent("why was the last run slow? check latency"),
            IntentType::AppDiagnostics
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(classify_intent("Buy $10 of BTC"), IntentType::TradeExecution);
        }
    }
}
