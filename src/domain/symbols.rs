//! Symbol normalization between base assets and venue product ids.
//!
//! The venue quotes everything against USD, so the canonical product id is
//! "BASE-USD". User text refers to assets by base symbol or full name.

/// Converts a symbol to canonical product id format (BASE-USD).
///
/// # Examples
/// ```
/// use execdesk::domain::symbols::to_product_id;
///
/// assert_eq!(to_product_id("SOL"), "SOL-USD");
/// assert_eq!(to_product_id("btc"), "BTC-USD");
/// assert_eq!(to_product_id("ETH-USD"), "ETH-USD");
/// ```
pub fn to_product_id(symbol: &str) -> String {
    let symbol = symbol.trim().to_uppercase();
    if symbol.contains('-') {
        symbol
    } else {
        format!("{}-USD", symbol)
    }
}

/// Converts a symbol to its base asset (strips the quote currency).
///
/// # Examples
/// ```
/// use execdesk::domain::symbols::to_base;
///
/// assert_eq!(to_base("SOL-USD"), "SOL");
/// assert_eq!(to_base("btc"), "BTC");
/// ```
pub fn to_base(symbol: &str) -> String {
    let symbol = symbol.trim().to_uppercase();
    match symbol.split_once('-') {
        Some((base, _)) => base.to_string(),
        None => symbol,
    }
}

/// Normalizes free text for intent matching: lowercase, trimmed, internal
/// whitespace collapsed to single spaces. Idempotent.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Maps a full asset name or ticker to the canonical base symbol, if known.
pub fn resolve_asset_alias(word: &str) -> Option<&'static str> {
    match word.to_lowercase().as_str() {
        "bitcoin" | "btc" => Some("BTC"),
        "ethereum" | "eth" => Some("ETH"),
        "solana" | "sol" => Some("SOL"),
        "cardano" | "ada" => Some("ADA"),
        "polkadot" | "dot" => Some("DOT"),
        "polygon" | "matic" => Some("MATIC"),
        "avalanche" | "avax" => Some("AVAX"),
        "chainlink" | "link" => Some("LINK"),
        "uniswap" | "uni" => Some("UNI"),
        "cosmos" | "atom" => Some("ATOM"),
        "ripple" | "xrp" => Some("XRP"),
        "dogecoin" | "doge" => Some("DOGE"),
        "shib" => Some("SHIB"),
        "litecoin" | "ltc" => Some("LTC"),
        "stellar" | "xlm" => Some("XLM"),
        _ => None,
    }
}

/// Crypto symbols and names recognized in holdings queries.
pub const CRYPTO_WORDS: &[&str] = &[
    "btc", "bitcoin", "eth", "ethereum", "sol", "solana", "ada", "cardano", "dot", "polkadot",
    "matic", "polygon", "avax", "avalanche", "link", "chainlink", "uni", "uniswap", "atom",
    "cosmos", "xrp", "ripple", "doge", "dogecoin", "shib", "ltc", "litecoin", "xlm", "stellar",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_product_id() {
        assert_eq!(to_product_id("SOL"), "SOL-USD");
        assert_eq!(to_product_id("SOL-USD"), "SOL-USD");
        assert_eq!(to_product_id("btc"), "BTC-USD");
        assert_eq!(to_product_id(" eth "), "ETH-USD");
    }

    #[test]
    fn test_to_base() {
        assert_eq!(to_base("SOL-USD"), "SOL");
        assert_eq!(to_base("BTC-USD"), "BTC");
        assert_eq!(to_base("SOL"), "SOL");
        assert_eq!(to_base("btc"), "BTC");
    }

    #[test]
    fn test_product_id_base_roundtrip() {
        for s in ["BTC", "eth", "SOL-USD", "matic"] {
            assert_eq!(to_product_id(&to_base(s)), to_product_id(s));
        }
    }

    #[test]
    fn test_normalize_text_idempotent() {
        let inputs = ["  Buy   $10\tof BTC ", "HELLO", "a  b   c"];
        for t in inputs {
            let once = normalize_text(t);
            assert_eq!(normalize_text(&once), once);
        }
    }

    #[test]
    fn test_resolve_asset_alias() {
        assert_eq!(resolve_asset_alias("bitcoin"), Some("BTC"));
        assert_eq!(resolve_asset_alias("ETHEREUM"), Some("ETH"));
        assert_eq!(resolve_asset_alias("doge"), Some("DOGE"));
        assert_eq!(resolve_asset_alias("tesla"), None);
    }
}
