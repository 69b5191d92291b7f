//! Display formatting for chat responses. The command service returns
//! structured data; everything the user reads is rendered here.

use serde_json::Value;

/// Format a dollar value with thousands separators: 4500.0 -> "$4,500.00".
pub fn money(value: f64) -> String {
    let negative = value < 0.0;
    // Round to cents first so 999.999 renders as $1,000.00
    let total_cents = (value.abs() * 100.0).round() as i64;
    let whole = total_cents / 100;
    let cents = total_cents % 100;

    let mut grouped = String::new();
    let digits = whole.to_string();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    format!("{}${}.{:02}", if negative { "-" } else { "" }, grouped, cents)
}

fn num(value: &Value) -> f64 {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0.0)
}

/// Clean, scannable portfolio analysis output. No markdown tables, max 5
/// holdings shown.
pub fn format_portfolio_analysis(brief: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();

    let mode = brief.get("mode").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
    let as_of = brief.get("as_of").and_then(|v| v.as_str()).unwrap_or("");

    lines.push("**Portfolio Snapshot**".to_string());
    lines.push(format!("Mode: {} | As of: {}", mode, as_of));
    lines.push(String::new());

    let total = num(brief.get("total_value_usd").unwrap_or(&Value::Null));
    let cash = num(brief.get("cash_usd").unwrap_or(&Value::Null));
    lines.push(format!("Total Value: **{}**", money(total)));
    lines.push(format!("Cash: {}", money(cash)));
    lines.push(String::new());

    if let Some(holdings) = brief.get("holdings").and_then(|v| v.as_array())
        && !holdings.is_empty()
    {
        lines.push("**Top Holdings**".to_string());
        for holding in holdings.iter().take(5) {
            let symbol = holding
                .get("asset_symbol")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let qty = num(holding.get("qty").unwrap_or(&Value::Null));
            let usd = num(holding.get("usd_value").unwrap_or(&Value::Null));
            let price = holding.get("current_price").map(|p| num(p)).unwrap_or(0.0);
            if price > 0.0 {
                lines.push(format!(
                    "  {}: {:.6} ({}) @ {}",
                    symbol,
                    qty,
                    money(usd),
                    money(price)
                ));
            } else {
                lines.push(format!("  {}: {:.6} ({})", symbol, qty, money(usd)));
            }
        }
        if holdings.len() > 5 {
            lines.push(format!("  ... and {} more", holdings.len() - 5));
        }
        lines.push(String::new());
    }

    if let Some(allocation) = brief.get("allocation").and_then(|v| v.as_array())
        && !allocation.is_empty()
    {
        lines.push("**Allocation**".to_string());
        for row in allocation.iter().take(5) {
            let symbol = row.get("asset_symbol").and_then(|v| v.as_str()).unwrap_or("?");
            let pct = num(row.get("pct").unwrap_or(&Value::Null));
            lines.push(format!("  {}: {:.1}%", symbol, pct));
        }
        lines.push(String::new());
    }

    if let Some(risk) = brief.get("risk") {
        let risk_level = risk.get("risk_level").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
        let label = match risk_level {
            "VERY_HIGH" => "High concentration",
            "HIGH" => "Concentrated",
            "MEDIUM" => "Moderately diversified",
            "LOW" => "Well diversified",
            _ => "Unable to assess",
        };
        lines.push("**Risk**".to_string());
        lines.push(format!("  Status: {}", label));
        let top1 = num(risk.get("concentration_pct_top1").unwrap_or(&Value::Null));
        if top1 > 0.0 {
            lines.push(format!("  Largest position: {:.0}% of portfolio", top1));
        }
        if let Some(score) = risk.get("diversification_score").and_then(|v| v.as_f64()) {
            lines.push(format!("  Diversification: {:.2}/1.00", score));
        }
        lines.push(String::new());
    }

    if let Some(recommendations) = brief.get("recommendations").and_then(|v| v.as_array())
        && !recommendations.is_empty()
    {
        lines.push("**Recommendations**".to_string());
        for rec in recommendations.iter().take(3) {
            if let Some(title) = rec.get("title").and_then(|v| v.as_str()) {
                lines.push(format!("  {}", title));
            }
            if let Some(desc) = rec.get("description").and_then(|v| v.as_str()) {
                lines.push(format!("    {}", desc));
            }
        }
        lines.push(String::new());
    }

    let evidence_count = brief
        .get("evidence_refs")
        .map(|refs| {
            let mut count = 0;
            if refs
                .get("accounts_call_id")
                .map(|v| !v.is_null())
                .unwrap_or(false)
            {
                count += 1;
            }
            count += refs
                .get("prices_call_ids")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            if refs
                .get("orders_call_id")
                .map(|v| !v.is_null())
                .unwrap_or(false)
            {
                count += 1;
            }
            count
        })
        .unwrap_or(0);
    if evidence_count > 0 {
        let word = if evidence_count == 1 { "source" } else { "sources" };
        lines.push(format!(
            "Data: {} {} queried. Full evidence in run artifacts.",
            evidence_count, word
        ));
    }

    lines.join("\n")
}

/// Focused response for a specific asset holdings query. A missing asset
/// is an explicit zero balance, never an empty reply.
pub fn format_asset_holdings_response(asset: &str, brief: &Value) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mode = brief.get("mode").and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
    let as_of = brief.get("as_of").and_then(|v| v.as_str()).unwrap_or("");

    let empty = Vec::new();
    let holdings = brief
        .get("holdings")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    let found = holdings.iter().find(|h| {
        h.get("asset_symbol")
            .and_then(|v| v.as_str())
            .map(|s| s.eq_ignore_ascii_case(asset))
            .unwrap_or(false)
    });

    lines.push(format!("## {} Holdings", asset));
    lines.push(String::new());
    match found {
        Some(holding) => {
            let qty = num(holding.get("qty").unwrap_or(&Value::Null));
            let usd = num(holding.get("usd_value").unwrap_or(&Value::Null));
            let price = holding.get("current_price").map(|p| num(p)).unwrap_or(0.0);
            lines.push(format!("**{}:** {:.8}", asset, qty));
            if price > 0.0 {
                lines.push(format!(
                    "**USD Value:** {} (at {} per {})",
                    money(usd),
                    money(price),
                    asset
                ));
            } else {
                lines.push(format!("**USD Value:** {}", money(usd)));
            }
        }
        None => {
            lines.push(format!("**{}:** 0.00000000", asset));
            lines.push("**USD Value:** $0.00".to_string());
            lines.push(String::new());
            lines.push(format!(
                "You do not currently hold any {} in your {} portfolio.",
                asset, mode
            ));
        }
    }
    lines.push(String::new());
    lines.push(format!("*{} mode, as of {}*", mode, as_of));

    // Portfolio context
    let total = num(brief.get("total_value_usd").unwrap_or(&Value::Null));
    let cash = num(brief.get("cash_usd").unwrap_or(&Value::Null));
    lines.push(String::new());
    lines.push("---".to_string());
    lines.push(String::new());
    lines.push("### Portfolio Summary".to_string());
    lines.push(format!("- **Total Portfolio Value:** {}", money(total)));
    lines.push(format!("- **Cash (USD):** {}", money(cash)));
    lines.push(format!("- **Holdings:** {} asset(s)", holdings.len()));

    let others: Vec<&Value> = holdings
        .iter()
        .filter(|h| {
            h.get("asset_symbol")
                .and_then(|v| v.as_str())
                .map(|s| !s.eq_ignore_ascii_case(asset))
                .unwrap_or(false)
        })
        .collect();
    if !others.is_empty() {
        lines.push(String::new());
        lines.push("**Other Holdings:**".to_string());
        for holding in others.iter().take(5) {
            let symbol = holding
                .get("asset_symbol")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            let qty = num(holding.get("qty").unwrap_or(&Value::Null));
            let usd = num(holding.get("usd_value").unwrap_or(&Value::Null));
            lines.push(format!("- {}: {:.6} ({})", symbol, qty, money(usd)));
        }
    }

    lines.join("\n")
}

/// Simple snapshot rendering for PORTFOLIO / FINANCE_ANALYSIS queries.
pub fn format_portfolio_snapshot(snapshot: &Value) -> String {
    let mode = snapshot.get("mode").and_then(|v| v.as_str()).unwrap_or("PAPER");
    let ts = snapshot.get("ts").and_then(|v| v.as_str()).unwrap_or("");
    let total = num(snapshot.get("total_value_usd").unwrap_or(&Value::Null));

    let mut lines = vec![
        format!("## Portfolio Snapshot ({} Mode)", mode),
        format!("*As of: {}*", ts),
        String::new(),
        format!("**Total Value:** {}", money(total)),
        String::new(),
    ];

    if let Some(positions) = snapshot.get("positions").and_then(|v| v.as_object())
        && !positions.is_empty()
    {
        lines.push("### Positions".to_string());
        for (asset, qty) in positions {
            lines.push(format!("- {}: {:.6}", asset, num(qty)));
        }
        lines.push(String::new());
    }

    if let Some(balances) = snapshot.get("balances").and_then(|v| v.as_object()) {
        lines.push("### Cash Balances".to_string());
        for (currency, amount) in balances {
            if currency == "USD" {
                lines.push(format!("- {}: {}", currency, money(num(amount))));
            } else {
                lines.push(format!("- {}: {:.6}", currency, num(amount)));
            }
        }
    }

    if mode != "LIVE" {
        lines.push(String::new());
        lines.push(
            "*Note: This is paper trading data. Configure Coinbase API credentials to see your real portfolio.*"
                .to_string(),
        );
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(4500.0), "$4,500.00");
        assert_eq!(money(0.0), "$0.00");
        assert_eq!(money(1234567.891), "$1,234,567.89");
        assert_eq!(money(-12.5), "-$12.50");
        assert_eq!(money(999.999), "$1,000.00");
    }

    #[test]
    fn test_holdings_response_with_position() {
        let brief = json!({
            "mode": "LIVE",
            "as_of": "2026-08-01T00:00:00Z",
            "total_value_usd": 5000.0,
            "cash_usd": 500.0,
            "holdings": [
                {"asset_symbol": "BTC", "qty": 0.1, "usd_value": 4500.0, "current_price": 45000.0}
            ]
        });
        let content = format_asset_holdings_response("BTC", &brief);
        assert!(content.contains("0.10000000"));
        assert!(content.contains("$4,500.00"));
        assert!(content.contains("LIVE"));
    }

    #[test]
    fn test_holdings_response_zero_balance() {
        let brief = json!({
            "mode": "PAPER",
            "as_of": "2026-08-01T00:00:00Z",
            "total_value_usd": 100.0,
            "cash_usd": 100.0,
            "holdings": []
        });
        let content = format_asset_holdings_response("SOL", &brief);
        assert!(content.contains("0.00000000"));
        assert!(content.contains("$0.00"));
        assert!(content.contains("do not currently hold any SOL"));
    }

    #[test]
    fn test_portfolio_analysis_format() {
        let brief = json!({
            "mode": "PAPER",
            "as_of": "2026-08-01T00:00:00Z",
            "total_value_usd": 32500.0,
            "cash_usd": 10000.0,
            "holdings": [
                {"asset_symbol": "BTC", "qty": 0.5, "usd_value": 22500.0, "current_price": 45000.0}
            ],
            "allocation": [
                {"asset_symbol": "BTC", "pct": 69.2},
                {"asset_symbol": "USD", "pct": 30.8}
            ],
            "risk": {"risk_level": "HIGH", "concentration_pct_top1": 69.2, "diversification_score": 0.43},
            "recommendations": [
                {"title": "Moderate Concentration", "description": "Consider spreading positions."}
            ]
        });
        let content = format_portfolio_analysis(&brief);
        assert!(content.contains("$32,500.00"));
        assert!(content.contains("Concentrated"));
        assert!(content.contains("Moderate Concentration"));
    }
}
