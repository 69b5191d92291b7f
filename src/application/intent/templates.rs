//! Response templates for message-only intents (no run creation) and the
//! confirmation flow prompts.

use crate::domain::types::{AssetClass, ExecutionMode, OrderSide};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

/// Estimated taker fee on crypto market orders. Shared with preflight so
/// the numbers the user confirms are the numbers that were validated.
pub const ESTIMATED_FEE_RATE: Decimal = dec!(0.006);

pub fn greeting_response() -> Value {
    json!({
        "content": "Hi - I'm your financial assistant. I can analyze markets (crypto & stocks), review your portfolio, or execute trades. Try asking me something!",
        "suggestions": [
            "Find the most profitable crypto in the last 24h",
            "Analyze my portfolio risk and allocation",
            "Buy $10 of BTC in PAPER mode",
            "Buy $50 of AAPL stock"
        ],
        "run_id": null,
        "intent": "GREETING",
        "status": "COMPLETED"
    })
}

pub fn capabilities_response() -> Value {
    json!({
        "content": "I can help with:\n\n\
**Market Analysis**\n\
- Price data, returns, volatility, candles\n\
- Top gainers/losers, comparative analysis (BTC vs ETH)\n\n\
**Portfolio & Risk**\n\
- Allocation, exposure, P&L\n\
- Risk metrics, diversification\n\n\
**Trading - Crypto (Automated)**\n\
- Paper/live order execution via Coinbase\n\
- Supported: BTC, ETH, SOL, ADA, DOT, MATIC, AVAX, LINK, UNI, ATOM\n\n\
**Trading - Stocks (Order Tickets)**\n\
- Generate order tickets for manual execution\n\
- EOD data via Polygon.io\n\n\
**Example Prompts:**\n\
- \"What's the most profitable crypto today?\"\n\
- \"Buy $10 of ETH in PAPER mode\"\n\
- \"Analyze my portfolio\"\n",
        "run_id": null,
        "intent": "CAPABILITIES_HELP",
        "status": "COMPLETED"
    })
}

pub fn out_of_scope_response() -> Value {
    json!({
        "content": "I'm a financial/trading assistant, so I can't help with that. Ask me about market analysis, portfolio risk, or executing a trade.",
        "suggestions": [
            "What's the most profitable crypto today?",
            "Analyze my portfolio allocation",
            "Execute a paper trade for $10 of BTC"
        ],
        "run_id": null,
        "intent": "OUT_OF_SCOPE",
        "status": "COMPLETED"
    })
}

pub fn app_diagnostics_response() -> Value {
    json!({
        "content": "**App Features:**\n\n\
- **Runs**: Each trading command creates a run that executes step-by-step\n\
- **Steps Panel**: Real-time progress of your run (research, ranking, execution)\n\
- **Telemetry**: Duration, tool calls, events and errors per run\n\
- **Evals**: Evaluation results that grade run quality and correctness\n\n\
Try a trading command to see runs and steps in action!",
        "run_id": null,
        "intent": "APP_DIAGNOSTICS",
        "status": "COMPLETED"
    })
}

pub fn missing_amount_prompt(side: OrderSide, asset: Option<&str>) -> Value {
    let asset_text = asset.map(|a| format!(" {}", a)).unwrap_or_default();
    json!({
        "content": format!(
            "How much{} do you want to {}? (e.g., $10 or 0.01 BTC)",
            asset_text,
            side.to_string().to_lowercase()
        ),
        "run_id": null,
        "intent": "TRADE_EXECUTION_INCOMPLETE",
        "status": "AWAITING_INPUT"
    })
}

/// Trade confirmation prompt (required for both LIVE and PAPER). Stock and
/// ASSISTED_LIVE flows produce an order ticket instead of automated
/// execution, and the wording says so.
pub fn trade_confirmation_prompt(
    side: OrderSide,
    display_asset: &str,
    amount_usd: Decimal,
    mode: ExecutionMode,
    asset_class: AssetClass,
    confirmation_id: &str,
) -> Value {
    let pending_trade = json!({
        "side": side.to_string().to_lowercase(),
        "asset": display_asset,
        "amount_usd": amount_usd,
        "mode": mode.to_string(),
        "asset_class": asset_class.to_string(),
        "confirmation_id": confirmation_id
    });

    if asset_class == AssetClass::Stock || mode == ExecutionMode::AssistedLive {
        let content = format!(
            "ORDER TICKET CONFIRMATION\n\n\
I will generate an order ticket for you to {} ${:.2} of {}.\n\n\
This is not automated execution. After confirming you will receive an order \
ticket with details. Execute the order manually in your brokerage and submit \
your execution receipt to complete the workflow. EOD (end-of-day) stock data \
is used for analysis.\n\n\
Type CONFIRM to generate the order ticket or CANCEL to abort.",
            side, amount_usd, display_asset
        );
        return json!({
            "content": content,
            "run_id": null,
            "intent": "TRADE_CONFIRMATION_PENDING",
            "status": "AWAITING_CONFIRMATION",
            "pending_trade": pending_trade,
            "confirmation_id": confirmation_id
        });
    }

    let mode_label = if mode == ExecutionMode::Live {
        "LIVE ORDER"
    } else {
        "PAPER TRADE (Simulation)"
    };
    let live_warning = if mode == ExecutionMode::Live {
        "This is a real trade using real funds."
    } else {
        "This is a simulated trade (no real funds)."
    };
    let estimated_fees = amount_usd * ESTIMATED_FEE_RATE;

    let content = format!(
        "{} CONFIRMATION\n\n\
I am about to place a {} market {} for ${:.2} of {}.\n\n\
Estimated fees: ${:.2}. Total notional: ${:.2}. {}\n\n\
Type CONFIRM to place this {} order or CANCEL to abort.",
        mode_label, mode, side, amount_usd, display_asset, estimated_fees, amount_usd, live_warning, mode
    );

    json!({
        "content": content,
        "run_id": null,
        "intent": "TRADE_CONFIRMATION_PENDING",
        "status": "AWAITING_CONFIRMATION",
        "pending_trade": pending_trade,
        "confirmation_id": confirmation_id
    })
}

pub fn trade_cancelled_response() -> Value {
    json!({
        "content": "Trade cancelled.",
        "run_id": null,
        "intent": "TRADE_CANCELLED",
        "status": "COMPLETED"
    })
}

pub fn pending_trade_expired_response() -> Value {
    json!({
        "content": "Your pending trade has expired (5 minute timeout). Please submit your trade request again.",
        "run_id": null,
        "intent": "PENDING_TRADE_EXPIRED",
        "status": "COMPLETED"
    })
}

pub fn no_pending_trade_response() -> Value {
    json!({
        "content": "No pending trade found. Please submit a new trade request or use the CONFIRM button in the conversation.",
        "run_id": null,
        "intent": "CONFIRMATION_NOT_FOUND",
        "status": "ERROR"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_opens_with_expected_text() {
        let resp = greeting_response();
        assert!(resp["content"]
            .as_str()
            .unwrap()
            .starts_with("Hi - I'm your financial assistant"));
        assert_eq!(resp["intent"], "GREETING");
        assert_eq!(resp["status"], "COMPLETED");
        assert!(resp["run_id"].is_null());
    }

    #[test]
    fn test_out_of_scope_opens_with_expected_text() {
        let resp = out_of_scope_response();
        assert!(resp["content"]
            .as_str()
            .unwrap()
            .starts_with("I'm a financial/trading assistant"));
    }

    #[test]
    fn test_crypto_confirmation_prompt_includes_fees() {
        let resp = trade_confirmation_prompt(
            OrderSide::Buy,
            "BTC",
            dec!(10),
            ExecutionMode::Paper,
            AssetClass::Crypto,
            "conf_1",
        );
        let content = resp["content"].as_str().unwrap();
        assert!(content.contains("PAPER TRADE"));
        assert!(content.contains("$0.06")); // 0.6% of $10
        assert_eq!(resp["status"], "AWAITING_CONFIRMATION");
        assert_eq!(resp["pending_trade"]["confirmation_id"], "conf_1");
    }

    #[test]
    fn test_stock_confirmation_is_order_ticket() {
        let resp = trade_confirmation_prompt(
            OrderSide::Buy,
            "AAPL",
            dec!(50),
            ExecutionMode::AssistedLive,
            AssetClass::Stock,
            "conf_2",
        );
        assert!(resp["content"].as_str().unwrap().contains("ORDER TICKET"));
        assert!(resp["content"].as_str().unwrap().contains("manually"));
    }
}
