//! Command dispatcher: classify, parse, preflight, stage, confirm, run.
//!
//! Stateless over the request; all durable state lives in the repositories.
//! The two-phase pattern applies wherever a side effect exists: the
//! complete response body is built and required state persisted before any
//! background work is dispatched.

use crate::application::intent::parser::parse_trade_command;
use crate::application::intent::planner::plan_execution;
use crate::application::intent::router::{
    classify_intent, extract_holdings_asset, is_holdings_query,
};
use crate::application::intent::templates;
use crate::application::orchestrator::NodeContext;
use crate::application::orchestrator::runner::DagRunner;
use crate::application::preflight::{PreflightRequest, PreflightValidator};
use crate::application::selection::{
    AssetSelectionEngine, SelectionRequest, SelectionResult, humanize_window,
};
use crate::domain::errors::{PreflightRejectReason, SelectionError};
use crate::domain::plan::{SelectedOrder, TradeIntent};
use crate::domain::ports::{NotificationRequest, Notifier};
use crate::domain::symbols::to_product_id;
use crate::domain::types::{
    AssetClass, ConfirmationStatus, ExecutionMode, IntentType, OrderSide, TradeProposal,
};
use crate::infrastructure::persistence::repositories::confirmations::{
    Confirmation, DEFAULT_TTL_SECONDS, TradeConfirmationsRepo,
};
use crate::infrastructure::persistence::repositories::runs::NewRun;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub text: String,
    pub conversation_id: Option<String>,
    pub confirmation_id: Option<String>,
    pub news_enabled: Option<bool>,
}

/// HTTP status plus the response body. Business rejections stay 200 with a
/// structured REJECTED status in the body.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub status: u16,
    pub body: Value,
}

impl CommandReply {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

pub struct CommandService {
    ctx: Arc<NodeContext>,
    confirmations: TradeConfirmationsRepo,
    preflight: PreflightValidator,
    selection: AssetSelectionEngine,
    runner: Arc<DagRunner>,
}

impl CommandService {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let confirmations = TradeConfirmationsRepo::new(ctx.database.clone());
        let preflight = PreflightValidator::new(
            ctx.database.clone(),
            ctx.crypto_data.clone(),
            ctx.live_execution.clone(),
        );
        let selection = AssetSelectionEngine::new(ctx.crypto_data.clone(), ctx.stock_data.clone());
        let runner = Arc::new(DagRunner::new(ctx.clone()));
        Self {
            ctx,
            confirmations,
            preflight,
            selection,
            runner,
        }
    }

    pub async fn handle(
        &self,
        request: &CommandRequest,
        tenant_id: &str,
        request_id: &str,
    ) -> Result<CommandReply> {
        let text = request.text.trim().to_string();
        let text_upper = text.to_uppercase();

        // Short-circuit confirm/cancel before classification
        if text_upper == "CONFIRM" || text_upper == "CONFIRM LIVE" {
            return self.handle_confirm(request, tenant_id, request_id).await;
        }
        if text_upper == "CANCEL" {
            return self.handle_cancel(request, tenant_id).await;
        }

        let intent = classify_intent(&text);
        info!("intent_classified: intent={} req={}", intent, request_id);

        match intent {
            IntentType::Greeting => Ok(CommandReply::ok(templates::greeting_response())),
            IntentType::CapabilitiesHelp => Ok(CommandReply::ok(templates::capabilities_response())),
            IntentType::OutOfScope => Ok(CommandReply::ok(templates::out_of_scope_response())),
            IntentType::AppDiagnostics => {
                Ok(CommandReply::ok(templates::app_diagnostics_response()))
            }
            IntentType::TradeExecution => {
                self.handle_trade(request, &text, tenant_id, request_id).await
            }
            IntentType::PortfolioAnalysis => {
                self.handle_portfolio_analysis(request, &text, tenant_id).await
            }
            IntentType::Portfolio | IntentType::FinanceAnalysis => {
                self.handle_portfolio_snapshot(intent, tenant_id).await
            }
        }
    }

    async fn resolve_confirmation(
        &self,
        request: &CommandRequest,
        tenant_id: &str,
    ) -> Result<Option<Confirmation>> {
        if let Some(confirmation_id) = &request.confirmation_id {
            info!(
                "Confirm received via confirmation_id={}, tenant={}",
                confirmation_id, tenant_id
            );
            return self.confirmations.get_by_id(tenant_id, confirmation_id).await;
        }
        if let Some(conversation_id) = &request.conversation_id {
            let found = self
                .confirmations
                .get_latest_pending_for_conversation(tenant_id, conversation_id)
                .await?;
            if let Some(confirmation) = &found {
                info!(
                    "Confirm received via conversation lookup, confirmation_id={}, tenant={}",
                    confirmation.id, tenant_id
                );
            }
            return Ok(found);
        }
        Ok(None)
    }

    async fn handle_confirm(
        &self,
        request: &CommandRequest,
        tenant_id: &str,
        request_id: &str,
    ) -> Result<CommandReply> {
        let Some(confirmation) = self.resolve_confirmation(request, tenant_id).await? else {
            return Ok(CommandReply::ok(templates::no_pending_trade_response()));
        };
        let confirmation_id = confirmation.id.clone();

        // Terminal states replay idempotently
        if confirmation.status != ConfirmationStatus::Pending {
            if confirmation.status == ConfirmationStatus::Confirmed
                && let Some(run_id) = &confirmation.run_id
            {
                return Ok(CommandReply::ok(json!({
                    "run_id": run_id,
                    "status": "EXECUTING",
                    "content": "Confirmation already processed",
                    "confirmation_id": confirmation_id,
                    "intent": "TRADE_EXECUTION",
                })));
            }
            return Ok(CommandReply::ok(json!({
                "content": format!(
                    "This trade confirmation is already {}.",
                    confirmation.status.to_string().to_lowercase()
                ),
                "run_id": null,
                "status": confirmation.status.to_string(),
            })));
        }

        // Global kill switch blocks LIVE confirms outright
        if confirmation.proposal.mode == ExecutionMode::Live && self.ctx.config.trading_disable_live
        {
            return Ok(CommandReply {
                status: 403,
                body: json!({
                    "error": {
                        "code": "LIVE_DISABLED",
                        "message": "LIVE trading is disabled via TRADING_DISABLE_LIVE",
                    },
                }),
            });
        }

        // TTL expiry observed on read
        if confirmation.is_expired(Utc::now()) {
            self.confirmations.mark_expired(tenant_id, &confirmation_id).await?;
            return Ok(CommandReply::ok(templates::pending_trade_expired_response()));
        }

        // The idempotency backbone: exactly one caller wins this CAS.
        let won = self.confirmations.mark_confirmed(tenant_id, &confirmation_id).await?;
        if !won {
            let reloaded = self.confirmations.get_by_id(tenant_id, &confirmation_id).await?;
            if let Some(run_id) = reloaded.and_then(|c| c.run_id) {
                return Ok(CommandReply::ok(json!({
                    "run_id": run_id,
                    "status": "EXECUTING",
                    "content": "Confirmation already processed",
                    "confirmation_id": confirmation_id,
                    "intent": "TRADE_EXECUTION",
                })));
            }
            return Ok(CommandReply::ok(json!({
                "content": "Confirmation already processed",
                "run_id": null,
                "status": "CONFIRMED",
                "confirmation_id": confirmation_id,
            })));
        }

        // Active-run guard: one non-terminal run per tenant
        if let Some(active_run_id) = self.ctx.runs.find_active_for_tenant(tenant_id).await? {
            return Ok(CommandReply {
                status: 409,
                body: json!({
                    "error": {
                        "code": "RUN_ALREADY_ACTIVE",
                        "message": "A trade is currently executing. Wait for it to complete.",
                        "active_run_id": active_run_id,
                    },
                }),
            });
        }

        let proposal = confirmation.proposal.clone();
        let run_id = self.create_trade_run(&proposal, &confirmation_id, tenant_id).await?;
        self.confirmations.set_run_id(&confirmation_id, &run_id).await?;

        // Two-phase: the response is complete before the side effect fires
        let (content, intent_type) = if proposal.asset_class == AssetClass::Stock
            || proposal.mode == ExecutionMode::AssistedLive
        {
            (
                format!(
                    "Confirmed. Generating order ticket for {} ${} of {}...",
                    proposal.side.to_string().to_lowercase(),
                    proposal.amount_usd,
                    proposal.asset
                ),
                "TRADE_TICKET_CREATING",
            )
        } else {
            (
                format!(
                    "Confirmed. Executing {} ${} of {}...",
                    proposal.side.to_string().to_lowercase(),
                    proposal.amount_usd,
                    proposal.asset
                ),
                "TRADE_EXECUTION",
            )
        };
        let reply = CommandReply::ok(json!({
            "run_id": run_id,
            "content": content,
            "intent": intent_type,
            "status": "EXECUTING",
            "confirmation_id": confirmation_id,
            "asset_class": proposal.asset_class.to_string(),
        }));

        info!(
            "confirmation_confirmed: conf={} tenant={} run={} mode={} asset={} req={}",
            confirmation_id, tenant_id, run_id, proposal.mode, proposal.asset, request_id
        );

        // Fire-and-forget: a background failure is logged, never surfaced
        let runner = self.runner.clone();
        let spawned_run_id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.execute_run(&spawned_run_id).await {
                warn!("Background run {} failed: {}", spawned_run_id, e);
            }
        });

        Ok(reply)
    }

    /// Expand a confirmed proposal into a run with its execution plan.
    /// The selection engine is never re-run here; a most-profitable trade
    /// uses the product locked at staging time.
    async fn create_trade_run(
        &self,
        proposal: &TradeProposal,
        confirmation_id: &str,
        tenant_id: &str,
    ) -> Result<String> {
        let locked_product_id = proposal
            .locked_product_id
            .clone()
            .or_else(|| Some(to_product_id(&proposal.asset)));
        let universe = vec![
            locked_product_id
                .clone()
                .unwrap_or_else(|| to_product_id(&proposal.asset)),
        ];

        let window = if proposal.lookback_hours <= 1.0 {
            "1h".to_string()
        } else if proposal.lookback_hours <= 24.0 {
            "24h".to_string()
        } else if proposal.lookback_hours <= 168.0 {
            format!("{}h", proposal.lookback_hours as i64)
        } else {
            "7d".to_string()
        };

        let raw_command = format!(
            "Confirmed {} trade: {} ${} of {}",
            proposal.mode,
            proposal.side.to_string().to_lowercase(),
            proposal.amount_usd,
            proposal.asset
        );

        let run_id = self
            .ctx
            .runs
            .create(&NewRun {
                tenant_id: tenant_id.to_string(),
                execution_mode: proposal.mode,
                source_run_id: None,
                asset_class: match proposal.asset_class {
                    AssetClass::Ambiguous => AssetClass::Crypto,
                    other => other,
                },
                news_enabled: proposal.news_enabled,
                locked_product_id: locked_product_id.clone(),
                tradability_verified: proposal.tradability_verified,
                command_text: raw_command.clone(),
                intent: "TRADE_EXECUTION".to_string(),
            })
            .await?;

        let trade_intent = TradeIntent {
            side: proposal.side,
            budget_usd: proposal.amount_usd,
            universe,
            raw_command,
            metric: "return".to_string(),
            window,
            lookback_hours: proposal.lookback_hours,
        };
        let mut plan = plan_execution(trade_intent, &run_id);

        // Direct-asset trades arrive pre-selected; strategy keeps them.
        if let Some(product_id) = &locked_product_id {
            plan.selected_asset = Some(product_id.clone());
            plan.selected_order = Some(SelectedOrder {
                symbol: product_id.clone(),
                side: proposal.side,
                notional_usd: proposal.amount_usd,
            });
        }
        self.ctx.runs.set_execution_plan(&run_id, &plan).await?;

        self.ctx
            .runs
            .set_metadata(
                &run_id,
                &json!({
                    "intent": "TRADE_EXECUTION",
                    "confirmed": true,
                    "confirmation_id": confirmation_id,
                    "side": proposal.side.to_string().to_lowercase(),
                    "asset": proposal.asset,
                    "amount_usd": proposal.amount_usd,
                    "mode": proposal.mode.to_string(),
                    "is_most_profitable": proposal.is_most_profitable,
                    "lookback_hours": proposal.lookback_hours,
                    "asset_class": proposal.asset_class.to_string(),
                    "news_enabled": proposal.news_enabled,
                    "auto_sell": proposal.auto_sell,
                }),
            )
            .await?;

        Ok(run_id)
    }

    async fn handle_cancel(
        &self,
        request: &CommandRequest,
        tenant_id: &str,
    ) -> Result<CommandReply> {
        if let Some(confirmation_id) = &request.confirmation_id {
            let cancelled = self.confirmations.mark_cancelled(tenant_id, confirmation_id).await?;
            if cancelled {
                info!(
                    "confirmation_cancelled: confirmation_id={} tenant={}",
                    confirmation_id, tenant_id
                );
            }
        } else if let Some(conversation_id) = &request.conversation_id
            && let Some(confirmation) = self
                .confirmations
                .get_latest_pending_for_conversation(tenant_id, conversation_id)
                .await?
        {
            self.confirmations.mark_cancelled(tenant_id, &confirmation.id).await?;
            info!(
                "confirmation_cancelled via conversation: confirmation_id={} tenant={}",
                confirmation.id, tenant_id
            );
        }
        Ok(CommandReply::ok(templates::trade_cancelled_response()))
    }

    async fn handle_trade(
        &self,
        request: &CommandRequest,
        text: &str,
        tenant_id: &str,
        request_id: &str,
    ) -> Result<CommandReply> {
        let mut parsed = parse_trade_command(text);

        if parsed.is_missing_amount() {
            return Ok(CommandReply::ok(templates::missing_amount_prompt(
                parsed.side.unwrap_or(OrderSide::Buy),
                parsed.asset.as_deref(),
            )));
        }

        if parsed.asset_class == AssetClass::Ambiguous {
            return Ok(CommandReply::ok(json!({
                "content": "I couldn't determine if you want to trade crypto or stocks. Please clarify:\n\n\
- For crypto: 'Buy $50 of BTC' or 'Buy $50 crypto'\n\
- For stocks: 'Buy $50 of AAPL stock' or 'Buy $50 AAPL equity'",
                "run_id": null,
                "intent": "TRADE_EXECUTION_INCOMPLETE",
                "status": "AWAITING_ASSET_CLASS",
            })));
        }

        // "Sell my last purchase" resolves from order history
        if parsed.is_sell_last_purchase {
            match self.ctx.orders.find_last_purchase(tenant_id).await? {
                Some(last) => {
                    info!(
                        "sell_last_purchase resolved to {} for tenant {}",
                        last.product_id, tenant_id
                    );
                    parsed.asset = Some(last.base_symbol);
                    parsed.venue_symbol = Some(last.product_id);
                    parsed.side = Some(OrderSide::Sell);
                    if parsed.amount_usd.is_none() {
                        parsed.amount_usd = Some(last.notional_usd);
                    }
                }
                None => {
                    return Ok(CommandReply::ok(json!({
                        "content": "No recent purchase found to sell. You haven't bought any assets yet.",
                        "run_id": null,
                        "intent": "TRADE_EXECUTION_INCOMPLETE",
                        "status": "REJECTED",
                        "reason_code": "NO_LAST_PURCHASE",
                    })));
                }
            }
        }

        if parsed.is_missing_asset() {
            let (asset_type, examples) = if parsed.asset_class == AssetClass::Stock {
                ("stock", "AAPL, MSFT, NVDA")
            } else {
                ("cryptocurrency", "BTC, ETH, SOL")
            };
            return Ok(CommandReply::ok(json!({
                "content": format!("Which {} do you want to trade? (e.g., {})", asset_type, examples),
                "run_id": null,
                "intent": "TRADE_EXECUTION_INCOMPLETE",
                "status": "AWAITING_INPUT",
            })));
        }

        if parsed.is_most_profitable {
            parsed.asset = Some("AUTO".to_string());
        }
        let asset = parsed.asset.clone().unwrap_or_else(|| "AUTO".to_string());
        let side = parsed.side.unwrap_or(OrderSide::Buy);

        // Base-asset quantities ("0.01 BTC") resolve to USD at the current
        // price; percentage sales resolve from current holdings.
        let mut amount_usd = parsed.amount_usd.unwrap_or(Decimal::ZERO);
        if amount_usd == Decimal::ZERO
            && let Some(base_size) = parsed.base_size
            && let Ok(price) = self.ctx.crypto_data.get_price(&to_product_id(&asset)).await
        {
            amount_usd = (base_size * price).round_dp(2);
        }
        if amount_usd == Decimal::ZERO
            && let Some(pct) = parsed.sell_pct
        {
            amount_usd = self
                .preflight
                .sell_percentage_notional(tenant_id, &asset, pct)
                .await?;
            if amount_usd <= Decimal::ZERO {
                return Ok(CommandReply::ok(json!({
                    "content": format!(
                        "You hold no {} to sell {}% of.",
                        asset, pct
                    ),
                    "run_id": null,
                    "intent": "TRADE_EXECUTION",
                    "status": "REJECTED",
                    "reason_code": "INSUFFICIENT_BALANCE",
                    "asset": asset,
                })));
            }
        }

        // Preflight is the only gate between the parser and confirmation
        let preflight_result = self
            .preflight
            .run(&PreflightRequest {
                tenant_id: tenant_id.to_string(),
                side,
                asset: asset.clone(),
                amount_usd,
                asset_class: parsed.asset_class,
                mode: parsed.mode,
            })
            .await?;

        if !preflight_result.valid {
            let reason_code = preflight_result
                .reason_code
                .map(|r| r.code())
                .unwrap_or("VALIDATION_FAILED");
            let mut body = json!({
                "content": preflight_result.message,
                "run_id": null,
                "intent": "TRADE_EXECUTION",
                "status": "REJECTED",
                "reason_code": reason_code,
                "remediation": preflight_result.remediation,
            });
            match preflight_result.reason_code {
                Some(PreflightRejectReason::MinNotionalTooLow) => {
                    body["requested_notional_usd"] = json!(preflight_result.requested_usd);
                    body["min_notional_usd"] = json!(preflight_result.effective_min_notional);
                    body["estimated_fee"] = json!(preflight_result.estimated_fee);
                }
                Some(PreflightRejectReason::InsufficientBalance)
                | Some(PreflightRejectReason::InsufficientCash) => {
                    body["requested_usd"] = json!(preflight_result.requested_usd);
                    body["available_balance"] = json!(preflight_result.available_balance);
                    body["available_usd"] = json!(preflight_result.available_usd);
                    body["asset"] = json!(asset);
                }
                _ => {}
            }
            return Ok(CommandReply::ok(body));
        }

        // LIVE request under the global kill switch downgrades to PAPER
        let mut mode = parsed.mode;
        if mode == ExecutionMode::Live && self.ctx.config.trading_disable_live {
            mode = ExecutionMode::Paper;
            info!("Downgraded LIVE -> PAPER (trading_disable_live=true): tenant={}", tenant_id);
        }

        // "Most profitable": run the selection engine now and lock the
        // winner into the proposal. Refusals reject before anything is
        // staged; there is no fallback asset.
        let mut selection_result: Option<SelectionResult> = None;
        let mut locked_product_id = parsed.venue_symbol.clone();
        let mut display_asset = asset.clone();
        let mut final_asset = asset.clone();

        if parsed.is_most_profitable {
            let selection_request = SelectionRequest {
                criteria: parsed
                    .selection_criteria
                    .clone()
                    .unwrap_or_else(|| "highest performing".to_string()),
                lookback_hours: parsed.lookback_hours,
                universe_constraint: parsed
                    .universe_constraint
                    .clone()
                    .unwrap_or_else(|| "top_25_volume".to_string()),
                threshold_pct: parsed.threshold_pct,
                asset_class: parsed.asset_class,
            };
            match self.selection.select_asset(&selection_request).await {
                Ok(result) => {
                    final_asset = result.selected_symbol.clone();
                    locked_product_id = Some(result.selected_product_id.clone());
                    display_asset = format!(
                        "{} (top performer, {:+.2}% in {})",
                        result.selected_symbol,
                        result.selected_return_pct,
                        result.window_description
                    );
                    info!(
                        "Asset selection completed: selected={} locked_product_id={} return={:.2}% req={}",
                        result.selected_symbol,
                        result.selected_product_id,
                        result.selected_return_pct,
                        request_id
                    );
                    selection_result = Some(result);
                }
                Err(e @ SelectionError::NoMarketData { .. }) => {
                    warn!("No market data for top performer: {}", e);
                    return Ok(CommandReply::ok(json!({
                        "content": e.to_string(),
                        "run_id": null,
                        "intent": "TRADE_EXECUTION",
                        "status": "REJECTED",
                        "reason_code": "NO_MARKET_DATA",
                    })));
                }
                Err(e @ SelectionError::NoTradeableAsset { .. }) => {
                    warn!("No tradeable asset found: {}", e);
                    return Ok(CommandReply::ok(json!({
                        "content": format!("Order not submitted. No trade was placed. {}", e),
                        "run_id": null,
                        "intent": "TRADE_EXECUTION",
                        "status": "REJECTED",
                        "executed": false,
                        "reason_code": "NO_TRADEABLE_TOP_PERFORMER",
                    })));
                }
                Err(SelectionError::Provider(e)) => {
                    warn!("Asset selection provider failure: {}", e);
                    return Ok(CommandReply::ok(json!({
                        "content": format!(
                            "Unable to reach market data for the {}. No trade was placed.",
                            humanize_window(parsed.lookback_hours)
                        ),
                        "run_id": null,
                        "intent": "TRADE_EXECUTION",
                        "status": "REJECTED",
                        "reason_code": "NO_MARKET_DATA",
                    })));
                }
            }
        }

        // Tradability preflight for LIVE crypto: never offer CONFIRM on a
        // product that cannot be traded.
        let mut tradability_verified = false;
        if mode == ExecutionMode::Live && parsed.asset_class == AssetClass::Crypto {
            let product_to_check = locked_product_id
                .clone()
                .unwrap_or_else(|| to_product_id(&final_asset));
            if self
                .selection
                .verify_product_tradeable(&product_to_check, parsed.asset_class)
                .await
            {
                info!("PREFLIGHT_PASS: {} is tradeable", product_to_check);
                tradability_verified = true;
            } else {
                warn!(
                    "PREFLIGHT_FAIL: {} not tradeable, blocking confirmation",
                    product_to_check
                );
                return Ok(CommandReply::ok(json!({
                    "content": format!(
                        "Order not submitted. No trade was placed. {} is not currently tradeable (product offline or not available for your account).",
                        product_to_check
                    ),
                    "run_id": null,
                    "intent": "TRADE_EXECUTION",
                    "status": "REJECTED",
                    "executed": false,
                    "reason_code": "PRODUCT_NOT_TRADEABLE",
                })));
            }
        }

        // Stage the durable confirmation with everything CONFIRM will need
        let news_enabled = request.news_enabled.unwrap_or(true);
        let proposal = TradeProposal {
            side,
            asset: final_asset.clone(),
            amount_usd,
            mode,
            asset_class: parsed.asset_class,
            lookback_hours: parsed.lookback_hours,
            is_most_profitable: parsed.is_most_profitable,
            news_enabled,
            locked_product_id: locked_product_id.clone(),
            tradability_verified,
            auto_sell: preflight_result.auto_sell_proposal.clone(),
            selection_result: selection_result
                .as_ref()
                .and_then(|r| serde_json::to_value(r).ok()),
        };

        let effective_conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| crate::domain::ids::new_id("eph_"));
        let confirmation_id = self
            .confirmations
            .create_pending(tenant_id, &effective_conversation_id, &proposal, DEFAULT_TTL_SECONDS)
            .await?;

        // Best-effort push for the pending confirmation
        let _ = self
            .ctx
            .notifier
            .notify(NotificationRequest {
                action: "pending_confirmation".to_string(),
                title: format!("{} trade pending", mode),
                message: format!(
                    "{} ${} of {} awaits CONFIRM",
                    side.to_string().to_lowercase(),
                    amount_usd,
                    display_asset
                ),
                run_id: None,
            })
            .await;

        // Pre-confirm insight: deterministic, non-blocking
        let financial_insight = self
            .build_insight(&final_asset, side, amount_usd, selection_result.as_ref())
            .await;
        if let Err(e) = self
            .confirmations
            .update_insight(&confirmation_id, &financial_insight)
            .await
        {
            warn!("Failed to persist pre-confirm insight: {}", e);
        }

        let mut resp = templates::trade_confirmation_prompt(
            side,
            &display_asset,
            amount_usd,
            mode,
            parsed.asset_class,
            &confirmation_id,
        );
        resp["financial_insight"] = financial_insight;
        if let Some(result) = &selection_result {
            resp["selection_result"] = serde_json::to_value(result)?;
        }
        if let Some(auto_sell) = &preflight_result.auto_sell_proposal {
            resp["auto_sell_proposal"] = serde_json::to_value(auto_sell)?;
            let existing = resp["content"].as_str().unwrap_or_default().to_string();
            resp["content"] = json!(format!(
                "{}\n\nNote: Insufficient cash - will auto-sell ${} of {} first to fund this trade.",
                existing, auto_sell.sell_amount_usd, auto_sell.sell_base_symbol
            ));
        }

        Ok(CommandReply::ok(resp))
    }

    /// Deterministic pre-confirm insight built from live data already at
    /// hand. Falls back to a minimal card when prices are unavailable.
    async fn build_insight(
        &self,
        asset: &str,
        side: OrderSide,
        amount_usd: Decimal,
        selection: Option<&SelectionResult>,
    ) -> Value {
        let product_id = to_product_id(asset);
        let price = self.ctx.crypto_data.get_price(&product_id).await.ok();

        let mut key_facts = Vec::new();
        if let Some(price) = price {
            key_facts.push(json!(format!("Current {} price: ${}", asset, price.round_dp(2))));
        }
        if let Some(selection) = selection {
            key_facts.push(json!(format!(
                "Top performer of the {}: {:+.2}%",
                selection.window_description, selection.selected_return_pct
            )));
            key_facts.push(json!(format!(
                "Ranked above {} other candidate(s)",
                selection.evaluated_count.saturating_sub(1)
            )));
        }

        if key_facts.is_empty() {
            return json!({
                "headline": "Market insight temporarily unavailable",
                "why_it_matters": "Unable to retrieve market data. Proceed with caution.",
                "key_facts": [],
                "risk_flags": [],
                "confidence": 0.0,
                "generated_by": "fallback",
            });
        }

        let risk_flags: Vec<Value> = if amount_usd > self.ctx.config.max_notional_per_order_usd {
            vec![json!("Order exceeds the configured per-order notional cap")]
        } else {
            Vec::new()
        };

        json!({
            "headline": format!("{} ${} of {}", side, amount_usd, asset),
            "why_it_matters": "Numbers below are computed from live market data recorded for this proposal.",
            "key_facts": key_facts,
            "risk_flags": risk_flags,
            "confidence": selection.map(|s| s.ranking_confidence).unwrap_or(0.6),
            "generated_by": "deterministic",
        })
    }

    async fn handle_portfolio_analysis(
        &self,
        request: &CommandRequest,
        text: &str,
        tenant_id: &str,
    ) -> Result<CommandReply> {
        let queried_asset = if is_holdings_query(text) {
            extract_holdings_asset(text)
        } else {
            None
        };
        let execution_mode = self.ctx.config.resolve_execution_mode();
        info!(
            "Portfolio analysis using mode: {}, queried_asset: {:?}",
            execution_mode, queried_asset
        );

        let run_id = self
            .ctx
            .runs
            .create(&NewRun {
                tenant_id: tenant_id.to_string(),
                execution_mode,
                source_run_id: None,
                asset_class: AssetClass::Crypto,
                news_enabled: request.news_enabled.unwrap_or(true),
                locked_product_id: None,
                tradability_verified: false,
                command_text: text.to_string(),
                intent: "PORTFOLIO_ANALYSIS".to_string(),
            })
            .await?;
        self.ctx
            .runs
            .set_metadata(
                &run_id,
                &json!({
                    "intent": "PORTFOLIO_ANALYSIS",
                    "command_text": text,
                    "queried_asset": queried_asset,
                }),
            )
            .await?;
        self.ctx.runs.mark_running(&run_id).await?;

        // The portfolio node runs synchronously so the brief lands in this
        // response; eval grading happens in the background afterwards.
        let node_id = self
            .ctx
            .dag_nodes
            .start(&run_id, "portfolio", &json!({"queried_asset": queried_asset}))
            .await?;
        self.ctx
            .events
            .emit(&run_id, "STARTED", &json!({"step": "portfolio"}))
            .await;

        let node_result =
            crate::application::orchestrator::nodes::portfolio::execute(&self.ctx, &run_id, &node_id, tenant_id)
                .await;

        let outputs = match node_result {
            Ok(outputs) => {
                let summary = outputs
                    .get("safe_summary")
                    .and_then(|v| v.as_str())
                    .unwrap_or("completed")
                    .to_string();
                self.ctx.dag_nodes.complete(&node_id, &outputs).await?;
                self.ctx
                    .events
                    .emit(&run_id, "FINISHED", &json!({"step": "portfolio", "summary": summary}))
                    .await;
                outputs
            }
            Err(e) => {
                self.ctx.dag_nodes.fail(&node_id, &e.to_string()).await?;
                self.ctx
                    .runs
                    .mark_failed(&run_id, "PORTFOLIO_ANALYSIS_FAILED", &e.to_string())
                    .await?;
                return Ok(CommandReply::ok(json!({
                    "content": "Portfolio analysis failed.",
                    "run_id": run_id,
                    "intent": "PORTFOLIO_ANALYSIS",
                    "status": "FAILED",
                })));
            }
        };

        let brief = outputs.get("portfolio_brief").cloned().unwrap_or(json!({}));
        let success = outputs.get("success").and_then(|v| v.as_bool()).unwrap_or(false);

        if !success {
            self.ctx
                .runs
                .mark_failed(&run_id, "PORTFOLIO_ANALYSIS_FAILED", "brief carries a failure")
                .await?;
            let failure = brief.get("failure").cloned().unwrap_or(json!({}));
            return Ok(CommandReply::ok(json!({
                "content": failure
                    .get("error_message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Portfolio analysis failed"),
                "run_id": run_id,
                "intent": "PORTFOLIO_ANALYSIS",
                "status": "FAILED",
                "portfolio_brief": brief,
                "suggested_action": failure.get("suggested_action").cloned().unwrap_or(json!("")),
            })));
        }

        self.ctx.runs.mark_completed(&run_id).await?;

        // Background eval grading for the analysis run
        let eval_ctx = self.ctx.clone();
        let eval_run_id = run_id.clone();
        let eval_tenant = tenant_id.to_string();
        tokio::spawn(async move {
            let node_id = match eval_ctx
                .dag_nodes
                .start(&eval_run_id, "eval", &json!({}))
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    warn!("Failed to start eval node for {}: {}", eval_run_id, e);
                    return;
                }
            };
            match crate::application::orchestrator::nodes::eval::execute(
                &eval_ctx,
                &eval_run_id,
                &node_id,
                &eval_tenant,
            )
            .await
            {
                Ok(outputs) => {
                    let _ = eval_ctx.dag_nodes.complete(&node_id, &outputs).await;
                }
                Err(e) => {
                    warn!("Eval node failed for {}: {}", eval_run_id, e);
                    let _ = eval_ctx.dag_nodes.fail(&node_id, &e.to_string()).await;
                }
            }
        });

        // Safe primary response; the endpoint formatter may upgrade it
        let total_value = brief
            .get("total_value_usd")
            .and_then(|v| {
                v.as_f64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or(0.0);
        let mode_str = brief
            .get("mode")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| execution_mode.to_string());

        // Best-effort push
        let _ = self
            .ctx
            .notifier
            .notify(NotificationRequest {
                action: "portfolio_analysis".to_string(),
                title: format!("Portfolio analysis ({})", mode_str),
                message: format!("Total value: ${:.2}", total_value),
                run_id: Some(run_id.clone()),
            })
            .await;

        Ok(CommandReply::ok(json!({
            "content": format!("Portfolio analysis complete. Total value: ${:.2}", total_value),
            "run_id": run_id,
            "intent": "PORTFOLIO_ANALYSIS",
            "status": "COMPLETED",
            "portfolio_brief": brief,
            "queried_asset": queried_asset,
        })))
    }

    async fn handle_portfolio_snapshot(
        &self,
        intent: IntentType,
        tenant_id: &str,
    ) -> Result<CommandReply> {
        let mode = self.ctx.config.resolve_execution_mode();
        let snapshot = self.ctx.portfolio.latest_snapshot(tenant_id).await?;

        let Some(snapshot) = snapshot else {
            let content = if mode == ExecutionMode::Live {
                "No portfolio data found. Try 'Analyze my portfolio' to fetch your live holdings."
            } else {
                "No portfolio data found yet. Execute a trade first to create portfolio snapshots, or configure Coinbase API credentials for live data."
            };
            return Ok(CommandReply::ok(json!({
                "content": content,
                "run_id": null,
                "intent": intent.to_string(),
                "status": "COMPLETED",
            })));
        };

        Ok(CommandReply::ok(json!({
            "run_id": null,
            "intent": intent.to_string(),
            "status": "COMPLETED",
            "portfolio_snapshot": {
                "mode": mode.to_string(),
                "balances": snapshot.balances,
                "positions": snapshot.positions,
                "total_value_usd": snapshot.total_value_usd,
                "ts": snapshot.ts.to_rfc3339(),
            },
        })))
    }
}
