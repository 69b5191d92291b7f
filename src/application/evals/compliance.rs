//! Compliance evaluators: policy adherence, order truthfulness,
//! idempotency, and the LIVE trading invariants.

use super::{EvalContext, EvalOutcome, Evaluator};
use crate::domain::types::ExecutionMode;
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::json;
use std::collections::HashSet;

pub struct PolicyCompliance;

impl Evaluator for PolicyCompliance {
    fn name(&self) -> &'static str {
        "policy_compliance"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        match ctx.policy_decision.as_deref() {
            Some("BLOCKED") => {
                if ctx.orders.is_empty() {
                    Ok(EvalOutcome::pass("BLOCKED decision honored: zero orders placed"))
                } else {
                    Ok(EvalOutcome::fail(format!(
                        "BLOCKED decision violated: {} order(s) placed",
                        ctx.orders.len()
                    )))
                }
            }
            Some(decision) => Ok(EvalOutcome::pass(format!("Policy decision {} honored", decision))),
            None => Ok(EvalOutcome::score(0.5, "No policy event recorded for trade run")),
        }
    }
}

pub struct PolicyDecisionPresent;

impl Evaluator for PolicyDecisionPresent {
    fn name(&self) -> &'static str {
        "policy_decision_present"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        match &ctx.policy_decision {
            Some(decision) => Ok(EvalOutcome::pass(format!("Policy event present: {}", decision))),
            None => Ok(EvalOutcome::fail("No policy event for trade run")),
        }
    }
}

/// FILLED means really filled: positive quantity and positive price.
pub struct LiveTradeTruthfulness;

impl Evaluator for LiveTradeTruthfulness {
    fn name(&self) -> &'static str {
        "live_trade_truthfulness"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let filled: Vec<_> = ctx
            .orders
            .iter()
            .filter(|o| o.status.eq_ignore_ascii_case("FILLED"))
            .collect();
        if filled.is_empty() {
            return Ok(EvalOutcome::skipped("No filled orders to verify"));
        }

        let mut violations = Vec::new();
        for order in &filled {
            let qty_ok = order.filled_qty.map(|q| q > Decimal::ZERO).unwrap_or(false);
            let price_ok = order
                .avg_fill_price
                .map(|p| p > Decimal::ZERO)
                .unwrap_or(false);
            if !qty_ok || !price_ok {
                violations.push(format!(
                    "{}: FILLED with qty={:?} price={:?}",
                    order.order_id, order.filled_qty, order.avg_fill_price
                ));
            }
        }

        if violations.is_empty() {
            Ok(EvalOutcome::pass(format!(
                "{} filled order(s) carry positive qty and price",
                filled.len()
            )))
        } else {
            Ok(EvalOutcome::fail(violations.join("; ")))
        }
    }
}

/// The execution node's claim must match the orders table.
pub struct OrderSubmissionTruthfulness;

impl Evaluator for OrderSubmissionTruthfulness {
    fn name(&self) -> &'static str {
        "order_submission_truthfulness"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(outputs) = ctx.node_outputs.get("execution") else {
            return Ok(EvalOutcome::skipped("No execution node output"));
        };
        let claimed = outputs
            .get("order_placed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let actual = !ctx.orders.is_empty();

        if claimed == actual {
            Ok(EvalOutcome::pass(format!(
                "Execution claim matches the ledger (order_placed={})",
                claimed
            )))
        } else {
            Ok(EvalOutcome::fail(format!(
                "Execution claimed order_placed={} but ledger has {} order(s)",
                claimed,
                ctx.orders.len()
            )))
        }
    }
}

/// No duplicate client order ids and no duplicated (symbol, side) legs.
pub struct ConfirmTradeIdempotency;

impl Evaluator for ConfirmTradeIdempotency {
    fn name(&self) -> &'static str {
        "confirm_trade_idempotency"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.orders.is_empty() {
            return Ok(EvalOutcome::skipped("No orders to check"));
        }

        let mut client_ids = HashSet::new();
        let mut legs = HashSet::new();
        let mut duplicates = Vec::new();

        for order in &ctx.orders {
            if !client_ids.insert(order.client_order_id.clone()) {
                duplicates.push(format!("duplicate client_order_id {}", order.client_order_id));
            }
            if !legs.insert((order.symbol.clone(), order.side)) {
                duplicates.push(format!("duplicate leg {} {}", order.side, order.symbol));
            }
        }

        if duplicates.is_empty() {
            Ok(EvalOutcome::pass("No duplicate orders for this run"))
        } else {
            Ok(EvalOutcome::fail(duplicates.join("; ")))
        }
    }
}

/// The notional executed must not be silently reduced beyond 5% of the
/// proposed notional.
pub struct InsufficientBalanceTruthfulness;

impl Evaluator for InsufficientBalanceTruthfulness {
    fn name(&self) -> &'static str {
        "insufficient_balance_truthfulness"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(proposal) = &ctx.trade_proposal else {
            return Ok(EvalOutcome::skipped("No trade proposal on run"));
        };
        let Some(proposed) = proposal
            .get("notional_usd")
            .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        else {
            return Ok(EvalOutcome::skipped("Proposal carries no notional"));
        };
        let proposal_symbol = proposal.get("symbol").and_then(|v| v.as_str()).unwrap_or("");

        let Some(order) = ctx.orders.iter().find(|o| o.symbol == proposal_symbol) else {
            return Ok(EvalOutcome::skipped("No order matching the proposal symbol"));
        };

        let executed = order.notional_usd.to_f64().unwrap_or(0.0);
        if proposed <= 0.0 {
            return Ok(EvalOutcome::skipped("Proposal notional is zero"));
        }
        let reduction = (proposed - executed) / proposed;

        if reduction > 0.05 {
            Ok(EvalOutcome::fail(format!(
                "Notional silently reduced {:.1}%: proposed ${:.2}, executed ${:.2}",
                reduction * 100.0,
                proposed,
                executed
            ))
            .with_thresholds(json!({"max_silent_reduction": 0.05})))
        } else {
            Ok(EvalOutcome::pass(format!(
                "Executed notional ${:.2} within 5% of proposed ${:.2}",
                executed, proposed
            ))
            .with_thresholds(json!({"max_silent_reduction": 0.05})))
        }
    }
}

/// A failed risk review must stop execution.
pub struct RiskGateCompliance;

impl Evaluator for RiskGateCompliance {
    fn name(&self) -> &'static str {
        "risk_gate_compliance"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(risk) = ctx.node_outputs.get("risk") else {
            return Ok(EvalOutcome::skipped("No risk node output"));
        };
        let approved = risk
            .pointer("/risk_analysis/approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        if approved {
            return Ok(EvalOutcome::pass("Risk review approved the order"));
        }
        if ctx.orders.is_empty() {
            Ok(EvalOutcome::pass("Risk review failed and no orders were placed"))
        } else {
            Ok(EvalOutcome::fail(format!(
                "Risk review failed but {} order(s) were placed",
                ctx.orders.len()
            )))
        }
    }
}

/// Orders stay within the confirmed budget.
pub struct BudgetCompliance;

impl Evaluator for BudgetCompliance {
    fn name(&self) -> &'static str {
        "budget_compliance"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(plan) = &ctx.plan else {
            return Ok(EvalOutcome::skipped("No execution plan"));
        };
        if ctx.orders.is_empty() {
            return Ok(EvalOutcome::skipped("No orders to check"));
        }

        let budget = plan.trade_intent.budget_usd;
        // Auto-sell legs recycle funds and are excluded from the budget cap
        let tolerance = budget * Decimal::from_f64(0.01).unwrap_or_default();
        let over: Vec<_> = ctx
            .orders
            .iter()
            .filter(|o| o.side == plan.trade_intent.side && o.notional_usd > budget + tolerance)
            .collect();

        if over.is_empty() {
            Ok(EvalOutcome::pass(format!("All orders within the ${} budget", budget)))
        } else {
            Ok(EvalOutcome::fail(format!(
                "{} order(s) exceed the ${} budget",
                over.len(),
                budget
            )))
        }
    }
}

/// LIVE runs that placed orders must carry the verified-tradability flag.
pub struct TradabilityPreflightPass;

impl Evaluator for TradabilityPreflightPass {
    fn name(&self) -> &'static str {
        "tradability_preflight_pass"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.run.execution_mode != ExecutionMode::Live {
            return Ok(EvalOutcome::skipped("Not a LIVE run"));
        }
        if ctx.orders.is_empty() {
            return Ok(EvalOutcome::skipped("LIVE run placed no orders"));
        }
        if ctx.run.tradability_verified {
            Ok(EvalOutcome::pass("LIVE orders placed with tradability verified"))
        } else {
            Ok(EvalOutcome::fail(
                "LIVE run placed orders without tradability verification",
            ))
        }
    }
}

/// Orders must execute the product locked at staging, never a re-derived
/// one.
pub struct DecisionLockConsistency;

impl Evaluator for DecisionLockConsistency {
    fn name(&self) -> &'static str {
        "decision_lock_consistency"
    }
    fn category(&self) -> &'static str {
        "compliance"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(locked) = &ctx.run.locked_product_id else {
            return Ok(EvalOutcome::skipped("Run has no locked product"));
        };
        if ctx.orders.is_empty() {
            return Ok(EvalOutcome::skipped("No orders to check against the lock"));
        }

        // Auto-sell legs intentionally trade a different product
        let plan_side = ctx.plan.as_ref().map(|p| p.trade_intent.side);
        let mismatched: Vec<_> = ctx
            .orders
            .iter()
            .filter(|o| Some(o.side) == plan_side && o.symbol != *locked)
            .collect();

        if mismatched.is_empty() {
            Ok(EvalOutcome::pass(format!("All primary orders traded the locked product {}", locked)))
        } else {
            Ok(EvalOutcome::fail(format!(
                "{} order(s) traded a product other than the locked {}",
                mismatched.len(),
                locked
            )))
        }
    }
}
