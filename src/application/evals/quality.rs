//! Quality evaluators: ranking and plan correctness, UX completeness, and
//! the oracle comparison against frozen candles.

use super::{EvalContext, EvalOutcome, Evaluator};
use crate::domain::types::{ExecutionMode, compute_return_pct};
use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;

/// The chosen symbol must be #1 in the stored rankings.
pub struct RankingCorrectness;

impl Evaluator for RankingCorrectness {
    fn name(&self) -> &'static str {
        "ranking_correctness"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(strategy) = ctx.node_outputs.get("strategy") else {
            if ctx.is_trade_run() {
                return Ok(EvalOutcome::fail("Strategy node output not found"));
            }
            return Ok(EvalOutcome::skipped("No strategy stage for this run type"));
        };
        let Some(chosen) = strategy.get("top_symbol").and_then(|v| v.as_str()) else {
            return Ok(EvalOutcome::fail("No chosen symbol in strategy output"));
        };

        let Some(ranking) = &ctx.ranking else {
            return Ok(EvalOutcome::score(0.5, "Rankings table missing; cannot verify"));
        };
        let Some(top_ranked) = ranking.table.first() else {
            return Ok(EvalOutcome::score(0.5, "Rankings table empty; cannot verify"));
        };

        if top_ranked.symbol == chosen && ranking.selected_symbol == chosen {
            Ok(EvalOutcome::pass(format!(
                "Chosen {} matches top-ranked symbol",
                chosen
            )))
        } else {
            Ok(EvalOutcome::fail(format!(
                "Mismatch: chosen {} vs top-ranked {}",
                chosen, top_ranked.symbol
            )))
        }
    }
}

/// Oracle eval: recompute the top performer from frozen candle batches and
/// grade the agent's choice against it.
pub struct ProfitRankingCorrectness;

impl Evaluator for ProfitRankingCorrectness {
    fn name(&self) -> &'static str {
        "profit_ranking_correctness"
    }
    fn category(&self) -> &'static str {
        "quality"
    }
    fn evaluator_type(&self) -> &'static str {
        "oracle"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        if ctx.batches.is_empty() {
            return Ok(EvalOutcome::score(0.5, "no oracle comparison possible"));
        }
        let Some(chosen) = ctx
            .node_outputs
            .get("strategy")
            .and_then(|s| s.get("top_symbol"))
            .and_then(|v| v.as_str())
        else {
            return Ok(EvalOutcome::score(0.5, "No strategy choice to compare"));
        };

        // Oracle: return recomputed from the frozen evidence
        let mut oracle: Vec<(String, f64)> = ctx
            .batches
            .iter()
            .filter(|b| b.candles.len() >= 2)
            .map(|b| (b.symbol.clone(), compute_return_pct(&b.candles)))
            .collect();
        if oracle.is_empty() {
            return Ok(EvalOutcome::score(0.5, "no oracle comparison possible"));
        }
        oracle.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let oracle_top = oracle[0].0.clone();
        let top3: Vec<&str> = oracle.iter().take(3).map(|(s, _)| s.as_str()).collect();

        if oracle_top == chosen {
            Ok(EvalOutcome::pass(format!(
                "Agent choice {} matches the oracle top performer",
                chosen
            ))
            .with_details(json!({"oracle_top3": top3})))
        } else if top3.contains(&chosen) {
            Ok(EvalOutcome::score(
                0.5,
                format!("Agent choice {} is in the oracle top 3 (oracle top: {})", chosen, oracle_top),
            )
            .with_details(json!({"oracle_top3": top3})))
        } else {
            Ok(EvalOutcome::fail(format!(
                "Agent choice {} not in oracle top 3 (oracle top: {})",
                chosen, oracle_top
            ))
            .with_details(json!({"oracle_top3": top3})))
        }
    }
}

pub struct PlanCompleteness;

impl Evaluator for PlanCompleteness {
    fn name(&self) -> &'static str {
        "plan_completeness"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        let Some(plan) = &ctx.plan else {
            return Ok(EvalOutcome::fail("Trade run has no execution plan"));
        };

        let mut missing = Vec::new();
        if plan.strategy_spec.universe.is_empty() {
            missing.push("universe");
        }
        if plan.strategy_spec.metric.is_empty() {
            missing.push("metric");
        }
        if plan.decision_trace.is_empty() {
            missing.push("decision_trace");
        }
        if plan.selected_order.is_none() {
            missing.push("selected_order");
        }

        if missing.is_empty() {
            Ok(EvalOutcome::pass("Execution plan carries all required sections"))
        } else {
            let score = 1.0 - 0.25 * missing.len() as f64;
            Ok(EvalOutcome::score(score, format!("Plan missing: {}", missing.join(", "))))
        }
    }
}

/// Every executed step needs STARTED and FINISHED events with summaries.
pub struct UxCompleteness;

impl Evaluator for UxCompleteness {
    fn name(&self) -> &'static str {
        "ux_completeness"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.node_timings.is_empty() {
            return Ok(EvalOutcome::skipped("No dag nodes executed"));
        }

        let started: Vec<&str> = ctx
            .events
            .iter()
            .filter(|(kind, _)| kind == "STARTED")
            .filter_map(|(_, payload)| payload.get("step").and_then(|v| v.as_str()))
            .collect();
        let finished: Vec<(&str, bool)> = ctx
            .events
            .iter()
            .filter(|(kind, _)| kind == "FINISHED")
            .filter_map(|(_, payload)| {
                Some((
                    payload.get("step").and_then(|v| v.as_str())?,
                    payload
                        .get("summary")
                        .and_then(|v| v.as_str())
                        .map(|s| !s.is_empty())
                        .unwrap_or(false),
                ))
            })
            .collect();

        let mut missing = Vec::new();
        for (name, _, completed_at) in &ctx.node_timings {
            if completed_at.is_none() {
                continue;
            }
            if !started.contains(&name.as_str()) {
                missing.push(format!("{} missing STARTED", name));
            }
            match finished.iter().find(|(step, _)| step == name) {
                Some((_, true)) => {}
                Some((_, false)) => missing.push(format!("{} FINISHED without summary", name)),
                None => missing.push(format!("{} missing FINISHED", name)),
            }
        }

        if missing.is_empty() {
            Ok(EvalOutcome::pass("Every executed step emitted STARTED and FINISHED with summaries"))
        } else {
            let score = 1.0 - missing.len() as f64 / (ctx.node_timings.len() as f64 * 2.0);
            Ok(EvalOutcome::score(score, missing.join("; ")))
        }
    }
}

/// The structured intent must reflect the command text.
pub struct IntentParseCorrectness;

impl Evaluator for IntentParseCorrectness {
    fn name(&self) -> &'static str {
        "intent_parse_correctness"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        let Some(plan) = &ctx.plan else {
            return Ok(EvalOutcome::fail("No plan to compare against the command"));
        };

        let text = ctx.run.command_text.to_lowercase();
        let side = plan.trade_intent.side.to_string().to_lowercase();
        let mut checks = 0;
        let mut passed = 0;

        if text.contains("buy") || text.contains("sell") {
            checks += 1;
            if text.contains(&side) {
                passed += 1;
            }
        }
        if text.contains("live") {
            checks += 1;
            if ctx.run.execution_mode == ExecutionMode::Live
                || ctx.run.execution_mode == ExecutionMode::AssistedLive
            {
                passed += 1;
            }
        }
        if checks == 0 {
            return Ok(EvalOutcome::skipped("Command text gives nothing to verify"));
        }

        let score = passed as f64 / checks as f64;
        Ok(EvalOutcome::score(
            score,
            format!("{}/{} parse assertions hold against the command text", passed, checks),
        ))
    }
}

/// The dollar amount in the command must match the planned budget.
pub struct TradeAmountIntentCorrectness;

impl Evaluator for TradeAmountIntentCorrectness {
    fn name(&self) -> &'static str {
        "trade_amount_intent_correctness"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(plan) = &ctx.plan else {
            return Ok(EvalOutcome::skipped("No execution plan"));
        };

        // First $amount in the stored command text
        let text = &ctx.run.command_text;
        let Some(dollar_pos) = text.find('$') else {
            return Ok(EvalOutcome::skipped("Command text has no dollar amount"));
        };
        let amount_str: String = text[dollar_pos + 1..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let Ok(commanded) = amount_str.parse::<f64>() else {
            return Ok(EvalOutcome::skipped("Dollar amount in command is unparseable"));
        };

        let planned = plan.trade_intent.budget_usd.to_f64().unwrap_or(0.0);
        if (commanded - planned).abs() < 0.01 {
            Ok(EvalOutcome::pass(format!("Planned budget ${} matches the command", planned)))
        } else {
            Ok(EvalOutcome::fail(format!(
                "Command asked for ${} but the plan budgets ${}",
                commanded, planned
            )))
        }
    }
}

/// Orders placed must match the proposal that justified them.
pub struct ActionGrounding;

impl Evaluator for ActionGrounding {
    fn name(&self) -> &'static str {
        "action_grounding"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.orders.is_empty() {
            return Ok(EvalOutcome::skipped("No orders to ground"));
        }
        let Some(proposal) = &ctx.trade_proposal else {
            return Ok(EvalOutcome::fail("Orders exist but no trade proposal is stored"));
        };

        let symbol = proposal.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
        let side = proposal.get("side").and_then(|v| v.as_str()).unwrap_or("");

        let grounded = ctx
            .orders
            .iter()
            .any(|o| o.symbol == symbol && o.side.to_string() == side);
        if grounded {
            Ok(EvalOutcome::pass(format!(
                "Order matches the proposal: {} {}",
                side, symbol
            )))
        } else {
            Ok(EvalOutcome::fail(format!(
                "No order matches the proposal {} {}",
                side, symbol
            )))
        }
    }
}

/// BUY/SELL proposals need at least two evidence items.
pub struct EvidenceSufficiency;

impl Evaluator for EvidenceSufficiency {
    fn name(&self) -> &'static str {
        "evidence_sufficiency"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(proposal) = &ctx.trade_proposal else {
            if ctx.is_trade_run() && !ctx.orders.is_empty() {
                return Ok(EvalOutcome::fail("Executed trade has no stored proposal"));
            }
            return Ok(EvalOutcome::skipped("No trade proposal on run"));
        };

        let count = proposal
            .get("evidence")
            .and_then(|v| v.as_array())
            .map(|e| e.len())
            .unwrap_or(0);
        if count >= 2 {
            Ok(EvalOutcome::pass(format!("Proposal carries {} evidence items", count))
                .with_thresholds(json!({"min_evidence": 2})))
        } else {
            Ok(EvalOutcome::score(
                count as f64 / 2.0,
                format!("Proposal carries {} evidence item(s), need 2", count),
            )
            .with_thresholds(json!({"min_evidence": 2})))
        }
    }
}

pub struct StrategyValidity;

impl Evaluator for StrategyValidity {
    fn name(&self) -> &'static str {
        "strategy_validity"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if !ctx.is_trade_run() {
            return Ok(EvalOutcome::skipped("Not a trade run"));
        }
        let Some(decision) = ctx.artifact("strategy_decision") else {
            return Ok(EvalOutcome::fail("No strategy_decision artifact"));
        };
        let chosen = decision.get("chosen_asset").and_then(|v| v.as_str());
        let planned = ctx.plan.as_ref().and_then(|p| p.selected_asset.as_deref());

        match (chosen, planned) {
            (Some(chosen), Some(planned)) if chosen == planned => Ok(EvalOutcome::pass(format!(
                "strategy_decision and execution plan agree on {}",
                chosen
            ))),
            (Some(chosen), Some(planned)) => Ok(EvalOutcome::fail(format!(
                "strategy_decision chose {} but the plan selected {}",
                chosen, planned
            ))),
            _ => Ok(EvalOutcome::score(0.5, "Cannot compare strategy decision to plan")),
        }
    }
}

/// Node outputs must carry human-readable safe summaries.
pub struct ResponseFormatScore;

impl Evaluator for ResponseFormatScore {
    fn name(&self) -> &'static str {
        "response_format_score"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.node_outputs.is_empty() {
            return Ok(EvalOutcome::skipped("No node outputs recorded"));
        }
        let graded: Vec<(&String, bool)> = ctx
            .node_outputs
            .iter()
            .filter(|(name, _)| name.as_str() != "eval")
            .map(|(name, outputs)| {
                let ok = outputs
                    .get("safe_summary")
                    .and_then(|v| v.as_str())
                    .map(|s| !s.is_empty())
                    .unwrap_or(false);
                (name, ok)
            })
            .collect();
        if graded.is_empty() {
            return Ok(EvalOutcome::skipped("No gradable node outputs"));
        }
        let with_summary = graded.iter().filter(|(_, ok)| *ok).count();
        let score = with_summary as f64 / graded.len() as f64;
        Ok(EvalOutcome::score(
            score,
            format!("{}/{} node outputs carry a safe summary", with_summary, graded.len()),
        ))
    }
}

pub struct RunStateConsistency;

impl Evaluator for RunStateConsistency {
    fn name(&self) -> &'static str {
        "run_state_consistency"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let mut issues = Vec::new();
        if ctx.run.status.is_terminal() && ctx.run.completed_at.is_none() {
            issues.push("terminal run without completed_at".to_string());
        }
        if ctx.run.status == crate::domain::types::RunStatus::Failed
            && ctx.run.failure_code.is_none()
        {
            issues.push("FAILED run without a failure_code".to_string());
        }
        if ctx.run.status == crate::domain::types::RunStatus::Completed
            && ctx.run.failure_code.is_some()
        {
            issues.push("COMPLETED run carries a failure_code".to_string());
        }

        if issues.is_empty() {
            Ok(EvalOutcome::pass("Run state fields are mutually consistent"))
        } else {
            Ok(EvalOutcome::fail(issues.join("; ")))
        }
    }
}

/// REPLAY runs must reproduce the source run's selection.
pub struct DeterminismReplay;

impl Evaluator for DeterminismReplay {
    fn name(&self) -> &'static str {
        "determinism_replay"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        if ctx.run.execution_mode != ExecutionMode::Replay {
            return Ok(EvalOutcome::skipped("Not a REPLAY run"));
        }
        let replayed = ctx
            .node_outputs
            .get("research")
            .and_then(|o| o.get("replayed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !replayed {
            return Ok(EvalOutcome::fail("REPLAY run fetched instead of replaying artifacts"));
        }

        // The replayed brief must still drive the same selection
        let brief_top = ctx
            .artifact("financial_brief")
            .and_then(|b| b.pointer("/ranked_assets/0/product_id"))
            .and_then(|v| v.as_str());
        let chosen = ctx
            .node_outputs
            .get("strategy")
            .and_then(|s| s.get("top_symbol"))
            .and_then(|v| v.as_str());

        match (brief_top, chosen) {
            (Some(expected), Some(actual)) if expected == actual => Ok(EvalOutcome::pass(
                format!("Replay reproduced the source selection {}", actual),
            )),
            (Some(expected), Some(actual)) => Ok(EvalOutcome::fail(format!(
                "Replay diverged: source top {} vs replayed {}",
                expected, actual
            ))),
            _ => Ok(EvalOutcome::score(0.5, "Replay artifacts incomplete; cannot compare")),
        }
    }
}
