//! Grounding evaluators: every claim and numeric in a derived artifact
//! must trace back to stored evidence.

use super::{EvalContext, EvalOutcome, Evaluator};
use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use std::collections::HashSet;

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '.')
        .filter(|t| t.len() > 1)
        .map(String::from)
        .collect()
}

/// Claim tokens in the proposal rationale must overlap the evidence claims
/// by at least 30%.
pub struct Faithfulness;

impl Evaluator for Faithfulness {
    fn name(&self) -> &'static str {
        "faithfulness"
    }
    fn category(&self) -> &'static str {
        "rag"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(proposal) = &ctx.trade_proposal else {
            return Ok(EvalOutcome::skipped("No trade proposal to check"));
        };
        let rationale = proposal
            .get("rationale")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let evidence_text: String = proposal
            .get("evidence")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|e| e.get("claim").and_then(|c| c.as_str()))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        if rationale.is_empty() || evidence_text.is_empty() {
            return Ok(EvalOutcome::score(0.5, "Rationale or evidence text missing"));
        }

        let rationale_tokens = tokenize(rationale);
        let evidence_tokens = tokenize(&evidence_text);
        let overlap = rationale_tokens.intersection(&evidence_tokens).count();
        let ratio = overlap as f64 / rationale_tokens.len().max(1) as f64;

        if ratio >= 0.3 {
            Ok(EvalOutcome::pass(format!(
                "Rationale overlaps evidence by {:.0}% of tokens",
                ratio * 100.0
            ))
            .with_thresholds(json!({"min_token_overlap": 0.3})))
        } else {
            Ok(EvalOutcome::score(
                ratio / 0.3,
                format!("Rationale overlaps evidence by only {:.0}% of tokens", ratio * 100.0),
            )
            .with_thresholds(json!({"min_token_overlap": 0.3})))
        }
    }
}

/// Weighted intent / specificity / completeness check on the run's
/// user-facing summaries.
pub struct AnswerRelevance;

impl Evaluator for AnswerRelevance {
    fn name(&self) -> &'static str {
        "answer_relevance"
    }
    fn category(&self) -> &'static str {
        "rag"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let summaries: Vec<&str> = ctx
            .node_outputs
            .values()
            .filter_map(|o| o.get("safe_summary").and_then(|v| v.as_str()))
            .collect();
        if summaries.is_empty() {
            return Ok(EvalOutcome::skipped("No summaries to grade"));
        }
        let combined = summaries.join(" ").to_lowercase();
        let command = ctx.run.command_text.to_lowercase();

        // Intent: the summaries speak to what was asked
        let command_tokens = tokenize(&command);
        let summary_tokens = tokenize(&combined);
        let intent_overlap = command_tokens
            .iter()
            .filter(|t| summary_tokens.contains(*t))
            .count() as f64
            / command_tokens.len().max(1) as f64;
        let intent_score = (intent_overlap * 2.0).min(1.0);

        // Specificity: concrete symbols or dollar figures appear
        let specificity_score = if combined.contains('$')
            || ctx
                .plan
                .as_ref()
                .and_then(|p| p.selected_asset.as_ref())
                .map(|s| combined.contains(&s.to_lowercase()))
                .unwrap_or(false)
        {
            1.0
        } else {
            0.3
        };

        // Completeness: a summary exists for every completed step
        let completed_steps = ctx
            .node_timings
            .iter()
            .filter(|(name, _, completed)| completed.is_some() && name != "eval")
            .count();
        let completeness_score = if completed_steps == 0 {
            1.0
        } else {
            (summaries.len() as f64 / completed_steps as f64).min(1.0)
        };

        let score = intent_score * 0.4 + specificity_score * 0.3 + completeness_score * 0.3;
        Ok(EvalOutcome::score(
            score,
            format!(
                "intent {:.2}, specificity {:.2}, completeness {:.2}",
                intent_score, specificity_score, completeness_score
            ),
        )
        .with_thresholds(json!({"weights": {"intent": 0.4, "specificity": 0.3, "completeness": 0.3}})))
    }
}

/// Evidence items must mention the symbol they justify.
pub struct RetrievalRelevance;

impl Evaluator for RetrievalRelevance {
    fn name(&self) -> &'static str {
        "retrieval_relevance"
    }
    fn category(&self) -> &'static str {
        "rag"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(proposal) = &ctx.trade_proposal else {
            return Ok(EvalOutcome::skipped("No trade proposal to check"));
        };
        let symbol = proposal
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let base = crate::domain::symbols::to_base(symbol);
        let Some(evidence) = proposal.get("evidence").and_then(|v| v.as_array()) else {
            return Ok(EvalOutcome::fail("Proposal has no evidence array"));
        };
        if evidence.is_empty() {
            return Ok(EvalOutcome::fail("Proposal evidence is empty"));
        }

        let relevant = evidence
            .iter()
            .filter(|e| {
                e.get("claim")
                    .and_then(|c| c.as_str())
                    .map(|c| c.contains(symbol) || c.contains(&base))
                    .unwrap_or(false)
            })
            .count();
        let score = relevant as f64 / evidence.len() as f64;
        Ok(EvalOutcome::score(
            score,
            format!("{}/{} evidence items mention {}", relevant, evidence.len(), base),
        ))
    }
}

/// Numbers in the trade receipt must match the orders ledger.
pub struct NumericGrounding;

impl Evaluator for NumericGrounding {
    fn name(&self) -> &'static str {
        "numeric_grounding"
    }
    fn category(&self) -> &'static str {
        "rag"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(receipt) = ctx.artifact("trade_receipt") else {
            return Ok(EvalOutcome::skipped("No trade receipt artifact"));
        };
        let Some(receipt_orders) = receipt.get("orders").and_then(|v| v.as_array()) else {
            return Ok(EvalOutcome::fail("Trade receipt has no orders array"));
        };

        let mut mismatches = Vec::new();
        for entry in receipt_orders {
            let Some(order_id) = entry.get("order_id").and_then(|v| v.as_str()) else {
                mismatches.push("receipt entry without order_id".to_string());
                continue;
            };
            let Some(order) = ctx.orders.iter().find(|o| o.order_id == order_id) else {
                mismatches.push(format!("receipt references unknown order {}", order_id));
                continue;
            };
            let receipt_notional = entry
                .get("notional_usd")
                .and_then(|v| {
                    v.as_f64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
                .unwrap_or(0.0);
            let ledger_notional = order.notional_usd.to_f64().unwrap_or(0.0);
            if (receipt_notional - ledger_notional).abs() > 0.01 {
                mismatches.push(format!(
                    "{}: receipt notional {} vs ledger {}",
                    order_id, receipt_notional, ledger_notional
                ));
            }
        }

        if mismatches.is_empty() {
            Ok(EvalOutcome::pass(format!(
                "All {} receipt entries match the orders ledger",
                receipt_orders.len()
            )))
        } else {
            Ok(EvalOutcome::fail(mismatches.join("; ")))
        }
    }
}

/// Summaries must not name symbols the run never looked at.
pub struct HallucinationDetection;

impl Evaluator for HallucinationDetection {
    fn name(&self) -> &'static str {
        "hallucination_detection"
    }
    fn category(&self) -> &'static str {
        "quality"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(ranking) = &ctx.ranking else {
            return Ok(EvalOutcome::skipped("No rankings to ground symbol mentions"));
        };
        let known: HashSet<String> = ranking
            .table
            .iter()
            .flat_map(|row| {
                vec![
                    row.symbol.to_lowercase(),
                    crate::domain::symbols::to_base(&row.symbol).to_lowercase(),
                ]
            })
            .collect();

        let strategy_summary = ctx
            .node_outputs
            .get("strategy")
            .and_then(|o| o.get("safe_summary"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let chosen = ctx
            .node_outputs
            .get("strategy")
            .and_then(|o| o.get("top_symbol"))
            .and_then(|v| v.as_str())
            .unwrap_or("");

        if chosen.is_empty() {
            return Ok(EvalOutcome::skipped("No strategy choice to verify"));
        }
        if !known.contains(&chosen.to_lowercase()) {
            return Ok(EvalOutcome::fail(format!(
                "Strategy chose {} which never appeared in the rankings",
                chosen
            )));
        }
        if !strategy_summary.is_empty()
            && !strategy_summary
                .to_lowercase()
                .contains(&crate::domain::symbols::to_base(chosen).to_lowercase())
        {
            return Ok(EvalOutcome::score(
                0.5,
                "Strategy summary does not mention the chosen symbol",
            ));
        }
        Ok(EvalOutcome::pass("Every claimed symbol is backed by ranked evidence"))
    }
}

/// The brief's totals must add up from its own holdings.
pub struct PortfolioGrounding;

impl Evaluator for PortfolioGrounding {
    fn name(&self) -> &'static str {
        "portfolio_grounding"
    }
    fn category(&self) -> &'static str {
        "rag"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(brief) = ctx.artifact("portfolio_brief") else {
            if ctx.is_portfolio_run() {
                return Ok(EvalOutcome::fail("Portfolio run has no portfolio_brief artifact"));
            }
            return Ok(EvalOutcome::skipped("No portfolio brief on this run"));
        };

        if !brief.get("failure").map(|f| f.is_null()).unwrap_or(true) {
            return Ok(EvalOutcome::skipped("Brief carries a failure; totals not expected"));
        }

        let total = brief
            .get("total_value_usd")
            .and_then(parse_num)
            .unwrap_or(Decimal::ZERO);
        let cash = brief
            .get("cash_usd")
            .and_then(parse_num)
            .unwrap_or(Decimal::ZERO);
        let holdings_sum: Decimal = brief
            .get("holdings")
            .and_then(|v| v.as_array())
            .map(|holdings| {
                holdings
                    .iter()
                    .filter_map(|h| h.get("usd_value").and_then(parse_num))
                    .sum()
            })
            .unwrap_or(Decimal::ZERO);

        let expected = holdings_sum + cash;
        if total == Decimal::ZERO && expected == Decimal::ZERO {
            return Ok(EvalOutcome::pass("Empty portfolio adds up trivially"));
        }
        let drift = ((total - expected).abs() / total.max(Decimal::ONE))
            .to_f64()
            .unwrap_or(1.0);

        if drift <= 0.01 {
            Ok(EvalOutcome::pass(format!(
                "Total ${} matches holdings + cash within 1%",
                total.round_dp(2)
            ))
            .with_thresholds(json!({"max_drift": 0.01})))
        } else {
            Ok(EvalOutcome::fail(format!(
                "Total ${} drifts {:.1}% from holdings + cash ${}",
                total.round_dp(2),
                drift * 100.0,
                expected.round_dp(2)
            ))
            .with_thresholds(json!({"max_drift": 0.01})))
        }
    }
}

fn parse_num(value: &serde_json::Value) -> Option<Decimal> {
    use rust_decimal::prelude::FromPrimitive;
    value
        .as_str()
        .and_then(|s| s.parse::<Decimal>().ok())
        .or_else(|| value.as_f64().and_then(Decimal::from_f64))
}

/// Every evidence ref in the proposal must resolve to a stored row.
pub struct CitationCoverage;

impl Evaluator for CitationCoverage {
    fn name(&self) -> &'static str {
        "citation_coverage"
    }
    fn category(&self) -> &'static str {
        "rag"
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<EvalOutcome> {
        let Some(proposal) = &ctx.trade_proposal else {
            return Ok(EvalOutcome::skipped("No trade proposal to check"));
        };
        let Some(evidence) = proposal.get("evidence").and_then(|v| v.as_array()) else {
            return Ok(EvalOutcome::fail("Proposal has no evidence array"));
        };
        if evidence.is_empty() {
            return Ok(EvalOutcome::fail("Proposal evidence is empty"));
        }

        let known_refs: HashSet<&str> = ctx
            .batches
            .iter()
            .map(|b| b.batch_id.as_str())
            .chain(ctx.ranking.iter().map(|r| r.ranking_id.as_str()))
            .collect();

        let resolved = evidence
            .iter()
            .filter(|e| {
                e.get("ref")
                    .and_then(|r| r.as_str())
                    .map(|r| known_refs.contains(r))
                    .unwrap_or(false)
            })
            .count();
        let score = resolved as f64 / evidence.len() as f64;
        Ok(EvalOutcome::score(
            score,
            format!("{}/{} evidence refs resolve to stored rows", resolved, evidence.len()),
        ))
    }
}
