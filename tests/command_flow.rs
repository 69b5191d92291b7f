//! End-to-end command flow tests against stubbed market data providers.
//!
//! Exercises the full dispatcher: classification, preflight, confirmation
//! staging, the idempotent CONFIRM transition, and the background DAG run
//! through to eval grading.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use execdesk::application::command::{CommandRequest, CommandService};
use execdesk::application::evals::registry;
use execdesk::application::orchestrator::NodeContext;
use execdesk::config::Config;
use execdesk::domain::errors::MarketDataError;
use execdesk::domain::ports::{ExecutionProvider, MarketDataProvider};
use execdesk::domain::types::{Candle, Granularity, Product, RunStatus};
use execdesk::infrastructure::api_stats::ApiCallStats;
use execdesk::infrastructure::notifications::PushoverNotifier;
use execdesk::infrastructure::paper::PaperExecution;
use execdesk::infrastructure::persistence::Database;
use execdesk::infrastructure::persistence::repositories::runs::RunsRepo;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::HashMap;
use std::sync::Arc;

const TENANT: &str = "t_default";

/// Market data stub: three liquid products with steadily rising prices.
struct StubMarketData {
    productless: bool,
    metadata_status: Option<u16>,
}

impl StubMarketData {
    fn healthy() -> Self {
        Self {
            productless: false,
            metadata_status: None,
        }
    }

    fn untradeable() -> Self {
        Self {
            productless: false,
            metadata_status: Some(404),
        }
    }

    fn product(id: &str, base: &str, volume: f64) -> Product {
        Product {
            product_id: id.to_string(),
            base_currency: base.to_string(),
            quote_currency: "USD".to_string(),
            status: "online".to_string(),
            volume_24h: volume,
            min_market_funds: Some(Decimal::ONE),
        }
    }

    fn base_price(product_id: &str) -> f64 {
        match product_id {
            "BTC-USD" => 50_000.0,
            "ETH-USD" => 3_000.0,
            _ => 100.0,
        }
    }
}

#[async_trait]
impl MarketDataProvider for StubMarketData {
    fn name(&self) -> &'static str {
        "stub_market_data"
    }

    async fn list_products(&self, _quote: &str) -> Result<Vec<Product>, MarketDataError> {
        if self.productless {
            return Ok(Vec::new());
        }
        Ok(vec![
            Self::product("BTC-USD", "BTC", 9000.0),
            Self::product("ETH-USD", "ETH", 8000.0),
            Self::product("SOL-USD", "SOL", 7000.0),
        ])
    }

    async fn get_candles(
        &self,
        product_id: &str,
        _granularity: Granularity,
        _start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MarketDataError> {
        // 30 hourly candles rising 0.1% per hour
        let base = Self::base_price(product_id);
        let mut candles = Vec::with_capacity(30);
        for i in 0..30 {
            let open = base * (1.0 + 0.001 * i as f64);
            let close = base * (1.0 + 0.001 * (i + 1) as f64);
            let start = end - Duration::hours(30 - i);
            candles.push(Candle {
                start,
                end: start + Duration::hours(1),
                open: Decimal::from_f64(open).unwrap(),
                high: Decimal::from_f64(close).unwrap(),
                low: Decimal::from_f64(open).unwrap(),
                close: Decimal::from_f64(close).unwrap(),
                volume: Decimal::from_f64(25.0).unwrap(),
            });
        }
        Ok(candles)
    }

    async fn get_price(&self, product_id: &str) -> Result<Decimal, MarketDataError> {
        Ok(Decimal::from_f64(Self::base_price(product_id)).unwrap())
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, MarketDataError> {
        if let Some(status) = self.metadata_status {
            return Err(MarketDataError::Api {
                status,
                message: "stub metadata failure".to_string(),
            });
        }
        Ok(Self::product(
            product_id,
            &execdesk::domain::symbols::to_base(product_id),
            0.0,
        ))
    }
}

async fn build_service(market_data: StubMarketData) -> (CommandService, Arc<NodeContext>) {
    let database = Database::in_memory().await.unwrap();
    let config = Config::from_env().unwrap();
    let crypto: Arc<dyn MarketDataProvider> = Arc::new(market_data);
    let paper: Arc<dyn ExecutionProvider> =
        Arc::new(PaperExecution::new(database.clone(), crypto.clone()));
    let notifier = Arc::new(PushoverNotifier::new(
        database.clone(),
        String::new(),
        String::new(),
        false,
    ));

    let ctx = Arc::new(NodeContext::new(
        database,
        config,
        crypto.clone(),
        crypto,
        paper,
        None,
        notifier,
        Arc::new(ApiCallStats::new()),
    ));
    (CommandService::new(ctx.clone()), ctx)
}

fn request(text: &str, conversation_id: Option<&str>) -> CommandRequest {
    CommandRequest {
        text: text.to_string(),
        conversation_id: conversation_id.map(String::from),
        confirmation_id: None,
        news_enabled: None,
    }
}

async fn wait_for_terminal(runs: &RunsRepo, run_id: &str) -> RunStatus {
    for _ in 0..100 {
        let run = runs.get(run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            return run.status;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("run {} never reached a terminal state", run_id);
}

#[tokio::test]
async fn test_greeting_is_message_only() {
    let (service, _ctx) = build_service(StubMarketData::healthy()).await;
    let reply = service
        .handle(&request("Hi", None), TENANT, "req1")
        .await
        .unwrap();

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["intent"], "GREETING");
    assert_eq!(reply.body["status"], "COMPLETED");
    assert!(reply.body["run_id"].is_null());
    assert!(reply.body["content"]
        .as_str()
        .unwrap()
        .starts_with("Hi - I'm your financial assistant"));
}

#[tokio::test]
async fn test_out_of_scope_refusal() {
    let (service, _ctx) = build_service(StubMarketData::healthy()).await;
    let reply = service
        .handle(&request("Who is the president?", None), TENANT, "req1")
        .await
        .unwrap();

    assert_eq!(reply.body["intent"], "OUT_OF_SCOPE");
    assert_eq!(reply.body["status"], "COMPLETED");
    assert!(reply.body["content"]
        .as_str()
        .unwrap()
        .starts_with("I'm a financial/trading assistant"));
}

#[tokio::test]
async fn test_trade_confirm_flow_end_to_end() {
    let (service, ctx) = build_service(StubMarketData::healthy()).await;

    // Stage the trade
    let reply = service
        .handle(&request("Buy $10 of BTC", Some("c1")), TENANT, "req1")
        .await
        .unwrap();
    assert_eq!(reply.body["status"], "AWAITING_CONFIRMATION");
    let pending = &reply.body["pending_trade"];
    assert_eq!(pending["side"], "buy");
    assert_eq!(pending["asset"], "BTC");
    assert_eq!(pending["mode"], "PAPER");
    let confirmation_id = reply.body["confirmation_id"].as_str().unwrap().to_string();
    assert!(confirmation_id.starts_with("conf_"));

    // Confirm it
    let reply = service
        .handle(&request("CONFIRM", Some("c1")), TENANT, "req2")
        .await
        .unwrap();
    assert_eq!(reply.body["status"], "EXECUTING");
    let run_id = reply.body["run_id"].as_str().unwrap().to_string();

    // Duplicate CONFIRM replays the same run id
    let reply = service
        .handle(
            &CommandRequest {
                text: "CONFIRM".to_string(),
                conversation_id: Some("c1".to_string()),
                confirmation_id: Some(confirmation_id.clone()),
                news_enabled: None,
            },
            TENANT,
            "req3",
        )
        .await
        .unwrap();
    assert_eq!(reply.body["status"], "EXECUTING");
    assert_eq!(reply.body["run_id"].as_str().unwrap(), run_id);

    // The background DAG run completes and every registered eval emits a row
    let status = wait_for_terminal(&ctx.runs, &run_id).await;
    assert_eq!(status, RunStatus::Completed);

    let orders = ctx.orders.list_for_run(&run_id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].symbol, "BTC-USD");
    assert_eq!(orders[0].status, "FILLED");
    assert!(orders[0].filled_qty.unwrap() > Decimal::ZERO);
    assert!(orders[0].avg_fill_price.unwrap() > Decimal::ZERO);

    let evals = ctx.eval_results.list_for_run(&run_id).await.unwrap();
    assert_eq!(evals.len(), registry().len());
}

#[tokio::test]
async fn test_concurrent_confirms_share_one_run() {
    let (service, _ctx) = build_service(StubMarketData::healthy()).await;
    let service = Arc::new(service);

    let reply = service
        .handle(&request("Buy $10 of ETH", Some("c2")), TENANT, "req1")
        .await
        .unwrap();
    let confirmation_id = reply.body["confirmation_id"].as_str().unwrap().to_string();

    let confirm = |service: Arc<CommandService>, id: String, req: &'static str| async move {
        service
            .handle(
                &CommandRequest {
                    text: "CONFIRM".to_string(),
                    conversation_id: Some("c2".to_string()),
                    confirmation_id: Some(id),
                    news_enabled: None,
                },
                TENANT,
                req,
            )
            .await
            .unwrap()
    };

    let (a, b) = tokio::join!(
        confirm(service.clone(), confirmation_id.clone(), "reqA"),
        confirm(service.clone(), confirmation_id.clone(), "reqB"),
    );

    let run_a = a.body["run_id"].as_str().map(String::from);
    let run_b = b.body["run_id"].as_str().map(String::from);
    assert!(run_a.is_some() || run_b.is_some());
    if let (Some(run_a), Some(run_b)) = (run_a, run_b) {
        assert_eq!(run_a, run_b);
    }
}

#[tokio::test]
async fn test_no_tradeable_top_performer_rejects_without_staging() {
    let (service, ctx) = build_service(StubMarketData::untradeable()).await;

    let reply = service
        .handle(
            &request(
                "Buy $2 of highest performing crypto in last 10 minutes",
                Some("c3"),
            ),
            TENANT,
            "req1",
        )
        .await
        .unwrap();

    assert_eq!(reply.body["status"], "REJECTED");
    assert_eq!(reply.body["reason_code"], "NO_TRADEABLE_TOP_PERFORMER");
    assert!(reply.body["run_id"].is_null());

    // No confirmation row was created for the refused selection
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trade_confirmations")
        .fetch_one(&ctx.database.pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_cancel_then_confirm_finds_nothing() {
    let (service, _ctx) = build_service(StubMarketData::healthy()).await;

    service
        .handle(&request("Buy $10 of BTC", Some("c4")), TENANT, "req1")
        .await
        .unwrap();

    let reply = service
        .handle(&request("CANCEL", Some("c4")), TENANT, "req2")
        .await
        .unwrap();
    assert_eq!(reply.body["intent"], "TRADE_CANCELLED");
    assert_eq!(reply.body["status"], "COMPLETED");

    let reply = service
        .handle(&request("CONFIRM", Some("c4")), TENANT, "req3")
        .await
        .unwrap();
    assert!(reply.body["content"]
        .as_str()
        .unwrap()
        .starts_with("No pending trade found"));
}

#[tokio::test]
async fn test_holdings_query_creates_portfolio_run() {
    let (service, ctx) = build_service(StubMarketData::healthy()).await;

    let reply = service
        .handle(&request("How much BTC do I own?", Some("c5")), TENANT, "req1")
        .await
        .unwrap();

    assert_eq!(reply.body["intent"], "PORTFOLIO_ANALYSIS");
    assert_eq!(reply.body["status"], "COMPLETED");
    assert_eq!(reply.body["queried_asset"], "BTC");

    let run_id = reply.body["run_id"].as_str().unwrap();
    let run = ctx.runs.get(run_id).await.unwrap().unwrap();
    assert_eq!(run.intent, "PORTFOLIO_ANALYSIS");

    // The brief reflects the seeded paper ledger: 0.5 BTC at $50,000
    let brief = &reply.body["portfolio_brief"];
    let holdings = brief["holdings"].as_array().unwrap();
    let btc = holdings
        .iter()
        .find(|h| h["asset_symbol"] == "BTC")
        .expect("BTC holding present");
    assert_eq!(btc["qty"], serde_json::json!("0.5"));
}

#[tokio::test]
async fn test_missing_amount_prompts_for_input() {
    let (service, _ctx) = build_service(StubMarketData::healthy()).await;
    let reply = service
        .handle(&request("buy some BTC", None), TENANT, "req1")
        .await
        .unwrap();
    assert_eq!(reply.body["intent"], "TRADE_EXECUTION_INCOMPLETE");
    assert_eq!(reply.body["status"], "AWAITING_INPUT");
}

#[tokio::test]
async fn test_sell_without_holdings_is_rejected() {
    let (service, _ctx) = build_service(StubMarketData::healthy()).await;
    // The seed ledger has no SOL
    let reply = service
        .handle(&request("sell $50 of SOL", None), TENANT, "req1")
        .await
        .unwrap();
    assert_eq!(reply.body["status"], "REJECTED");
    assert_eq!(reply.body["reason_code"], "INSUFFICIENT_BALANCE");
}
