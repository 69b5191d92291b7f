//! Execdesk server - natural-language trading assistant backend
//!
//! Serves the chat command API, trade ticket workflow, and eval dashboards
//! over HTTP. All state lives in SQLite; market data and execution go
//! through the Coinbase and Polygon providers.
//!
//! # Usage
//! ```sh
//! EXECUTION_MODE_DEFAULT=PAPER cargo run
//! ```

use anyhow::Result;
use execdesk::application::orchestrator::NodeContext;
use execdesk::config::Config;
use execdesk::domain::ports::{ExecutionProvider, MarketDataProvider};
use execdesk::infrastructure::api_stats::ApiCallStats;
use execdesk::infrastructure::coinbase::{CoinbaseExecution, CoinbaseMarketData};
use execdesk::infrastructure::notifications::PushoverNotifier;
use execdesk::infrastructure::paper::PaperExecution;
use execdesk::infrastructure::persistence::Database;
use execdesk::infrastructure::polygon::PolygonMarketData;
use execdesk::interfaces::http::{AppState, router};
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Setup logging (stdout only)
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false).pretty();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Execdesk Server {} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Configuration loaded: Mode={}, LiveEnabled={}, Watchlist={:?}",
        config.execution_mode_default, config.enable_live_trading, config.stock_watchlist
    );

    let database = Database::new(&config.database_url).await?;
    let api_stats = Arc::new(ApiCallStats::new());

    let crypto_data: Arc<dyn MarketDataProvider> = Arc::new(
        CoinbaseMarketData::builder()
            .public_url(config.coinbase_public_url.clone())
            .stats(api_stats.clone())
            .build(),
    );
    let stock_data: Arc<dyn MarketDataProvider> = Arc::new(PolygonMarketData::new(
        config.polygon_base_url.clone(),
        config.polygon_api_key.clone(),
        config.stock_watchlist.clone(),
        api_stats.clone(),
    ));

    let paper_execution: Arc<dyn ExecutionProvider> =
        Arc::new(PaperExecution::new(database.clone(), crypto_data.clone()));
    let live_execution: Option<Arc<dyn ExecutionProvider>> =
        if config.enable_live_trading && config.has_live_credentials() {
            info!("LIVE execution provider enabled");
            Some(Arc::new(CoinbaseExecution::new(
                config.coinbase_base_url.clone(),
                config.coinbase_api_key_name.clone(),
                config.coinbase_api_private_key.clone(),
            )))
        } else {
            info!("LIVE execution disabled; PAPER only");
            None
        };

    let notifier = Arc::new(PushoverNotifier::new(
        database.clone(),
        config.pushover_token.clone(),
        config.pushover_user_key.clone(),
        config.pushover_enabled,
    ));

    let bind_address = config.bind_address.clone();
    let ctx = Arc::new(NodeContext::new(
        database,
        config,
        crypto_data,
        stock_data,
        paper_execution,
        live_execution,
        notifier,
        api_stats,
    ));

    let state = Arc::new(AppState::new(ctx));
    let app = router(state);

    info!("Listening on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
