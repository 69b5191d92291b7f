pub mod nodes;
pub mod runner;

use crate::config::Config;
use crate::domain::ports::{ExecutionProvider, MarketDataProvider};
use crate::infrastructure::api_stats::ApiCallStats;
use crate::infrastructure::audit::ToolCallLog;
use crate::infrastructure::notifications::PushoverNotifier;
use crate::infrastructure::persistence::Database;
use crate::infrastructure::persistence::repositories::artifacts::RunArtifactsRepo;
use crate::infrastructure::persistence::repositories::candles::CandlesRepo;
use crate::infrastructure::persistence::repositories::dag_nodes::DagNodesRepo;
use crate::infrastructure::persistence::repositories::evals::EvalResultsRepo;
use crate::infrastructure::persistence::repositories::events::RunEventsRepo;
use crate::infrastructure::persistence::repositories::orders::OrdersRepo;
use crate::infrastructure::persistence::repositories::portfolio::PortfolioRepo;
use crate::infrastructure::persistence::repositories::rankings::RankingsRepo;
use crate::infrastructure::persistence::repositories::runs::RunsRepo;
use crate::infrastructure::persistence::repositories::tickets::TradeTicketsRepo;
use std::sync::Arc;

/// Everything a DAG node needs. Nodes never call each other; they read
/// artifacts written by earlier nodes and write their own.
pub struct NodeContext {
    pub database: Database,
    pub config: Config,
    pub runs: RunsRepo,
    pub artifacts: RunArtifactsRepo,
    pub dag_nodes: DagNodesRepo,
    pub candles: CandlesRepo,
    pub rankings: RankingsRepo,
    pub orders: OrdersRepo,
    pub portfolio: PortfolioRepo,
    pub tickets: TradeTicketsRepo,
    pub eval_results: EvalResultsRepo,
    pub events: RunEventsRepo,
    pub tool_log: ToolCallLog,
    pub crypto_data: Arc<dyn MarketDataProvider>,
    pub stock_data: Arc<dyn MarketDataProvider>,
    pub paper_execution: Arc<dyn ExecutionProvider>,
    pub live_execution: Option<Arc<dyn ExecutionProvider>>,
    pub notifier: Arc<PushoverNotifier>,
    pub api_stats: Arc<ApiCallStats>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        database: Database,
        config: Config,
        crypto_data: Arc<dyn MarketDataProvider>,
        stock_data: Arc<dyn MarketDataProvider>,
        paper_execution: Arc<dyn ExecutionProvider>,
        live_execution: Option<Arc<dyn ExecutionProvider>>,
        notifier: Arc<PushoverNotifier>,
        api_stats: Arc<ApiCallStats>,
    ) -> Self {
        Self {
            runs: RunsRepo::new(database.clone()),
            artifacts: RunArtifactsRepo::new(database.clone()),
            dag_nodes: DagNodesRepo::new(database.clone()),
            candles: CandlesRepo::new(database.clone()),
            rankings: RankingsRepo::new(database.clone()),
            orders: OrdersRepo::new(database.clone()),
            portfolio: PortfolioRepo::new(database.clone()),
            tickets: TradeTicketsRepo::new(database.clone()),
            eval_results: EvalResultsRepo::new(database.clone()),
            events: RunEventsRepo::new(database.clone()),
            tool_log: ToolCallLog::new(database.clone()),
            database,
            config,
            crypto_data,
            stock_data,
            paper_execution,
            live_execution,
            notifier,
            api_stats,
        }
    }

    /// Market data provider for a run's asset class.
    pub fn market_data_for(
        &self,
        asset_class: crate::domain::types::AssetClass,
    ) -> Arc<dyn MarketDataProvider> {
        match asset_class {
            crate::domain::types::AssetClass::Stock => self.stock_data.clone(),
            _ => self.crypto_data.clone(),
        }
    }
}
