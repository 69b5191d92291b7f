use std::env;

#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub api_key_name: String,
    pub api_private_key: String,
    pub base_url: String,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct PolygonConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct PushoverConfig {
    pub token: String,
    pub user_key: String,
    pub enabled: bool,
}

/// Credentials for the optional LLM explanation layer. The core ships the
/// deterministic explainer; these are loaded so deployments that enable
/// the enhancement don't need a config change.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
}

/// Broker and outbound-service credentials, loaded from the environment.
/// Missing values default to empty strings; the application degrades to
/// PAPER behavior when credentials are absent.
#[derive(Debug, Clone)]
pub struct BrokerEnvConfig {
    pub coinbase: CoinbaseConfig,
    pub polygon: PolygonConfig,
    pub pushover: PushoverConfig,
    pub openai: OpenAiConfig,
}

impl BrokerEnvConfig {
    pub fn from_env() -> Self {
        let pushover_token = env::var("PUSHOVER_TOKEN").unwrap_or_default();
        let pushover_user_key = env::var("PUSHOVER_USER_KEY").unwrap_or_default();
        let pushover_enabled = !pushover_token.is_empty() && !pushover_user_key.is_empty();

        Self {
            coinbase: CoinbaseConfig {
                api_key_name: env::var("COINBASE_API_KEY_NAME").unwrap_or_default(),
                api_private_key: env::var("COINBASE_API_PRIVATE_KEY").unwrap_or_default(),
                base_url: env::var("COINBASE_BASE_URL")
                    .unwrap_or_else(|_| "https://api.coinbase.com/api/v3/brokerage".to_string()),
                public_url: env::var("COINBASE_PUBLIC_URL")
                    .unwrap_or_else(|_| "https://api.exchange.coinbase.com".to_string()),
            },
            polygon: PolygonConfig {
                api_key: env::var("POLYGON_API_KEY").unwrap_or_default(),
                base_url: env::var("POLYGON_BASE_URL")
                    .unwrap_or_else(|_| "https://api.polygon.io".to_string()),
            },
            pushover: PushoverConfig {
                token: pushover_token,
                user_key: pushover_user_key,
                enabled: pushover_enabled,
            },
            openai: OpenAiConfig {
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            },
        }
    }
}
