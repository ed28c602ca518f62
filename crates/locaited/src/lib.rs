//! # LocAIted - Event Discovery Engine
//!
//! Runs a fixed pipeline of discovery stages (profile, leads, verification,
//! evidence, curation) under an orchestrator that owns two bounded retry
//! cycles. Every LLM completion and web search goes through a metered gateway
//! backed by a content-addressed cache and a per-run cost ledger.

pub mod brain;
pub mod cache;
pub mod config;
pub mod curation;
pub mod gateway;
pub mod ledger;
pub mod search;
pub mod workflow;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use brain::{CompletionProvider, LlmClient, OpenAIProvider};
pub use cache::{CacheKey, CacheStats, CacheStore, CanonicalKey, DiskStore, Namespace};
pub use config::{AppConfig, CacheConfig, CallPolicy, CostConfig, OngoingPolicy, WorkflowConfig};
pub use curation::{DedupEngine, ScoringContext};
pub use gateway::{CallError, CallGateway};
pub use ledger::{CostLedger, LedgerTotals, RunMeter, StageMetrics};
pub use search::{SearchClient, SearchHit, SearchProvider, TavilyProvider};
pub use workflow::{
    DiscoveryRequest, DiscoveryResponse, Event, GateDecision, ObserverDirective, Orchestrator,
    ResponseStatus, RunOutcome, RunState, StageKind, StageObserver, StageReport, TerminalReason,
    WorkflowEvent,
};

/// Main error types for LocAIted operations
#[derive(Debug, thiserror::Error)]
pub enum LocaitedError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<::config::ConfigError> for LocaitedError {
    fn from(err: ::config::ConfigError) -> Self {
        LocaitedError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LocaitedError>;

/// Build an orchestrator wired to the configured OpenAI and Tavily providers.
///
/// The cache store and cost ledger are created here and shared by every run
/// the returned orchestrator executes. With `cache.persist` set, results from
/// earlier processes are loaded from the cache directory.
pub async fn initialize_locaited(config: AppConfig) -> Result<Orchestrator> {
    tracing::info!("Initializing LocAIted discovery engine...");

    let completion = OpenAIProvider::from_config(&config.llm);
    if !completion.is_configured() {
        return Err(LocaitedError::NotConfigured(
            "OPENAI_API_KEY is not set".to_string(),
        ));
    }
    let search = TavilyProvider::from_config(&config.search);
    if !search.is_configured() {
        return Err(LocaitedError::NotConfigured(
            "TAVILY_API_KEY is not set".to_string(),
        ));
    }

    let cache = Arc::new(CacheStore::open(&config.cache).await?);
    let ledger = Arc::new(CostLedger::new());
    let gateway = Arc::new(CallGateway::new(cache, ledger, config.calls.clone()));

    let llm = Arc::new(LlmClient::new(
        Arc::new(completion),
        gateway.clone(),
        config.cost.pricing.clone(),
        config.llm.clone(),
    ));
    let search = Arc::new(SearchClient::new(
        Arc::new(search),
        gateway.clone(),
        config.search.clone(),
        config.cost.search_cost_usd,
    ));

    let orchestrator = Orchestrator::with_default_stages(config, gateway, llm, search);

    tracing::info!("LocAIted initialized successfully");
    Ok(orchestrator)
}
