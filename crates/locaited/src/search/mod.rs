//! Web search through the metered gateway

pub mod tavily;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use tavily::TavilyProvider;

use crate::{
    brain::ProviderError,
    cache::{CanonicalKey, Namespace},
    config::SearchConfig,
    gateway::{CallError, CallGateway, ComputedCall},
    ledger::{CallUsage, RunMeter},
    workflow::stages::StageKind,
};

/// A single search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Trait that all web search providers must implement
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_configured(&self) -> bool;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub cache_hit: bool,
}

pub struct SearchClient {
    provider: Arc<dyn SearchProvider>,
    gateway: Arc<CallGateway>,
    config: SearchConfig,
    cost_per_search_usd: f64,
}

impl SearchClient {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        gateway: Arc<CallGateway>,
        config: SearchConfig,
        cost_per_search_usd: f64,
    ) -> Self {
        Self {
            provider,
            gateway,
            config,
            cost_per_search_usd,
        }
    }

    /// Run one metered, cached search
    pub async fn search(
        &self,
        meter: &RunMeter,
        stage: StageKind,
        query: &str,
    ) -> Result<SearchOutcome, CallError> {
        let max_results = self.config.max_results;
        let key = CanonicalKey::new()
            .text("query", query)
            .int("max_results", max_results as i64)
            .text("depth", &self.config.search_depth);

        let provider = &self.provider;
        let cost = self.cost_per_search_usd;

        let response = self
            .gateway
            .call(meter, stage, Namespace::Search, &key, cost, move || async move {
                let hits = provider.search(query, max_results).await?;
                let payload = serde_json::to_value(&hits)
                    .map_err(|e| CallError::MalformedResponse(e.to_string()))?;
                Ok::<_, CallError>(ComputedCall {
                    payload,
                    usage: CallUsage::flat(cost),
                })
            })
            .await?;

        let hits = serde_json::from_value(response.payload)
            .map_err(|e| CallError::MalformedResponse(e.to_string()))?;

        Ok(SearchOutcome {
            hits,
            cache_hit: response.cache_hit,
        })
    }
}
