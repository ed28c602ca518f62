//! Tavily web search provider

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{SearchHit, SearchProvider};
use crate::{brain::ProviderError, config::SearchConfig};

pub struct TavilyProvider {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    search_depth: String,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl TavilyProvider {
    pub fn from_config(config: &SearchConfig) -> Self {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("TAVILY_API_KEY").ok());

        if api_key.is_none() {
            tracing::warn!("Tavily provider created without API key - TAVILY_API_KEY env var not found");
        }

        Self {
            client: Client::new(),
            api_key,
            endpoint: config.endpoint.clone(),
            search_depth: config.search_depth.clone(),
        }
    }

    fn into_hits(response: TavilyResponse) -> Vec<SearchHit> {
        response
            .results
            .into_iter()
            .filter(|r| !r.url.is_empty())
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                snippet: r.content,
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &'static str {
        "Tavily"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ProviderError::AuthError("No Tavily API key configured".to_string()))?;

        tracing::debug!("[Tavily] Searching: {}", query);

        let payload = serde_json::json!({
            "api_key": api_key,
            "query": query,
            "max_results": max_results,
            "search_depth": self.search_depth,
            "include_answer": false
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => ProviderError::RateLimited {
                    retry_after_ms: None,
                },
                401 | 403 => ProviderError::AuthError(body),
                code => ProviderError::ApiError {
                    status: code,
                    message: body,
                },
            });
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(Self::into_hits(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_map_to_hits() {
        let response: TavilyResponse = serde_json::from_value(serde_json::json!({
            "results": [
                { "url": "https://example.org/march", "title": "Climate March", "content": "Saturday at City Hall" },
                { "url": "", "title": "broken" }
            ]
        }))
        .unwrap();

        let hits = TavilyProvider::into_hits(response);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Climate March");
        assert_eq!(hits[0].snippet, "Saturday at City Hall");
    }
}
