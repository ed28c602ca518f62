//! OpenAI provider implementation

use async_trait::async_trait;
use reqwest::Client;

use super::provider::{Completion, CompletionProvider, CompletionRequest, ProviderError, TokenUsage};
use crate::config::LlmConfig;

/// OpenAI chat completions provider using JSON-schema response format
pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
}

impl OpenAIProvider {
    pub fn from_config(config: &LlmConfig) -> Self {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());

        if api_key.is_some() {
            tracing::info!("OpenAI provider initialized with API key");
        } else {
            tracing::warn!("OpenAI provider created without API key - OPENAI_API_KEY env var not found");
        }

        Self {
            client: Client::new(),
            api_key,
            endpoint: config.endpoint.clone(),
        }
    }

    fn build_payload(request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user }
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": false
                }
            }
        })
    }

    fn parse_response(json: &serde_json::Value) -> Result<Completion, ProviderError> {
        let message = &json["choices"][0]["message"];

        if let Some(refusal) = message["refusal"].as_str() {
            return Err(ProviderError::ParseError(format!("model refused: {}", refusal)));
        }

        let content = message["content"]
            .as_str()
            .ok_or_else(|| ProviderError::ParseError("response has no message content".to_string()))?
            .trim()
            .to_string();

        let usage = json.get("usage").and_then(|u| {
            Some(TokenUsage {
                input_tokens: u["prompt_tokens"].as_u64()? as u32,
                output_tokens: u["completion_tokens"].as_u64()? as u32,
                total_tokens: u["total_tokens"].as_u64()? as u32,
            })
        });

        Ok(Completion { content, usage })
    }
}

#[async_trait]
impl CompletionProvider for OpenAIProvider {
    fn name(&self) -> &'static str {
        "OpenAI"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let auth_header = self
            .api_key
            .as_ref()
            .map(|k| format!("Bearer {}", k))
            .ok_or_else(|| ProviderError::AuthError("No OpenAI API key configured".to_string()))?;

        tracing::debug!(
            "[OpenAI] Sending request: model={}, schema={}",
            request.model,
            request.schema_name
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Authorization", auth_header)
            .json(&Self::build_payload(request))
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 429 {
                let retry_after_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1_000);
                return Err(ProviderError::RateLimited { retry_after_ms });
            }

            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(ProviderError::AuthError(body));
            }

            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Self::parse_response(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_reads_content_and_usage() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": " {\"leads\": []} " } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150 }
        });

        let completion = OpenAIProvider::parse_response(&json).unwrap();
        assert_eq!(completion.content, "{\"leads\": []}");
        assert_eq!(
            completion.usage,
            Some(TokenUsage {
                input_tokens: 120,
                output_tokens: 30,
                total_tokens: 150
            })
        );
    }

    #[test]
    fn test_parse_response_without_content_fails() {
        let json = serde_json::json!({ "choices": [{ "message": { "content": null } }] });
        assert!(matches!(
            OpenAIProvider::parse_response(&json),
            Err(ProviderError::ParseError(_))
        ));
    }

    #[test]
    fn test_payload_carries_schema() {
        let request = CompletionRequest {
            system: "sys".to_string(),
            user: "user".to_string(),
            schema_name: "LeadBatch".to_string(),
            schema: serde_json::json!({ "type": "object" }),
            model: "gpt-4.1-mini".to_string(),
            temperature: 0.2,
            max_tokens: 100,
        };
        let payload = OpenAIProvider::build_payload(&request);
        assert_eq!(payload["response_format"]["json_schema"]["name"], "LeadBatch");
        assert_eq!(payload["messages"][1]["content"], "user");
    }
}
