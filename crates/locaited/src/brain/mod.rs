//! Structured LLM completions
//!
//! [`LlmClient`] turns a prompt plus a Rust response type into a validated
//! value. The JSON schema sent to the provider is derived from the type, and
//! the answer is validated by deserializing into it. One local repair is
//! attempted on malformed output before the gateway treats it as a failed
//! attempt.

pub mod openai;
pub mod provider;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

pub use openai::OpenAIProvider;
pub use provider::{Completion, CompletionProvider, CompletionRequest, ProviderError, TokenUsage};

use crate::{
    cache::{CanonicalKey, Namespace},
    config::{LlmConfig, ModelPricing},
    gateway::{CallError, CallGateway, ComputedCall},
    ledger::{CallUsage, RunMeter},
    workflow::stages::StageKind,
};

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid regex"));

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));

/// System and user prompt for one completion
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// A validated structured answer
#[derive(Debug, Clone)]
pub struct Structured<T> {
    pub value: T,
    pub cache_hit: bool,
}

pub struct LlmClient {
    provider: Arc<dyn CompletionProvider>,
    gateway: Arc<CallGateway>,
    pricing: ModelPricing,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        gateway: Arc<CallGateway>,
        pricing: ModelPricing,
        config: LlmConfig,
    ) -> Self {
        Self {
            provider,
            gateway,
            pricing,
            config,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Complete `prompt` and validate the answer as `T`.
    ///
    /// `key` must describe the semantic inputs of the call; the model name is
    /// folded in here so different models never share cache entries.
    pub async fn complete_json<T>(
        &self,
        meter: &RunMeter,
        stage: StageKind,
        namespace: Namespace,
        key: CanonicalKey,
        prompt: Prompt,
    ) -> Result<Structured<T>, CallError>
    where
        T: DeserializeOwned + JsonSchema,
    {
        let key = key.text("model", &self.config.model);
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| CallError::MalformedResponse(format!("schema generation failed: {}", e)))?;

        let request = CompletionRequest {
            system: prompt.system,
            user: prompt.user,
            schema_name: T::schema_name().to_string(),
            schema,
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let estimate_usd = self
            .pricing
            .cost(estimate_tokens(&request), self.config.max_tokens / 4);

        let provider = &self.provider;
        let pricing = &self.pricing;
        let request = &request;

        let response = self
            .gateway
            .call(meter, stage, namespace, &key, estimate_usd, move || async move {
                let completion = provider.complete(request).await?;
                let payload = parse_structured::<T>(&completion.content)?;
                let usage = completion.usage.unwrap_or_default();
                Ok::<_, CallError>(ComputedCall {
                    payload,
                    usage: CallUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cost_usd: pricing.cost(usage.input_tokens, usage.output_tokens),
                    },
                })
            })
            .await?;

        let value = serde_json::from_value(response.payload)
            .map_err(|e| CallError::MalformedResponse(e.to_string()))?;

        Ok(Structured {
            value,
            cache_hit: response.cache_hit,
        })
    }
}

/// Rough prompt size in tokens (four characters per token)
fn estimate_tokens(request: &CompletionRequest) -> u32 {
    ((request.system.len() + request.user.len()) / 4) as u32
}

/// Validate `content` as `T`, repairing it once if needed.
///
/// Returns the JSON value (not `T`) so the validated payload can be cached
/// independently of the response type.
pub fn parse_structured<T: DeserializeOwned>(content: &str) -> Result<serde_json::Value, CallError> {
    let first_error = match validate::<T>(content.trim()) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    let repaired = repair_json(content).ok_or_else(|| CallError::MalformedResponse(first_error.clone()))?;
    tracing::debug!("[LLM] Repaired malformed response ({})", first_error);
    validate::<T>(&repaired).map_err(CallError::MalformedResponse)
}

fn validate<T: DeserializeOwned>(text: &str) -> Result<serde_json::Value, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    serde_json::from_value::<T>(value.clone()).map_err(|e| e.to_string())?;
    Ok(value)
}

/// Strip code fences, cut to the outermost JSON value and drop trailing commas
pub fn repair_json(content: &str) -> Option<String> {
    let unfenced = CODE_FENCE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(content);

    let start = unfenced.find(|c| c == '{' || c == '[')?;
    let closing = if unfenced[start..].starts_with('{') { '}' } else { ']' };
    let end = unfenced.rfind(closing)?;
    if end <= start {
        return None;
    }

    let body = &unfenced[start..=end];
    Some(TRAILING_COMMA.replace_all(body, "$1").into_owned())
}
