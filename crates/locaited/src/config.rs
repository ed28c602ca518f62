//! Configuration for the discovery engine
//!
//! Every field has a serde default, so an empty file (or no file at all)
//! yields the stock configuration. Values are layered: defaults, then an
//! optional TOML file, then `LOCAITED__SECTION__FIELD` environment variables.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{LocaitedError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub cost: CostConfig,

    #[serde(default)]
    pub calls: CallPolicy,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

impl AppConfig {
    /// Load configuration from an explicit file, or from `locaited.toml` in
    /// the working directory when present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("locaited").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("LOCAITED")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        tracing::debug!("[CONFIG] Loaded configuration: {:?}", config.workflow);
        Ok(config)
    }

    /// Reject values that would make the state machine or worker pool unusable
    pub fn validate(&self) -> Result<()> {
        let wf = &self.workflow;
        if wf.max_events == 0 {
            return Err(LocaitedError::ConfigError(
                "workflow.max_events must be at least 1".to_string(),
            ));
        }
        if !(wf.dedup_threshold > 0.0 && wf.dedup_threshold <= 1.0) {
            return Err(LocaitedError::ConfigError(format!(
                "workflow.dedup_threshold must be in (0, 1], got {}",
                wf.dedup_threshold
            )));
        }
        if wf.min_event_score > 100 {
            return Err(LocaitedError::ConfigError(format!(
                "workflow.min_event_score must be at most 100, got {}",
                wf.min_event_score
            )));
        }
        if wf.evidence_parallelism == 0 || wf.verify_batch_size == 0 || wf.leads_per_pass == 0 {
            return Err(LocaitedError::ConfigError(
                "workflow.evidence_parallelism, verify_batch_size and leads_per_pass must be positive"
                    .to_string(),
            ));
        }
        if self.calls.max_attempts == 0 {
            return Err(LocaitedError::ConfigError(
                "calls.max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(cap) = self.cost.budget_cap_usd {
            if cap < 0.0 {
                return Err(LocaitedError::ConfigError(format!(
                    "cost.budget_cap_usd must not be negative, got {}",
                    cap
                )));
            }
        }
        Ok(())
    }
}

/// How leads classified as already underway are treated by the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OngoingPolicy {
    Keep,
    #[default]
    Drop,
}

/// Bounds and thresholds for the orchestrator and stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Outer cycle bound (Curator back to Profile Builder)
    #[serde(default = "default_max_iterations")]
    pub max_outer_iterations: u32,

    /// Inner cycle bound (Verifier back to Lead Generator)
    #[serde(default = "default_max_iterations")]
    pub max_inner_iterations: u32,

    #[serde(default = "default_min_verified_leads")]
    pub min_verified_leads: usize,

    /// Qualifying events required for approval
    #[serde(default = "default_min_events")]
    pub min_events: usize,

    #[serde(default = "default_min_event_score")]
    pub min_event_score: u8,

    /// Output cap, applied after dedup and scoring
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,

    #[serde(default = "default_true")]
    pub verification_enabled: bool,

    #[serde(default)]
    pub ongoing_policy: OngoingPolicy,

    /// Leads requested from the generator on a fresh pass
    #[serde(default = "default_leads_per_pass")]
    pub leads_per_pass: usize,

    /// Leads classified per verifier completion
    #[serde(default = "default_verify_batch_size")]
    pub verify_batch_size: usize,

    /// Concurrent searches issued by the evidence gatherer
    #[serde(default = "default_evidence_parallelism")]
    pub evidence_parallelism: usize,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_min_verified_leads() -> usize {
    15
}

fn default_min_events() -> usize {
    5
}

fn default_min_event_score() -> u8 {
    60
}

fn default_max_events() -> usize {
    15
}

fn default_dedup_threshold() -> f64 {
    0.85
}

fn default_true() -> bool {
    true
}

fn default_leads_per_pass() -> usize {
    25
}

fn default_verify_batch_size() -> usize {
    5
}

fn default_evidence_parallelism() -> usize {
    5
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_outer_iterations: default_max_iterations(),
            max_inner_iterations: default_max_iterations(),
            min_verified_leads: default_min_verified_leads(),
            min_events: default_min_events(),
            min_event_score: default_min_event_score(),
            max_events: default_max_events(),
            dedup_threshold: default_dedup_threshold(),
            verification_enabled: true,
            ongoing_policy: OngoingPolicy::default(),
            leads_per_pass: default_leads_per_pass(),
            verify_batch_size: default_verify_batch_size(),
            evidence_parallelism: default_evidence_parallelism(),
        }
    }
}

/// Per-token LLM pricing in USD per million tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default = "default_input_rate")]
    pub input_per_million_usd: f64,

    #[serde(default = "default_output_rate")]
    pub output_per_million_usd: f64,
}

fn default_input_rate() -> f64 {
    0.15
}

fn default_output_rate() -> f64 {
    0.60
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_million_usd
            + output_tokens as f64 * self.output_per_million_usd)
            / 1_000_000.0
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_million_usd: default_input_rate(),
            output_per_million_usd: default_output_rate(),
        }
    }
}

/// Spend limits and pricing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Per-run cap; `None` disables the budget gate
    #[serde(default = "default_budget_cap")]
    pub budget_cap_usd: Option<f64>,

    #[serde(default = "default_search_cost")]
    pub search_cost_usd: f64,

    #[serde(default)]
    pub pricing: ModelPricing,
}

fn default_budget_cap() -> Option<f64> {
    Some(0.10)
}

fn default_search_cost() -> f64 {
    0.001
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            budget_cap_usd: default_budget_cap(),
            search_cost_usd: default_search_cost(),
            pricing: ModelPricing::default(),
        }
    }
}

/// Timeout and retry policy applied to every external call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallPolicy {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

impl CallPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retrying after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

/// Cache store sizing and on-disk persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Keep results on disk so later processes reuse them
    #[serde(default = "default_cache_persist")]
    pub persist: bool,

    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_cache_persist() -> bool {
    true
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from(".locaited/cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
            persist: default_cache_persist(),
            directory: default_cache_directory(),
        }
    }
}

/// LLM provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Falls back to `OPENAI_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            endpoint: default_llm_endpoint(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key: None,
        }
    }
}

/// Web search provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_search_depth")]
    pub search_depth: String,

    /// Falls back to `TAVILY_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_max_results() -> usize {
    10
}

fn default_search_depth() -> String {
    "basic".to_string()
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            max_results: default_max_results(),
            search_depth: default_search_depth(),
            api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_match_documented_bounds() {
        let config = AppConfig::default();
        assert_eq!(config.workflow.max_outer_iterations, 3);
        assert_eq!(config.workflow.max_inner_iterations, 3);
        assert_eq!(config.workflow.min_verified_leads, 15);
        assert_eq!(config.workflow.min_events, 5);
        assert_eq!(config.workflow.min_event_score, 60);
        assert_eq!(config.workflow.max_events, 15);
        assert_eq!(config.workflow.ongoing_policy, OngoingPolicy::Drop);
        assert_eq!(config.cost.budget_cap_usd, Some(0.10));
        assert!(config.cache.persist);
        assert_eq!(config.cache.directory, PathBuf::from(".locaited/cache"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = CallPolicy {
            timeout_secs: 1,
            max_attempts: 3,
            backoff_base_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_pricing_per_million_tokens() {
        let pricing = ModelPricing::default();
        let cost = pricing.cost(1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[workflow]\nmax_events = 7\nongoing_policy = \"keep\"\n\n[cost]\nbudget_cap_usd = 0.5\n\n[cache]\npersist = false"
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.workflow.max_events, 7);
        assert_eq!(config.workflow.ongoing_policy, OngoingPolicy::Keep);
        assert_eq!(config.workflow.min_events, 5);
        assert_eq!(config.cost.budget_cap_usd, Some(0.5));
        assert_eq!(config.calls.max_attempts, 3);
        assert!(!config.cache.persist);
        assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut config = AppConfig::default();
        config.workflow.max_events = 0;
        assert!(matches!(
            config.validate(),
            Err(LocaitedError::ConfigError(_))
        ));
    }
}
