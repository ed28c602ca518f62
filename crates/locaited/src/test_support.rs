//! Fixtures and scripted providers shared by the unit tests

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    brain::{Completion, CompletionProvider, CompletionRequest, LlmClient, ProviderError, TokenUsage},
    cache::CacheStore,
    config::{CallPolicy, LlmConfig, ModelPricing, SearchConfig},
    gateway::CallGateway,
    ledger::CostLedger,
    search::{SearchClient, SearchHit, SearchProvider},
    workflow::{
        stages::{LeadsDelta, Stage, StageContext, StageDelta, StageKind, StageOutput, StageResult},
        types::{DiscoveryRequest, Event, LeadDraft, RunState, Temporality, VerificationResult},
    },
};

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
}

pub fn request() -> DiscoveryRequest {
    DiscoveryRequest::new(
        "Brooklyn",
        14,
        vec!["climate".to_string(), "housing".to_string()],
    )
    .on_date(today())
}

pub fn draft(description: &str) -> LeadDraft {
    LeadDraft {
        description: description.to_string(),
        category: "rally".to_string(),
        keywords: Vec::new(),
        date: None,
        time: None,
        venue: None,
        source_hint: None,
    }
}

/// Add `count` fresh leads through the orchestrator's merge path
pub fn with_leads(state: RunState, count: usize) -> RunState {
    let retained = state.leads.iter().map(|l| l.id).collect();
    let drafts = (0..count).map(|i| draft(&format!("Lead {}", i))).collect();
    state.apply(StageDelta::Leads(LeadsDelta { retained, drafts }))
}

pub fn verification(lead_id: u64, keep: bool) -> VerificationResult {
    VerificationResult {
        lead_id,
        is_specific: true,
        has_date: keep,
        has_location: true,
        has_time: false,
        temporality: Temporality::Future,
        confidence: 0.9,
        should_keep: keep,
        reason: if keep { "specific and dated" } else { "no date" }.to_string(),
    }
}

pub fn event(id: &str, title: &str, date: &str, location: &str) -> Event {
    Event {
        id: id.to_string(),
        title: title.to_string(),
        date: date.to_string(),
        time: None,
        location: location.to_string(),
        description: String::new(),
        organizer: None,
        access: None,
        source_url: None,
        lead_id: None,
        raw_score: 50,
        score: 0,
        rationale: String::new(),
        dedup_group_id: String::new(),
    }
}

pub fn scored_event(id: &str, score: u8) -> Event {
    let mut e = event(id, &format!("Event {}", id), "2025-06-05", "City Hall");
    e.score = score;
    e
}

pub fn test_gateway() -> Arc<CallGateway> {
    Arc::new(CallGateway::new(
        Arc::new(CacheStore::with_limits(1_000, 3_600)),
        Arc::new(CostLedger::new()),
        CallPolicy {
            timeout_secs: 5,
            max_attempts: 2,
            backoff_base_ms: 1,
        },
    ))
}

type CompletionFn = dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync;

/// Completion provider answering from a closure, counting calls per schema
pub struct FnCompletionProvider {
    respond: Box<CompletionFn>,
    calls: Mutex<Vec<String>>,
}

impl FnCompletionProvider {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls_for(&self, schema_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.as_str() == schema_name)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for FnCompletionProvider {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.lock().unwrap().push(request.schema_name.clone());
        let content = (self.respond)(request)?;
        Ok(Completion {
            content,
            usage: Some(TokenUsage {
                input_tokens: 1_000,
                output_tokens: 500,
                total_tokens: 1_500,
            }),
        })
    }
}

pub fn llm_client_with(provider: Arc<FnCompletionProvider>, gateway: Arc<CallGateway>) -> Arc<LlmClient> {
    Arc::new(LlmClient::new(
        provider,
        gateway,
        ModelPricing::default(),
        LlmConfig::default(),
    ))
}

pub fn llm_client<F>(respond: F) -> Arc<LlmClient>
where
    F: Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
{
    llm_client_with(Arc::new(FnCompletionProvider::new(respond)), test_gateway())
}

type SearchFn = dyn Fn(&str) -> Result<Vec<SearchHit>, ProviderError> + Send + Sync;

/// Search provider answering from a closure; tracks peak concurrency
pub struct FnSearchProvider {
    respond: Box<SearchFn>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FnSearchProvider {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<SearchHit>, ProviderError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for FnSearchProvider {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.respond)(query)
    }
}

pub fn search_client_with(provider: Arc<FnSearchProvider>, gateway: Arc<CallGateway>) -> Arc<SearchClient> {
    Arc::new(SearchClient::new(
        provider,
        gateway,
        SearchConfig::default(),
        0.001,
    ))
}

pub fn hit(url: &str, title: &str) -> SearchHit {
    SearchHit {
        url: url.to_string(),
        title: title.to_string(),
        snippet: format!("{} details", title),
    }
}

type ScriptFn = dyn Fn(&RunState, usize) -> StageResult<StageOutput> + Send + Sync;

/// Stage whose output is computed by a closure from the state and the
/// 0-based invocation count
pub struct ScriptedStage {
    kind: StageKind,
    script: Box<ScriptFn>,
    runs: AtomicUsize,
}

impl ScriptedStage {
    pub fn new<F>(kind: StageKind, script: F) -> Arc<Self>
    where
        F: Fn(&RunState, usize) -> StageResult<StageOutput> + Send + Sync + 'static,
    {
        Arc::new(Self {
            kind,
            script: Box::new(script),
            runs: AtomicUsize::new(0),
        })
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn run(&self, state: &RunState, _ctx: &StageContext) -> StageResult<StageOutput> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        (self.script)(state, n)
    }
}

/// Stage that never finishes
pub struct HangingStage(pub StageKind);

#[async_trait]
impl Stage for HangingStage {
    fn kind(&self) -> StageKind {
        self.0
    }

    async fn run(&self, _state: &RunState, _ctx: &StageContext) -> StageResult<StageOutput> {
        std::future::pending().await
    }
}
