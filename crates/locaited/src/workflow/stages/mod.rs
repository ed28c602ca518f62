//! Pipeline stages
//!
//! Five stages share one contract:
//! 1. Profile Builder - search profile and guidance
//! 2. Lead Generator - candidate event leads
//! 3. Lead Verifier - specificity and temporality checks (optional)
//! 4. Evidence Gatherer - per-lead web search, bounded concurrency
//! 5. Event Curator - extraction, dedup, scoring and the quality gate
//!
//! A stage reads only the fields its input view declares and returns a
//! [`StageDelta`]; it never mutates the run state.

pub mod event_curator;
pub mod evidence_gatherer;
pub mod lead_generator;
pub mod lead_verifier;
pub mod profile_builder;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use event_curator::EventCurator;
pub use evidence_gatherer::EvidenceGatherer;
pub use lead_generator::LeadGenerator;
pub use lead_verifier::LeadVerifier;
pub use profile_builder::ProfileBuilder;

use crate::{gateway::CallError, ledger::{RunMeter, StageMetrics}};

use super::types::{CuratorVerdict, Event, Evidence, LeadDraft, LeadId, Profile, RunState, VerificationResult};

/// Stage names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Profile,
    Leads,
    Verify,
    Evidence,
    Curate,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Profile => "profile_builder",
            StageKind::Leads => "lead_generator",
            StageKind::Verify => "lead_verifier",
            StageKind::Evidence => "evidence_gatherer",
            StageKind::Curate => "event_curator",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StageKind::Profile => "Profile Builder",
            StageKind::Leads => "Lead Generator",
            StageKind::Verify => "Lead Verifier",
            StageKind::Evidence => "Evidence Gatherer",
            StageKind::Curate => "Event Curator",
        }
    }

    pub fn order(&self) -> u32 {
        match self {
            StageKind::Profile => 1,
            StageKind::Leads => 2,
            StageKind::Verify => 3,
            StageKind::Evidence => 4,
            StageKind::Curate => 5,
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed stage failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("external call failed: {0}")]
    ExternalCallFailure(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("missing input: {0}")]
    MissingInput(&'static str),
}

impl From<CallError> for StageError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::ExternalCallFailure { detail, .. } => StageError::ExternalCallFailure(detail),
            CallError::MalformedResponse(detail) => StageError::MalformedResponse(detail),
            err @ CallError::BudgetExceeded { .. } => StageError::BudgetExceeded(err.to_string()),
        }
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;

/// Lead Generator output: which existing leads survive, plus new drafts
#[derive(Debug, Clone, PartialEq)]
pub struct LeadsDelta {
    pub retained: Vec<LeadId>,
    pub drafts: Vec<LeadDraft>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurationDelta {
    /// Qualifying events, ranked and capped
    pub events: Vec<Event>,
    pub verdict: CuratorVerdict,
}

/// Fields a stage hands back to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum StageDelta {
    Profile(Profile),
    Leads(LeadsDelta),
    Verify(Vec<VerificationResult>),
    Evidence(Vec<Evidence>),
    Curate(CurationDelta),
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub delta: StageDelta,
    /// Set when the budget cap cut the stage short; the delta is partial
    pub budget_exhausted: bool,
    /// One-line summary for the debug hook
    pub summary: String,
}

impl StageOutput {
    pub fn complete(delta: StageDelta, summary: impl Into<String>) -> Self {
        Self {
            delta,
            budget_exhausted: false,
            summary: summary.into(),
        }
    }

    pub fn degraded(delta: StageDelta, summary: impl Into<String>) -> Self {
        Self {
            delta,
            budget_exhausted: true,
            summary: summary.into(),
        }
    }
}

/// Per-run services handed to every stage
#[derive(Debug, Clone)]
pub struct StageContext {
    pub meter: RunMeter,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, state: &RunState, ctx: &StageContext) -> StageResult<StageOutput>;
}

/// The five stage implementations an orchestrator drives
#[derive(Clone)]
pub struct StageSet {
    pub profile: Arc<dyn Stage>,
    pub leads: Arc<dyn Stage>,
    pub verify: Arc<dyn Stage>,
    pub evidence: Arc<dyn Stage>,
    pub curate: Arc<dyn Stage>,
}

impl StageSet {
    pub fn get(&self, kind: StageKind) -> &Arc<dyn Stage> {
        match kind {
            StageKind::Profile => &self.profile,
            StageKind::Leads => &self.leads,
            StageKind::Verify => &self.verify,
            StageKind::Evidence => &self.evidence,
            StageKind::Curate => &self.curate,
        }
    }
}

/// Record of one stage execution, reported to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub run_id: Uuid,
    pub stage: StageKind,
    pub success: bool,
    pub outer_iteration: u32,
    pub inner_iteration: u32,
    pub summary: String,
    pub metrics: StageMetrics,
    pub budget_exhausted: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl StageReport {
    pub fn new(run_id: Uuid, stage: StageKind, state: &RunState, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            stage,
            success: false,
            outer_iteration: state.outer_iteration,
            inner_iteration: state.inner_iteration,
            summary: String::new(),
            metrics: StageMetrics::default(),
            budget_exhausted: false,
            started_at,
            completed_at: Utc::now(),
            execution_time_ms: 0,
        }
    }

    pub fn complete(mut self, output: &StageOutput, metrics: StageMetrics) -> Self {
        self.success = true;
        self.summary = output.summary.clone();
        self.budget_exhausted = output.budget_exhausted;
        self.finish(metrics)
    }

    pub fn fail(mut self, error: &StageError, metrics: StageMetrics) -> Self {
        self.success = false;
        self.summary = error.to_string();
        self.finish(metrics)
    }

    fn finish(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self.completed_at = Utc::now();
        self.execution_time_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self
    }
}
