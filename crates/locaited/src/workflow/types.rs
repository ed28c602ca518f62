//! Run state and the records threaded through the pipeline

use chrono::{Duration, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ledger::LedgerTotals, search::SearchHit, LocaitedError, Result};

use super::stages::{LeadsDelta, StageDelta, StageKind};

pub type LeadId = u64;

/// Maximum number of interests a request may carry
pub const MAX_INTERESTS: usize = 5;

/// Caller parameters, immutable for the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub location: String,
    pub time_window_days: u32,
    pub interests: Vec<String>,
    #[serde(default)]
    pub free_text_query: Option<String>,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Day the run is evaluated against; today (UTC) when absent
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

fn default_use_cache() -> bool {
    true
}

impl DiscoveryRequest {
    pub fn new(location: impl Into<String>, time_window_days: u32, interests: Vec<String>) -> Self {
        Self {
            location: location.into(),
            time_window_days,
            interests,
            free_text_query: None,
            use_cache: true,
            reference_date: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.free_text_query = Some(query.into());
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn on_date(mut self, reference_date: NaiveDate) -> Self {
        self.reference_date = Some(reference_date);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.location.trim().is_empty() {
            return Err(LocaitedError::InvalidRequest(
                "location must not be empty".to_string(),
            ));
        }
        if self.time_window_days == 0 {
            return Err(LocaitedError::InvalidRequest(
                "time_window_days must be at least 1".to_string(),
            ));
        }
        let interests = self
            .interests
            .iter()
            .filter(|i| !i.trim().is_empty())
            .count();
        if interests == 0 || interests > MAX_INTERESTS || interests != self.interests.len() {
            return Err(LocaitedError::InvalidRequest(format!(
                "between 1 and {} non-empty interests are required, got {}",
                MAX_INTERESTS,
                self.interests.len()
            )));
        }
        Ok(())
    }
}

/// Search profile derived by the Profile Builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub location: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub interests: Vec<String>,
    pub focus_event_types: Vec<String>,
    pub avoid_event_types: Vec<String>,
    pub key_organizations: Vec<String>,
    pub search_themes: Vec<String>,
    /// Free-text guidance for the Lead Generator
    pub guidance: String,
}

impl Profile {
    pub fn time_frame(&self) -> String {
        format!("{} to {}", self.window_start, self.window_end)
    }
}

/// Lead as proposed by the generator, before the orchestrator assigns an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LeadDraft {
    /// One-sentence description of a specific event
    pub description: String,
    /// Event category (protest, conference, festival, ...)
    pub category: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Event date if known, YYYY-MM-DD
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    /// Where the lead came from (organizer site, listing, news)
    #[serde(default)]
    pub source_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub description: String,
    pub category: String,
    pub keywords: Vec<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub venue: Option<String>,
    pub source_hint: Option<String>,
}

impl Lead {
    pub fn from_draft(id: LeadId, draft: LeadDraft) -> Self {
        Self {
            id,
            description: draft.description,
            category: draft.category,
            keywords: draft.keywords,
            date: draft.date,
            time: draft.time,
            venue: draft.venue,
            source_hint: draft.source_hint,
        }
    }

    /// Names both a date and a venue
    pub fn is_specific(&self) -> bool {
        let present = |field: &Option<String>| {
            field.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
        };
        present(&self.date) && present(&self.venue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Temporality {
    Future,
    Past,
    Ongoing,
    Unclear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub lead_id: LeadId,
    pub is_specific: bool,
    pub has_date: bool,
    pub has_location: bool,
    pub has_time: bool,
    pub temporality: Temporality,
    /// In [0, 1]
    pub confidence: f64,
    pub should_keep: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub lead_id: LeadId,
    pub query: String,
    pub hits: Vec<SearchHit>,
}

/// Curated event. Date and location are required; candidates lacking either
/// never become an `Event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub date: String,
    pub time: Option<String>,
    pub location: String,
    pub description: String,
    pub organizer: Option<String>,
    pub access: Option<String>,
    pub source_url: Option<String>,
    pub lead_id: Option<LeadId>,
    /// Relevance estimate from extraction, 0..=100
    pub raw_score: u8,
    /// Final score, 0..=100
    pub score: u8,
    pub rationale: String,
    pub dedup_group_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateDecision {
    Approve,
    Retry,
    Reject,
}

/// Why a curation pass did not approve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shortfall {
    NoLeadsSurvived,
    NoEvidenceFound,
    InsufficientEvents { qualifying: usize, required: usize },
}

impl Shortfall {
    pub fn describe(&self, min_score: u8) -> String {
        match self {
            Shortfall::NoLeadsSurvived => {
                "no leads survived verification; propose more specific, dated events".to_string()
            }
            Shortfall::NoEvidenceFound => {
                "searches returned no evidence for any lead; favour well-publicised events"
                    .to_string()
            }
            Shortfall::InsufficientEvents {
                qualifying,
                required,
            } => format!(
                "only {} of {} required events scored above {}; broaden event types or themes",
                qualifying, required, min_score
            ),
        }
    }
}

/// Gate verdict produced by the Curator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CuratorVerdict {
    Approve { qualifying: usize },
    Shortfall(Shortfall),
}

impl CuratorVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, CuratorVerdict::Approve { .. })
    }
}

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalReason {
    Approved,
    InsufficientEvents { qualifying: usize, required: usize },
    NoLeadsSurvived,
    NoEvidenceFound,
    BudgetExceeded { spent_usd: f64 },
    StageFailed { stage: StageKind, detail: String },
    Cancelled,
    StoppedByObserver { after: StageKind },
    InvalidRequest { detail: String },
}

impl TerminalReason {
    pub fn decision(&self) -> GateDecision {
        match self {
            TerminalReason::Approved => GateDecision::Approve,
            _ => GateDecision::Reject,
        }
    }
}

impl From<Shortfall> for TerminalReason {
    fn from(shortfall: Shortfall) -> Self {
        match shortfall {
            Shortfall::NoLeadsSurvived => TerminalReason::NoLeadsSurvived,
            Shortfall::NoEvidenceFound => TerminalReason::NoEvidenceFound,
            Shortfall::InsufficientEvents {
                qualifying,
                required,
            } => TerminalReason::InsufficientEvents {
                qualifying,
                required,
            },
        }
    }
}

/// State threaded through one orchestration run.
///
/// Stages read it; only the orchestrator writes it (through [`RunState::apply`]
/// and the cycle helpers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub request: DiscoveryRequest,
    pub reference_date: NaiveDate,
    pub profile: Option<Profile>,
    pub leads: Vec<Lead>,
    pub verification_results: Vec<VerificationResult>,
    pub evidence: Vec<Evidence>,
    pub events: Vec<Event>,
    pub curation: Option<CuratorVerdict>,
    pub gate_decision: Option<GateDecision>,
    /// Verifier to Lead Generator feedback (inner cycle)
    pub editor_feedback: Option<String>,
    /// Curator to Profile Builder feedback (outer cycle)
    pub researcher_feedback: Option<String>,
    pub outer_iteration: u32,
    pub inner_iteration: u32,
    pub metrics: LedgerTotals,
    pub budget_exhausted: bool,
    pub stage_executions: u32,
    next_lead_id: LeadId,
}

impl RunState {
    pub fn seed(request: DiscoveryRequest, reference_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request,
            reference_date,
            profile: None,
            leads: Vec::new(),
            verification_results: Vec::new(),
            evidence: Vec::new(),
            events: Vec::new(),
            curation: None,
            gate_decision: None,
            editor_feedback: None,
            researcher_feedback: None,
            outer_iteration: 0,
            inner_iteration: 0,
            metrics: LedgerTotals::default(),
            budget_exhausted: false,
            stage_executions: 0,
            next_lead_id: 1,
        }
    }

    /// Last day of the request window (inclusive)
    pub fn window_end(&self) -> NaiveDate {
        self.reference_date + Duration::days(self.request.time_window_days as i64)
    }

    pub fn verification_for(&self, lead_id: LeadId) -> Option<&VerificationResult> {
        self.verification_results
            .iter()
            .find(|r| r.lead_id == lead_id)
    }

    pub fn kept_lead_count(&self) -> usize {
        self.leads
            .iter()
            .filter(|lead| {
                self.verification_for(lead.id)
                    .map(|r| r.should_keep)
                    .unwrap_or(false)
            })
            .count()
    }

    /// Leads that go on to evidence gathering. Without verification the
    /// leads' own date and venue stand in for the verifier's judgement.
    pub fn eligible_leads(&self, verification_enabled: bool) -> Vec<&Lead> {
        if !verification_enabled {
            return self.leads.iter().filter(|lead| lead.is_specific()).collect();
        }
        self.leads
            .iter()
            .filter(|lead| {
                self.verification_for(lead.id)
                    .map(|r| r.should_keep && r.has_date && r.has_location)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Merge a stage delta. Lead ids are assigned here and never reused.
    pub fn apply(mut self, delta: StageDelta) -> Self {
        match delta {
            StageDelta::Profile(profile) => {
                self.profile = Some(profile);
            }
            StageDelta::Leads(LeadsDelta { retained, drafts }) => {
                self.leads.retain(|lead| retained.contains(&lead.id));
                let leads = &self.leads;
                self.verification_results
                    .retain(|r| leads.iter().any(|lead| lead.id == r.lead_id));
                for draft in drafts {
                    let id = self.next_lead_id;
                    self.next_lead_id += 1;
                    self.leads.push(Lead::from_draft(id, draft));
                }
            }
            StageDelta::Verify(results) => {
                for result in results {
                    match self
                        .verification_results
                        .iter_mut()
                        .find(|r| r.lead_id == result.lead_id)
                    {
                        Some(existing) => *existing = result,
                        None => self.verification_results.push(result),
                    }
                }
            }
            StageDelta::Evidence(evidence) => {
                self.evidence = evidence;
            }
            StageDelta::Curate(curation) => {
                self.events = if curation.verdict.is_approved() {
                    curation.events
                } else {
                    Vec::new()
                };
                self.curation = Some(curation.verdict);
            }
        }
        self
    }

    /// Enter another inner pass (Verifier back to Lead Generator)
    pub(crate) fn begin_inner_retry(&mut self, feedback: String) {
        self.inner_iteration += 1;
        self.editor_feedback = Some(feedback);
    }

    /// Enter another outer pass; results of the failed pass are discarded
    pub(crate) fn begin_outer_retry(&mut self, feedback: String) {
        self.outer_iteration += 1;
        self.researcher_feedback = Some(feedback);
        self.gate_decision = Some(GateDecision::Retry);
        self.editor_feedback = None;
        self.leads.clear();
        self.verification_results.clear();
        self.evidence.clear();
        self.events.clear();
        self.curation = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, request, today, verification};

    fn dated(description: &str, venue: Option<&str>) -> LeadDraft {
        LeadDraft {
            date: Some("2025-06-05".to_string()),
            venue: venue.map(str::to_string),
            ..draft(description)
        }
    }

    fn state_with(drafts: Vec<LeadDraft>) -> RunState {
        RunState::seed(request(), today()).apply(StageDelta::Leads(LeadsDelta {
            retained: Vec::new(),
            drafts,
        }))
    }

    #[test]
    fn test_unverified_leads_need_date_and_venue() {
        let state = state_with(vec![
            dated("Tenant rally", Some("Borough Hall")),
            dated("Some climate thing", None),
            draft("Housing forum sometime"),
            dated("Blank venue", Some("  ")),
        ]);

        let eligible: Vec<&str> = state
            .eligible_leads(false)
            .into_iter()
            .map(|l| l.description.as_str())
            .collect();
        assert_eq!(eligible, vec!["Tenant rally"]);
    }

    #[test]
    fn test_verified_leads_follow_verification() {
        let state = state_with(vec![draft("Lead A"), draft("Lead B")]);
        let ids: Vec<LeadId> = state.leads.iter().map(|l| l.id).collect();
        let state = state.apply(StageDelta::Verify(vec![
            verification(ids[0], true),
            verification(ids[1], false),
        ]));

        let eligible: Vec<LeadId> = state.eligible_leads(true).into_iter().map(|l| l.id).collect();
        assert_eq!(eligible, vec![ids[0]]);
    }
}
