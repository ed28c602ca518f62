//! Stage 5: Event Curator
//!
//! Extracts structured events from gathered evidence, merges duplicates,
//! scores what is left and applies the quality gate. Candidates without a
//! date or a location are discarded before scoring.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    brain::{LlmClient, Prompt},
    cache::{CanonicalKey, Namespace},
    config::WorkflowConfig,
    curation::{evaluate_gate, DedupEngine, ScoringContext},
    workflow::types::{CuratorVerdict, Event, Evidence, RunState, Shortfall},
};

use super::{CurationDelta, Stage, StageContext, StageDelta, StageError, StageKind, StageOutput, StageResult};

/// Snippets per lead included in the extraction prompt
const HITS_PER_LEAD: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEvent {
    /// Number of the lead this event was found under
    pub lead_index: Option<usize>,
    pub title: String,
    /// YYYY-MM-DD
    pub date: Option<String>,
    pub time: Option<String>,
    /// Venue and address
    pub location: Option<String>,
    #[serde(default)]
    pub description: String,
    pub organizer: Option<String>,
    /// Public, ticketed, press-only, ...
    pub access: Option<String>,
    pub source_url: Option<String>,
    /// How well the event matches the interests, 0 to 100
    pub relevance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionBatch {
    pub events: Vec<ExtractedEvent>,
}

const SYSTEM_PROMPT: &str = "You extract concrete upcoming events from search \
results for a photojournalist. Only report events that the results actually \
describe. Give each event its date as YYYY-MM-DD and its venue. Leave a field \
null when the results do not state it. Respond with JSON only.";

pub struct EventCurator {
    llm: Arc<LlmClient>,
    config: WorkflowConfig,
}

impl EventCurator {
    pub fn new(llm: Arc<LlmClient>, config: WorkflowConfig) -> Self {
        Self { llm, config }
    }

    fn shortfall(verdict: Shortfall, summary: &str) -> StageOutput {
        StageOutput::complete(
            StageDelta::Curate(CurationDelta {
                events: Vec::new(),
                verdict: CuratorVerdict::Shortfall(verdict),
            }),
            summary,
        )
    }

    fn cache_key(state: &RunState, sources: &[&Evidence]) -> CanonicalKey {
        let evidence: Vec<serde_json::Value> = sources
            .iter()
            .map(|e| {
                let hits: Vec<serde_json::Value> = e
                    .hits
                    .iter()
                    .take(HITS_PER_LEAD)
                    .map(|h| serde_json::json!({ "url": h.url, "title": h.title, "snippet": h.snippet }))
                    .collect();
                serde_json::json!({ "query": e.query, "hits": hits })
            })
            .collect();
        CanonicalKey::new()
            .text("location", &state.request.location)
            .text("reference_date", &state.reference_date.to_string())
            .int("window_days", state.request.time_window_days as i64)
            .set("interests", &state.request.interests)
            .value("evidence", serde_json::Value::Array(evidence))
    }

    fn prompt(state: &RunState, sources: &[&Evidence]) -> Prompt {
        let mut user = format!(
            "Location: {}\nWindow: {} to {}\nInterests: {}\n",
            state.request.location,
            state.reference_date,
            state.window_end(),
            state.request.interests.join(", ")
        );
        for (index, evidence) in sources.iter().enumerate() {
            let description = state
                .leads
                .iter()
                .find(|lead| lead.id == evidence.lead_id)
                .map(|lead| lead.description.as_str())
                .unwrap_or(evidence.query.as_str());
            user.push_str(&format!("\nLead {}: {}\n", index, description));
            for hit in evidence.hits.iter().take(HITS_PER_LEAD) {
                user.push_str(&format!("- {} ({})\n  {}\n", hit.title, hit.url, hit.snippet));
            }
        }
        Prompt::new(SYSTEM_PROMPT, user)
    }

    /// Turn extracted candidates into events; ids are stable within a pass
    fn to_events(state: &RunState, sources: &[&Evidence], extracted: Vec<ExtractedEvent>) -> Vec<Event> {
        extracted
            .into_iter()
            .filter_map(|candidate| {
                let date = non_empty(candidate.date)?;
                let location = non_empty(candidate.location)?;
                let title = candidate.title.trim().to_string();
                if title.is_empty() {
                    return None;
                }
                let lead_id = candidate
                    .lead_index
                    .and_then(|i| sources.get(i))
                    .map(|e| e.lead_id);
                let source_url = non_empty(candidate.source_url).or_else(|| {
                    candidate
                        .lead_index
                        .and_then(|i| sources.get(i))
                        .and_then(|e| e.hits.first())
                        .map(|h| h.url.clone())
                });
                Some(Event {
                    id: String::new(),
                    title,
                    date,
                    time: non_empty(candidate.time),
                    location,
                    description: candidate.description,
                    organizer: non_empty(candidate.organizer),
                    access: non_empty(candidate.access),
                    source_url,
                    lead_id,
                    raw_score: candidate.relevance.clamp(0.0, 100.0).round() as u8,
                    score: 0,
                    rationale: String::new(),
                    dedup_group_id: String::new(),
                })
            })
            .enumerate()
            .map(|(n, mut event)| {
                event.id = format!("E{}-{:03}", state.outer_iteration, n + 1);
                event
            })
            .collect()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null") && !v.eq_ignore_ascii_case("tbd"))
}

#[async_trait]
impl Stage for EventCurator {
    fn kind(&self) -> StageKind {
        StageKind::Curate
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> StageResult<StageOutput> {
        if state.evidence.is_empty() {
            tracing::info!("[CURATOR] No leads reached curation");
            return Ok(Self::shortfall(Shortfall::NoLeadsSurvived, "no leads survived"));
        }

        let sources: Vec<&Evidence> = state
            .evidence
            .iter()
            .filter(|e| !e.hits.is_empty())
            .collect();
        if sources.is_empty() {
            tracing::info!("[CURATOR] Searches returned nothing for any lead");
            return Ok(Self::shortfall(Shortfall::NoEvidenceFound, "no evidence found"));
        }

        let result = self
            .llm
            .complete_json::<ExtractionBatch>(
                &ctx.meter,
                StageKind::Curate,
                Namespace::Events,
                Self::cache_key(state, &sources),
                Self::prompt(state, &sources),
            )
            .await;

        let batch = match result {
            Ok(structured) => structured.value,
            Err(err) if err.is_budget_exceeded() => {
                tracing::warn!("[CURATOR] Budget exhausted before extraction");
                return Ok(StageOutput::degraded(
                    StageDelta::Curate(CurationDelta {
                        events: Vec::new(),
                        verdict: CuratorVerdict::Shortfall(Shortfall::InsufficientEvents {
                            qualifying: 0,
                            required: self.config.min_events,
                        }),
                    }),
                    "budget exhausted before extraction",
                ));
            }
            Err(err) => return Err(StageError::from(err)),
        };

        let extracted = batch.events.len();
        let candidates = Self::to_events(state, &sources, batch.events);
        let dropped = extracted - candidates.len();
        if dropped > 0 {
            tracing::debug!("[CURATOR] Dropped {} candidates without date or location", dropped);
        }

        let engine = DedupEngine::new(
            self.config.dedup_threshold,
            ScoringContext {
                reference_date: state.reference_date,
                window_days: state.request.time_window_days,
                interests: state.request.interests.clone(),
            },
        );
        let ranked = engine.process(candidates);
        let unique = ranked.len();
        let (events, verdict) = evaluate_gate(ranked, &self.config);

        let summary = match &verdict {
            CuratorVerdict::Approve { qualifying } => format!(
                "{} extracted, {} unique, {} qualifying; approved",
                extracted, unique, qualifying
            ),
            CuratorVerdict::Shortfall(shortfall) => format!(
                "{} extracted, {} unique; {}",
                extracted,
                unique,
                shortfall.describe(self.config.min_event_score)
            ),
        };
        tracing::info!("[CURATOR] {}", summary);

        Ok(StageOutput::complete(
            StageDelta::Curate(CurationDelta { events, verdict }),
            summary,
        ))
    }
}
