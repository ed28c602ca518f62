//! Stage 2: Lead Generator
//!
//! Proposes candidate events from the profile. On a fresh pass it asks for
//! `leads_per_pass` leads. Once the verifier has judged the current leads it
//! switches to refine mode: leads that passed are kept, the rest are dropped
//! and replaced with new proposals shaped by the verifier's reasons.

use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    brain::{LlmClient, Prompt},
    cache::{normalize_text, CanonicalKey, Namespace},
    config::WorkflowConfig,
    workflow::types::{Lead, LeadDraft, LeadId, Profile, RunState},
};

use super::{LeadsDelta, Stage, StageContext, StageDelta, StageError, StageKind, StageOutput, StageResult};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LeadBatch {
    pub leads: Vec<LeadDraft>,
}

const SYSTEM_PROMPT: &str = "You propose specific upcoming public events for a \
photojournalist. Each lead must describe one concrete event with a date and a \
venue when known. Avoid recurring listings and generic categories. Respond \
with JSON only.";

/// How many leads to request and what to keep
struct Plan {
    retained: Vec<LeadId>,
    requested: usize,
    rejected: Vec<String>,
}

pub struct LeadGenerator {
    llm: Arc<LlmClient>,
    config: WorkflowConfig,
}

impl LeadGenerator {
    pub fn new(llm: Arc<LlmClient>, config: WorkflowConfig) -> Self {
        Self { llm, config }
    }

    fn plan(&self, state: &RunState) -> Plan {
        if state.verification_results.is_empty() {
            return Plan {
                retained: Vec::new(),
                requested: self.config.leads_per_pass,
                rejected: Vec::new(),
            };
        }

        let mut retained = Vec::new();
        let mut rejected = Vec::new();
        for lead in &state.leads {
            match state.verification_for(lead.id) {
                Some(result) if result.should_keep => retained.push(lead.id),
                Some(result) => rejected.push(format!("\"{}\": {}", lead.description, result.reason)),
                None => rejected.push(format!("\"{}\": not verified", lead.description)),
            }
        }

        let shortfall = self.config.min_verified_leads.saturating_sub(retained.len());
        Plan {
            requested: rejected.len().max(shortfall),
            retained,
            rejected,
        }
    }

    fn cache_key(state: &RunState, profile: &Profile, plan: &Plan, kept: &[&Lead]) -> CanonicalKey {
        CanonicalKey::new()
            .text("location", &profile.location)
            .text("window", &profile.time_frame())
            .set("interests", &profile.interests)
            .set("focus", &profile.focus_event_types)
            .set("avoid", &profile.avoid_event_types)
            .set("themes", &profile.search_themes)
            .text("guidance", &profile.guidance)
            .opt_text("query", state.request.free_text_query.as_deref())
            .opt_text("editor_feedback", state.editor_feedback.as_deref())
            .set("kept", kept.iter().map(|lead| lead.description.as_str()))
            .set("rejected", &plan.rejected)
            .int("requested", plan.requested as i64)
    }

    fn prompt(state: &RunState, profile: &Profile, plan: &Plan, kept: &[&Lead]) -> Prompt {
        let mut user = format!(
            "Location: {}\nWindow: {}\nInterests: {}\n",
            profile.location,
            profile.time_frame(),
            profile.interests.join(", ")
        );
        if !profile.focus_event_types.is_empty() {
            user.push_str(&format!("Focus on: {}\n", profile.focus_event_types.join(", ")));
        }
        if !profile.avoid_event_types.is_empty() {
            user.push_str(&format!("Avoid: {}\n", profile.avoid_event_types.join(", ")));
        }
        if !profile.key_organizations.is_empty() {
            user.push_str(&format!(
                "Organizations to watch: {}\n",
                profile.key_organizations.join(", ")
            ));
        }
        if !profile.search_themes.is_empty() {
            user.push_str(&format!("Themes: {}\n", profile.search_themes.join("; ")));
        }
        if !profile.guidance.is_empty() {
            user.push_str(&format!("Guidance: {}\n", profile.guidance));
        }
        if let Some(query) = &state.request.free_text_query {
            user.push_str(&format!("Request: {}\n", query));
        }
        if !kept.is_empty() {
            user.push_str("\nAlready accepted (do not repeat):\n");
            for lead in kept {
                user.push_str(&format!("- {}\n", lead.description));
            }
        }
        if !plan.rejected.is_empty() {
            user.push_str("\nRejected by the editor, with reasons:\n");
            for reason in &plan.rejected {
                user.push_str(&format!("- {}\n", reason));
            }
        }
        if let Some(feedback) = &state.editor_feedback {
            user.push_str(&format!("\nEditor feedback: {}\n", feedback));
        }
        user.push_str(&format!("\nPropose {} new leads.", plan.requested));
        Prompt::new(SYSTEM_PROMPT, user)
    }

    /// Drop drafts that repeat a kept lead or each other, and cap the count
    fn filter_drafts(drafts: Vec<LeadDraft>, kept: &[&Lead], limit: usize) -> Vec<LeadDraft> {
        let mut seen: HashSet<String> = kept
            .iter()
            .map(|lead| normalize_text(&lead.description))
            .collect();
        drafts
            .into_iter()
            .filter(|draft| !draft.description.trim().is_empty())
            .filter(|draft| seen.insert(normalize_text(&draft.description)))
            .take(limit)
            .collect()
    }
}

#[async_trait]
impl Stage for LeadGenerator {
    fn kind(&self) -> StageKind {
        StageKind::Leads
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> StageResult<StageOutput> {
        let profile = state
            .profile
            .as_ref()
            .ok_or(StageError::MissingInput("profile"))?;

        let plan = self.plan(state);
        let kept: Vec<&Lead> = state
            .leads
            .iter()
            .filter(|lead| plan.retained.contains(&lead.id))
            .collect();

        if plan.requested == 0 {
            let summary = format!("kept {} leads, none requested", plan.retained.len());
            return Ok(StageOutput::complete(
                StageDelta::Leads(LeadsDelta {
                    retained: plan.retained,
                    drafts: Vec::new(),
                }),
                summary,
            ));
        }

        tracing::info!(
            "[LEADS] Requesting {} leads ({} kept, {} rejected)",
            plan.requested,
            plan.retained.len(),
            plan.rejected.len()
        );

        let result = self
            .llm
            .complete_json::<LeadBatch>(
                &ctx.meter,
                StageKind::Leads,
                Namespace::Leads,
                Self::cache_key(state, profile, &plan, &kept),
                Self::prompt(state, profile, &plan, &kept),
            )
            .await;

        let batch = match result {
            Ok(structured) => structured.value,
            Err(err) if err.is_budget_exceeded() => {
                tracing::warn!("[LEADS] Budget exhausted, keeping current leads");
                let retained = state.leads.iter().map(|lead| lead.id).collect();
                return Ok(StageOutput::degraded(
                    StageDelta::Leads(LeadsDelta {
                        retained,
                        drafts: Vec::new(),
                    }),
                    "budget exhausted; no new leads",
                ));
            }
            Err(err) => return Err(StageError::from(err)),
        };

        let drafts = Self::filter_drafts(batch.leads, &kept, plan.requested);
        let summary = format!("kept {}, proposed {}", plan.retained.len(), drafts.len());
        Ok(StageOutput::complete(
            StageDelta::Leads(LeadsDelta {
                retained: plan.retained,
                drafts,
            }),
            summary,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::draft;

    #[test]
    fn test_filter_drafts_dedups_against_kept_and_caps() {
        let kept_lead = Lead::from_draft(1, draft("Climate March at City Hall"));
        let kept = vec![&kept_lead];
        let drafts = vec![
            draft("climate march at  city hall"),
            draft("Tenant rally"),
            draft("Tenant Rally"),
            draft("Book fair"),
            draft("Jazz night"),
        ];

        let filtered = LeadGenerator::filter_drafts(drafts, &kept, 2);
        let descriptions: Vec<_> = filtered.iter().map(|d| d.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Tenant rally", "Book fair"]);
    }
}
