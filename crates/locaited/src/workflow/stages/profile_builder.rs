//! Stage 1: Profile Builder
//!
//! Turns the request (plus any outer-cycle feedback) into a search profile:
//! event types to chase and avoid, organizations worth watching, search
//! themes, and guidance for the Lead Generator.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    brain::{LlmClient, Prompt},
    cache::{CanonicalKey, Namespace},
    workflow::types::{Profile, RunState},
};

use super::{Stage, StageContext, StageDelta, StageError, StageKind, StageOutput, StageResult};

/// Shape the LLM fills in
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProfileDraft {
    /// Kinds of events worth attending (rallies, hearings, launches, ...)
    pub focus_event_types: Vec<String>,
    /// Kinds of events to skip
    #[serde(default)]
    pub avoid_event_types: Vec<String>,
    /// Local organizations likely to host relevant events
    #[serde(default)]
    pub key_organizations: Vec<String>,
    /// Search themes combining interests and location
    pub search_themes: Vec<String>,
    /// Short guidance for whoever proposes leads
    pub guidance: String,
}

const SYSTEM_PROMPT: &str = "You plan event discovery for a photojournalist. \
Given a location, a date window and interests, describe which kinds of public \
events to look for, which to avoid, which organizations tend to host them, and \
which search themes will surface them. Respond with JSON only.";

pub struct ProfileBuilder {
    llm: Arc<LlmClient>,
}

impl ProfileBuilder {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    fn cache_key(state: &RunState) -> CanonicalKey {
        let request = &state.request;
        CanonicalKey::new()
            .text("location", &request.location)
            .text("reference_date", &state.reference_date.to_string())
            .int("window_days", request.time_window_days as i64)
            .set("interests", &request.interests)
            .opt_text("query", request.free_text_query.as_deref())
            .opt_text("feedback", state.researcher_feedback.as_deref())
    }

    fn prompt(state: &RunState) -> Prompt {
        let request = &state.request;
        let mut user = format!(
            "Location: {}\nWindow: {} to {}\nInterests: {}\n",
            request.location,
            state.reference_date,
            state.window_end(),
            request.interests.join(", ")
        );
        if let Some(query) = &request.free_text_query {
            user.push_str(&format!("Additional request: {}\n", query));
        }
        if let Some(feedback) = &state.researcher_feedback {
            user.push_str(&format!(
                "The previous search came up short: {}\nAdjust the profile accordingly.\n",
                feedback
            ));
        }
        Prompt::new(SYSTEM_PROMPT, user)
    }

    /// Profile built from the request alone
    fn baseline(state: &RunState) -> Profile {
        let request = &state.request;
        Profile {
            location: request.location.clone(),
            window_start: state.reference_date,
            window_end: state.window_end(),
            interests: request.interests.clone(),
            focus_event_types: Vec::new(),
            avoid_event_types: Vec::new(),
            key_organizations: Vec::new(),
            search_themes: request
                .interests
                .iter()
                .map(|interest| format!("{} events in {}", interest, request.location))
                .collect(),
            guidance: request.free_text_query.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Stage for ProfileBuilder {
    fn kind(&self) -> StageKind {
        StageKind::Profile
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> StageResult<StageOutput> {
        tracing::info!(
            "[PROFILE] Building profile for {} (outer pass {})",
            state.request.location,
            state.outer_iteration
        );

        let result = self
            .llm
            .complete_json::<ProfileDraft>(
                &ctx.meter,
                StageKind::Profile,
                Namespace::Profile,
                Self::cache_key(state),
                Self::prompt(state),
            )
            .await;

        let draft = match result {
            Ok(structured) => structured.value,
            Err(err) if err.is_budget_exceeded() => {
                tracing::warn!("[PROFILE] Budget exhausted, using request-only profile");
                return Ok(StageOutput::degraded(
                    StageDelta::Profile(Self::baseline(state)),
                    "budget exhausted; request-only profile",
                ));
            }
            Err(err) => return Err(StageError::from(err)),
        };

        let mut profile = Self::baseline(state);
        profile.focus_event_types = draft.focus_event_types;
        profile.avoid_event_types = draft.avoid_event_types;
        profile.key_organizations = draft.key_organizations;
        if !draft.search_themes.is_empty() {
            profile.search_themes = draft.search_themes;
        }
        profile.guidance = draft.guidance;

        let summary = format!(
            "{} focus types, {} themes",
            profile.focus_event_types.len(),
            profile.search_themes.len()
        );
        Ok(StageOutput::complete(StageDelta::Profile(profile), summary))
    }
}
