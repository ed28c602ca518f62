//! Stage 3: Lead Verifier
//!
//! Classifies each unverified lead for specificity and temporality. Leads
//! are judged in small batches, one completion per batch; results for leads
//! already judged in an earlier inner pass are kept as they are.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    brain::{LlmClient, Prompt},
    cache::{CanonicalKey, Namespace},
    config::{OngoingPolicy, WorkflowConfig},
    workflow::types::{Lead, RunState, Temporality, VerificationResult},
};

use super::{Stage, StageContext, StageDelta, StageError, StageKind, StageOutput, StageResult};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LeadAssessment {
    /// Position of the lead in the batch, starting at 0
    pub index: usize,
    /// Names one concrete event rather than a category or listing
    pub is_specific: bool,
    pub has_date: bool,
    pub has_location: bool,
    #[serde(default)]
    pub has_time: bool,
    pub temporality: Temporality,
    /// Between 0 and 1
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VerificationBatch {
    pub results: Vec<LeadAssessment>,
}

const SYSTEM_PROMPT: &str = "You are a photo editor screening event leads. For \
each numbered lead decide whether it names one specific event, whether it has \
a date, a location and a start time, and whether the event is FUTURE, PAST, \
ONGOING or UNCLEAR relative to today. Give a one-line reason. Respond with \
JSON only.";

pub struct LeadVerifier {
    llm: Arc<LlmClient>,
    config: WorkflowConfig,
}

impl LeadVerifier {
    pub fn new(llm: Arc<LlmClient>, config: WorkflowConfig) -> Self {
        Self { llm, config }
    }

    fn cache_key(state: &RunState, batch: &[&Lead]) -> CanonicalKey {
        let leads: Vec<serde_json::Value> = batch
            .iter()
            .map(|lead| {
                serde_json::json!({
                    "description": lead.description,
                    "date": lead.date,
                    "time": lead.time,
                    "venue": lead.venue,
                })
            })
            .collect();
        CanonicalKey::new()
            .text("location", &state.request.location)
            .text("reference_date", &state.reference_date.to_string())
            .value("leads", serde_json::Value::Array(leads))
    }

    fn prompt(state: &RunState, batch: &[&Lead]) -> Prompt {
        let mut user = format!(
            "Today: {}\nLocation of interest: {}\n\nLeads:\n",
            state.reference_date, state.request.location
        );
        for (index, lead) in batch.iter().enumerate() {
            user.push_str(&format!("{}. {}", index, lead.description));
            if let Some(date) = &lead.date {
                user.push_str(&format!(" | date: {}", date));
            }
            if let Some(time) = &lead.time {
                user.push_str(&format!(" | time: {}", time));
            }
            if let Some(venue) = &lead.venue {
                user.push_str(&format!(" | venue: {}", venue));
            }
            user.push('\n');
        }
        Prompt::new(SYSTEM_PROMPT, user)
    }

    fn should_keep(&self, assessment: &LeadAssessment) -> bool {
        let timely = match assessment.temporality {
            Temporality::Future => true,
            Temporality::Ongoing => self.config.ongoing_policy == OngoingPolicy::Keep,
            Temporality::Past | Temporality::Unclear => false,
        };
        assessment.is_specific && assessment.has_date && assessment.has_location && timely
    }

    /// Map assessments back to leads; a lead the model skipped is unclear
    fn resolve(&self, batch: &[&Lead], assessments: Vec<LeadAssessment>) -> Vec<VerificationResult> {
        batch
            .iter()
            .enumerate()
            .map(|(index, lead)| match assessments.iter().find(|a| a.index == index) {
                Some(assessment) => VerificationResult {
                    lead_id: lead.id,
                    is_specific: assessment.is_specific,
                    has_date: assessment.has_date,
                    has_location: assessment.has_location,
                    has_time: assessment.has_time,
                    temporality: assessment.temporality,
                    confidence: normalize_confidence(assessment.confidence),
                    should_keep: self.should_keep(assessment),
                    reason: assessment.reason.clone(),
                },
                None => VerificationResult {
                    lead_id: lead.id,
                    is_specific: false,
                    has_date: false,
                    has_location: false,
                    has_time: false,
                    temporality: Temporality::Unclear,
                    confidence: 0.0,
                    should_keep: false,
                    reason: "no assessment returned".to_string(),
                },
            })
            .collect()
    }
}

/// Accept both 0..1 and percentage confidences
fn normalize_confidence(value: f64) -> f64 {
    let value = if value > 1.0 { value / 100.0 } else { value };
    value.clamp(0.0, 1.0)
}

#[async_trait]
impl Stage for LeadVerifier {
    fn kind(&self) -> StageKind {
        StageKind::Verify
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> StageResult<StageOutput> {
        let pending: Vec<&Lead> = state
            .leads
            .iter()
            .filter(|lead| state.verification_for(lead.id).is_none())
            .collect();

        if pending.is_empty() {
            return Ok(StageOutput::complete(
                StageDelta::Verify(Vec::new()),
                "no unverified leads",
            ));
        }

        tracing::info!(
            "[VERIFY] Verifying {} leads in batches of {}",
            pending.len(),
            self.config.verify_batch_size
        );

        let mut results = Vec::with_capacity(pending.len());
        for batch in pending.chunks(self.config.verify_batch_size.max(1)) {
            let outcome = self
                .llm
                .complete_json::<VerificationBatch>(
                    &ctx.meter,
                    StageKind::Verify,
                    Namespace::Verify,
                    Self::cache_key(state, batch),
                    Self::prompt(state, batch),
                )
                .await;

            match outcome {
                Ok(structured) => results.extend(self.resolve(batch, structured.value.results)),
                Err(err) if err.is_budget_exceeded() => {
                    tracing::warn!(
                        "[VERIFY] Budget exhausted after {} of {} leads",
                        results.len(),
                        pending.len()
                    );
                    let summary = format!("verified {} of {} leads", results.len(), pending.len());
                    return Ok(StageOutput::degraded(StageDelta::Verify(results), summary));
                }
                Err(err) => return Err(StageError::from(err)),
            }
        }

        let kept = results.iter().filter(|r| r.should_keep).count();
        tracing::info!("[VERIFY] {} of {} leads kept", kept, results.len());
        let summary = format!("{} of {} leads kept", kept, results.len());
        Ok(StageOutput::complete(StageDelta::Verify(results), summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessment(index: usize, temporality: Temporality) -> LeadAssessment {
        LeadAssessment {
            index,
            is_specific: true,
            has_date: true,
            has_location: true,
            has_time: false,
            temporality,
            confidence: 85.0,
            reason: "ok".to_string(),
        }
    }

    #[test]
    fn test_confidence_normalization() {
        assert_eq!(normalize_confidence(0.7), 0.7);
        assert_eq!(normalize_confidence(85.0), 0.85);
        assert_eq!(normalize_confidence(-1.0), 0.0);
    }

    #[test]
    fn test_keep_rule_follows_policy() {
        let verifier = |policy| LeadVerifier {
            llm: crate::test_support::llm_client(|_| Ok(String::new())),
            config: WorkflowConfig {
                ongoing_policy: policy,
                ..WorkflowConfig::default()
            },
        };

        let strict = verifier(OngoingPolicy::Drop);
        let lenient = verifier(OngoingPolicy::Keep);
        let ongoing = assessment(0, Temporality::Ongoing);

        assert!(strict.should_keep(&assessment(0, Temporality::Future)));
        assert!(!strict.should_keep(&ongoing));
        assert!(lenient.should_keep(&ongoing));
        assert!(!lenient.should_keep(&assessment(0, Temporality::Past)));

        let mut vague = assessment(0, Temporality::Future);
        vague.has_date = false;
        assert!(!lenient.should_keep(&vague));
    }
}
