//! Stage 4: Evidence Gatherer
//!
//! One web search per eligible lead, with at most `evidence_parallelism`
//! searches in flight. Results come back in lead order regardless of which
//! search finished first. Dropping the stage future aborts outstanding
//! searches.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    config::WorkflowConfig,
    gateway::CallError,
    search::SearchClient,
    workflow::types::{Evidence, Lead, RunState},
};

use super::{Stage, StageContext, StageDelta, StageError, StageKind, StageOutput, StageResult};

const QUERY_KEYWORDS: usize = 3;

pub struct EvidenceGatherer {
    search: Arc<SearchClient>,
    config: WorkflowConfig,
}

impl EvidenceGatherer {
    pub fn new(search: Arc<SearchClient>, config: WorkflowConfig) -> Self {
        Self { search, config }
    }

    /// Search query for one lead
    pub fn query_for(lead: &Lead, state: &RunState) -> String {
        let mut parts = vec![lead.description.trim().to_string()];
        parts.extend(
            lead.keywords
                .iter()
                .filter(|k| !k.trim().is_empty())
                .take(QUERY_KEYWORDS)
                .cloned(),
        );
        parts.push(state.request.location.clone());
        parts.push(state.reference_date.year().to_string());
        parts.join(" ")
    }
}

#[async_trait]
impl Stage for EvidenceGatherer {
    fn kind(&self) -> StageKind {
        StageKind::Evidence
    }

    async fn run(&self, state: &RunState, ctx: &StageContext) -> StageResult<StageOutput> {
        let leads = state.eligible_leads(self.config.verification_enabled);
        if leads.is_empty() {
            tracing::info!("[EVIDENCE] No eligible leads to search");
            return Ok(StageOutput::complete(
                StageDelta::Evidence(Vec::new()),
                "no eligible leads",
            ));
        }

        let parallelism = self.config.evidence_parallelism.max(1);
        tracing::info!(
            "[EVIDENCE] Searching {} leads with parallelism {}",
            leads.len(),
            parallelism
        );

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut tasks = JoinSet::new();

        for (index, lead) in leads.iter().enumerate() {
            let semaphore = semaphore.clone();
            let search = self.search.clone();
            let meter = ctx.meter.clone();
            let lead_id = lead.id;
            let query = Self::query_for(lead, state);

            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => search.search(&meter, StageKind::Evidence, &query).await,
                    Err(e) => Err(CallError::ExternalCallFailure {
                        detail: format!("semaphore closed: {}", e),
                        retryable: false,
                    }),
                };
                (index, lead_id, query, outcome)
            });
        }

        let mut slots: Vec<Option<Evidence>> = vec![None; leads.len()];
        let mut budget_hit = false;

        while let Some(joined) = tasks.join_next().await {
            let (index, lead_id, query, outcome) = joined.map_err(|e| {
                StageError::ExternalCallFailure(format!("search task failed: {}", e))
            })?;
            match outcome {
                Ok(found) => {
                    if found.hits.is_empty() {
                        tracing::debug!("[EVIDENCE] No results for lead {}", lead_id);
                    }
                    slots[index] = Some(Evidence {
                        lead_id,
                        query,
                        hits: found.hits,
                    });
                }
                Err(err) if err.is_budget_exceeded() => budget_hit = true,
                Err(err) => {
                    tracing::error!("[EVIDENCE] Search for lead {} failed: {}", lead_id, err);
                    // The stage has failed; stop paying for the remaining searches
                    tasks.abort_all();
                    return Err(StageError::from(err));
                }
            }
        }

        let evidence: Vec<Evidence> = slots.into_iter().flatten().collect();
        let with_hits = evidence.iter().filter(|e| !e.hits.is_empty()).count();
        let summary = format!(
            "searched {} of {} leads, {} with results",
            evidence.len(),
            leads.len(),
            with_hits
        );

        if budget_hit {
            tracing::warn!("[EVIDENCE] Budget exhausted; {}", summary);
            return Ok(StageOutput::degraded(StageDelta::Evidence(evidence), summary));
        }

        tracing::info!("[EVIDENCE] {}", summary);
        Ok(StageOutput::complete(StageDelta::Evidence(evidence), summary))
    }
}
