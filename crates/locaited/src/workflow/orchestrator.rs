//! Discovery Orchestrator
//!
//! Drives the five stages in order, merges their deltas into the run state,
//! and follows [`next_transition`] through the inner (verifier) and outer
//! (curator) retry cycles until the run approves or rejects. Stages run one
//! at a time; each is raced against the caller's cancellation token.

use std::{sync::Arc, time::Instant};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    brain::LlmClient,
    config::{AppConfig, CostConfig, WorkflowConfig},
    gateway::CallGateway,
    ledger::RunMeter,
    search::SearchClient,
};

use super::{
    events::{Cycle, EventBroadcaster, WorkflowEvent},
    machine::{next_transition, Transition},
    observer::{NoopObserver, ObserverDirective, StageObserver},
    response::DiscoveryResponse,
    stages::{
        EventCurator, EvidenceGatherer, LeadGenerator, LeadVerifier, ProfileBuilder, StageContext,
        StageError, StageKind, StageReport, StageSet,
    },
    types::{DiscoveryRequest, GateDecision, RunState, TerminalReason},
};

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub reason: TerminalReason,
    pub reports: Vec<StageReport>,
    pub duration_ms: u64,
}

pub struct Orchestrator {
    stages: StageSet,
    config: WorkflowConfig,
    budget_cap_usd: Option<f64>,
    gateway: Arc<CallGateway>,
    observer: Arc<dyn StageObserver>,
    events: EventBroadcaster,
}

impl Orchestrator {
    pub fn new(
        stages: StageSet,
        config: WorkflowConfig,
        cost: &CostConfig,
        gateway: Arc<CallGateway>,
    ) -> Self {
        Self {
            stages,
            config,
            budget_cap_usd: cost.budget_cap_usd,
            gateway,
            observer: Arc::new(NoopObserver),
            events: EventBroadcaster::new(),
        }
    }

    /// Wire the built-in stages to the given LLM and search clients
    pub fn with_default_stages(
        config: AppConfig,
        gateway: Arc<CallGateway>,
        llm: Arc<LlmClient>,
        search: Arc<SearchClient>,
    ) -> Self {
        let workflow = config.workflow;
        let stages = StageSet {
            profile: Arc::new(ProfileBuilder::new(llm.clone())),
            leads: Arc::new(LeadGenerator::new(llm.clone(), workflow.clone())),
            verify: Arc::new(LeadVerifier::new(llm.clone(), workflow.clone())),
            evidence: Arc::new(EvidenceGatherer::new(search, workflow.clone())),
            curate: Arc::new(EventCurator::new(llm, workflow.clone())),
        };
        Self::new(stages, workflow, &config.cost, gateway)
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn gateway(&self) -> &Arc<CallGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run to completion and shape the result for the caller
    pub async fn discover(&self, request: DiscoveryRequest) -> DiscoveryResponse {
        self.discover_with_cancel(request, CancellationToken::new()).await
    }

    pub async fn discover_with_cancel(
        &self,
        request: DiscoveryRequest,
        cancel: CancellationToken,
    ) -> DiscoveryResponse {
        let outcome = self.run(request, cancel).await;
        DiscoveryResponse::from_outcome(outcome, self.config.min_event_score)
    }

    /// Execute one discovery run.
    ///
    /// Always returns a terminal outcome: stage errors, budget exhaustion,
    /// cancellation and observer stops all end the run with a REJECT reason.
    pub async fn run(&self, request: DiscoveryRequest, cancel: CancellationToken) -> RunOutcome {
        let started = Instant::now();
        let reference_date = request
            .reference_date
            .unwrap_or_else(|| Utc::now().date_naive());
        let mut state = RunState::seed(request, reference_date);
        let mut reports = Vec::new();

        if let Err(err) = state.request.validate() {
            tracing::warn!("[ORCHESTRATOR] Rejecting request: {}", err);
            let reason = TerminalReason::InvalidRequest {
                detail: err.to_string(),
            };
            state.gate_decision = Some(GateDecision::Reject);
            return RunOutcome {
                state,
                reason,
                reports,
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        let run_id = state.run_id;
        let meter = self
            .gateway
            .meter(run_id, self.budget_cap_usd, state.request.use_cache);
        let ctx = StageContext {
            meter: meter.clone(),
        };

        tracing::info!(
            "[ORCHESTRATOR] Starting run {} for {} ({} days, interests: {})",
            run_id,
            state.request.location,
            state.request.time_window_days,
            state.request.interests.join(", ")
        );
        self.events
            .run_started(run_id, &state.request.location, &state.request.interests);

        let mut current = StageKind::Profile;
        let reason = loop {
            if cancel.is_cancelled() {
                break TerminalReason::Cancelled;
            }

            let (next_state, step) = self
                .execute_stage(current, state, &ctx, &meter, &cancel, &mut reports)
                .await;
            state = next_state;

            let transition = match step {
                Step::Completed => next_transition(current, &state, &self.config),
                Step::Terminal(reason) => break reason,
            };

            match transition {
                Transition::Advance(next) => {
                    if current == StageKind::Verify
                        && state.kept_lead_count() < self.config.min_verified_leads
                    {
                        tracing::info!(
                            "[ORCHESTRATOR] Inner bound reached with {} of {} leads; continuing best-effort",
                            state.kept_lead_count(),
                            self.config.min_verified_leads
                        );
                    }
                    current = next;
                }
                Transition::RetryInner { feedback } => {
                    state.begin_inner_retry(feedback.clone());
                    tracing::info!(
                        "[ORCHESTRATOR] Inner retry {}/{}: {}",
                        state.inner_iteration,
                        self.config.max_inner_iterations,
                        feedback
                    );
                    self.events
                        .cycle_retry(run_id, Cycle::Inner, state.inner_iteration, &feedback);
                    current = StageKind::Leads;
                }
                Transition::RetryOuter { feedback } => {
                    state.begin_outer_retry(feedback.clone());
                    tracing::info!(
                        "[ORCHESTRATOR] Outer retry {}/{}: {}",
                        state.outer_iteration,
                        self.config.max_outer_iterations,
                        feedback
                    );
                    self.events
                        .cycle_retry(run_id, Cycle::Outer, state.outer_iteration, &feedback);
                    current = StageKind::Profile;
                }
                Transition::Approve => break TerminalReason::Approved,
                Transition::Reject(reason) => break reason,
            }
        };

        state.gate_decision = Some(reason.decision());
        if reason != TerminalReason::Approved {
            state.events.clear();
        }
        state.metrics = meter.totals();
        self.gateway.ledger().reset(run_id);
        let lifetime = self.gateway.ledger().lifetime();
        tracing::debug!(
            "[ORCHESTRATOR] Process totals: {} calls, {} cache hits, ${:.4}",
            lifetime.calls,
            lifetime.cache_hits,
            lifetime.cost_usd
        );

        let duration_ms = started.elapsed().as_millis() as u64;
        match &reason {
            TerminalReason::Approved => tracing::info!(
                "[ORCHESTRATOR] Run {} approved with {} events in {}ms (${:.4}, {} cache hits)",
                run_id,
                state.events.len(),
                duration_ms,
                state.metrics.run_total.cost_usd,
                state.metrics.run_total.cache_hits
            ),
            TerminalReason::StageFailed { .. } => {
                tracing::error!("[ORCHESTRATOR] Run {} failed: {:?}", run_id, reason)
            }
            other => tracing::info!("[ORCHESTRATOR] Run {} rejected: {:?}", run_id, other),
        }
        self.events.run_finished(
            run_id,
            &reason,
            state.events.len(),
            state.metrics.run_total.cost_usd,
            duration_ms,
        );

        RunOutcome {
            state,
            reason,
            reports,
            duration_ms,
        }
    }

    /// Run one stage, merge its delta and consult the observer
    async fn execute_stage(
        &self,
        kind: StageKind,
        mut state: RunState,
        ctx: &StageContext,
        meter: &RunMeter,
        cancel: &CancellationToken,
        reports: &mut Vec<StageReport>,
    ) -> (RunState, Step) {
        let stage = self.stages.get(kind).clone();
        let before = meter.stage_totals(kind);
        let started_at = Utc::now();

        tracing::debug!(
            "[ORCHESTRATOR] Running {} (outer {}, inner {})",
            kind.display_name(),
            state.outer_iteration,
            state.inner_iteration
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = stage.run(&state, ctx) => Some(result),
        };

        let Some(result) = result else {
            tracing::info!("[ORCHESTRATOR] Run {} cancelled during {}", state.run_id, kind);
            return (state, Step::Terminal(TerminalReason::Cancelled));
        };

        let metrics = meter.stage_totals(kind).since(&before);
        let report = StageReport::new(state.run_id, kind, &state, started_at);
        state.stage_executions += 1;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let report = report.fail(&err, metrics);
                self.events.stage_reported(&report);
                reports.push(report);
                state.metrics = meter.totals();
                let reason = match err {
                    StageError::BudgetExceeded(_) => TerminalReason::BudgetExceeded {
                        spent_usd: meter.spent_usd(),
                    },
                    err => {
                        tracing::error!("[ORCHESTRATOR] {} failed: {}", kind.display_name(), err);
                        TerminalReason::StageFailed {
                            stage: kind,
                            detail: err.to_string(),
                        }
                    }
                };
                return (state, Step::Terminal(reason));
            }
        };

        let report = report.complete(&output, metrics);
        state.budget_exhausted |= output.budget_exhausted;
        state = state.apply(output.delta);
        state.metrics = meter.totals();

        tracing::info!(
            "[ORCHESTRATOR] {} done in {}ms: {}",
            kind.display_name(),
            report.execution_time_ms,
            report.summary
        );
        self.events.stage_reported(&report);

        let directive = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            directive = self.observer.stage_completed(&report) => Some(directive),
        };
        reports.push(report);

        let Some(directive) = directive else {
            tracing::info!(
                "[ORCHESTRATOR] Run {} cancelled while paused after {}",
                state.run_id,
                kind
            );
            return (state, Step::Terminal(TerminalReason::Cancelled));
        };

        if directive == ObserverDirective::Stop {
            tracing::info!("[ORCHESTRATOR] Observer stopped the run after {}", kind);
            return (state, Step::Terminal(TerminalReason::StoppedByObserver { after: kind }));
        }
        (state, Step::Completed)
    }
}

enum Step {
    Completed,
    Terminal(TerminalReason),
}
