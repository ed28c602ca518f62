//! Transition table
//!
//! Every decision the orchestrator makes after a stage completes lives in
//! [`next_transition`], a pure function of the completed stage, the merged
//! run state and the workflow bounds.

use crate::config::WorkflowConfig;

use super::{
    stages::StageKind,
    types::{CuratorVerdict, RunState, Shortfall, TerminalReason},
};

/// What happens after a stage completes successfully
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Run this stage next
    Advance(StageKind),
    /// Back to the Lead Generator with the verifier's feedback
    RetryInner { feedback: String },
    /// Back to the Profile Builder with the curator's feedback
    RetryOuter { feedback: String },
    Approve,
    Reject(TerminalReason),
}

pub fn next_transition(completed: StageKind, state: &RunState, config: &WorkflowConfig) -> Transition {
    if state.budget_exhausted {
        return Transition::Reject(TerminalReason::BudgetExceeded {
            spent_usd: state.metrics.run_total.cost_usd,
        });
    }

    match completed {
        StageKind::Profile => Transition::Advance(StageKind::Leads),
        StageKind::Leads if config.verification_enabled => Transition::Advance(StageKind::Verify),
        StageKind::Leads => Transition::Advance(StageKind::Evidence),
        StageKind::Verify => {
            let kept = state.kept_lead_count();
            if kept < config.min_verified_leads && state.inner_iteration < config.max_inner_iterations {
                Transition::RetryInner {
                    feedback: inner_feedback(state, kept, config.min_verified_leads),
                }
            } else {
                Transition::Advance(StageKind::Evidence)
            }
        }
        StageKind::Evidence => Transition::Advance(StageKind::Curate),
        StageKind::Curate => match &state.curation {
            Some(CuratorVerdict::Approve { .. }) => Transition::Approve,
            Some(CuratorVerdict::Shortfall(shortfall)) => {
                if state.outer_iteration < config.max_outer_iterations {
                    Transition::RetryOuter {
                        feedback: shortfall.describe(config.min_event_score),
                    }
                } else {
                    Transition::Reject(shortfall.clone().into())
                }
            }
            None => Transition::Reject(
                Shortfall::InsufficientEvents {
                    qualifying: 0,
                    required: config.min_events,
                }
                .into(),
            ),
        },
    }
}

/// Summary of why leads failed verification, for the Lead Generator
fn inner_feedback(state: &RunState, kept: usize, required: usize) -> String {
    let mut reasons: Vec<&str> = state
        .verification_results
        .iter()
        .filter(|r| !r.should_keep)
        .map(|r| r.reason.as_str())
        .filter(|r| !r.is_empty())
        .collect();
    reasons.sort_unstable();
    reasons.dedup();
    reasons.truncate(5);

    let mut feedback = format!(
        "{} of {} required leads passed verification",
        kept, required
    );
    if !reasons.is_empty() {
        feedback.push_str(&format!("; rejected because: {}", reasons.join("; ")));
    }
    feedback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_support::{request, verification, with_leads},
        workflow::types::RunState,
    };

    fn config() -> WorkflowConfig {
        WorkflowConfig::default()
    }

    fn state_with_kept(total: usize, kept: usize) -> RunState {
        let mut state = with_leads(RunState::seed(request(), crate::test_support::today()), total);
        let ids: Vec<_> = state.leads.iter().map(|l| l.id).collect();
        state.verification_results = ids
            .iter()
            .enumerate()
            .map(|(i, id)| verification(*id, i < kept))
            .collect();
        state
    }

    #[test]
    fn test_linear_transitions() {
        let state = state_with_kept(0, 0);
        assert_eq!(
            next_transition(StageKind::Profile, &state, &config()),
            Transition::Advance(StageKind::Leads)
        );
        assert_eq!(
            next_transition(StageKind::Leads, &state, &config()),
            Transition::Advance(StageKind::Verify)
        );
        assert_eq!(
            next_transition(StageKind::Evidence, &state, &config()),
            Transition::Advance(StageKind::Curate)
        );

        let no_verify = WorkflowConfig {
            verification_enabled: false,
            ..config()
        };
        assert_eq!(
            next_transition(StageKind::Leads, &state, &no_verify),
            Transition::Advance(StageKind::Evidence)
        );
    }

    #[test]
    fn test_inner_retry_until_bound() {
        let mut state = state_with_kept(20, 10);
        assert!(matches!(
            next_transition(StageKind::Verify, &state, &config()),
            Transition::RetryInner { .. }
        ));

        state.inner_iteration = config().max_inner_iterations;
        assert_eq!(
            next_transition(StageKind::Verify, &state, &config()),
            Transition::Advance(StageKind::Evidence)
        );
    }

    #[test]
    fn test_enough_kept_leads_advance() {
        let state = state_with_kept(20, 16);
        assert_eq!(
            next_transition(StageKind::Verify, &state, &config()),
            Transition::Advance(StageKind::Evidence)
        );
    }

    #[test]
    fn test_inner_feedback_names_failures() {
        let state = state_with_kept(4, 1);
        match next_transition(StageKind::Verify, &state, &config()) {
            Transition::RetryInner { feedback } => {
                assert!(feedback.starts_with("1 of 15 required leads"));
                assert!(feedback.contains("no date"));
            }
            other => panic!("unexpected transition {:?}", other),
        }
    }

    #[test]
    fn test_curate_outcomes() {
        let mut state = state_with_kept(0, 0);
        state.curation = Some(CuratorVerdict::Approve { qualifying: 5 });
        assert_eq!(next_transition(StageKind::Curate, &state, &config()), Transition::Approve);

        let shortfall = Shortfall::InsufficientEvents {
            qualifying: 2,
            required: 5,
        };
        state.curation = Some(CuratorVerdict::Shortfall(shortfall.clone()));
        match next_transition(StageKind::Curate, &state, &config()) {
            Transition::RetryOuter { feedback } => assert!(feedback.contains("only 2 of 5")),
            other => panic!("unexpected transition {:?}", other),
        }

        state.outer_iteration = config().max_outer_iterations;
        assert_eq!(
            next_transition(StageKind::Curate, &state, &config()),
            Transition::Reject(TerminalReason::InsufficientEvents {
                qualifying: 2,
                required: 5
            })
        );
    }

    #[test]
    fn test_budget_flag_rejects_from_any_stage() {
        let mut state = state_with_kept(0, 0);
        state.budget_exhausted = true;
        state.metrics.run_total.cost_usd = 0.12;
        for stage in [StageKind::Profile, StageKind::Verify, StageKind::Curate] {
            assert_eq!(
                next_transition(stage, &state, &config()),
                Transition::Reject(TerminalReason::BudgetExceeded { spent_usd: 0.12 })
            );
        }
    }
}
