//! Caller-facing result of a discovery run

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    orchestrator::RunOutcome,
    types::{Event, TerminalReason},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    NoResults,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub run_id: Uuid,
    pub events: Vec<Event>,
    pub status: ResponseStatus,
    pub cost_usd: f64,
    pub cache_hits: u64,
    pub message: String,
    pub reason: TerminalReason,
    pub outer_iteration: u32,
    pub inner_iteration: u32,
}

impl ResponseStatus {
    pub fn for_reason(reason: &TerminalReason) -> Self {
        match reason {
            TerminalReason::Approved => ResponseStatus::Success,
            TerminalReason::InsufficientEvents { .. }
            | TerminalReason::NoLeadsSurvived
            | TerminalReason::NoEvidenceFound => ResponseStatus::NoResults,
            TerminalReason::BudgetExceeded { .. }
            | TerminalReason::StageFailed { .. }
            | TerminalReason::Cancelled
            | TerminalReason::StoppedByObserver { .. }
            | TerminalReason::InvalidRequest { .. } => ResponseStatus::Error,
        }
    }
}

/// Human-readable line for the terminal reason
pub fn describe(reason: &TerminalReason, event_count: usize, min_score: u8) -> String {
    match reason {
        TerminalReason::Approved => format!("found {} events", event_count),
        TerminalReason::InsufficientEvents {
            qualifying,
            required,
        } => format!(
            "no good events found: only {} of {} required events scored above {}",
            qualifying, required, min_score
        ),
        TerminalReason::NoLeadsSurvived => {
            "no good events found: no leads survived verification".to_string()
        }
        TerminalReason::NoEvidenceFound => {
            "no good events found: searches returned no evidence".to_string()
        }
        TerminalReason::BudgetExceeded { spent_usd } => {
            format!("budget exhausted after spending ${:.4}", spent_usd)
        }
        TerminalReason::StageFailed { stage, detail } => {
            format!("{} failed: {}", stage.display_name(), detail)
        }
        TerminalReason::Cancelled => "run cancelled".to_string(),
        TerminalReason::StoppedByObserver { after } => {
            format!("stopped after {}", after.display_name())
        }
        TerminalReason::InvalidRequest { detail } => format!("invalid request: {}", detail),
    }
}

impl DiscoveryResponse {
    pub fn from_outcome(outcome: RunOutcome, min_score: u8) -> Self {
        let RunOutcome { state, reason, .. } = outcome;
        let totals = state.metrics.run_total;
        let events = if reason == TerminalReason::Approved {
            state.events
        } else {
            Vec::new()
        };
        Self {
            run_id: state.run_id,
            status: ResponseStatus::for_reason(&reason),
            message: describe(&reason, events.len(), min_score),
            events,
            cost_usd: totals.cost_usd,
            cache_hits: totals.cache_hits,
            reason,
            outer_iteration: state.outer_iteration,
            inner_iteration: state.inner_iteration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::stages::StageKind;

    #[test]
    fn test_status_distinguishes_failure_kinds() {
        assert_eq!(ResponseStatus::for_reason(&TerminalReason::Approved), ResponseStatus::Success);
        assert_eq!(
            ResponseStatus::for_reason(&TerminalReason::NoEvidenceFound),
            ResponseStatus::NoResults
        );
        assert_eq!(
            ResponseStatus::for_reason(&TerminalReason::BudgetExceeded { spent_usd: 0.1 }),
            ResponseStatus::Error
        );
        assert_eq!(
            ResponseStatus::for_reason(&TerminalReason::StageFailed {
                stage: StageKind::Evidence,
                detail: "timeout".to_string()
            }),
            ResponseStatus::Error
        );
    }

    #[test]
    fn test_messages_are_distinct() {
        let failed = describe(
            &TerminalReason::StageFailed {
                stage: StageKind::Evidence,
                detail: "timeout".to_string(),
            },
            0,
            60,
        );
        let budget = describe(&TerminalReason::BudgetExceeded { spent_usd: 0.1 }, 0, 60);
        let empty = describe(&TerminalReason::NoLeadsSurvived, 0, 60);
        assert_eq!(failed, "Evidence Gatherer failed: timeout");
        assert!(budget.starts_with("budget exhausted"));
        assert!(empty.starts_with("no good events found"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ResponseStatus::NoResults).unwrap(),
            "no_results"
        );
    }
}
