//! Dedup, scoring and the quality gate

pub mod dedup;
pub mod scoring;

pub use dedup::DedupEngine;
pub use scoring::ScoringContext;

use crate::{
    config::WorkflowConfig,
    workflow::{CuratorVerdict, Event, Shortfall},
};

/// Keep the events scoring above `min_event_score`, capped at `max_events`,
/// and decide whether the pass is good enough.
///
/// `ranked` must already be in [`dedup::rank`] order. The gate counts every
/// qualifying event before the cap applies.
pub fn evaluate_gate(ranked: Vec<Event>, config: &WorkflowConfig) -> (Vec<Event>, CuratorVerdict) {
    let mut qualifying: Vec<Event> = ranked
        .into_iter()
        .filter(|e| e.score > config.min_event_score)
        .collect();
    let count = qualifying.len();
    qualifying.truncate(config.max_events);

    let verdict = if count >= config.min_events {
        CuratorVerdict::Approve { qualifying: count }
    } else {
        CuratorVerdict::Shortfall(Shortfall::InsufficientEvents {
            qualifying: count,
            required: config.min_events,
        })
    };
    (qualifying, verdict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scored_event;

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            min_events: 2,
            min_event_score: 60,
            max_events: 3,
            ..WorkflowConfig::default()
        }
    }

    #[test]
    fn test_gate_approves_at_min_count() {
        let ranked = vec![
            scored_event("E1", 90),
            scored_event("E2", 75),
            scored_event("E3", 60),
            scored_event("E4", 59),
        ];
        let (events, verdict) = evaluate_gate(ranked, &config());
        assert_eq!(verdict, CuratorVerdict::Approve { qualifying: 2 });
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.score > 60));
    }

    #[test]
    fn test_score_must_exceed_threshold() {
        let at_threshold = vec![scored_event("E1", 90), scored_event("E2", 60)];
        let (events, verdict) = evaluate_gate(at_threshold, &config());
        assert_eq!(
            verdict,
            CuratorVerdict::Shortfall(Shortfall::InsufficientEvents {
                qualifying: 1,
                required: 2
            })
        );
        assert_eq!(events.len(), 1);

        let above_threshold = vec![scored_event("E1", 90), scored_event("E2", 61)];
        let (events, verdict) = evaluate_gate(above_threshold, &config());
        assert_eq!(verdict, CuratorVerdict::Approve { qualifying: 2 });
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_gate_reports_shortfall() {
        let ranked = vec![scored_event("E1", 90), scored_event("E2", 40)];
        let (events, verdict) = evaluate_gate(ranked, &config());
        assert_eq!(
            verdict,
            CuratorVerdict::Shortfall(Shortfall::InsufficientEvents {
                qualifying: 1,
                required: 2
            })
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_cap_applies_after_counting() {
        let ranked = (0..5).map(|i| scored_event(&format!("E{}", i), 95 - i)).collect();
        let (events, verdict) = evaluate_gate(ranked, &config());
        assert_eq!(verdict, CuratorVerdict::Approve { qualifying: 5 });
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, "E0");
    }
}
