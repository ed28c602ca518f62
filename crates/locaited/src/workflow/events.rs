//! Workflow event stream
//!
//! The orchestrator publishes run and stage lifecycle events on a broadcast
//! channel. Any number of consumers (CLI progress output, a log sink, a
//! future UI) can subscribe; publishing never blocks the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ledger::StageMetrics;

use super::{
    stages::{StageKind, StageReport},
    types::TerminalReason,
};

const CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cycle {
    Inner,
    Outer,
}

/// Events emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        location: String,
        interests: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    StageCompleted {
        run_id: Uuid,
        stage: StageKind,
        summary: String,
        metrics: StageMetrics,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    StageFailed {
        run_id: Uuid,
        stage: StageKind,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A retry cycle was entered
    CycleRetry {
        run_id: Uuid,
        cycle: Cycle,
        iteration: u32,
        feedback: String,
        timestamp: DateTime<Utc>,
    },

    RunFinished {
        run_id: Uuid,
        reason: TerminalReason,
        event_count: usize,
        cost_usd: f64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcasts workflow events to all subscribers
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn broadcast(&self, event: WorkflowEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn run_started(&self, run_id: Uuid, location: &str, interests: &[String]) {
        self.broadcast(WorkflowEvent::RunStarted {
            run_id,
            location: location.to_string(),
            interests: interests.to_vec(),
            timestamp: Utc::now(),
        });
    }

    pub fn stage_reported(&self, report: &StageReport) {
        let event = if report.success {
            WorkflowEvent::StageCompleted {
                run_id: report.run_id,
                stage: report.stage,
                summary: report.summary.clone(),
                metrics: report.metrics,
                duration_ms: report.execution_time_ms,
                timestamp: report.completed_at,
            }
        } else {
            WorkflowEvent::StageFailed {
                run_id: report.run_id,
                stage: report.stage,
                error: report.summary.clone(),
                timestamp: report.completed_at,
            }
        };
        self.broadcast(event);
    }

    pub fn cycle_retry(&self, run_id: Uuid, cycle: Cycle, iteration: u32, feedback: &str) {
        self.broadcast(WorkflowEvent::CycleRetry {
            run_id,
            cycle,
            iteration,
            feedback: feedback.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn run_finished(
        &self,
        run_id: Uuid,
        reason: &TerminalReason,
        event_count: usize,
        cost_usd: f64,
        duration_ms: u64,
    ) {
        self.broadcast(WorkflowEvent::RunFinished {
            run_id,
            reason: reason.clone(),
            event_count,
            cost_usd,
            duration_ms,
            timestamp: Utc::now(),
        });
    }
}
