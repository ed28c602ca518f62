//! Debug hook
//!
//! After every stage the orchestrator hands a [`StageReport`] to its
//! observer and waits for a directive. `Stop` ends the run.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::stages::StageReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverDirective {
    Continue,
    Stop,
}

#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn stage_completed(&self, report: &StageReport) -> ObserverDirective;
}

/// Observer that never intervenes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl StageObserver for NoopObserver {
    async fn stage_completed(&self, _report: &StageReport) -> ObserverDirective {
        ObserverDirective::Continue
    }
}

/// Pauses the run after each stage until the paired [`StepHandle`] answers.
///
/// If the handle is dropped the run continues unattended.
pub struct SteppingObserver {
    reports: mpsc::UnboundedSender<StageReport>,
    directives: Mutex<mpsc::Receiver<ObserverDirective>>,
}

/// Controller side of a [`SteppingObserver`]
pub struct StepHandle {
    reports: mpsc::UnboundedReceiver<StageReport>,
    directives: mpsc::Sender<ObserverDirective>,
}

pub fn stepping() -> (SteppingObserver, StepHandle) {
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let (directive_tx, directive_rx) = mpsc::channel(1);
    (
        SteppingObserver {
            reports: report_tx,
            directives: Mutex::new(directive_rx),
        },
        StepHandle {
            reports: report_rx,
            directives: directive_tx,
        },
    )
}

#[async_trait]
impl StageObserver for SteppingObserver {
    async fn stage_completed(&self, report: &StageReport) -> ObserverDirective {
        if self.reports.send(report.clone()).is_err() {
            return ObserverDirective::Continue;
        }
        let mut directives = self.directives.lock().await;
        directives.recv().await.unwrap_or(ObserverDirective::Continue)
    }
}

impl StepHandle {
    /// Wait for the next paused stage; `None` once the run is over
    pub async fn next_report(&mut self) -> Option<StageReport> {
        self.reports.recv().await
    }

    pub async fn resume(&self) {
        let _ = self.directives.send(ObserverDirective::Continue).await;
    }

    pub async fn stop(&self) {
        let _ = self.directives.send(ObserverDirective::Stop).await;
    }
}
