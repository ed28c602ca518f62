//! Discovery workflow: run state, stages, transition table and orchestrator

pub mod events;
pub mod machine;
pub mod observer;
pub mod orchestrator;
pub mod response;
pub mod stages;
pub mod types;

pub use events::{Cycle, EventBroadcaster, WorkflowEvent};
pub use machine::{next_transition, Transition};
pub use observer::{stepping, NoopObserver, ObserverDirective, StageObserver, StepHandle, SteppingObserver};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use response::{DiscoveryResponse, ResponseStatus};
pub use stages::{Stage, StageContext, StageDelta, StageError, StageKind, StageOutput, StageReport, StageSet};
pub use types::{
    CuratorVerdict, DiscoveryRequest, Event, Evidence, GateDecision, Lead, LeadDraft, LeadId, Profile,
    RunState, Shortfall, Temporality, TerminalReason, VerificationResult,
};
