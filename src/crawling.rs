//! # Crawling Module
//!
//! Timeline harvesting: the tick-driven engine and the components it drives.
//! - `checkpoint`: remembered ids, resume cursor and start gate
//! - `deferral`: bounded wait for translation overlay content
//! - `stall`: auto-stop state machine
//! - `threads`: reply thread reconstruction from DOM order
//! - `orchestrator`: multi-page crawl run over a queue of status pages
//! - `collector`: candidate collection on search pages
//! - `engine`: ties the above into one run per page

pub mod checkpoint;
pub mod collector;
pub mod deferral;
pub mod engine;
pub mod observer;
pub mod orchestrator;
pub mod replay;
pub mod stall;
pub mod threads;

pub use checkpoint::{CheckpointStore, GateDecision, ImportSummary, RememberedExport, ResumeCursor};
pub use collector::SearchCollector;
pub use deferral::{DeferralPolicy, DeferralScheduler, SettleOutcome};
pub use engine::{EngineError, EngineParts, EngineStart, HarvestEngine, HarvestEngineHandle, TickReport};
pub use observer::{ActivityPulse, HarvestSink, Navigator, ObserveError, PageObserver};
pub use orchestrator::{
    AdvanceOutcome, Aggregate, CrawlOrchestrator, CrawlRunState, Navigation, OrchestratorError, QueuePlan,
    ResumePlan, RunPhase,
};
pub use replay::{PageFrame, RecordingNavigator, RecordingSink, ReplaySession, ScriptedPage};
pub use stall::{StallConfig, StallDecision, StallDetector, StallState, TickSignals};
pub use threads::{reconstruct_status_page, Reconstruction, Thread, ThreadReconstructor};
