//! # Page Collaborators
//!
//! The engine never reads the page itself. It is fed by a [`PageObserver`],
//! reports to a [`HarvestSink`] and asks a [`Navigator`] to change pages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crawling::orchestrator::Aggregate;
use crate::domain::{FinalizedOutput, ObservedPost, PostId, RunStatus};

/// Page-level activity signals sampled once per tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityPulse {
    pub scroll_y: f64,
    pub document_height: f64,
    /// Timestamp (ms) of the last time a new post node appeared, 0 when never
    pub new_node_observed_at_ms: u64,
    pub end_marker_visible: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObserveError {
    #[error("Observation failed: {0}")]
    Failed(String),
}

/// Source of post observations and activity signals
#[async_trait]
pub trait PageObserver: Send + Sync {
    /// Posts currently rendered, in DOM order
    async fn observe_posts(&self) -> Result<Vec<ObservedPost>, ObserveError>;

    async fn activity_pulse(&self) -> ActivityPulse;

    /// Whether translation overlay content is attached to the post right now
    async fn has_overlay_content_for(&self, id: &PostId) -> bool;

    /// Whether a translation overlay system is present on the page at all
    async fn overlay_system_active(&self) -> bool;

    async fn page_url(&self) -> String;

    /// Advances the page by one scroll step of `step_px` pixels
    async fn scroll_step(&self, _step_px: u32) {}
}

/// Receiver of finalized output and status transitions
#[async_trait]
pub trait HarvestSink: Send + Sync {
    async fn on_finalized(&self, output: FinalizedOutput);

    async fn on_run_state_changed(&self, status: RunStatus);

    /// Run-level aggregate handed over once a multi-page crawl run completes
    async fn on_aggregate_ready(&self, _aggregate: Aggregate) {}
}

/// Page navigation requested by the crawl run
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate(&self, url: &str);
}
