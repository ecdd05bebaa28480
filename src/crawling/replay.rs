//! # Replay Collaborators
//!
//! Scripted page and recording sink/navigator. The replay binary feeds a
//! recorded session through the engine with these; integration tests use them
//! to drive the engine deterministically under paused tokio time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::crawling::observer::{ActivityPulse, HarvestSink, Navigator, ObserveError, PageObserver};
use crate::crawling::orchestrator::Aggregate;
use crate::domain::{FinalizedOutput, ObservedPost, PostId, RunStatus};

/// What the page shows between two scroll steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageFrame {
    #[serde(default)]
    pub posts: Vec<ObservedPost>,
    /// Explicit pulse; synthesized from the frame index when absent
    #[serde(default)]
    pub pulse: Option<ActivityPulse>,
    #[serde(default)]
    pub fail_observation: bool,
}

impl PageFrame {
    #[must_use]
    pub fn new(posts: Vec<ObservedPost>) -> Self {
        Self { posts, pulse: None, fail_observation: false }
    }

    #[must_use]
    pub const fn with_pulse(mut self, pulse: ActivityPulse) -> Self {
        self.pulse = Some(pulse);
        self
    }

    #[must_use]
    pub fn failing() -> Self {
        Self { fail_observation: true, ..Self::default() }
    }
}

/// Recorded session as stored on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplaySession {
    pub page_url: String,
    #[serde(default)]
    pub overlay_active: bool,
    /// Post id → delay after page load until overlay content attaches
    #[serde(default)]
    pub overlay_delays_ms: HashMap<String, u64>,
    /// End-of-timeline marker shows once the last frame is reached
    #[serde(default)]
    pub end_of_timeline: bool,
    #[serde(default)]
    pub frames: Vec<PageFrame>,
}

impl ReplaySession {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay session: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid replay session: {}", path.display()))
    }

    #[must_use]
    pub fn into_page(self) -> ScriptedPage {
        let mut page = ScriptedPage::new(&self.page_url, self.frames)
            .with_overlay(self.overlay_active)
            .with_end_of_timeline(self.end_of_timeline);
        for (id, delay_ms) in self.overlay_delays_ms {
            page = page.with_overlay_delay(&id, Duration::from_millis(delay_ms));
        }
        page
    }
}

/// Page that walks through scripted frames, one per scroll step
pub struct ScriptedPage {
    url: Mutex<String>,
    frames: Vec<PageFrame>,
    cursor: AtomicUsize,
    scrolls: AtomicUsize,
    scrolled_px: AtomicUsize,
    overlay_active: bool,
    overlay_delays: HashMap<PostId, Duration>,
    end_of_timeline: bool,
    loaded_at: Instant,
}

impl ScriptedPage {
    #[must_use]
    pub fn new(url: &str, frames: Vec<PageFrame>) -> Self {
        Self {
            url: Mutex::new(url.to_string()),
            frames,
            cursor: AtomicUsize::new(0),
            scrolls: AtomicUsize::new(0),
            scrolled_px: AtomicUsize::new(0),
            overlay_active: false,
            overlay_delays: HashMap::new(),
            end_of_timeline: false,
            loaded_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn with_overlay(mut self, active: bool) -> Self {
        self.overlay_active = active;
        self
    }

    /// Overlay content for `id` attaches `delay` after the page loaded
    #[must_use]
    pub fn with_overlay_delay(mut self, id: &str, delay: Duration) -> Self {
        self.overlay_delays.insert(PostId::normalize(id), delay);
        self
    }

    #[must_use]
    pub const fn with_end_of_timeline(mut self, visible_at_end: bool) -> Self {
        self.end_of_timeline = visible_at_end;
        self
    }

    /// Simulates a navigation of the host page
    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) = url.to_string();
    }

    #[must_use]
    pub fn scroll_count(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    /// Total distance requested by scroll steps so far
    #[must_use]
    pub fn scrolled_px(&self) -> usize {
        self.scrolled_px.load(Ordering::SeqCst)
    }

    fn index(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<&PageFrame> {
        self.frames.get(self.index())
    }

    fn at_end(&self) -> bool {
        self.index() + 1 >= self.frames.len()
    }

    fn overlay_ready(&self, id: &PostId) -> bool {
        self.overlay_delays
            .get(id)
            .is_some_and(|delay| self.loaded_at.elapsed() >= *delay)
    }

    #[allow(clippy::cast_precision_loss)]
    fn synthesized_pulse(&self) -> ActivityPulse {
        let index = self.index();
        ActivityPulse {
            scroll_y: (index * 500) as f64,
            document_height: (2000 + index * 500) as f64,
            new_node_observed_at_ms: index as u64 + 1,
            end_marker_visible: self.end_of_timeline && self.at_end(),
        }
    }
}

#[async_trait]
impl PageObserver for ScriptedPage {
    async fn observe_posts(&self) -> Result<Vec<ObservedPost>, ObserveError> {
        let Some(frame) = self.current() else {
            return Ok(Vec::new());
        };
        if frame.fail_observation {
            return Err(ObserveError::Failed(format!("scripted failure at frame {}", self.index())));
        }
        Ok(frame
            .posts
            .iter()
            .cloned()
            .map(|mut post| {
                post.has_overlay_content |= self.overlay_ready(&post.id);
                post
            })
            .collect())
    }

    async fn activity_pulse(&self) -> ActivityPulse {
        self.current()
            .and_then(|frame| frame.pulse)
            .unwrap_or_else(|| self.synthesized_pulse())
    }

    async fn has_overlay_content_for(&self, id: &PostId) -> bool {
        self.overlay_ready(id)
            || self
                .current()
                .is_some_and(|frame| frame.posts.iter().any(|p| p.id == *id && p.has_overlay_content))
    }

    async fn overlay_system_active(&self) -> bool {
        self.overlay_active
    }

    async fn page_url(&self) -> String {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn scroll_step(&self, step_px: u32) {
        self.scrolls.fetch_add(1, Ordering::SeqCst);
        self.scrolled_px.fetch_add(step_px as usize, Ordering::SeqCst);
        if !self.at_end() {
            self.cursor.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Sink that keeps everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    outputs: Mutex<Vec<FinalizedOutput>>,
    statuses: Mutex<Vec<RunStatus>>,
    aggregates: Mutex<Vec<Aggregate>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn outputs(&self) -> Vec<FinalizedOutput> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<RunStatus> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn aggregates(&self) -> Vec<Aggregate> {
        self.aggregates.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl HarvestSink for RecordingSink {
    async fn on_finalized(&self, output: FinalizedOutput) {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner).push(output);
    }

    async fn on_run_state_changed(&self, status: RunStatus) {
        tracing::info!("{}", status);
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).push(status);
    }

    async fn on_aggregate_ready(&self, aggregate: Aggregate) {
        self.aggregates.lock().unwrap_or_else(PoisonError::into_inner).push(aggregate);
    }
}

/// Navigator that records requested pages
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Navigator for RecordingNavigator {
    async fn navigate(&self, url: &str) {
        tracing::info!("🧭 Navigate to {}", url);
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).push(url.to_string());
    }
}
