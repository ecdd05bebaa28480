//! # Crawl Orchestrator
//!
//! Drives a multi-page crawl run: a queue of status pages collected from a
//! search page is visited one by one. A navigation destroys the engine, so the
//! whole run lives in a persisted [`CrawlRunState`] record that is read when
//! the next engine starts and written after every transition.
//!
//! ```text
//! BuildingQueue ─▶ Running ─▶ Done
//!                    │  ▲
//!                    ▼  │
//!                   Paused ─▶ Cancelled
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crawling::checkpoint::CheckpointStore;
use crate::domain::{ObservedPost, PageMode, PostId, PostSideData, RunContext};
use crate::infrastructure::storage::{self, keys, KeyValueStore};

const RECORD_VERSION: u32 = 1;

/// Orchestrator-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("No new posts to queue")]
    NothingToQueue,

    #[error("No active crawl run")]
    NoActiveRun,
}

/// A page the host should open next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigation {
    pub url: String,
}

impl Navigation {
    fn to(url: impl Into<String>) -> Option<Self> {
        let url = url.into();
        (!url.trim().is_empty()).then_some(Self { url })
    }
}

/// Persisted multi-page crawl run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlRunState {
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,
    pub mode: PageMode,
    /// Search page the run was started from
    #[serde(default)]
    pub origin_page_ref: String,
    #[serde(default)]
    pub owner_key: String,
    #[serde(default)]
    pub owner_handle: String,
    #[serde(default)]
    pub target_queue: Vec<PostId>,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub started_at: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub cancelled: bool,
}

impl CrawlRunState {
    fn sanitized(mut self) -> Self {
        self.target_queue.retain(|id| !id.is_empty());
        self.current_index = self.current_index.min(self.target_queue.len());
        if self.owner_key.is_empty() {
            self.owner_key = "account".to_string();
        }
        self
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.target_queue.len()
    }

    #[must_use]
    pub fn current_target(&self) -> Option<&PostId> {
        self.target_queue.get(self.current_index)
    }
}

/// Side data accumulated across the pages of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub owner_key: String,
    #[serde(default)]
    pub owner_handle: String,
    #[serde(default)]
    pub posts: Vec<PostSideData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Running,
    Paused,
    Cancelled,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    pub queued: usize,
    pub limit_reached: bool,
    pub navigation: Navigation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved to `index`; no navigation while paused
    Next { index: usize, total: usize, navigation: Option<Navigation> },
    Completed { total: usize, navigation: Option<Navigation> },
    /// Completed target is not in the queue; the run needs an explicit cancel
    Stuck { completed: PostId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub index: usize,
    pub total: usize,
    pub navigation: Option<Navigation>,
}

pub struct CrawlOrchestrator {
    store: Arc<dyn KeyValueStore>,
    state: Option<CrawlRunState>,
    aggregate: Aggregate,
}

impl CrawlOrchestrator {
    /// Restores the run record and aggregate from the store
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let state = storage::load_json::<CrawlRunState>(store.as_ref(), keys::CRAWL_RUN_STATE)
            .map(CrawlRunState::sanitized);
        let aggregate = storage::load_json::<Aggregate>(store.as_ref(), keys::AGGREGATE).unwrap_or_default();
        Self { store, state, aggregate }
    }

    #[must_use]
    pub const fn state(&self) -> Option<&CrawlRunState> {
        self.state.as_ref()
    }

    #[must_use]
    pub fn phase(&self) -> RunPhase {
        match &self.state {
            None => RunPhase::Idle,
            Some(s) if s.cancelled => RunPhase::Cancelled,
            Some(s) if s.done => RunPhase::Done,
            Some(s) if s.paused => RunPhase::Paused,
            Some(_) => RunPhase::Running,
        }
    }

    /// A run exists, is not finished and still has targets
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.done && !s.target_queue.is_empty())
    }

    /// Whether `page_url` is the current target of an active, unpaused run
    #[must_use]
    pub fn is_current_target(&self, page_url: &str) -> bool {
        let page = PostId::normalize(page_url);
        self.state
            .as_ref()
            .filter(|s| !s.done && !s.paused)
            .and_then(CrawlRunState::current_target)
            .is_some_and(|target| *target == page)
    }

    /// Starts a run from the candidates collected on a search page
    pub fn build_queue(
        &mut self,
        candidates: &[PostId],
        max_targets: usize,
        checkpoint: &CheckpointStore,
        context: &RunContext,
    ) -> Result<QueuePlan, OrchestratorError> {
        let mut queue: Vec<PostId> = Vec::new();
        for id in candidates {
            if queue.len() >= max_targets.max(1) {
                break;
            }
            if checkpoint.should_accept(id) && !queue.contains(id) {
                queue.push(id.clone());
            }
        }

        let Some(first) = queue.first().cloned() else {
            info!("📭 Nothing new to queue from {}", context.page_url);
            return Err(OrchestratorError::NothingToQueue);
        };

        self.aggregate = Aggregate::default();
        storage::clear(self.store.as_ref(), keys::AGGREGATE);

        let queued = queue.len();
        self.state = Some(CrawlRunState {
            version: RECORD_VERSION,
            run_id: Uuid::new_v4(),
            mode: context.mode,
            origin_page_ref: context.page_url.clone(),
            owner_key: context.export_key.clone(),
            owner_handle: context.profile_handle.clone(),
            target_queue: queue,
            current_index: 0,
            started_at: Utc::now().to_rfc3339(),
            done: false,
            paused: false,
            cancelled: false,
        });
        self.persist();

        info!("🚀 Crawl run queued {} targets (limit {})", queued, max_targets);
        Ok(QueuePlan {
            queued,
            limit_reached: queued >= max_targets,
            navigation: Navigation { url: first.to_string() },
        })
    }

    /// Moves past the target that just finished
    pub fn advance(&mut self, completed: &PostId) -> Result<AdvanceOutcome, OrchestratorError> {
        let state = self.active_state_mut()?;

        let index = if state.target_queue.get(state.current_index) == Some(completed) {
            state.current_index + 1
        } else if let Some(found) = state.target_queue.iter().position(|id| id == completed) {
            // Manual navigation; never move backwards
            (found + 1).max(state.current_index)
        } else {
            warn!("⚠️ Completed target {} is not in the crawl queue", completed);
            return Ok(AdvanceOutcome::Stuck { completed: completed.clone() });
        };

        let total = state.target_queue.len();
        if index >= total {
            state.current_index = total;
            state.done = true;
            state.paused = false;
            let navigation = Navigation::to(state.origin_page_ref.clone());
            self.persist();
            info!("🏁 Crawl run completed ({} targets)", total);
            return Ok(AdvanceOutcome::Completed { total, navigation });
        }

        state.current_index = index;
        let navigation = if state.paused {
            None
        } else {
            Navigation::to(state.target_queue[index].to_string())
        };
        self.persist();
        Ok(AdvanceOutcome::Next { index, total, navigation })
    }

    /// Toggles the pause-after-this-page flag; returns the new value
    pub fn pause(&mut self) -> Result<bool, OrchestratorError> {
        let state = self.active_state_mut()?;
        state.paused = !state.paused;
        let paused = state.paused;
        self.persist();
        info!("{} crawl run", if paused { "⏸️ Paused" } else { "▶️ Unpaused" });
        Ok(paused)
    }

    /// Unpauses and re-opens the current target
    pub fn resume(&mut self) -> Result<ResumePlan, OrchestratorError> {
        let state = self.active_state_mut()?;
        let total = state.target_queue.len();
        let index = state.current_index.min(total.saturating_sub(1));
        state.paused = false;
        state.current_index = index;
        let navigation = Navigation::to(state.target_queue[index].to_string());
        self.persist();
        info!("▶️ Resuming crawl run at {}/{}", index + 1, total);
        Ok(ResumePlan { index, total, navigation })
    }

    /// Ends the run; returns the navigation back to the origin page
    pub fn cancel(&mut self) -> Result<Option<Navigation>, OrchestratorError> {
        let state = self.active_state_mut()?;
        state.done = true;
        state.paused = false;
        state.cancelled = true;
        let navigation = Navigation::to(state.origin_page_ref.clone());
        self.persist();
        info!("🛑 Crawl run cancelled");
        Ok(navigation)
    }

    /// Appends the side data of one finished target to the aggregate
    pub fn record_target_output(&mut self, posts: &[ObservedPost]) {
        let Some(state) = self.state.as_ref().filter(|s| !s.done) else {
            return;
        };
        self.aggregate.version = RECORD_VERSION;
        self.aggregate.owner_key.clone_from(&state.owner_key);
        self.aggregate.owner_handle.clone_from(&state.owner_handle);
        self.aggregate
            .posts
            .extend(posts.iter().filter(|p| !p.id.is_empty()).map(ObservedPost::side_data));
        storage::save_json(self.store.as_ref(), keys::AGGREGATE, &self.aggregate);
    }

    #[must_use]
    pub const fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    /// Hands the aggregate over once the run is done, clearing it
    pub fn take_aggregate(&mut self) -> Option<Aggregate> {
        if self.phase() != RunPhase::Done || self.aggregate.posts.is_empty() {
            return None;
        }
        storage::clear(self.store.as_ref(), keys::AGGREGATE);
        Some(std::mem::take(&mut self.aggregate))
    }

    /// Acknowledges a finished or cancelled run and removes its record
    pub fn finish(&mut self) {
        if self.state.as_ref().is_some_and(|s| s.done) {
            self.state = None;
            storage::clear(self.store.as_ref(), keys::CRAWL_RUN_STATE);
        }
    }

    fn active_state_mut(&mut self) -> Result<&mut CrawlRunState, OrchestratorError> {
        self.state
            .as_mut()
            .filter(|s| !s.done && !s.target_queue.is_empty())
            .ok_or(OrchestratorError::NoActiveRun)
    }

    fn persist(&self) {
        if let Some(state) = &self.state {
            storage::save_json(self.store.as_ref(), keys::CRAWL_RUN_STATE, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::MemoryStore;
    use std::time::Duration;

    const SEARCH_URL: &str = "https://x.com/search?q=from%3Aowner";

    fn id(n: u64) -> PostId {
        PostId::normalize(&format!("https://x.com/owner/status/{n}"))
    }

    fn setup(targets: &[u64]) -> (Arc<MemoryStore>, CrawlOrchestrator) {
        let store = Arc::new(MemoryStore::new());
        let checkpoint = CheckpointStore::load(store.clone(), true, Duration::ZERO);
        let mut orchestrator = CrawlOrchestrator::load(store.clone());
        let candidates: Vec<PostId> = targets.iter().map(|n| id(*n)).collect();
        orchestrator
            .build_queue(&candidates, 20, &checkpoint, &RunContext::from_url(SEARCH_URL))
            .unwrap();
        (store, orchestrator)
    }

    #[test]
    fn build_queue_dedups_and_caps() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::REMEMBERED_IDS, id(2).as_str()).unwrap();
        let checkpoint = CheckpointStore::load(store.clone(), true, Duration::ZERO);
        let mut orchestrator = CrawlOrchestrator::load(store);

        let candidates = vec![id(1), id(1), id(2), id(3), id(4)];
        let plan = orchestrator
            .build_queue(&candidates, 2, &checkpoint, &RunContext::from_url(SEARCH_URL))
            .unwrap();

        assert_eq!(plan.queued, 2);
        assert!(plan.limit_reached);
        assert_eq!(plan.navigation.url, id(1).to_string());
        assert_eq!(orchestrator.state().unwrap().target_queue, vec![id(1), id(3)]);
        assert_eq!(orchestrator.state().unwrap().owner_key, "owner");
    }

    #[test]
    fn empty_queue_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let checkpoint = CheckpointStore::load(store.clone(), true, Duration::ZERO);
        let mut orchestrator = CrawlOrchestrator::load(store);
        let result = orchestrator.build_queue(&[], 20, &checkpoint, &RunContext::from_url(SEARCH_URL));
        assert_eq!(result, Err(OrchestratorError::NothingToQueue));
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
    }

    #[test]
    fn advance_with_fallback_search_completes() {
        let (_store, mut orchestrator) = setup(&[1, 2, 3]);

        let next = orchestrator.advance(&id(1)).unwrap();
        assert_eq!(
            next,
            AdvanceOutcome::Next { index: 1, total: 3, navigation: Navigation::to(id(2).to_string()) }
        );

        let done = orchestrator.advance(&id(3)).unwrap();
        assert_eq!(done, AdvanceOutcome::Completed { total: 3, navigation: Navigation::to(SEARCH_URL) });
        assert_eq!(orchestrator.phase(), RunPhase::Done);
        assert_eq!(orchestrator.state().unwrap().current_index, 3);
        assert_eq!(orchestrator.advance(&id(3)), Err(OrchestratorError::NoActiveRun));
    }

    #[test]
    fn unknown_target_is_stuck() {
        let (_store, mut orchestrator) = setup(&[1, 2]);
        let outcome = orchestrator.advance(&id(99)).unwrap();
        assert_eq!(outcome, AdvanceOutcome::Stuck { completed: id(99) });
        assert_eq!(orchestrator.state().unwrap().current_index, 0);
        assert!(orchestrator.cancel().unwrap().is_some());
        assert_eq!(orchestrator.phase(), RunPhase::Cancelled);
    }

    #[test]
    fn paused_run_advances_without_navigation_and_resumes() {
        let (_store, mut orchestrator) = setup(&[1, 2, 3]);
        assert!(orchestrator.pause().unwrap());
        assert!(!orchestrator.is_current_target(id(1).as_str()));

        let outcome = orchestrator.advance(&id(1)).unwrap();
        assert_eq!(outcome, AdvanceOutcome::Next { index: 1, total: 3, navigation: None });

        let plan = orchestrator.resume().unwrap();
        assert_eq!(plan.index, 1);
        assert_eq!(plan.navigation, Navigation::to(id(2).to_string()));
        assert!(orchestrator.is_current_target("https://x.com/owner/status/2"));
    }

    #[test]
    fn state_survives_reload() {
        let (store, mut orchestrator) = setup(&[1, 2]);
        orchestrator.advance(&id(1)).unwrap();

        let reloaded = CrawlOrchestrator::load(store);
        assert_eq!(reloaded.state().unwrap().current_index, 1);
        assert_eq!(reloaded.phase(), RunPhase::Running);
    }

    #[test]
    fn aggregate_is_handed_over_once_at_done() {
        let (_store, mut orchestrator) = setup(&[1]);
        let post = ObservedPost::new(id(1).as_str(), "@owner", "t").with_avatar("a.jpg").voice();
        orchestrator.record_target_output(std::slice::from_ref(&post));
        assert!(orchestrator.take_aggregate().is_none());

        orchestrator.advance(&id(1)).unwrap();
        let aggregate = orchestrator.take_aggregate().unwrap();
        assert_eq!(aggregate.owner_key, "owner");
        assert_eq!(aggregate.posts, vec![post.side_data()]);
        assert!(orchestrator.take_aggregate().is_none());

        orchestrator.finish();
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
    }
}
