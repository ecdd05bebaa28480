//! # Harvest Engine
//!
//! One engine per page and crawl run. All run state lives in the engine's
//! fields; cross-page state goes through the checkpoint store and the crawl
//! run record. A fixed-period tick observes the page, admits posts through the
//! resume gate, dedup and translation deferral, feeds the stall detector and
//! finalizes the run buffer exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawling::checkpoint::CheckpointStore;
use crate::crawling::collector::SearchCollector;
use crate::crawling::deferral::{DeferralPolicy, DeferralScheduler, SettleOutcome};
use crate::crawling::observer::{ActivityPulse, HarvestSink, Navigator, PageObserver};
use crate::crawling::orchestrator::{AdvanceOutcome, CrawlOrchestrator, Navigation, OrchestratorError};
use crate::crawling::stall::{wait_for_new_nodes, StallConfig, StallDecision, StallDetector, TickSignals};
use crate::crawling::threads::{reconstruct_status_page, Reconstruction, ThreadReconstructor};
use crate::domain::{
    handle_to_export_key, shifted_search_url, FinalizedOutput, ObservedPost, PageMode, PostId, RunContext, RunStatus,
    SearchRangeError, ShiftDirection, StopReason,
};
use crate::infrastructure::config::HarvestConfig;
use crate::infrastructure::storage::KeyValueStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Crawl run error: {0}")]
    CrawlRun(#[from] OrchestratorError),

    #[error("Page {0} is not harvestable")]
    NotHarvesting(String),

    #[error("Search window error: {0}")]
    SearchWindow(#[from] SearchRangeError),
}

/// How the engine started on the current page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStart {
    /// Collecting posts from this page
    Harvesting { mode: PageMode, gate_open: bool, part_of_crawl_run: bool },
    SearchRunStarted { queued: usize, limit_reached: bool },
    SearchRunResumed { index: usize, total: usize },
    NothingToQueue,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// Engine is not harvesting (finalized, cancelled or on a search page)
    Inactive,
    /// Waiting out the start delay of a crawl-run page
    Delayed,
    Continued { accepted: usize, deferred: usize },
    Stopped(StopReason),
}

#[derive(Debug, Default, Clone, Copy)]
struct ExtractStats {
    accepted: usize,
    deferred: usize,
}

/// Host-side collaborators of an engine
#[derive(Clone)]
pub struct EngineParts {
    pub observer: Arc<dyn PageObserver>,
    pub sink: Arc<dyn HarvestSink>,
    pub navigator: Arc<dyn Navigator>,
    pub store: Arc<dyn KeyValueStore>,
}

pub struct HarvestEngine {
    observer: Arc<dyn PageObserver>,
    sink: Arc<dyn HarvestSink>,
    navigator: Arc<dyn Navigator>,
    config: HarvestConfig,
    context: RunContext,
    checkpoint: CheckpointStore,
    deferral: DeferralScheduler,
    stall: StallDetector,
    orchestrator: CrawlOrchestrator,
    buffer: Vec<ObservedPost>,
    harvesting: bool,
    finalized: bool,
    stop_reason: Option<StopReason>,
    part_of_crawl_run: bool,
    start_delay_until: Option<Instant>,
    last_pulse: Option<ActivityPulse>,
    last_activity_at: Instant,
    scroll_step_px: u32,
    cancel: CancellationToken,
}

impl HarvestEngine {
    /// Builds an engine for the page the observer currently shows
    pub async fn open(parts: EngineParts, config: HarvestConfig) -> Self {
        let config = config.normalized();
        let page_url = parts.observer.page_url().await;
        let context = RunContext::from_url(&page_url);

        let checkpoint = CheckpointStore::load(
            Arc::clone(&parts.store),
            config.checkpoint.remember_ids,
            Duration::from_millis(config.checkpoint.save_debounce_ms),
        );
        let orchestrator = CrawlOrchestrator::load(Arc::clone(&parts.store));
        let deferral = DeferralScheduler::new(DeferralPolicy::from_config(&config));
        let stall = StallDetector::new(StallConfig::from_config(&config, context.mode.is_timeline_scroll()));
        let scroll_step_px = config.timing.effective_scroll_step();

        info!("🌐 Harvest engine opened on {} ({})", context.page_url, context.mode);

        Self {
            observer: parts.observer,
            sink: parts.sink,
            navigator: parts.navigator,
            config,
            context,
            checkpoint,
            deferral,
            stall,
            orchestrator,
            buffer: Vec::new(),
            harvesting: false,
            finalized: false,
            stop_reason: None,
            part_of_crawl_run: false,
            start_delay_until: None,
            last_pulse: None,
            last_activity_at: Instant::now(),
            scroll_step_px,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn context(&self) -> &RunContext {
        &self.context
    }

    #[must_use]
    pub const fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn checkpoint_mut(&mut self) -> &mut CheckpointStore {
        &mut self.checkpoint
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &CrawlOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn buffer(&self) -> &[ObservedPost] {
        &self.buffer
    }

    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[must_use]
    pub const fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts harvesting, or starts/resumes a crawl run on a search page
    pub async fn begin(&mut self) -> Result<EngineStart, EngineError> {
        if self.context.mode.is_search() {
            return self.begin_search_run().await;
        }
        if self.context.mode == PageMode::Other {
            return Err(EngineError::NotHarvesting(self.context.page_url.clone()));
        }

        let is_status = self.context.mode == PageMode::Status;
        self.checkpoint.begin_run(is_status);
        self.part_of_crawl_run = is_status && self.orchestrator.is_active();
        if self.part_of_crawl_run && self.orchestrator.is_current_target(&self.context.page_url) {
            let delay = Duration::from_millis(self.config.timing.search_run_start_delay_ms);
            self.start_delay_until = Some(Instant::now() + delay);
            debug!("Crawl-run page, starting in {:?}", delay);
        }

        self.harvesting = true;
        self.last_activity_at = Instant::now();

        let gate_open = self.checkpoint.gate_is_open();
        let status = if gate_open { RunStatus::Started } else { RunStatus::WaitingForStartPost };
        self.sink.on_run_state_changed(status).await;
        info!("▶️ Harvest started ({}, gate open: {})", self.context.mode, gate_open);

        Ok(EngineStart::Harvesting {
            mode: self.context.mode,
            gate_open,
            part_of_crawl_run: self.part_of_crawl_run,
        })
    }

    async fn begin_search_run(&mut self) -> Result<EngineStart, EngineError> {
        if self.orchestrator.state().is_some_and(|s| s.paused) && self.orchestrator.is_active() {
            let plan = self.orchestrator.resume()?;
            self.sink
                .on_run_state_changed(RunStatus::SearchRunResumed { index: plan.index, total: plan.total })
                .await;
            self.navigate(plan.navigation).await;
            return Ok(EngineStart::SearchRunResumed { index: plan.index, total: plan.total });
        }

        if self.context.owner_handle().is_none() {
            self.infer_search_owner().await;
        }

        let collector = SearchCollector::from_config(&self.config);
        let candidates = collector
            .collect(self.observer.as_ref(), &self.checkpoint, &self.cancel)
            .await;

        let plan = match self
            .orchestrator
            .build_queue(&candidates, collector.max_targets, &self.checkpoint, &self.context)
        {
            Ok(plan) => plan,
            Err(OrchestratorError::NothingToQueue) => {
                self.sink.on_run_state_changed(RunStatus::NothingToQueue).await;
                return Ok(EngineStart::NothingToQueue);
            }
            Err(e) => return Err(e.into()),
        };

        self.sink
            .on_run_state_changed(RunStatus::SearchRunQueued { count: plan.queued, limit_reached: plan.limit_reached })
            .await;
        self.sink
            .on_run_state_changed(RunStatus::SearchRunOpening { index: 0, total: plan.queued })
            .await;
        self.checkpoint.flush_now();
        self.navigate(Some(plan.navigation)).await;

        Ok(EngineStart::SearchRunStarted { queued: plan.queued, limit_reached: plan.limit_reached })
    }

    /// Takes the owner from the first result when the query names none
    async fn infer_search_owner(&mut self) {
        let Ok(posts) = self.observer.observe_posts().await else {
            return;
        };
        if let Some(first) = posts.iter().find(|p| !p.is_repost && !p.author_handle.trim().is_empty()) {
            debug!("Search owner inferred from first result: {}", first.author_handle);
            self.context = self.context.clone().with_fallback_owner(&first.author_handle);
        }
    }

    /// Moves a search page to the neighbouring `since:`/`until:` window
    pub async fn shift_search_window(&mut self, direction: ShiftDirection) -> Result<String, EngineError> {
        let url = shifted_search_url(&self.context.page_url, direction)?;
        info!("📅 Shifting search window {:?}", direction);
        self.navigator.navigate(&url).await;
        Ok(url)
    }

    /// Runs one tick. Never fails; per-item problems are logged and skipped.
    pub async fn tick(&mut self) -> TickReport {
        if self.cancel.is_cancelled() || !self.harvesting || self.finalized {
            return TickReport::Inactive;
        }

        let now = Instant::now();
        if let Some(until) = self.start_delay_until {
            if now < until {
                return TickReport::Delayed;
            }
            self.start_delay_until = None;
            self.last_activity_at = now;
        }

        self.checkpoint.flush_if_due(now);
        let dropped = self.deferral.cleanup_stale(now);
        if dropped > 0 {
            debug!("Dropped {} stale deferrals", dropped);
        }

        if self.settle_deferrals().await == SettleOutcome::Cancelled {
            return TickReport::Inactive;
        }

        let mut stats = self.extract_posts().await;
        if stats.deferred > 0 {
            if self.settle_deferrals().await == SettleOutcome::Cancelled {
                return TickReport::Inactive;
            }
            let retry = self.extract_posts().await;
            stats.accepted += retry.accepted;
            stats.deferred = retry.deferred;
        }

        self.observer.scroll_step(self.scroll_step_px).await;
        let pulse = self.observer.activity_pulse().await;
        let signals = self.signals_for(pulse, stats.accepted > 0);
        debug!(
            accepted = stats.accepted,
            deferred = stats.deferred,
            buffered = self.buffer.len(),
            idle_ticks = self.stall.no_progress_ticks(),
            "Tick"
        );

        let decision = match self.stall.observe(signals) {
            StallDecision::AwaitLoad { timeout } => self.await_load(pulse, timeout).await,
            other => other,
        };

        match decision {
            StallDecision::Stop(reason) => {
                self.sink
                    .on_run_state_changed(RunStatus::AutoStopped { reason, accepted: self.buffer.len() })
                    .await;
                self.finalize(reason, false).await;
                TickReport::Stopped(reason)
            }
            _ if self.cancel.is_cancelled() => TickReport::Inactive,
            _ => TickReport::Continued { accepted: stats.accepted, deferred: stats.deferred },
        }
    }

    /// Waits on deferred posts that are still rendered and not yet accepted.
    /// Deferrals whose post left the page are dropped.
    async fn settle_deferrals(&mut self) -> SettleOutcome {
        if self.deferral.pending_count() == 0 {
            return SettleOutcome::Skipped;
        }
        let rendered = match self.observer.observe_posts().await {
            Ok(posts) => posts,
            Err(e) => {
                debug!("Skipping overlay settle: {}", e);
                return SettleOutcome::Skipped;
            }
        };

        let candidates = {
            let visible: HashSet<&PostId> = rendered.iter().map(|p| &p.id).collect();
            let dropped = self.deferral.retain_rendered(&visible);
            if dropped > 0 {
                debug!("Dropped {} deferrals no longer on the page", dropped);
            }
            let checkpoint = &self.checkpoint;
            self.deferral
                .settle_candidates(rendered.iter().map(|p| &p.id), |id| checkpoint.should_accept(id))
        };
        if candidates.is_empty() {
            return SettleOutcome::Skipped;
        }

        self.sink
            .on_run_state_changed(RunStatus::WaitingForTranslation { pending: candidates.len() })
            .await;
        let outcome = self
            .deferral
            .settle_pending(self.observer.as_ref(), &candidates, &self.cancel)
            .await;
        debug!("Overlay settle: {:?}", outcome);
        outcome
    }

    async fn extract_posts(&mut self) -> ExtractStats {
        let mut stats = ExtractStats::default();
        let posts = match self.observer.observe_posts().await {
            Ok(posts) => posts,
            Err(e) => {
                warn!("⚠️ Observation failed, skipping tick: {}", e);
                return stats;
            }
        };
        let overlay_active = self.observer.overlay_system_active().await;
        let now = Instant::now();

        for post in posts {
            if post.is_repost || post.id.is_empty() {
                continue;
            }
            // Gate before dedup: a remembered cursor post must still open the gate
            if !self.checkpoint.check_gate(&post.id).admits_post() {
                continue;
            }
            if !self.checkpoint.should_accept(&post.id) {
                continue;
            }

            let has_overlay = post.has_overlay_content;
            if self.deferral.should_defer(&post.id, has_overlay, overlay_active, now) {
                stats.deferred += 1;
                continue;
            }
            self.deferral.resolve(&post.id);

            let remember = self.deferral.confidently_translated(overlay_active, has_overlay);
            self.checkpoint.mark_accepted(&post.id, remember, now);
            debug!("Accepted {} (remember: {})", post.id, remember);
            self.buffer.push(post);
            stats.accepted += 1;
        }
        stats
    }

    #[allow(clippy::float_cmp)]
    fn signals_for(&mut self, pulse: ActivityPulse, new_items_accepted: bool) -> TickSignals {
        let now = Instant::now();
        let (scroll_changed, height_changed, new_node) = match self.last_pulse {
            Some(last) => (
                pulse.scroll_y != last.scroll_y,
                pulse.document_height != last.document_height,
                pulse.new_node_observed_at_ms != last.new_node_observed_at_ms,
            ),
            None => (true, true, true),
        };
        if new_node || height_changed || new_items_accepted {
            self.last_activity_at = now;
        }
        self.last_pulse = Some(pulse);

        TickSignals {
            new_items_accepted,
            scroll_changed,
            height_changed,
            end_marker_visible: pulse.end_marker_visible,
            since_last_new_node: now.saturating_duration_since(self.last_activity_at),
            gate_open: self.checkpoint.gate_is_open(),
        }
    }

    async fn await_load(&mut self, pulse: ActivityPulse, timeout: Duration) -> StallDecision {
        self.sink.on_run_state_changed(RunStatus::PausedWaitingForLoad).await;
        let poll = Duration::from_millis(self.config.timing.load_poll_ms.max(1));
        let observed = wait_for_new_nodes(
            self.observer.as_ref(),
            pulse.new_node_observed_at_ms,
            timeout,
            poll,
            &self.cancel,
        )
        .await;
        if self.cancel.is_cancelled() {
            return StallDecision::Continue;
        }

        let decision = self.stall.resolve_load_wait(observed);
        if decision == StallDecision::Continue {
            self.last_activity_at = Instant::now();
            self.last_pulse = Some(self.observer.activity_pulse().await);
            self.sink.on_run_state_changed(RunStatus::Started).await;
        }
        decision
    }

    /// Manual stop. With `cancel_all` an active crawl run is cancelled instead of advanced.
    pub async fn stop_and_finalize(&mut self, cancel_all: bool) -> Option<FinalizedOutput> {
        if self.finalized || !self.harvesting {
            if cancel_all {
                self.cancel_crawl_run().await.ok();
            }
            return None;
        }
        let reason = if cancel_all { StopReason::Cancelled } else { StopReason::Manual };
        let StallDecision::Stop(reason) = self.stall.force_stop(reason) else {
            return None;
        };
        self.finalize(reason, cancel_all).await
    }

    async fn finalize(&mut self, reason: StopReason, cancel_all: bool) -> Option<FinalizedOutput> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        self.stop_reason = Some(reason);

        if let Some(last) = self.buffer.last() {
            self.checkpoint.set_resume_cursor(last.id.clone(), true);
        }

        let output = self.build_output();
        info!(
            "📦 Finalized {} rows in {} threads ({})",
            output.rows.len(),
            output.thread_count,
            reason
        );
        self.sink.on_finalized(output.clone()).await;
        self.sink
            .on_run_state_changed(RunStatus::Finalized { rows: output.rows.len(), threads: output.thread_count })
            .await;
        self.checkpoint.flush_now();
        self.deferral.clear();

        if self.part_of_crawl_run {
            self.orchestrator.record_target_output(&self.buffer);
            if cancel_all {
                self.cancel_crawl_run().await.ok();
            } else {
                self.advance_crawl_run().await;
            }
        }

        Some(output)
    }

    fn build_output(&self) -> FinalizedOutput {
        let (reconstruction, export_key) = match self.context.mode {
            PageMode::Status => {
                let reconstruction = reconstruct_status_page(&self.buffer, self.context.root_rest_id.as_deref());
                let key = match (self.orchestrator.state(), reconstruction.rows.first()) {
                    (Some(run), _) if self.part_of_crawl_run => run.owner_key.clone(),
                    (_, Some(root)) => handle_to_export_key(&root.post.author_handle),
                    _ => self.context.export_key.clone(),
                };
                (reconstruction, key)
            }
            _ => {
                let reconstruction: Reconstruction =
                    ThreadReconstructor::new(self.context.owner_handle()).reconstruct_timeline(&self.buffer);
                (reconstruction, self.context.export_key.clone())
            }
        };

        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let suggested_name = match (self.context.mode, self.context.root_rest_id.as_deref()) {
            (PageMode::Status, Some(rest_id)) => format!("{export_key}_status_{rest_id}_{stamp}"),
            (mode, _) => format!("{export_key}_{mode}_{stamp}"),
        };

        FinalizedOutput {
            export_key,
            mode: self.context.mode,
            suggested_name,
            thread_count: reconstruction.thread_count,
            rows: reconstruction.rows,
            accepted_count: self.buffer.len(),
        }
    }

    async fn advance_crawl_run(&mut self) {
        let page_url = self.observer.page_url().await;
        let completed = PostId::normalize(&page_url);
        match self.orchestrator.advance(&completed) {
            Ok(AdvanceOutcome::Next { index, total, navigation: Some(navigation) }) => {
                self.sink
                    .on_run_state_changed(RunStatus::SearchRunOpening { index, total })
                    .await;
                self.navigate(Some(navigation)).await;
            }
            Ok(AdvanceOutcome::Next { index, total, navigation: None }) => {
                self.sink
                    .on_run_state_changed(RunStatus::SearchRunPaused { index, total })
                    .await;
            }
            Ok(AdvanceOutcome::Completed { total, navigation }) => {
                self.sink.on_run_state_changed(RunStatus::SearchRunCompleted { total }).await;
                if let Some(aggregate) = self.orchestrator.take_aggregate() {
                    self.sink.on_aggregate_ready(aggregate).await;
                }
                self.orchestrator.finish();
                self.navigate(navigation).await;
            }
            Ok(AdvanceOutcome::Stuck { completed }) => {
                self.sink
                    .on_run_state_changed(RunStatus::SearchRunStuck { completed: completed.to_string() })
                    .await;
            }
            Err(e) => warn!("⚠️ Could not advance crawl run: {}", e),
        }
    }

    /// Toggles pause-after-this-page of the active crawl run
    pub async fn pause_crawl_run(&mut self) -> Result<bool, EngineError> {
        let paused = self.orchestrator.pause()?;
        if let Some(run) = self.orchestrator.state() {
            let (index, total) = (run.current_index, run.total());
            let status = if paused {
                RunStatus::SearchRunPaused { index, total }
            } else {
                RunStatus::SearchRunResumed { index, total }
            };
            self.sink.on_run_state_changed(status).await;
        }
        Ok(paused)
    }

    /// Cancels the active crawl run and returns to its origin page
    pub async fn cancel_crawl_run(&mut self) -> Result<(), EngineError> {
        let navigation = self.orchestrator.cancel()?;
        self.orchestrator.finish();
        self.sink.on_run_state_changed(RunStatus::SearchRunCancelled).await;
        self.navigate(navigation).await;
        Ok(())
    }

    async fn navigate(&self, navigation: Option<Navigation>) {
        if let Some(navigation) = navigation {
            self.navigator.navigate(&navigation.url).await;
        }
    }
}

/// Drives an engine on a fixed interval
#[derive(Clone)]
pub struct HarvestEngineHandle {
    engine: Arc<Mutex<HarvestEngine>>,
    cancel: CancellationToken,
    tick_interval: Duration,
}

impl HarvestEngineHandle {
    #[must_use]
    pub fn new(engine: HarvestEngine) -> Self {
        let cancel = engine.cancellation_token();
        let tick_interval = engine.config.timing.tick_interval();
        Self { engine: Arc::new(Mutex::new(engine)), cancel, tick_interval }
    }

    #[must_use]
    pub fn engine(&self) -> Arc<Mutex<HarvestEngine>> {
        Arc::clone(&self.engine)
    }

    /// Ticks until the engine stops or is cancelled
    pub async fn run(&self) -> Option<StopReason> {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("🛑 Harvest cancelled");
                    return None;
                }
                _ = interval.tick() => {
                    // In-flight guard: a manual stop may hold the engine
                    let Ok(mut engine) = self.engine.try_lock() else {
                        debug!("Engine busy, skipping tick");
                        continue;
                    };
                    match engine.tick().await {
                        TickReport::Stopped(reason) => return Some(reason),
                        TickReport::Inactive => return engine.stop_reason(),
                        TickReport::Delayed | TickReport::Continued { .. } => {}
                    }
                }
            }
        }
    }

    /// Manual stop, see [`HarvestEngine::stop_and_finalize`]
    pub async fn stop(&self, cancel_all: bool) -> Option<FinalizedOutput> {
        self.engine.lock().await.stop_and_finalize(cancel_all).await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
