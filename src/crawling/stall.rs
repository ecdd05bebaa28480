//! # Stall Detector
//!
//! Per-tick state machine deciding when a page has stopped producing posts:
//!
//! ```text
//! Running ──(idle timeline)──▶ PausedWaitingForLoad ──(new node)──▶ Running
//!    │                                   │
//!    └──(end marker / ceiling)──▶ Stopped ◀──(load wait timeout)──┘
//! ```
//!
//! `Stopped` is terminal.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crawling::observer::PageObserver;
use crate::domain::StopReason;
use crate::infrastructure::config::{defaults, HarvestConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallConfig {
    pub auto_stop: bool,
    pub max_no_new_ticks: u32,
    pub end_marker_ticks: u32,
    pub pause_min_ticks: u32,
    pub pause_threshold: Duration,
    pub load_wait_timeout: Duration,
    /// Load-wait pause only applies to scrolling timelines
    pub timeline_scroll_mode: bool,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            auto_stop: defaults::AUTO_STOP_ENABLED,
            max_no_new_ticks: defaults::MAX_NO_NEW_TICKS,
            end_marker_ticks: defaults::END_MARKER_TICKS,
            pause_min_ticks: defaults::PAUSE_MIN_TICKS,
            pause_threshold: Duration::from_millis(defaults::TIMELINE_PAUSE_THRESHOLD_MS),
            load_wait_timeout: Duration::from_millis(defaults::TIMELINE_LOAD_WAIT_MS),
            timeline_scroll_mode: false,
        }
    }
}

impl StallConfig {
    #[must_use]
    pub fn from_config(config: &HarvestConfig, timeline_scroll_mode: bool) -> Self {
        Self {
            auto_stop: config.limits.auto_stop,
            max_no_new_ticks: config.limits.max_no_new_ticks.max(1),
            end_marker_ticks: config.limits.end_marker_ticks.max(1),
            pause_min_ticks: config.limits.pause_min_ticks,
            pause_threshold: Duration::from_millis(config.limits.pause_threshold_ms),
            load_wait_timeout: Duration::from_millis(config.limits.load_wait_timeout_ms),
            timeline_scroll_mode,
        }
    }
}

/// Signals sampled for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSignals {
    pub new_items_accepted: bool,
    pub scroll_changed: bool,
    pub height_changed: bool,
    pub end_marker_visible: bool,
    pub since_last_new_node: Duration,
    pub gate_open: bool,
}

impl TickSignals {
    /// A tick where nothing happened on an open page
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            new_items_accepted: false,
            scroll_changed: false,
            height_changed: false,
            end_marker_visible: false,
            since_last_new_node: Duration::ZERO,
            gate_open: true,
        }
    }

    const fn page_static(&self) -> bool {
        !self.scroll_changed && !self.height_changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallState {
    Running,
    PausedWaitingForLoad,
    Stopped(StopReason),
}

/// What the engine should do after feeding a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDecision {
    Continue,
    /// Wait for a new-node signal up to `timeout`, then call `resolve_load_wait`
    AwaitLoad { timeout: Duration },
    Stop(StopReason),
}

#[derive(Debug)]
pub struct StallDetector {
    config: StallConfig,
    state: StallState,
    no_progress_ticks: u32,
}

impl StallDetector {
    #[must_use]
    pub const fn new(config: StallConfig) -> Self {
        Self { config, state: StallState::Running, no_progress_ticks: 0 }
    }

    #[must_use]
    pub const fn state(&self) -> StallState {
        self.state
    }

    #[must_use]
    pub const fn no_progress_ticks(&self) -> u32 {
        self.no_progress_ticks
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self.state, StallState::Stopped(_))
    }

    /// Feeds one tick of signals
    pub fn observe(&mut self, signals: TickSignals) -> StallDecision {
        match self.state {
            StallState::Stopped(reason) => return StallDecision::Stop(reason),
            StallState::PausedWaitingForLoad => {
                return StallDecision::AwaitLoad { timeout: self.config.load_wait_timeout };
            }
            StallState::Running => {}
        }

        if !signals.gate_open {
            self.no_progress_ticks = 0;
            return StallDecision::Continue;
        }

        if signals.new_items_accepted {
            self.no_progress_ticks = 0;
        } else {
            self.no_progress_ticks = self.no_progress_ticks.saturating_add(1);
        }

        if !self.config.auto_stop {
            return StallDecision::Continue;
        }

        if signals.end_marker_visible && self.no_progress_ticks >= self.config.end_marker_ticks {
            return self.stop(StopReason::EndOfTimeline);
        }

        if self.config.timeline_scroll_mode
            && signals.page_static()
            && self.no_progress_ticks >= self.config.pause_min_ticks
            && signals.since_last_new_node >= self.config.pause_threshold
        {
            info!("⏸️ No new posts for {:?}, waiting for the page to load", signals.since_last_new_node);
            self.state = StallState::PausedWaitingForLoad;
            return StallDecision::AwaitLoad { timeout: self.config.load_wait_timeout };
        }

        if self.no_progress_ticks >= self.config.max_no_new_ticks && signals.page_static() {
            return self.stop(StopReason::StallCeiling);
        }

        StallDecision::Continue
    }

    /// Completes a load wait: new nodes resume the run, a timeout stops it
    pub fn resolve_load_wait(&mut self, new_nodes_observed: bool) -> StallDecision {
        if self.state != StallState::PausedWaitingForLoad {
            return match self.state {
                StallState::Stopped(reason) => StallDecision::Stop(reason),
                _ => StallDecision::Continue,
            };
        }

        if new_nodes_observed {
            debug!("New posts arrived, resuming");
            self.state = StallState::Running;
            self.no_progress_ticks = 0;
            StallDecision::Continue
        } else {
            self.stop(StopReason::NoNewNodes)
        }
    }

    /// Stops regardless of signals (manual stop, cancellation)
    pub fn force_stop(&mut self, reason: StopReason) -> StallDecision {
        if let StallState::Stopped(existing) = self.state {
            return StallDecision::Stop(existing);
        }
        self.stop(reason)
    }

    fn stop(&mut self, reason: StopReason) -> StallDecision {
        info!("🛑 Auto-stop: {} after {} idle ticks", reason, self.no_progress_ticks);
        self.state = StallState::Stopped(reason);
        StallDecision::Stop(reason)
    }
}

/// Polls activity pulses until the new-node marker moves away from `baseline_ms`
///
/// Returns whether new nodes were observed before `timeout` (or cancellation).
pub async fn wait_for_new_nodes(
    observer: &dyn PageObserver,
    baseline_ms: u64,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if observer.activity_pulse().await.new_node_observed_at_ms != baseline_ms {
            return true;
        }
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
            return false;
        }
        let nap = poll_interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end_marker_tick() -> TickSignals {
        TickSignals { end_marker_visible: true, ..TickSignals::idle() }
    }

    #[test]
    fn end_marker_stops_exactly_on_fourth_idle_tick() {
        let mut detector = StallDetector::new(StallConfig::default());
        for _ in 0..3 {
            assert_eq!(detector.observe(end_marker_tick()), StallDecision::Continue);
        }
        assert_eq!(detector.observe(end_marker_tick()), StallDecision::Stop(StopReason::EndOfTimeline));
        assert_eq!(detector.state(), StallState::Stopped(StopReason::EndOfTimeline));
    }

    #[test]
    fn closed_gate_never_stops() {
        let mut detector = StallDetector::new(StallConfig::default());
        let closed = TickSignals { gate_open: false, ..end_marker_tick() };
        for _ in 0..100 {
            assert_eq!(detector.observe(closed), StallDecision::Continue);
        }
        assert_eq!(detector.no_progress_ticks(), 0);
    }

    #[test]
    fn progress_resets_counter() {
        let mut detector = StallDetector::new(StallConfig::default());
        for _ in 0..11 {
            detector.observe(TickSignals::idle());
        }
        detector.observe(TickSignals { new_items_accepted: true, ..TickSignals::idle() });
        assert_eq!(detector.no_progress_ticks(), 0);
    }

    #[test]
    fn ceiling_requires_static_page() {
        let mut detector = StallDetector::new(StallConfig::default());
        let scrolling = TickSignals { scroll_changed: true, ..TickSignals::idle() };
        for _ in 0..20 {
            assert_eq!(detector.observe(scrolling), StallDecision::Continue);
        }
        assert_eq!(detector.observe(TickSignals::idle()), StallDecision::Stop(StopReason::StallCeiling));
    }

    #[test]
    fn timeline_pause_then_resume_or_stop() {
        let config = StallConfig { timeline_scroll_mode: true, ..StallConfig::default() };
        let idle_long = TickSignals { since_last_new_node: Duration::from_millis(1500), ..TickSignals::idle() };

        let mut detector = StallDetector::new(config.clone());
        assert_eq!(detector.observe(idle_long), StallDecision::Continue);
        assert_eq!(
            detector.observe(idle_long),
            StallDecision::AwaitLoad { timeout: Duration::from_secs(10) }
        );
        assert_eq!(detector.resolve_load_wait(true), StallDecision::Continue);
        assert_eq!(detector.state(), StallState::Running);
        assert_eq!(detector.no_progress_ticks(), 0);

        let mut detector = StallDetector::new(config);
        detector.observe(idle_long);
        detector.observe(idle_long);
        assert_eq!(detector.resolve_load_wait(false), StallDecision::Stop(StopReason::NoNewNodes));
    }

    #[test]
    fn auto_stop_disabled_keeps_running() {
        let mut detector = StallDetector::new(StallConfig { auto_stop: false, ..StallConfig::default() });
        for _ in 0..50 {
            assert_eq!(detector.observe(end_marker_tick()), StallDecision::Continue);
        }
        assert_eq!(detector.force_stop(StopReason::Manual), StallDecision::Stop(StopReason::Manual));
    }

    #[test]
    fn stopped_is_terminal() {
        let mut detector = StallDetector::new(StallConfig::default());
        detector.force_stop(StopReason::Manual);
        let busy = TickSignals { new_items_accepted: true, scroll_changed: true, ..TickSignals::idle() };
        assert_eq!(detector.observe(busy), StallDecision::Stop(StopReason::Manual));
        assert_eq!(detector.force_stop(StopReason::Cancelled), StallDecision::Stop(StopReason::Manual));
    }
}
