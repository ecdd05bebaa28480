//! # Deferral Scheduler
//!
//! Holds posts back while a translation overlay is expected to attach content
//! to them. Every post gets a bounded window and a bounded number of
//! attempts; after that it is accepted untranslated. Entries that outlive
//! `stale_factor` windows get a fresh window instead of blocking forever.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::crawling::observer::PageObserver;
use crate::domain::PostId;
use crate::infrastructure::config::{defaults, HarvestConfig};

/// Deferral limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferralPolicy {
    pub enabled: bool,
    /// Configured wait (already clamped); zero disables settling
    pub wait: Duration,
    pub min_wait: Duration,
    pub max_attempts: u32,
    pub stale_factor: u32,
    pub poll_interval: Duration,
}

impl Default for DeferralPolicy {
    fn default() -> Self {
        Self {
            enabled: defaults::WAIT_FOR_OVERLAY,
            wait: Duration::from_millis(defaults::TRANSLATION_WAIT_MS),
            min_wait: Duration::from_millis(defaults::MIN_EFFECTIVE_TRANSLATION_WAIT_MS),
            max_attempts: defaults::MAX_DEFER_ATTEMPTS,
            stale_factor: defaults::DEFER_STALE_FACTOR,
            poll_interval: Duration::from_millis(defaults::TRANSLATION_POLL_MS),
        }
    }
}

impl DeferralPolicy {
    #[must_use]
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            enabled: config.translation.wait_for_overlay,
            wait: config.translation.clamped_wait(),
            min_wait: Duration::from_millis(config.translation.min_effective_wait_ms),
            max_attempts: config.translation.max_defer_attempts,
            stale_factor: config.translation.stale_factor.max(1),
            poll_interval: Duration::from_millis(config.timing.translation_poll_ms.max(1)),
        }
    }

    /// Per-post window: the configured wait, but never below the floor
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.wait.max(self.min_wait)
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.max_wait() * self.stale_factor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferralEntry {
    first_seen_at: Instant,
    attempt_count: u32,
}

/// Outcome of waiting for overlay content on pending posts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Every pending post has overlay content
    Settled,
    TimedOut { remaining: usize },
    Cancelled,
    /// Nothing to wait for (no pending posts, feature off, or zero wait)
    Skipped,
}

#[derive(Debug, Default)]
pub struct DeferralScheduler {
    policy: DeferralPolicy,
    entries: HashMap<PostId, DeferralEntry>,
}

impl DeferralScheduler {
    #[must_use]
    pub fn new(policy: DeferralPolicy) -> Self {
        Self { policy, entries: HashMap::new() }
    }

    #[must_use]
    pub const fn policy(&self) -> &DeferralPolicy {
        &self.policy
    }

    /// Whether to hold the post back this tick
    pub fn should_defer(&mut self, id: &PostId, has_overlay_now: bool, overlay_active: bool, now: Instant) -> bool {
        if !self.policy.enabled || !overlay_active || has_overlay_now || id.is_empty() {
            return false;
        }

        let max_wait = self.policy.max_wait();
        let stale_after = self.policy.stale_after();
        let entry = self
            .entries
            .entry(id.clone())
            .or_insert(DeferralEntry { first_seen_at: now, attempt_count: 0 });

        if now.saturating_duration_since(entry.first_seen_at) > stale_after {
            *entry = DeferralEntry { first_seen_at: now, attempt_count: 0 };
        }
        entry.attempt_count += 1;

        let elapsed = now.saturating_duration_since(entry.first_seen_at);
        let defer = elapsed <= max_wait && entry.attempt_count <= self.policy.max_attempts;
        if !defer {
            debug!("Giving up on overlay for {} after {} attempts", id, entry.attempt_count);
        }
        defer
    }

    /// Drops the entry once the post has been accepted
    pub fn resolve(&mut self, id: &PostId) {
        self.entries.remove(id);
    }

    /// Forgets every pending post (run finalized)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn is_pending(&self, id: &PostId) -> bool {
        self.entries.contains_key(id)
    }

    /// Drops entries whose post is no longer rendered
    pub fn retain_rendered(&mut self, rendered: &HashSet<&PostId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| rendered.contains(id));
        before - self.entries.len()
    }

    #[must_use]
    pub fn pending_ids(&self) -> Vec<PostId> {
        self.entries.keys().cloned().collect()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    /// Drops entries older than the stale threshold
    pub fn cleanup_stale(&mut self, now: Instant) -> usize {
        let stale_after = self.policy.stale_after();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.first_seen_at) <= stale_after);
        before - self.entries.len()
    }

    /// A post accepted without overlay content while the overlay is active was not
    /// confidently translated and must stay eligible for a later run
    #[must_use]
    pub const fn confidently_translated(&self, overlay_active: bool, has_overlay: bool) -> bool {
        !(self.policy.enabled && overlay_active && !has_overlay)
    }

    /// Deferred posts worth waiting on: rendered in `posts`, not yet accepted
    /// according to `unseen`, at most `MAX_SETTLE_CANDIDATES` in DOM order
    pub fn settle_candidates<'a>(
        &self,
        posts: impl IntoIterator<Item = &'a PostId>,
        unseen: impl Fn(&PostId) -> bool,
    ) -> Vec<PostId> {
        let mut picked: Vec<PostId> = Vec::new();
        for id in posts {
            if picked.len() >= defaults::MAX_SETTLE_CANDIDATES {
                break;
            }
            if self.is_pending(id) && unseen(id) && !picked.contains(id) {
                picked.push(id.clone());
            }
        }
        picked
    }

    /// Waits for overlay content on the given deferred posts
    pub async fn settle_pending(
        &self,
        observer: &dyn PageObserver,
        pending: &[PostId],
        cancel: &CancellationToken,
    ) -> SettleOutcome {
        if !self.policy.enabled || self.policy.wait.is_zero() {
            return SettleOutcome::Skipped;
        }
        settle(observer, pending, self.policy.poll_interval, self.policy.max_wait(), cancel).await
    }
}

/// Polls the observer until every pending post has overlay content, the
/// window elapses, or the run is cancelled. Never sleeps past `max_wait`.
pub async fn settle(
    observer: &dyn PageObserver,
    pending: &[PostId],
    poll_interval: Duration,
    max_wait: Duration,
    cancel: &CancellationToken,
) -> SettleOutcome {
    if pending.is_empty() {
        return SettleOutcome::Skipped;
    }

    let start = Instant::now();
    let deadline = start + max_wait;

    loop {
        if cancel.is_cancelled() {
            return SettleOutcome::Cancelled;
        }
        if !observer.overlay_system_active().await {
            return SettleOutcome::Skipped;
        }

        let checks = join_all(pending.iter().map(|id| observer.has_overlay_content_for(id))).await;
        let remaining = checks.iter().filter(|ready| !**ready).count();
        if remaining == 0 {
            return SettleOutcome::Settled;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("Overlay settle timed out with {} pending", remaining);
            return SettleOutcome::TimedOut { remaining };
        }

        let nap = poll_interval.min(deadline - now);
        tokio::select! {
            () = cancel.cancelled() => return SettleOutcome::Cancelled,
            () = tokio::time::sleep(nap) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_policy() -> DeferralPolicy {
        DeferralPolicy { enabled: true, ..DeferralPolicy::default() }
    }

    fn id(n: u64) -> PostId {
        PostId::normalize(&format!("https://x.com/u/status/{n}"))
    }

    #[test]
    fn never_defers_when_disabled_or_inactive_or_translated() {
        let now = Instant::now();
        let mut off = DeferralScheduler::new(DeferralPolicy::default());
        assert!(!off.should_defer(&id(1), false, true, now));

        let mut on = DeferralScheduler::new(enabled_policy());
        assert!(!on.should_defer(&id(1), false, false, now));
        assert!(!on.should_defer(&id(1), true, true, now));
        assert_eq!(on.pending_count(), 0);
    }

    #[test]
    fn max_wait_has_a_floor() {
        let policy = DeferralPolicy { wait: Duration::from_millis(100), ..enabled_policy() };
        assert_eq!(policy.max_wait(), Duration::from_millis(1200));
        assert_eq!(policy.stale_after(), Duration::from_millis(3600));
    }

    #[test]
    fn attempts_are_capped() {
        let now = Instant::now();
        let mut scheduler = DeferralScheduler::new(enabled_policy());
        let defers = (0..40).take_while(|_| scheduler.should_defer(&id(1), false, true, now)).count();
        assert_eq!(defers, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires_then_stale_entry_resets() {
        let policy = DeferralPolicy { wait: Duration::from_millis(1200), ..enabled_policy() };
        let mut scheduler = DeferralScheduler::new(policy);

        assert!(scheduler.should_defer(&id(1), false, true, Instant::now()));
        tokio::time::advance(Duration::from_millis(1300)).await;
        assert!(!scheduler.should_defer(&id(1), false, true, Instant::now()));

        tokio::time::advance(Duration::from_millis(3700)).await;
        assert!(scheduler.should_defer(&id(1), false, true, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_stale_entries() {
        let mut scheduler = DeferralScheduler::new(enabled_policy());
        scheduler.should_defer(&id(1), false, true, Instant::now());
        tokio::time::advance(Duration::from_secs(60)).await;
        scheduler.should_defer(&id(2), false, true, Instant::now());

        assert_eq!(scheduler.cleanup_stale(Instant::now()), 1);
        assert_eq!(scheduler.pending_ids(), vec![id(2)]);
    }

    #[test]
    fn settle_candidates_are_rendered_unseen_and_capped() {
        let now = Instant::now();
        let mut scheduler = DeferralScheduler::new(enabled_policy());
        for n in 1..=20 {
            scheduler.should_defer(&id(n), false, true, now);
        }

        let rendered: Vec<PostId> = (0..=16).map(id).collect();
        let candidates = scheduler.settle_candidates(&rendered, |p| *p != id(3));
        assert_eq!(candidates.len(), 12);
        assert_eq!(candidates.first(), Some(&id(1)));
        assert!(!candidates.contains(&id(0)));
        assert!(!candidates.contains(&id(3)));

        let visible: HashSet<&PostId> = rendered.iter().collect();
        assert_eq!(scheduler.retain_rendered(&visible), 4);
        assert!(!scheduler.is_pending(&id(17)));
        assert!(scheduler.is_pending(&id(16)));
    }

    #[test]
    fn remember_policy() {
        let scheduler = DeferralScheduler::new(enabled_policy());
        assert!(!scheduler.confidently_translated(true, false));
        assert!(scheduler.confidently_translated(true, true));
        assert!(scheduler.confidently_translated(false, false));

        let off = DeferralScheduler::new(DeferralPolicy::default());
        assert!(off.confidently_translated(true, false));
    }
}
