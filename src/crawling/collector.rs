//! Search result collection: scrolls a search page and gathers candidate
//! status pages for a crawl run.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawling::checkpoint::CheckpointStore;
use crate::crawling::observer::PageObserver;
use crate::domain::PostId;
use crate::infrastructure::config::HarvestConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCollector {
    pub max_targets: usize,
    pub max_ticks: u32,
    pub max_no_progress_ticks: u32,
    pub tick_interval: Duration,
    pub scroll_step_px: u32,
}

impl SearchCollector {
    #[must_use]
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            max_targets: config.search_run.effective_max_targets(),
            max_ticks: config.search_run.collect_max_ticks,
            max_no_progress_ticks: config.search_run.collect_max_no_progress_ticks.max(1),
            tick_interval: config.timing.tick_interval(),
            scroll_step_px: config.timing.effective_scroll_step(),
        }
    }

    /// Scrolls until enough candidates are found or the page is exhausted
    pub async fn collect(
        &self,
        observer: &dyn PageObserver,
        checkpoint: &CheckpointStore,
        cancel: &CancellationToken,
    ) -> Vec<PostId> {
        let mut collected: Vec<PostId> = Vec::new();
        let mut no_progress_ticks = 0u32;

        for tick in 0..self.max_ticks {
            if cancel.is_cancelled() {
                break;
            }

            let before_count = collected.len();
            match observer.observe_posts().await {
                Ok(posts) => {
                    for post in posts {
                        if collected.len() >= self.max_targets {
                            break;
                        }
                        if !post.is_repost && checkpoint.should_accept(&post.id) && !collected.contains(&post.id) {
                            collected.push(post.id);
                        }
                    }
                }
                Err(e) => warn!("⚠️ Search observation failed: {}", e),
            }
            if collected.len() >= self.max_targets {
                break;
            }

            let before = observer.activity_pulse().await;
            observer.scroll_step(self.scroll_step_px).await;
            let after = observer.activity_pulse().await;

            #[allow(clippy::float_cmp)]
            let scrolled = after.scroll_y != before.scroll_y;
            #[allow(clippy::float_cmp)]
            let grew = after.document_height != before.document_height;
            let progressed = collected.len() > before_count;

            if progressed || scrolled || grew {
                no_progress_ticks = 0;
            } else {
                no_progress_ticks += 1;
            }
            debug!(tick, collected = collected.len(), no_progress_ticks, "Search collect tick");

            if after.end_marker_visible && !scrolled && !grew {
                break;
            }
            if no_progress_ticks >= self.max_no_progress_ticks {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.tick_interval) => {}
            }
        }

        info!("🔎 Collected {} search candidates", collected.len());
        collected
    }
}
