//! Status events emitted to the sink during a harvest
//!
//! Every state transition of the engine or of a multi-page crawl run is
//! reported as a [`RunStatus`]. Its `Display` form is the short status text a
//! UI shows next to the controls.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a harvest stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// End-of-timeline marker stayed visible without progress
    EndOfTimeline,
    /// Paused waiting for load and nothing new arrived in time
    NoNewNodes,
    /// Too many consecutive ticks without progress
    StallCeiling,
    /// User requested stop
    Manual,
    /// Crawl run was cancelled
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfTimeline => write!(f, "end of timeline reached"),
            Self::NoNewNodes => write!(f, "no new posts loaded"),
            Self::StallCeiling => write!(f, "no progress"),
            Self::Manual => write!(f, "stopped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status transition reported to the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    /// Resume cursor is set and has not been reached yet
    WaitingForStartPost,
    WaitingForTranslation { pending: usize },
    PausedWaitingForLoad,
    AutoStopped { reason: StopReason, accepted: usize },
    Finalized { rows: usize, threads: usize },
    SearchRunQueued { count: usize, limit_reached: bool },
    SearchRunOpening { index: usize, total: usize },
    SearchRunPaused { index: usize, total: usize },
    SearchRunResumed { index: usize, total: usize },
    SearchRunCompleted { total: usize },
    SearchRunCancelled,
    /// Completed target could not be located in the queue
    SearchRunStuck { completed: String },
    NothingToQueue,
}

impl RunStatus {
    /// Whether the status ends the current page's harvest
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AutoStopped { .. }
                | Self::Finalized { .. }
                | Self::SearchRunCompleted { .. }
                | Self::SearchRunCancelled
                | Self::NothingToQueue
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "Scraping…"),
            Self::WaitingForStartPost => write!(f, "Waiting for start post…"),
            Self::WaitingForTranslation { pending } => {
                write!(f, "Waiting for translation ({pending} pending)…")
            }
            Self::PausedWaitingForLoad => write!(f, "Paused, waiting for more posts to load…"),
            Self::AutoStopped { reason, accepted } => {
                write!(f, "Auto-stopped ({reason}). {accepted} posts collected")
            }
            Self::Finalized { rows, threads } => {
                write!(f, "Exported {rows} posts in {threads} threads")
            }
            Self::SearchRunQueued { count, limit_reached } => {
                if *limit_reached {
                    write!(f, "Queued {count} posts (limit reached)")
                } else {
                    write!(f, "Queued {count} posts")
                }
            }
            Self::SearchRunOpening { index, total } => {
                write!(f, "Search run: opening {}/{total}…", index + 1)
            }
            Self::SearchRunPaused { index, total } => {
                write!(f, "Search run paused at {}/{total}", index + 1)
            }
            Self::SearchRunResumed { index, total } => {
                write!(f, "Search run resumed at {}/{total}", index + 1)
            }
            Self::SearchRunCompleted { total } => write!(f, "Search run complete ({total} posts)"),
            Self::SearchRunCancelled => write!(f, "Search run cancelled"),
            Self::SearchRunStuck { completed } => {
                write!(f, "Search run stuck: {completed} is not in the queue, cancel to recover")
            }
            Self::NothingToQueue => write!(f, "No new posts to queue"),
        }
    }
}
