//! Ordered output sequence produced when a run buffer is finalized.

use serde::{Deserialize, Serialize};

use crate::domain::page::PageMode;
use crate::domain::post::{ObservedPost, PostId};

/// Reply pairing recorded by the DOM-adjacency heuristic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pairing {
    #[default]
    None,
    /// Non-owner post that was followed by one or more owner replies
    Parent { reply_ids: Vec<PostId> },
    /// Owner reply attached to the preceding non-owner post
    Reply { parent_id: PostId },
}

impl Pairing {
    #[must_use]
    pub const fn is_parent(&self) -> bool {
        matches!(self, Self::Parent { .. })
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<&PostId> {
        match self {
            Self::Reply { parent_id } => Some(parent_id),
            _ => None,
        }
    }
}

/// One row of the output sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRow {
    pub post: ObservedPost,
    /// 0 for the section root, 1 for a thread's first post, 2 for later posts
    pub depth: u8,
    pub thread_number: Option<usize>,
    pub post_number_in_thread: Option<usize>,
    pub section_index: usize,
    #[serde(default)]
    pub pairing: Pairing,
}

impl OutputRow {
    #[must_use]
    pub const fn root(post: ObservedPost, section_index: usize) -> Self {
        Self {
            post,
            depth: 0,
            thread_number: None,
            post_number_in_thread: None,
            section_index,
            pairing: Pairing::None,
        }
    }
}

/// Everything a sink receives when a run buffer is finalized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedOutput {
    pub export_key: String,
    pub mode: PageMode,
    /// Suggested output file name, e.g. `alice_replies_20240101-120000`
    pub suggested_name: String,
    pub rows: Vec<OutputRow>,
    pub thread_count: usize,
    pub accepted_count: usize,
}

impl FinalizedOutput {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Posts in output order, without the row annotations
    pub fn posts(&self) -> impl Iterator<Item = &ObservedPost> {
        self.rows.iter().map(|row| &row.post)
    }
}
