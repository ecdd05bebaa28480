//! # Checkpoint Store
//!
//! Decides which posts a run may accept:
//! - ids remembered from earlier runs are skipped (when remembering is on)
//! - ids already accepted in this run are skipped
//! - while a resume cursor is set, everything before it is skipped
//!
//! Remembered ids are persisted as a newline-delimited blob with a debounced
//! write; the resume cursor is persisted as a small JSON record. Storage
//! failures never abort a run: the in-memory sets stay authoritative.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::PostId;
use crate::infrastructure::storage::{self, keys, KeyValueStore};

/// Persisted resume position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCursor {
    pub id: PostId,
    /// Resume after the cursor post instead of at it
    #[serde(default)]
    pub exclusive: bool,
}

/// Result of checking a post against the resume gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Cursor not reached yet; skip the post
    Closed,
    /// This post is the cursor; the gate is now open for the rest of the run
    Opened { skip_cursor: bool },
    Open,
}

impl GateDecision {
    /// Whether the post that produced this decision may proceed to acceptance
    #[must_use]
    pub const fn admits_post(self) -> bool {
        matches!(self, Self::Open | Self::Opened { skip_cursor: false })
    }
}

/// Export format of the remembered-id set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberedExport {
    pub version: u32,
    pub exported_at: String,
    pub ids: Vec<PostId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub total: usize,
}

pub struct CheckpointStore {
    store: Arc<dyn KeyValueStore>,
    remember_enabled: bool,
    remembered: BTreeSet<PostId>,
    run_seen: HashSet<PostId>,
    cursor: Option<ResumeCursor>,
    gate_open: bool,
    save_debounce: Duration,
    save_deadline: Option<Instant>,
}

impl CheckpointStore {
    /// Loads remembered ids and the resume cursor from the store
    pub fn load(store: Arc<dyn KeyValueStore>, remember_enabled: bool, save_debounce: Duration) -> Self {
        let remembered = match store.get(keys::REMEMBERED_IDS) {
            Ok(raw) => parse_remembered_payload(raw.as_deref().unwrap_or_default())
                .into_iter()
                .collect(),
            Err(e) => {
                warn!("⚠️ Failed to load remembered ids: {}", e);
                BTreeSet::new()
            }
        };
        let cursor = storage::load_json::<ResumeCursor>(store.as_ref(), keys::RESUME_CURSOR)
            .filter(|cursor| !cursor.id.is_empty());

        debug!(remembered = remembered.len(), cursor = ?cursor, "Checkpoint loaded");

        Self {
            store,
            remember_enabled,
            remembered,
            run_seen: HashSet::new(),
            cursor,
            gate_open: false,
            save_debounce,
            save_deadline: None,
        }
    }

    /// Resets per-run state; the gate starts open without a cursor or on status pages
    pub fn begin_run(&mut self, gate_starts_open: bool) {
        self.run_seen.clear();
        self.gate_open = gate_starts_open || self.cursor.is_none();
    }

    #[must_use]
    pub fn should_accept(&self, id: &PostId) -> bool {
        if id.is_empty() || self.run_seen.contains(id) {
            return false;
        }
        !(self.remember_enabled && self.remembered.contains(id))
    }

    /// Records an accepted post; `remember` is false for posts that must be retried in a later run
    pub fn mark_accepted(&mut self, id: &PostId, remember: bool, now: Instant) {
        self.run_seen.insert(id.clone());
        if self.remember_enabled && remember && self.remembered.insert(id.clone()) && self.save_deadline.is_none() {
            self.save_deadline = Some(now + self.save_debounce);
        }
    }

    /// Marks a post as handled in this run without accepting it
    pub fn mark_seen(&mut self, id: &PostId) {
        self.run_seen.insert(id.clone());
    }

    #[must_use]
    pub fn is_remembered(&self, id: &PostId) -> bool {
        self.remembered.contains(id)
    }

    #[must_use]
    pub fn remembered_count(&self) -> usize {
        self.remembered.len()
    }

    #[must_use]
    pub const fn has_pending_save(&self) -> bool {
        self.save_deadline.is_some()
    }

    /// Writes the remembered set if the debounce deadline passed
    pub fn flush_if_due(&mut self, now: Instant) -> bool {
        match self.save_deadline {
            Some(deadline) if now >= deadline => {
                self.flush_now();
                true
            }
            _ => false,
        }
    }

    /// Writes the remembered set immediately
    pub fn flush_now(&mut self) {
        self.save_deadline = None;
        if !self.remember_enabled {
            return;
        }
        let payload = self
            .remembered
            .iter()
            .map(PostId::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(e) = self.store.set(keys::REMEMBERED_IDS, &payload) {
            warn!("⚠️ Failed to save remembered ids: {}", e);
        }
    }

    #[must_use]
    pub const fn resume_cursor(&self) -> Option<&ResumeCursor> {
        self.cursor.as_ref()
    }

    pub fn set_resume_cursor(&mut self, id: PostId, exclusive: bool) {
        if id.is_empty() {
            return;
        }
        let cursor = ResumeCursor { id, exclusive };
        storage::save_json(self.store.as_ref(), keys::RESUME_CURSOR, &cursor);
        info!("📌 Resume cursor set to {} (exclusive: {})", cursor.id, exclusive);
        self.cursor = Some(cursor);
    }

    pub fn clear_resume_cursor(&mut self) {
        self.cursor = None;
        storage::clear(self.store.as_ref(), keys::RESUME_CURSOR);
    }

    /// Checks a post against the resume gate, opening it when the cursor is reached
    pub fn check_gate(&mut self, id: &PostId) -> GateDecision {
        if self.gate_open {
            return GateDecision::Open;
        }
        let Some(cursor) = &self.cursor else {
            self.gate_open = true;
            return GateDecision::Open;
        };
        if cursor.id != *id {
            return GateDecision::Closed;
        }

        self.gate_open = true;
        let skip_cursor = cursor.exclusive;
        if skip_cursor {
            self.run_seen.insert(id.clone());
        }
        info!("🚪 Reached resume cursor {}", id);
        GateDecision::Opened { skip_cursor }
    }

    #[must_use]
    pub const fn gate_is_open(&self) -> bool {
        self.gate_open
    }

    /// Removes ids from the remembered set (e.g. everything on the current page)
    pub fn forget<'a>(&mut self, ids: impl IntoIterator<Item = &'a PostId>) -> usize {
        let mut removed = 0;
        for id in ids {
            if self.remembered.remove(id) {
                self.run_seen.remove(id);
                removed += 1;
            }
        }
        if removed > 0 {
            self.flush_now();
            info!("🧹 Forgot {} remembered ids", removed);
        }
        removed
    }

    pub fn clear_remembered(&mut self) {
        self.remembered.clear();
        self.save_deadline = None;
        storage::clear(self.store.as_ref(), keys::REMEMBERED_IDS);
        info!("🧹 Cleared remembered ids");
    }

    #[must_use]
    pub fn export_remembered(&self) -> RememberedExport {
        RememberedExport {
            version: 1,
            exported_at: Utc::now().to_rfc3339(),
            ids: self.remembered.iter().cloned().collect(),
        }
    }

    /// Merges ids from an exported payload and persists the result
    pub fn import_remembered(&mut self, text: &str) -> ImportSummary {
        let before = self.remembered.len();
        self.remembered.extend(parse_remembered_payload(text));
        let added = self.remembered.len() - before;
        if added > 0 {
            self.flush_now();
        }
        ImportSummary { added, total: self.remembered.len() }
    }
}

/// Accepts newline-delimited ids, a JSON array of ids, or `{ "ids": [...] }`
#[must_use]
pub fn parse_remembered_payload(text: &str) -> Vec<PostId> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            let list = match &value {
                serde_json::Value::Array(items) => Some(items),
                serde_json::Value::Object(map) => map.get("ids").and_then(serde_json::Value::as_array),
                _ => None,
            };
            return list
                .into_iter()
                .flatten()
                .filter_map(serde_json::Value::as_str)
                .map(PostId::normalize)
                .filter(|id| !id.is_empty())
                .collect();
        }
    }

    trimmed
        .lines()
        .map(PostId::normalize)
        .filter(|id| !id.is_empty())
        .collect()
}
