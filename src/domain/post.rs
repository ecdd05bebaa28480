//! # Observed Posts
//!
//! Normalized records describing a single post detected on the page during a
//! crawl tick, together with the identity helpers that keep a post's id stable
//! when the page re-renders it (scroll-out / scroll-in, photo/video permalinks,
//! `/i/web/status/...` links).

use std::borrow::Borrow;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Origin used when a post link is relative or when normalizing status links
pub const DEFAULT_ORIGIN: &str = "https://x.com";

static STATUS_REST_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/status/(\d+)").expect("status rest id pattern is valid"));

/// Opaque, normalize-stable post identifier.
///
/// Two observations of the same logical post always produce the same `PostId`,
/// regardless of which permalink variant the page rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    /// Normalizes a raw link against the default origin
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        Self(normalize_status_url(raw, DEFAULT_ORIGIN))
    }

    /// Normalizes a raw link against a specific page origin
    #[must_use]
    pub fn normalize_with_origin(raw: &str, origin: &str) -> Self {
        Self(normalize_status_url(raw, origin))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric status id embedded in the link, if any
    #[must_use]
    pub fn rest_id(&self) -> Option<String> {
        extract_rest_id(&self.0)
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PostId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PostId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PostId {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

/// Extracts the numeric status id from any status-style link.
///
/// Works for `/<user>/status/<id>`, `/i/web/status/<id>` and the
/// `/status/<id>/photo/1` style sub-pages.
#[must_use]
pub fn extract_rest_id(status_url: &str) -> Option<String> {
    let trimmed = status_url.trim();
    if trimmed.is_empty() {
        return None;
    }

    let haystack = match parse_with_origin(trimmed, DEFAULT_ORIGIN) {
        Some(parsed) => parsed.path().to_string(),
        None => trimmed.to_string(),
    };

    STATUS_REST_ID
        .captures(&haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Canonicalizes a post link.
///
/// Status links collapse to `<origin>/i/web/status/<id>`; any other URL loses
/// its query and fragment; unparsable input is returned trimmed.
#[must_use]
pub fn normalize_status_url(raw: &str, origin: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(rest_id) = extract_rest_id(trimmed) {
        let origin = origin.trim_end_matches('/');
        return format!("{origin}/i/web/status/{rest_id}");
    }

    match parse_with_origin(trimmed, origin) {
        Some(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        None => trimmed.to_string(),
    }
}

fn parse_with_origin(raw: &str, origin: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .or_else(|| Url::parse(origin).ok().and_then(|base| base.join(raw).ok()))
}

/// One post as reported by the page observer during a tick.
///
/// Missing DOM signals are represented by sentinels: an unknown timestamp or
/// author handle is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedPost {
    pub id: PostId,

    #[serde(default)]
    pub author_handle: String,

    #[serde(default)]
    pub author_name: String,

    /// ISO-8601 timestamp, empty when the page did not render one
    #[serde(default)]
    pub timestamp: String,

    /// Page rendered a reply marker (gutter line or "Replying to" banner)
    #[serde(default)]
    pub is_reply: bool,

    /// Reply counter on the post is non-zero
    #[serde(default)]
    pub has_declared_replies: bool,

    #[serde(default)]
    pub is_repost: bool,

    /// Translation overlay content was attached when the post was observed
    #[serde(default)]
    pub has_overlay_content: bool,

    #[serde(default)]
    pub avatar_ref: String,

    #[serde(default)]
    pub is_voice_post: bool,
}

impl ObservedPost {
    #[must_use]
    pub fn new(id: impl AsRef<str>, author_handle: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            id: PostId::normalize(id.as_ref()),
            author_handle: author_handle.into(),
            author_name: String::new(),
            timestamp: timestamp.into(),
            is_reply: false,
            has_declared_replies: false,
            is_repost: false,
            has_overlay_content: false,
            avatar_ref: String::new(),
            is_voice_post: false,
        }
    }

    #[must_use]
    pub const fn reply(mut self) -> Self {
        self.is_reply = true;
        self
    }

    #[must_use]
    pub const fn repost(mut self) -> Self {
        self.is_repost = true;
        self
    }

    #[must_use]
    pub const fn with_overlay(mut self) -> Self {
        self.has_overlay_content = true;
        self
    }

    #[must_use]
    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = avatar_ref.into();
        self
    }

    #[must_use]
    pub const fn voice(mut self) -> Self {
        self.is_voice_post = true;
        self
    }

    /// Sort key for chronological ordering; the empty sentinel sorts first
    #[must_use]
    pub fn timestamp_key(&self) -> &str {
        &self.timestamp
    }

    #[must_use]
    pub fn is_authored_by(&self, handle: &str) -> bool {
        !handle.is_empty() && self.author_handle == handle
    }

    /// Lightweight data carried across pages for the run-level export
    #[must_use]
    pub fn side_data(&self) -> PostSideData {
        PostSideData {
            id: self.id.clone(),
            author_handle: self.author_handle.clone(),
            avatar_ref: self.avatar_ref.clone(),
            is_voice_post: self.is_voice_post,
        }
    }
}

/// Per-post side data accumulated across a multi-page crawl run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSideData {
    pub id: PostId,
    #[serde(default)]
    pub author_handle: String,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default)]
    pub is_voice_post: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_variants_collapse_to_one_id() {
        let a = PostId::normalize("https://x.com/alice/status/1234567890");
        let b = PostId::normalize("https://x.com/alice/status/1234567890/photo/1?s=20");
        let c = PostId::normalize("/i/web/status/1234567890#top");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_str(), "https://x.com/i/web/status/1234567890");
    }

    #[test]
    fn non_status_links_drop_query_and_fragment() {
        let id = PostId::normalize("https://example.com/page?utm=1#frag");
        assert_eq!(id.as_str(), "https://example.com/page");
    }

    #[test]
    fn empty_input_normalizes_to_empty() {
        assert!(PostId::normalize("   ").is_empty());
        assert_eq!(extract_rest_id(""), None);
    }

    #[test]
    fn rest_id_extraction() {
        assert_eq!(extract_rest_id("https://x.com/bob/status/42/analytics"), Some("42".to_string()));
        assert_eq!(extract_rest_id("https://x.com/bob/with_replies"), None);
        assert_eq!(PostId::normalize("https://x.com/bob/status/77").rest_id(), Some("77".to_string()));
    }

    #[test]
    fn custom_origin_is_respected() {
        let id = PostId::normalize_with_origin("/carol/status/9", "https://twitter.com/");
        assert_eq!(id.as_str(), "https://twitter.com/i/web/status/9");
    }

    #[test]
    fn authorship_requires_known_handle() {
        let post = ObservedPost::new("https://x.com/a/status/1", "", "");
        assert!(!post.is_authored_by(""));
        let post = ObservedPost::new("https://x.com/a/status/1", "@a", "");
        assert!(post.is_authored_by("@a"));
    }
}
