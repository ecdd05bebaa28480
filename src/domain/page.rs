//! Page context: which kind of page a crawl runs on and who owns it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::post::{extract_rest_id, DEFAULT_ORIGIN};

static WITH_REPLIES_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/with_replies/?$").expect("with_replies pattern is valid"));
static SEARCH_ADVANCED_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^/search-advanced/?").expect("search-advanced pattern is valid"));
static SEARCH_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^/search/?").expect("search pattern is valid"));
static FROM_HANDLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)from:(\w{1,15})").expect("from: pattern is valid"));
static EXPORT_KEY_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("export key pattern is valid"));

/// Kind of page a crawl is started on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMode {
    /// Profile `/with_replies` timeline (scrolling, many root sections)
    WithReplies,
    /// Single status page (one root section)
    Status,
    /// Search results; drives a multi-page crawl run
    Search,
    /// Advanced search builder; treated like search
    SearchAdvanced,
    Other,
}

impl PageMode {
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let Some(parsed) = parse_page_url(url) else {
            return Self::Other;
        };
        let path = parsed.path();

        if WITH_REPLIES_PATH.is_match(path) {
            Self::WithReplies
        } else if SEARCH_ADVANCED_PATH.is_match(path) {
            Self::SearchAdvanced
        } else if SEARCH_PATH.is_match(path) {
            Self::Search
        } else if extract_rest_id(url).is_some() && path.to_ascii_lowercase().contains("/status/") {
            Self::Status
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub const fn is_search(self) -> bool {
        matches!(self, Self::Search | Self::SearchAdvanced)
    }

    /// Only scrolling timelines benefit from the pause-and-wait-for-load heuristic
    #[must_use]
    pub const fn is_timeline_scroll(self) -> bool {
        matches!(self, Self::WithReplies)
    }
}

impl std::fmt::Display for PageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WithReplies => write!(f, "with_replies"),
            Self::Status => write!(f, "status"),
            Self::Search => write!(f, "search"),
            Self::SearchAdvanced => write!(f, "search_advanced"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Run context computed once at crawl start (the page can change under us later)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub mode: PageMode,
    pub page_url: String,
    /// Tracked owner handle (`@name`), empty when unknown
    pub profile_handle: String,
    /// Filename-safe key used for exports and the aggregate
    pub export_key: String,
    /// Root status id for status pages
    pub root_rest_id: Option<String>,
}

impl RunContext {
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let mode = PageMode::from_url(url);
        let parsed = parse_page_url(url);

        match mode {
            PageMode::WithReplies => {
                let handle = parsed
                    .as_ref()
                    .and_then(|u| u.path_segments().and_then(|mut segs| segs.find(|s| !s.is_empty())))
                    .map(|account| format!("@{account}"))
                    .unwrap_or_default();
                Self {
                    mode,
                    page_url: url.to_string(),
                    export_key: handle_to_export_key(&handle),
                    profile_handle: handle,
                    root_rest_id: None,
                }
            }
            PageMode::Status => Self {
                mode,
                page_url: url.to_string(),
                profile_handle: String::new(),
                export_key: "status".to_string(),
                root_rest_id: extract_rest_id(url),
            },
            PageMode::Search | PageMode::SearchAdvanced => {
                let handle = parsed
                    .as_ref()
                    .and_then(search_query)
                    .and_then(|q| infer_owner_from_query(&q))
                    .unwrap_or_default();
                Self {
                    mode,
                    page_url: url.to_string(),
                    export_key: handle_to_export_key(&handle),
                    profile_handle: handle,
                    root_rest_id: None,
                }
            }
            PageMode::Other => Self {
                mode,
                page_url: url.to_string(),
                profile_handle: String::new(),
                export_key: "account".to_string(),
                root_rest_id: None,
            },
        }
    }

    /// Supplies the owner from the page itself when the URL did not carry one
    #[must_use]
    pub fn with_fallback_owner(mut self, handle: &str) -> Self {
        let handle = handle.trim();
        if self.profile_handle.is_empty() && !handle.is_empty() {
            self.profile_handle = handle.to_string();
            if self.mode != PageMode::Status {
                self.export_key = handle_to_export_key(handle);
            }
        }
        self
    }

    #[must_use]
    pub fn owner_handle(&self) -> Option<&str> {
        let handle = self.profile_handle.trim();
        (!handle.is_empty()).then_some(handle)
    }
}

/// Turns a handle into a filename-safe export key; unknown handles map to `account`
#[must_use]
pub fn handle_to_export_key(handle: &str) -> String {
    let stripped = handle.trim().trim_start_matches('@');
    if stripped.is_empty() {
        "account".to_string()
    } else {
        EXPORT_KEY_INVALID.replace_all(stripped, "_").into_owned()
    }
}

/// Reads the owner from a `from:<handle>` token inside a search query
#[must_use]
pub fn infer_owner_from_query(query: &str) -> Option<String> {
    FROM_HANDLE
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("@{}", m.as_str()))
}

pub(crate) fn parse_page_url(url: &str) -> Option<Url> {
    Url::parse(url)
        .ok()
        .or_else(|| Url::parse(DEFAULT_ORIGIN).ok().and_then(|base| base.join(url).ok()))
}

pub(crate) fn search_query(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://x.com/alice/with_replies", PageMode::WithReplies)]
    #[case("https://x.com/alice/with_replies/", PageMode::WithReplies)]
    #[case("https://x.com/search?q=from%3Aalice", PageMode::Search)]
    #[case("https://x.com/search-advanced", PageMode::SearchAdvanced)]
    #[case("https://x.com/alice/status/123", PageMode::Status)]
    #[case("https://x.com/i/web/status/123/photo/1", PageMode::Status)]
    #[case("https://x.com/alice", PageMode::Other)]
    fn page_mode_detection(#[case] url: &str, #[case] expected: PageMode) {
        assert_eq!(PageMode::from_url(url), expected);
    }

    #[test]
    fn with_replies_context_uses_first_segment() {
        let ctx = RunContext::from_url("https://x.com/alice_b/with_replies");
        assert_eq!(ctx.profile_handle, "@alice_b");
        assert_eq!(ctx.export_key, "alice_b");
        assert_eq!(ctx.owner_handle(), Some("@alice_b"));
    }

    #[test]
    fn search_context_reads_from_token() {
        let ctx = RunContext::from_url("https://x.com/search?q=from%3Acarol%20since%3A2024-1-1&f=live");
        assert_eq!(ctx.mode, PageMode::Search);
        assert_eq!(ctx.profile_handle, "@carol");
        assert_eq!(ctx.export_key, "carol");
    }

    #[test]
    fn search_without_owner_falls_back() {
        let ctx = RunContext::from_url("https://x.com/search?q=rust").with_fallback_owner("@dave");
        assert_eq!(ctx.profile_handle, "@dave");
        assert_eq!(ctx.export_key, "dave");
    }

    #[test]
    fn status_context_keeps_root_id() {
        let ctx = RunContext::from_url("https://x.com/erin/status/555");
        assert_eq!(ctx.root_rest_id.as_deref(), Some("555"));
        assert_eq!(ctx.export_key, "status");
        assert_eq!(ctx.owner_handle(), None);
    }

    #[rstest]
    #[case("@some.name", "some_name")]
    #[case("", "account")]
    #[case("@", "account")]
    #[case("plain-handle_1", "plain-handle_1")]
    fn export_keys(#[case] handle: &str, #[case] expected: &str) {
        assert_eq!(handle_to_export_key(handle), expected);
    }
}
