//! Search date window (`since:` / `until:` inside the `q` parameter) and the
//! helper that moves the window forward or backward by its own width.

use chrono::{Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::domain::page::{parse_page_url, search_query, PageMode};

static SINCE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bsince:(\d{4}-\d{1,2}-\d{1,2})\b").expect("since pattern is valid"));
static UNTIL_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\buntil:(\d{4}-\d{1,2}-\d{1,2})\b").expect("until pattern is valid"));

/// Window width used when the parsed bounds are equal or inverted
pub const DEFAULT_WINDOW_DAYS: i64 = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchRangeError {
    #[error("Date range controls are only available on search pages")]
    NotSearchPage,

    #[error("Could not find valid since:/until: dates in the search query")]
    MissingBounds,

    #[error("Failed to compute the shifted date range")]
    OutOfRange,

    #[error("Invalid page url: {0}")]
    InvalidUrl(String),
}

/// Direction of a window shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    Backward,
    Forward,
}

impl ShiftDirection {
    const fn sign(self) -> i64 {
        match self {
            Self::Backward => -1,
            Self::Forward => 1,
        }
    }
}

/// Parsed `since:` / `until:` bounds of a search query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDateRange {
    pub query: String,
    pub since_text: String,
    pub until_text: String,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl SearchDateRange {
    /// Reads the window from a query string; `None` when neither bound is present
    #[must_use]
    pub fn from_query(query: &str) -> Option<Self> {
        let since_text = capture(&SINCE_TOKEN, query);
        let until_text = capture(&UNTIL_TOKEN, query);
        if since_text.is_empty() && until_text.is_empty() {
            return None;
        }

        Some(Self {
            query: query.to_string(),
            since: parse_date_token(&since_text),
            until: parse_date_token(&until_text),
            since_text,
            until_text,
        })
    }

    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        let parsed = parse_page_url(url)?;
        Self::from_query(&search_query(&parsed).unwrap_or_default())
    }

    /// Human-readable `since:… until:…`
    #[must_use]
    pub fn describe(&self) -> String {
        let mut parts = Vec::with_capacity(2);
        if !self.since_text.is_empty() {
            parts.push(format!("since:{}", self.since_text));
        }
        if !self.until_text.is_empty() {
            parts.push(format!("until:{}", self.until_text));
        }
        parts.join(" ")
    }

    /// Width of the window in whole days, falling back to the default width
    #[must_use]
    pub fn width_days(&self) -> Option<i64> {
        let (since, until) = (self.since?, self.until?);
        let days = (until - since).num_days();
        Some(if days <= 0 { DEFAULT_WINDOW_DAYS } else { days })
    }

    /// Query with both bounds moved by one window width
    pub fn shifted_query(&self, direction: ShiftDirection) -> Result<String, SearchRangeError> {
        let (Some(since), Some(until)) = (self.since, self.until) else {
            return Err(SearchRangeError::MissingBounds);
        };
        let width = self.width_days().unwrap_or(DEFAULT_WINDOW_DAYS);
        let step = Duration::days(width * direction.sign());

        let new_since = since.checked_add_signed(step).ok_or(SearchRangeError::OutOfRange)?;
        let new_until = until.checked_add_signed(step).ok_or(SearchRangeError::OutOfRange)?;

        let query = SINCE_TOKEN.replace(&self.query, format!("since:{}", format_date_token(new_since)));
        let query = UNTIL_TOKEN.replace(&query, format!("until:{}", format_date_token(new_until)));
        Ok(query.into_owned())
    }
}

/// Rewrites a search page URL so its date window moves by one width
pub fn shifted_search_url(url: &str, direction: ShiftDirection) -> Result<String, SearchRangeError> {
    if !PageMode::from_url(url).is_search() {
        return Err(SearchRangeError::NotSearchPage);
    }

    let mut parsed = parse_page_url(url).ok_or_else(|| SearchRangeError::InvalidUrl(url.to_string()))?;
    let range = search_query(&parsed)
        .and_then(|q| SearchDateRange::from_query(&q))
        .ok_or(SearchRangeError::MissingBounds)?;
    let new_query = range.shifted_query(direction)?;

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            if k == "q" {
                (k.into_owned(), new_query.clone())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();
    parsed.query_pairs_mut().clear().extend_pairs(pairs);

    Ok(parsed.to_string())
}

fn capture(pattern: &Regex, haystack: &str) -> String {
    pattern
        .captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn parse_date_token(text: &str) -> Option<NaiveDate> {
    let mut parts = text.split('-').map(str::parse::<u32>);
    let (Some(Ok(y)), Some(Ok(m)), Some(Ok(d)), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    NaiveDate::from_ymd_opt(i32::try_from(y).ok()?, m, d)
}

/// Unpadded `Y-M-D`; the site accepts padded and unpadded forms
fn format_date_token(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}-{}-{}", date.year(), date.month(), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_describes_bounds() {
        let range = SearchDateRange::from_query("from:alice since:2024-1-1 until:2024-01-16").unwrap();
        assert_eq!(range.describe(), "since:2024-1-1 until:2024-01-16");
        assert_eq!(range.width_days(), Some(15));
    }

    #[test]
    fn query_without_bounds_is_none() {
        assert!(SearchDateRange::from_query("from:alice rust").is_none());
    }

    #[test]
    fn invalid_calendar_dates_do_not_parse() {
        let range = SearchDateRange::from_query("since:2024-2-30 until:2024-3-1").unwrap();
        assert_eq!(range.since, None);
        assert_eq!(range.shifted_query(ShiftDirection::Forward), Err(SearchRangeError::MissingBounds));
    }

    #[test]
    fn shift_moves_by_width() {
        let range = SearchDateRange::from_query("from:alice since:2024-1-1 until:2024-1-11").unwrap();
        assert_eq!(
            range.shifted_query(ShiftDirection::Forward).unwrap(),
            "from:alice since:2024-1-11 until:2024-1-21"
        );
        assert_eq!(
            range.shifted_query(ShiftDirection::Backward).unwrap(),
            "from:alice since:2023-12-22 until:2024-1-1"
        );
    }

    #[test]
    fn zero_width_uses_default() {
        let range = SearchDateRange::from_query("since:2024-1-1 until:2024-1-1").unwrap();
        assert_eq!(
            range.shifted_query(ShiftDirection::Forward).unwrap(),
            "since:2024-1-16 until:2024-1-16"
        );
    }

    #[test]
    fn shifted_url_only_on_search_pages() {
        assert_eq!(
            shifted_search_url("https://x.com/alice/with_replies", ShiftDirection::Forward),
            Err(SearchRangeError::NotSearchPage)
        );

        let shifted = shifted_search_url(
            "https://x.com/search?q=from%3Aalice+since%3A2024-1-1+until%3A2024-1-3&f=live",
            ShiftDirection::Forward,
        )
        .unwrap();
        let range = SearchDateRange::from_url(&shifted).unwrap();
        assert_eq!(range.describe(), "since:2024-1-3 until:2024-1-5");
        assert!(shifted.contains("f=live"));
    }
}
