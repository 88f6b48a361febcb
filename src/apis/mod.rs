pub mod arxiv;
pub mod google_scholar;
pub mod ieee;
pub mod query_cache;
pub mod semantic_scholar;

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failure::ErrorClass;
use crate::transport::backoff::Backoff;
use crate::transport::throttle::Throttle;
use crate::transport::{FetchError, HttpResponse, RequestSpec, Transport};

/// A paper as returned by any source, normalized to one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    /// Source-qualified id, e.g. `arxiv_2301.12345v1` or `ss_<paperId>`.
    pub id: String,
    pub title: String,
    /// Display string: first three names, then `et al.`.
    pub authors: String,
    pub year: Option<u32>,
    pub venue: String,
    pub source: String,
    pub link: String,
    pub pdf_url: Option<String>,
    pub summary: String,
    pub citation_count: Option<u32>,
    pub doi: Option<String>,
}

/// Inclusive publication-year range. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct YearFilter {
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl YearFilter {
    pub fn any() -> Self {
        Self::default()
    }

    /// Parse `"2019-2023"`, `"2019-"`, `"-2023"` or `"all"`. Anything else means no filter.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return Self::any();
        }
        let Some((start, end)) = raw.split_once('-') else {
            tracing::warn!("Ignoring malformed year filter {:?}", raw);
            return Self::any();
        };
        let bound = |s: &str| -> Result<Option<u32>, ()> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse::<u32>().map(Some).map_err(|_| ())
            }
        };
        match (bound(start), bound(end)) {
            (Ok(start), Ok(end)) => Self { start, end },
            _ => {
                tracing::warn!("Ignoring malformed year filter {:?}", raw);
                Self::any()
            }
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Whether a record from `year` passes. Unknown years pass only an unbounded filter.
    pub fn contains(&self, year: Option<u32>) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(year) = year else {
            return false;
        };
        self.start.map_or(true, |s| year >= s) && self.end.map_or(true, |e| year <= e)
    }

    /// `start-end` with open bounds left empty, as range-style APIs expect.
    pub fn as_range(&self) -> Option<String> {
        if self.is_unbounded() {
            return None;
        }
        let fmt = |b: Option<u32>| b.map(|y| y.to_string()).unwrap_or_default();
        Some(format!("{}-{}", fmt(self.start), fmt(self.end)))
    }
}

impl std::fmt::Display for YearFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_range() {
            Some(range) => f.write_str(&range),
            None => f.write_str("all"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("{name} is rate limiting requests: {detail}")]
    RateLimited { name: String, detail: String },
    #[error("{name} served a bot challenge: {detail}")]
    Blocked { name: String, detail: String },
    #[error("{0} is not accepting requests (circuit open or daily limit reached)")]
    CircuitOpen(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Missing API key: {0}")]
    MissingKey(String),
}

impl SourceError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Transport(e) => Some(e.class()),
            Self::RateLimited { .. } => Some(ErrorClass::RateLimited),
            Self::Blocked { .. } => Some(ErrorClass::Blocked),
            Self::Parse(_) => Some(ErrorClass::ShapeMismatch),
            Self::CircuitOpen(_) | Self::Api(_) | Self::MissingKey(_) => None,
        }
    }
}

#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &str;

    fn throttle(&self) -> &Throttle;

    /// Serialized sources run after the concurrent fan-out, one at a time.
    fn serialized(&self) -> bool {
        false
    }

    async fn search(
        &self,
        query: &str,
        years: &YearFilter,
        limit: u32,
    ) -> Result<Vec<PaperRecord>, SourceError>;
}

/// Run one logical request against a source under its throttle.
///
/// An open circuit short-circuits before `request` is polled, so no network
/// call happens. Every completed request feeds the breaker.
pub(crate) async fn guarded<T, F>(throttle: &Throttle, name: &str, request: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    if !throttle.can_proceed() {
        return Err(SourceError::CircuitOpen(name.to_string()));
    }
    throttle.wait_if_needed().await;
    let result = request.await;
    throttle.record_outcome(result.is_ok());
    result
}

/// GET with bounded local retries inside one logical request.
///
/// Statuses in `retry_on` and retryable transport failures are retried on the
/// `backoff` schedule. Any other response is handed back for the caller to
/// interpret. A retry status that outlasts the schedule becomes
/// [`SourceError::RateLimited`].
pub(crate) async fn get_with_retry(
    transport: &Transport,
    url: &str,
    spec: &RequestSpec,
    backoff: &Backoff,
    name: &str,
    retry_on: &[u16],
) -> Result<HttpResponse, SourceError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure = match transport.get(url, spec).await {
            Ok(resp) if retry_on.contains(&resp.status) => SourceError::RateLimited {
                name: name.to_string(),
                detail: status_detail(resp.status),
            },
            Ok(resp) => return Ok(resp),
            Err(e) if e.class().is_retryable() => SourceError::Transport(e),
            Err(e) => return Err(SourceError::Transport(e)),
        };

        if !backoff.should_retry(attempt) {
            return Err(failure);
        }
        tracing::warn!("{}: {} (attempt {}/{})", name, failure, attempt, backoff.max_attempts);
        backoff.wait(attempt).await;
    }
}

fn status_detail(status: u16) -> String {
    match status {
        202 => "still processing (HTTP 202)".to_string(),
        429 => "too many requests (HTTP 429)".to_string(),
        503 => "service unavailable (HTTP 503)".to_string(),
        other => format!("HTTP {}", other),
    }
}

pub(crate) fn display_authors<S: AsRef<str>>(names: &[S]) -> String {
    let names: Vec<&str> = names
        .iter()
        .map(|n| n.as_ref().trim())
        .filter(|n| !n.is_empty())
        .collect();
    let mut shown = names.iter().take(3).copied().collect::<Vec<_>>().join(", ");
    if names.len() > 3 {
        shown.push_str(" et al.");
    }
    shown
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

pub(crate) fn truncate_words(text: &str, max: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        return words.join(" ");
    }
    format!("{}...", words[..max].join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::throttle::ThrottleConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_year_filter_forms() {
        assert_eq!(
            YearFilter::parse("2019-2023"),
            YearFilter { start: Some(2019), end: Some(2023) }
        );
        assert_eq!(YearFilter::parse("2019-"), YearFilter { start: Some(2019), end: None });
        assert_eq!(YearFilter::parse("-2010"), YearFilter { start: None, end: Some(2010) });
        assert!(YearFilter::parse("all").is_unbounded());
        assert!(YearFilter::parse("").is_unbounded());
        assert!(YearFilter::parse("recent").is_unbounded());
        assert!(YearFilter::parse("20x9-2020").is_unbounded());
    }

    #[test]
    fn test_year_filter_contains() {
        let f = YearFilter::parse("2019-2021");
        assert!(f.contains(Some(2019)));
        assert!(f.contains(Some(2021)));
        assert!(!f.contains(Some(2022)));
        assert!(!f.contains(None));
        assert!(YearFilter::any().contains(None));
        assert_eq!(YearFilter::parse("2019-").as_range().as_deref(), Some("2019-"));
    }

    #[test]
    fn test_display_authors_truncates() {
        assert_eq!(display_authors(&["A", "B"]), "A, B");
        assert_eq!(display_authors(&["A", "B", "C", "D"]), "A, B, C et al.");
        assert_eq!(display_authors::<&str>(&[]), "");
    }

    #[test]
    fn test_truncation() {
        assert_eq!(truncate_chars("short", 300), "short");
        assert_eq!(truncate_chars(&"x".repeat(310), 300).len(), 303);
        assert_eq!(truncate_words("one two three four", 2), "one two...");
    }

    #[tokio::test]
    async fn test_open_circuit_skips_request() {
        let throttle = Throttle::new(
            "test",
            ThrottleConfig {
                min_delay: Duration::ZERO,
                daily_limit: 100,
                failure_threshold: 2,
                cooldown: Duration::from_secs(600),
            },
        );
        let calls = AtomicU32::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SourceError::Api("HTTP 500".into()))
        };

        assert!(guarded(&throttle, "test", failing()).await.is_err());
        assert!(guarded(&throttle, "test", failing()).await.is_err());
        let err = guarded(&throttle, "test", failing()).await.unwrap_err();
        assert!(matches!(err, SourceError::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
