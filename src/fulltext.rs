//! Resolve a paper to its document, extract the text and remember the outcome.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;

use crate::cache::{self, ExtractionRecord, ExtractionStatus, ExtractionStore, RetryPolicy, RetryRefusal, Scope, StoreError};
use crate::extract::{self, ExtractError};
use crate::failure::ErrorClass;
use crate::resolver::{ResolveError, Reference, Resolver};

pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
const STATS_LOG_EVERY: u64 = 10;

/// What a caller knows about the paper it wants the text of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaperReference {
    pub paper_id: String,
    pub link: Option<String>,
    pub pdf_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FullText {
    pub text: String,
    pub used_direct_document: bool,
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("extraction failed {attempts} times; reset the record to try again{}", last_error_suffix(.last_error))]
    AttemptsExhausted { attempts: u32, last_error: Option<String> },
    #[error("previous attempt failed; retry in {retry_in_secs}s")]
    CoolingDown { retry_in_secs: u64 },
    #[error("resolution did not finish within {secs}s")]
    Timeout { secs: u64 },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot use upload {path}: {reason}")]
    Upload { path: String, reason: String },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|e| format!(" (last error: {})", e))
        .unwrap_or_default()
}

impl RetrievalError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Timeout { .. } => Some(ErrorClass::Transport),
            Self::Resolve(e) => Some(e.class()),
            Self::Extract(e) => Some(e.class()),
            _ => None,
        }
    }
}

impl From<RetryRefusal> for RetrievalError {
    fn from(refusal: RetryRefusal) -> Self {
        match refusal {
            RetryRefusal::AttemptsExhausted { attempts, last_error } => Self::AttemptsExhausted { attempts, last_error },
            RetryRefusal::CoolingDown { retry_in } => Self::CoolingDown {
                retry_in_secs: retry_in.as_secs().max(1),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FullTextConfig {
    /// Wall-clock bound for one whole resolution and extraction.
    pub budget: Duration,
    pub public_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for FullTextConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(60),
            public_ttl: Duration::from_secs(24 * 3600),
            retry: RetryPolicy {
                max_attempts: 3,
                cooldown: Duration::from_secs(3600),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub total_ms: u64,
}

impl ExtractionStats {
    pub fn average_ms(&self) -> u64 {
        if self.attempts == 0 {
            0
        } else {
            self.total_ms / self.attempts
        }
    }
}

type Key = (String, Scope);
type Flight = Shared<BoxFuture<'static, Result<FullText, RetrievalError>>>;

pub struct FullTextService {
    resolver: Resolver,
    store: Arc<dyn ExtractionStore>,
    config: FullTextConfig,
    inflight: Mutex<HashMap<Key, Flight>>,
    stats: Mutex<ExtractionStats>,
}

impl FullTextService {
    pub fn new(resolver: Resolver, store: Arc<dyn ExtractionStore>, config: FullTextConfig) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            store,
            config,
            inflight: Mutex::new(HashMap::new()),
            stats: Mutex::new(ExtractionStats::default()),
        })
    }

    pub fn stats(&self) -> ExtractionStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Text of the paper for `scope`, from the cache when possible.
    ///
    /// Concurrent calls for the same `(paper_id, scope)` share one resolution.
    pub async fn resolve_and_extract(
        self: &Arc<Self>,
        reference: &PaperReference,
        scope: &Scope,
    ) -> Result<FullText, RetrievalError> {
        let key: Key = (reference.paper_id.clone(), scope.clone());
        let flight = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| StoreError::Io("in-flight map poisoned".to_string()))?;
            match inflight.get(&key) {
                Some(flight) => {
                    tracing::debug!("Joining in-flight extraction of {} ({})", key.0, key.1);
                    flight.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let reference = reference.clone();
                    let owned_key = key.clone();
                    let flight = async move {
                        let result = this.run(&reference, &owned_key.1).await;
                        if let Ok(mut inflight) = this.inflight.lock() {
                            inflight.remove(&owned_key);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    async fn run(&self, reference: &PaperReference, scope: &Scope) -> Result<FullText, RetrievalError> {
        let paper_id = reference.paper_id.as_str();
        let now = Utc::now();
        let candidates = candidates(reference);
        let primary = candidates.first().map(Reference::describe);

        let existing = cache::lookup(self.store.as_ref(), paper_id, scope, now).await?;
        if let Some(record) = &existing {
            if let Some(text) = record.cached_text() {
                tracing::info!("Cache hit for {} ({}, {} chars)", paper_id, record.scope, text.len());
                return Ok(FullText {
                    text: text.to_string(),
                    used_direct_document: record.used_direct_document,
                });
            }
            self.config.retry.check(record, primary.as_deref(), now)?;
        }
        if candidates.is_empty() {
            return Err(ResolveError::UnknownReference(paper_id.to_string()).into());
        }

        let attempts = existing.as_ref().map_or(0, |r| r.attempts) + 1;
        let mut record = ExtractionRecord {
            reference_url: primary,
            status: ExtractionStatus::InProgress,
            attempts,
            last_attempt: Some(now),
            ..ExtractionRecord::new(paper_id, scope.clone())
        };
        self.store.save(record.clone()).await?;

        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.budget, self.fetch_and_extract(&candidates)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Resolution of {} abandoned after {:?}", paper_id, self.config.budget);
                Err(RetrievalError::Timeout {
                    secs: self.config.budget.as_secs(),
                })
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.record_stats(&result, elapsed_ms);

        record.extraction_ms = Some(elapsed_ms);
        match &result {
            Ok(full) => {
                record.status = ExtractionStatus::Success;
                record.text = Some(full.text.clone());
                record.text_length = full.text.len();
                record.used_direct_document = full.used_direct_document;
                record.expires_at = self.expiry_for(scope);
                tracing::info!("Extracted {} chars for {} in {}ms", full.text.len(), paper_id, elapsed_ms);
            }
            Err(e) => {
                record.status = ExtractionStatus::Failed;
                record.error = Some(e.to_string());
                tracing::warn!("Full text for {} failed (attempt {}): {}", paper_id, attempts, e);
            }
        }
        if let Err(e) = self.store.save(record).await {
            tracing::warn!("Could not store extraction outcome for {}: {}", paper_id, e);
        }
        result
    }

    /// Try each starting point in turn; the last failure wins.
    async fn fetch_and_extract(&self, candidates: &[Reference]) -> Result<FullText, RetrievalError> {
        let mut last_error = None;
        for reference in candidates {
            let outcome = match self.resolver.resolve_reference(reference).await {
                Ok(document) => extract::extract_async(document.bytes)
                    .await
                    .map(|text| FullText {
                        text,
                        used_direct_document: document.direct,
                    })
                    .map_err(RetrievalError::from),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(full) => return Ok(full),
                Err(e) => {
                    tracing::debug!("Candidate {} failed: {}", reference.describe(), e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ResolveError::UnknownReference(String::new()).into()))
    }

    fn expiry_for(&self, scope: &Scope) -> Option<chrono::DateTime<Utc>> {
        if !scope.is_public() {
            return None;
        }
        let ttl = chrono::Duration::from_std(self.config.public_ttl).ok()?;
        Utc::now().checked_add_signed(ttl)
    }

    fn record_stats(&self, result: &Result<FullText, RetrievalError>, elapsed_ms: u64) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        stats.attempts += 1;
        stats.total_ms += elapsed_ms;
        match result {
            Ok(_) => stats.successes += 1,
            Err(RetrievalError::Timeout { .. }) => {
                stats.timeouts += 1;
                stats.failures += 1;
            }
            Err(_) => stats.failures += 1,
        }
        if stats.attempts % STATS_LOG_EVERY == 0 {
            tracing::info!(
                "Extraction stats: {} attempts, {} ok, {} failed ({} timeouts), avg {}ms",
                stats.attempts,
                stats.successes,
                stats.failures,
                stats.timeouts,
                stats.average_ms()
            );
        }
    }

    /// Extract a user-supplied document and store it as a successful record.
    pub async fn extract_uploaded_pdf(
        &self,
        paper_id: &str,
        path: &Path,
        scope: &Scope,
    ) -> Result<FullText, RetrievalError> {
        let upload_error = |reason: String| RetrievalError::Upload {
            path: path.display().to_string(),
            reason,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(|e| upload_error(e.to_string()))?;
        if !metadata.is_file() {
            return Err(upload_error("not a regular file".to_string()));
        }
        if metadata.len() > MAX_UPLOAD_BYTES {
            return Err(upload_error(format!(
                "{} bytes exceeds the {} byte limit",
                metadata.len(),
                MAX_UPLOAD_BYTES
            )));
        }

        let started = Instant::now();
        let owned = path.to_path_buf();
        let text = tokio::task::spawn_blocking(move || extract::extract_file(&owned))
            .await
            .map_err(|e| upload_error(e.to_string()))??;

        let now = Utc::now();
        let record = ExtractionRecord {
            reference_url: Some(format!("local://{}", path.display())),
            status: ExtractionStatus::Success,
            text: Some(text.clone()),
            attempts: 1,
            last_attempt: Some(now),
            extraction_ms: Some(started.elapsed().as_millis() as u64),
            text_length: text.len(),
            used_direct_document: true,
            expires_at: self.expiry_for(scope),
            ..ExtractionRecord::new(paper_id, scope.clone())
        };
        self.store.save(record).await?;
        tracing::info!("Stored uploaded document for {} ({} chars)", paper_id, text.len());
        Ok(FullText {
            text,
            used_direct_document: true,
        })
    }

    /// Clear the record so the next request resolves again.
    pub async fn reset_extraction(&self, paper_id: &str, scope: &Scope) -> Result<bool, RetrievalError> {
        let removed = self.store.remove(paper_id, scope).await?;
        if removed.is_some() {
            tracing::info!("Cleared extraction record for {} ({})", paper_id, scope);
        }
        Ok(removed.is_some())
    }

    /// Drop expired records and delete the uploaded files they own.
    pub async fn purge_expired(&self) -> Result<usize, RetrievalError> {
        let removed = cache::purge_expired(self.store.as_ref(), Utc::now()).await?;
        for record in &removed {
            let Some(path) = record.reference_url.as_deref().and_then(|u| u.strip_prefix("local://")) else {
                continue;
            };
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!("Deleted expired upload {}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Could not delete expired upload {}: {}", path, e),
            }
        }
        tracing::info!("Purged {} expired extraction records", removed.len());
        Ok(removed.len())
    }
}

/// Starting points in preference order: the direct document link, the landing
/// link, then whatever the paper id itself can be resolved through.
fn candidates(reference: &PaperReference) -> Vec<Reference> {
    let from_id = Reference::parse(&reference.paper_id).or_else(|| {
        reference
            .paper_id
            .strip_prefix("arxiv_")
            .filter(|id| !id.is_empty())
            .map(|id| Reference::Url(format!("https://arxiv.org/pdf/{}.pdf", id)))
    });

    let mut out: Vec<Reference> = Vec::new();
    let parsed = [reference.pdf_url.as_deref(), reference.link.as_deref()]
        .into_iter()
        .flatten()
        .filter_map(Reference::parse)
        .chain(from_id);
    for candidate in parsed {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}
