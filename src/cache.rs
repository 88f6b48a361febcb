//! Extraction records: the cache in front of resolution and extraction.
//!
//! Records are keyed by `(paper_id, Scope)`. A user-scoped record is permanent
//! until cleared; a public record may carry an expiry after which it reads as absent.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Who asked for the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "user")]
pub enum Scope {
    Public,
    User(String),
}

impl Scope {
    /// A missing or blank user id means the public scope.
    pub fn from_user(user: Option<&str>) -> Self {
        match user.map(str::trim) {
            Some(u) if !u.is_empty() && !u.eq_ignore_ascii_case("public") => Self::User(u.to_string()),
            _ => Self::Public,
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::User(u) => write!(f, "user:{}", u),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub paper_id: String,
    pub scope: Scope,
    /// The reference the last attempt started from.
    pub reference_url: Option<String>,
    pub status: ExtractionStatus,
    pub text: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub extraction_ms: Option<u64>,
    pub text_length: usize,
    #[serde(default)]
    pub used_direct_document: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ExtractionRecord {
    pub fn new(paper_id: impl Into<String>, scope: Scope) -> Self {
        Self {
            paper_id: paper_id.into(),
            scope,
            reference_url: None,
            status: ExtractionStatus::Pending,
            text: None,
            error: None,
            attempts: 0,
            last_attempt: None,
            extraction_ms: None,
            text_length: 0,
            used_direct_document: false,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Successful text, if this record holds any.
    pub fn cached_text(&self) -> Option<&str> {
        match (self.status, &self.text) {
            (ExtractionStatus::Success, Some(text)) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("extraction store I/O failed: {0}")]
    Io(String),
    #[error("extraction store encoding failed: {0}")]
    Encode(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

#[async_trait]
pub trait ExtractionStore: Send + Sync {
    async fn get(&self, paper_id: &str, scope: &Scope) -> Result<Option<ExtractionRecord>, StoreError>;
    /// Insert or replace the record for `(record.paper_id, record.scope)`.
    async fn save(&self, record: ExtractionRecord) -> Result<(), StoreError>;
    async fn remove(&self, paper_id: &str, scope: &Scope) -> Result<Option<ExtractionRecord>, StoreError>;
    async fn records(&self) -> Result<Vec<ExtractionRecord>, StoreError>;
}

type Key = (String, Scope);

fn key_of(paper_id: &str, scope: &Scope) -> Key {
    (paper_id.to_string(), scope.clone())
}

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<Key, ExtractionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn get(&self, paper_id: &str, scope: &Scope) -> Result<Option<ExtractionRecord>, StoreError> {
        Ok(self.records.get(&key_of(paper_id, scope)).map(|r| r.value().clone()))
    }

    async fn save(&self, record: ExtractionRecord) -> Result<(), StoreError> {
        self.records
            .insert(key_of(&record.paper_id, &record.scope), record);
        Ok(())
    }

    async fn remove(&self, paper_id: &str, scope: &Scope) -> Result<Option<ExtractionRecord>, StoreError> {
        Ok(self.records.remove(&key_of(paper_id, scope)).map(|(_, r)| r))
    }

    async fn records(&self) -> Result<Vec<ExtractionRecord>, StoreError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    records: Vec<ExtractionRecord>,
}

/// Records kept in one JSON document, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<Key, ExtractionRecord>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing or corrupt file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records: HashMap<Key, ExtractionRecord> = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(file) => file
                    .records
                    .into_iter()
                    .map(|r| (key_of(&r.paper_id, &r.scope), r))
                    .collect(),
                Err(e) => {
                    tracing::warn!("Ignoring corrupt extraction store {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", path.display(), e);
                HashMap::new()
            }
        };
        tracing::info!("Extraction store {} holds {} records", path.display(), records.len());
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    async fn flush(&self, records: &HashMap<Key, ExtractionRecord>) -> Result<(), StoreError> {
        let mut file = StoreFile {
            records: records.values().cloned().collect(),
        };
        file.records
            .sort_by(|a, b| (&a.paper_id, a.scope.to_string()).cmp(&(&b.paper_id, b.scope.to_string())));
        let body = serde_json::to_vec_pretty(&file)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &body))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
    }
}

fn write_atomically(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error.to_string()))?;
    Ok(())
}

#[async_trait]
impl ExtractionStore for JsonFileStore {
    async fn get(&self, paper_id: &str, scope: &Scope) -> Result<Option<ExtractionRecord>, StoreError> {
        Ok(self.records.lock().await.get(&key_of(paper_id, scope)).cloned())
    }

    async fn save(&self, record: ExtractionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        records.insert(key_of(&record.paper_id, &record.scope), record);
        self.flush(&records).await
    }

    async fn remove(&self, paper_id: &str, scope: &Scope) -> Result<Option<ExtractionRecord>, StoreError> {
        let mut records = self.records.lock().await;
        let removed = records.remove(&key_of(paper_id, scope));
        if removed.is_some() {
            self.flush(&records).await?;
        }
        Ok(removed)
    }

    async fn records(&self) -> Result<Vec<ExtractionRecord>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

/// The caller's own record first, then an unexpired public one.
pub async fn lookup(
    store: &dyn ExtractionStore,
    paper_id: &str,
    scope: &Scope,
    now: DateTime<Utc>,
) -> Result<Option<ExtractionRecord>, StoreError> {
    if !scope.is_public() {
        if let Some(record) = store.get(paper_id, scope).await? {
            return Ok(Some(record));
        }
    }
    Ok(store
        .get(paper_id, &Scope::Public)
        .await?
        .filter(|r| !r.is_expired(now)))
}

/// Remove every expired record and return what was removed.
pub async fn purge_expired(
    store: &dyn ExtractionStore,
    now: DateTime<Utc>,
) -> Result<Vec<ExtractionRecord>, StoreError> {
    let mut removed = Vec::new();
    for record in store.records().await? {
        if record.is_expired(now) {
            if let Some(r) = store.remove(&record.paper_id, &record.scope).await? {
                removed.push(r);
            }
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryRefusal {
    AttemptsExhausted { attempts: u32, last_error: Option<String> },
    CoolingDown { retry_in: Duration },
}

/// When a failed record may be attempted again.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    /// The attempt cap is checked before anything else. Below the cap a failed
    /// record waits out the cooldown unless the reference URL changed.
    pub fn check(
        &self,
        record: &ExtractionRecord,
        reference_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), RetryRefusal> {
        if record.status == ExtractionStatus::Success {
            return Ok(());
        }
        if record.attempts >= self.max_attempts {
            return Err(RetryRefusal::AttemptsExhausted {
                attempts: record.attempts,
                last_error: record.error.clone(),
            });
        }
        if record.status != ExtractionStatus::Failed {
            return Ok(());
        }
        if reference_url.is_some() && reference_url != record.reference_url.as_deref() {
            tracing::info!(
                "Reference for {} changed, retrying before cooldown",
                record.paper_id
            );
            return Ok(());
        }
        let Some(last) = record.last_attempt else {
            return Ok(());
        };
        let cooldown = chrono::Duration::from_std(self.cooldown).unwrap_or(chrono::Duration::MAX);
        let ready_at = last.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC);
        if now < ready_at {
            let retry_in = (ready_at - now).to_std().unwrap_or_default();
            return Err(RetryRefusal::CoolingDown { retry_in });
        }
        Ok(())
    }
}
