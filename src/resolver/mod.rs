//! Walks from a paper reference to the bytes of a downloadable document.
//!
//! Each fetch is one step of a [`ResolutionContext`]: redirects, landing-page
//! links and DOI hops all count. A URL is fetched at most once per chain, and the
//! chain fails closed once the depth bound is reached.

pub mod html;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::apis::semantic_scholar::SemanticScholarClient;
use crate::failure::ErrorClass;
use crate::transport::backoff::Backoff;
use crate::transport::pacing::HostPacer;
use crate::transport::{identity, FetchError, HttpResponse, RequestSpec, Transport};
use html::PageFinding;

const DOI_RESOLVER: &str = "https://doi.org";

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("maximum resolution depth ({max}) exceeded at {url}")]
    MaxDepthExceeded { url: String, max: u32 },
    #[error("cycle detected: {0} was already visited")]
    CycleDetected(String),
    #[error("{0} points to a non-document page")]
    NonDocumentPath(String),
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("no document link found on {0}")]
    NoDocumentLink(String),
    #[error("{0} kept rate limiting the request")]
    RateLimited(String),
    #[error("{0} served a bot challenge")]
    Blocked(String),
    #[error("cannot read local document {path}: {reason}")]
    Local { path: String, reason: String },
    #[error("unrecognized paper reference {0:?}")]
    UnknownReference(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ResolveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MaxDepthExceeded { .. } | Self::CycleDetected(_) => ErrorClass::BoundExceeded,
            Self::NonDocumentPath(_)
            | Self::NoDocumentLink(_)
            | Self::Local { .. }
            | Self::UnknownReference(_) => ErrorClass::ShapeMismatch,
            Self::HttpStatus { .. } => ErrorClass::Transport,
            Self::RateLimited(_) => ErrorClass::RateLimited,
            Self::Blocked(_) => ErrorClass::Blocked,
            Self::Fetch(e) => e.class(),
        }
    }
}

/// Starting point of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Url(String),
    Doi(String),
    Local(PathBuf),
    SemanticScholar(String),
}

impl Reference {
    /// Classify a raw link or identifier. Returns `None` for unusable input.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(path) = raw.strip_prefix("local://") {
            return Some(Self::Local(PathBuf::from(path)));
        }
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Some(Self::Url(raw.to_string()));
        }
        if let Some(id) = raw.strip_prefix("ss_").or_else(|| raw.strip_prefix("s2:")) {
            if !id.is_empty() {
                return Some(Self::SemanticScholar(id.to_string()));
            }
        }
        if lower.starts_with("doi:") || lower.starts_with("10.") {
            return html::extract_doi(raw).map(Self::Doi);
        }
        None
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Url(u) => u.clone(),
            Self::Doi(d) => format!("doi:{}", d),
            Self::Local(p) => format!("local://{}", p.display()),
            Self::SemanticScholar(id) => format!("ss_{}", id),
        }
    }
}

/// Per-chain state. Never shared between top-level resolutions.
#[derive(Debug)]
pub struct ResolutionContext {
    pub depth: u32,
    pub max_depth: u32,
    visited: HashSet<String>,
}

impl ResolutionContext {
    pub fn new(max_depth: u32) -> Self {
        Self {
            depth: 0,
            max_depth,
            visited: HashSet::new(),
        }
    }

    /// Claim a fetch of `url`, failing closed on a revisit or when out of depth.
    pub fn enter(&mut self, url: &str) -> Result<(), ResolveError> {
        let key = visit_key(url);
        if self.visited.contains(&key) {
            tracing::warn!("Resolution cycle at {}", url);
            return Err(ResolveError::CycleDetected(url.to_string()));
        }
        if self.depth >= self.max_depth {
            tracing::warn!("Resolution depth {} reached at {}", self.max_depth, url);
            return Err(ResolveError::MaxDepthExceeded {
                url: url.to_string(),
                max: self.max_depth,
            });
        }
        self.visited.insert(key);
        self.depth += 1;
        Ok(())
    }
}

fn visit_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut u) => {
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => url.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedDocument {
    /// Where the bytes came from: a URL or `local://<path>`.
    pub location: String,
    pub bytes: Vec<u8>,
    /// True when the first location fetched (after plain redirects) was the document.
    pub direct: bool,
}

pub struct Resolver {
    transport: Arc<Transport>,
    pacer: HostPacer,
    semantic_scholar: Option<Arc<SemanticScholarClient>>,
    max_depth: u32,
    retry: Backoff,
    doi_base: String,
}

impl Resolver {
    pub fn new(transport: Arc<Transport>, host_interval: Duration, max_depth: u32) -> Self {
        Self {
            transport,
            pacer: HostPacer::new(host_interval),
            semantic_scholar: None,
            max_depth,
            retry: Backoff::new(3, Duration::from_secs(1), Duration::from_secs(8)),
            doi_base: DOI_RESOLVER.to_string(),
        }
    }

    pub fn with_semantic_scholar(mut self, client: Arc<SemanticScholarClient>) -> Self {
        self.semantic_scholar = Some(client);
        self
    }

    pub fn with_retry(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_doi_base(mut self, base: impl Into<String>) -> Self {
        self.doi_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Resolve with a fresh context.
    pub async fn resolve_reference(&self, reference: &Reference) -> Result<ResolvedDocument, ResolveError> {
        let mut ctx = ResolutionContext::new(self.max_depth);
        self.resolve(reference, &mut ctx).await
    }

    pub async fn resolve(
        &self,
        reference: &Reference,
        ctx: &mut ResolutionContext,
    ) -> Result<ResolvedDocument, ResolveError> {
        tracing::info!("Resolving {}", reference.describe());
        match reference {
            Reference::Local(path) => read_local(path).await,
            Reference::Url(url) => self.walk(url.clone(), true, ctx).await,
            Reference::Doi(doi) => self.walk(self.doi_url(doi), false, ctx).await,
            Reference::SemanticScholar(id) => {
                let start = self.semantic_scholar_start(id).await?;
                self.walk(start.0, start.1, ctx).await
            }
        }
    }

    fn doi_url(&self, doi: &str) -> String {
        format!("{}/{}", self.doi_base, doi)
    }

    /// Open-access document first, then the DOI, then the paper page.
    async fn semantic_scholar_start(&self, id: &str) -> Result<(String, bool), ResolveError> {
        let unknown = || ResolveError::NoDocumentLink(format!("ss_{}", id));
        let Some(client) = &self.semantic_scholar else {
            return Err(unknown());
        };
        let details = client.paper_details(id).await.map_err(|e| {
            tracing::warn!("Semantic Scholar lookup for {} failed: {}", id, e);
            unknown()
        })?;
        if let Some(pdf) = details.pdf_url {
            return Ok((pdf, true));
        }
        if let Some(doi) = details.doi {
            return Ok((self.doi_url(&doi), false));
        }
        details.url.map(|u| (u, false)).ok_or_else(unknown)
    }

    async fn walk(
        &self,
        start: String,
        mut direct: bool,
        ctx: &mut ResolutionContext,
    ) -> Result<ResolvedDocument, ResolveError> {
        let mut current = start;
        loop {
            let url = Url::parse(&current).map_err(|_| FetchError::InvalidUrl(current.clone()))?;
            if html::is_non_document_path(&url) {
                return Err(ResolveError::NonDocumentPath(current));
            }
            ctx.enter(&current)?;

            let host = url.host_str().unwrap_or_default().to_string();
            self.pacer.pace(&host).await;
            let resp = self.fetch(&current, &host).await?;

            if resp.is_redirect() {
                let location = resp.location.as_deref().unwrap_or_default();
                let next = url
                    .join(location)
                    .map_err(|_| FetchError::InvalidUrl(location.to_string()))?;
                tracing::debug!("{} redirects to {}", current, next);
                current = next.to_string();
                continue;
            }
            match resp.status {
                200..=299 => {}
                429 => return Err(ResolveError::RateLimited(current)),
                403 if html::looks_like_challenge(&resp.text()) => {
                    return Err(ResolveError::Blocked(current))
                }
                status => return Err(ResolveError::HttpStatus { url: current, status }),
            }

            if is_document(&resp) {
                tracing::info!(
                    "Document found at {} ({} bytes, depth {})",
                    resp.url,
                    resp.body.len(),
                    ctx.depth
                );
                return Ok(ResolvedDocument {
                    location: current,
                    bytes: resp.body,
                    direct,
                });
            }

            // Not a document: treat whatever came back as a landing page.
            let page = resp.text();
            direct = false;
            match html::scan_landing_page(&page, &url) {
                Some(PageFinding::Document(link)) => current = link,
                Some(PageFinding::Doi(doi)) => {
                    tracing::debug!("Following DOI {} found on {}", doi, current);
                    current = self.doi_url(&doi);
                }
                None if html::looks_like_challenge(&page) => return Err(ResolveError::Blocked(current)),
                None => return Err(ResolveError::NoDocumentLink(current)),
            }
        }
    }

    /// One logical fetch. 429/503 and transient transport failures are retried.
    async fn fetch(&self, url: &str, host: &str) -> Result<HttpResponse, ResolveError> {
        let spec = RequestSpec::new(identity::document_headers(host)).manual_redirects();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let retry = match self.transport.get(url, &spec).await {
                Ok(resp) if resp.status == 429 || resp.status == 503 => {
                    if !self.retry.should_retry(attempt) {
                        return Ok(resp);
                    }
                    format!("HTTP {}", resp.status)
                }
                Ok(resp) => return Ok(resp),
                Err(e) if e.class().is_retryable() && self.retry.should_retry(attempt) => e.to_string(),
                Err(e) => return Err(e.into()),
            };
            tracing::debug!("Retrying {} after {}", url, retry);
            self.retry.wait(attempt).await;
        }
    }
}

fn is_document(resp: &HttpResponse) -> bool {
    if resp.body.starts_with(b"%PDF-") {
        return true;
    }
    matches!(
        resp.media_type().as_deref(),
        Some("application/pdf") | Some("application/x-pdf")
    ) && !resp.body.is_empty()
}

async fn read_local(path: &Path) -> Result<ResolvedDocument, ResolveError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| ResolveError::Local {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(ResolvedDocument {
        location: format!("local://{}", path.display()),
        bytes,
        direct: true,
    })
}
