//! Outbound HTTP with learned TLS degradation.
//!
//! Every request first goes through a fully verified client. When the handshake
//! fails certificate validation, the host is recorded in [`DomainReputation`] and
//! the request is retried once through a client that skips verification. Later
//! requests to that host go straight to the unverified client. Hosts that never
//! failed are never degraded.

pub mod backoff;
pub mod identity;
pub mod pacing;
pub mod reputation;
pub mod throttle;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::failure::ErrorClass;
use reputation::DomainReputation;

const DEFAULT_MAX_BODY: usize = 64 * 1024 * 1024;
/// Verification failures as reported by OpenSSL, Schannel/Security.framework
/// and rustls. Matched only against the handshake error's sources, never the
/// top-level message, which embeds the request URL.
const CERTIFICATE_MARKERS: &[&str] = &[
    "certificate verify failed",
    "self signed certificate",
    "self-signed certificate",
    "unable to get local issuer certificate",
    "certificate has expired",
    "certificate is not yet valid",
    "invalid peer certificate",
    "invalidcertificate",
    "unknownissuer",
    "untrusted root",
    "certificate is not trusted",
];

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("certificate validation for {url} failed: {reason}")]
    Certificate { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { .. } | Self::Certificate { .. } | Self::Timeout { .. } => {
                ErrorClass::Transport
            }
            Self::InvalidUrl(_) | Self::TooLarge { .. } => ErrorClass::ShapeMismatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redirects {
    #[default]
    Follow,
    /// Return 3xx responses to the caller with their `Location`.
    Manual,
}

#[derive(Debug, Clone, Default)]
pub struct RequestSpec {
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub redirects: Redirects,
}

impl RequestSpec {
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = reqwest::header::HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
        self
    }

    pub fn manual_redirects(mut self) -> Self {
        self.redirects = Redirects::Manual;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL after any redirects the client followed.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.location.is_some()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Lowercased media type without parameters.
    pub fn media_type(&self) -> Option<String> {
        self.content_type.as_deref().map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

#[derive(Debug)]
struct ClientPair {
    follow: Client,
    manual: Client,
}

impl ClientPair {
    fn build(timeout: Duration, accept_invalid_certs: bool) -> Result<Self, reqwest::Error> {
        let builder = || {
            Client::builder()
                .timeout(timeout)
                .connect_timeout(timeout.min(Duration::from_secs(10)))
                .gzip(true)
                .danger_accept_invalid_certs(accept_invalid_certs)
        };
        Ok(Self {
            follow: builder().redirect(Policy::limited(10)).build()?,
            manual: builder().redirect(Policy::none()).build()?,
        })
    }

    fn pick(&self, redirects: Redirects) -> &Client {
        match redirects {
            Redirects::Follow => &self.follow,
            Redirects::Manual => &self.manual,
        }
    }
}

#[derive(Debug)]
pub struct Transport {
    reputation: Arc<DomainReputation>,
    verified: ClientPair,
    degraded: ClientPair,
    max_body: usize,
}

impl Transport {
    pub fn new(
        request_timeout: Duration,
        reputation: Arc<DomainReputation>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            reputation,
            verified: ClientPair::build(request_timeout, false)?,
            degraded: ClientPair::build(request_timeout, true)?,
            max_body: DEFAULT_MAX_BODY,
        })
    }

    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body = bytes;
        self
    }

    pub async fn get(&self, url: &str, spec: &RequestSpec) -> Result<HttpResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_ascii_lowercase();

        if self.reputation.should_degrade_tls(&host) {
            tracing::debug!("Using unverified TLS for known host {}", host);
            return self.send(&self.degraded, url, spec).await;
        }

        match self.send(&self.verified, url, spec).await {
            Err(FetchError::Certificate { reason, .. }) if parsed.scheme() == "https" => {
                tracing::warn!(
                    "Certificate validation failed for {} ({}), retrying without verification",
                    host,
                    reason
                );
                self.reputation.record_certificate_failure(&host);
                self.send(&self.degraded, url, spec).await
            }
            other => other,
        }
    }

    async fn send(
        &self,
        clients: &ClientPair,
        url: &str,
        spec: &RequestSpec,
    ) -> Result<HttpResponse, FetchError> {
        let mut req = clients.pick(spec.redirects).get(url).headers(spec.headers.clone());
        if !spec.query.is_empty() {
            req = req.query(&spec.query);
        }

        let mut resp = req.send().await.map_err(|e| classify(url, &e))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let content_type = header_string(resp.headers(), CONTENT_TYPE);
        let location = header_string(resp.headers(), LOCATION);

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| classify(url, &e))? {
            if body.len() + chunk.len() > self.max_body {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_body,
                });
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!("GET {} -> {} ({} bytes)", url, status, body.len());
        Ok(HttpResponse {
            url: final_url,
            status,
            content_type,
            location,
            body,
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn classify(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_string(),
        };
    }
    let url = url.to_string();
    let reason = error_chain(err);
    if err.is_connect() && is_certificate_failure(err) {
        FetchError::Certificate { url, reason }
    } else {
        FetchError::Transport { url, reason }
    }
}

/// Whether a connect error was caused by certificate verification. Only the
/// underlying sources are inspected.
fn is_certificate_failure(err: &dyn std::error::Error) -> bool {
    let mut current = err.source();
    while let Some(e) = current {
        if mentions_certificate_failure(&e.to_string()) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Flatten an error and all its sources into one message.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let msg = e.to_string();
        if !parts.iter().any(|p| p.contains(&msg)) {
            parts.push(msg);
        }
        current = e.source();
    }
    parts.join(": ")
}

fn mentions_certificate_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CERTIFICATE_MARKERS.iter().any(|m| lower.contains(m))
}
