use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::apis::{self, semantic_scholar::SemanticScholarClient, PaperSource};
use crate::cache::RetryPolicy;
use crate::fulltext::FullTextConfig;
use crate::resolver::Resolver;
use crate::search::SourceSet;
use crate::transport::reputation::DomainReputation;
use crate::transport::throttle::ThrottleStatus;
use crate::transport::Transport;

pub const ALL_SOURCES: &[&str] = &[
    apis::semantic_scholar::NAME,
    apis::arxiv::NAME,
    apis::google_scholar::NAME,
    apis::ieee::NAME,
];

const REPUTATION_FILE: &str = "degraded_hosts.json";
const STORE_FILE: &str = "extractions.json";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub enabled_source_names: Vec<String>,
    pub semantic_scholar_api_key: Option<String>,
    pub ieee_api_key: Option<String>,
    pub request_timeout: Duration,
    pub resolution_budget: Duration,
    pub max_depth: u32,
    pub host_interval: Duration,
    pub public_ttl: Duration,
    pub retry_cooldown: Duration,
    pub max_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or blank values take the default;
    /// unparseable numbers are reported and also take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = get("PAPER_HARVEST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".paper-harvest"));

        let enabled_source_names = get("PAPER_HARVEST_SOURCES")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty() && s != "all")
                    .collect()
            })
            .unwrap_or_default();

        Self {
            data_dir,
            enabled_source_names,
            semantic_scholar_api_key: get("SEMANTIC_SCHOLAR_API_KEY"),
            ieee_api_key: get("IEEE_API_KEY"),
            request_timeout: Duration::from_secs(number(&get, "PAPER_HARVEST_REQUEST_TIMEOUT_SECS", 20)),
            resolution_budget: Duration::from_secs(number(&get, "PAPER_HARVEST_RESOLUTION_BUDGET_SECS", 60)),
            max_depth: number(&get, "PAPER_HARVEST_MAX_DEPTH", 3),
            host_interval: Duration::from_millis(number(&get, "PAPER_HARVEST_HOST_INTERVAL_MS", 2000)),
            public_ttl: Duration::from_secs(3600 * number(&get, "PAPER_HARVEST_PUBLIC_TTL_HOURS", 24)),
            retry_cooldown: Duration::from_secs(number(&get, "PAPER_HARVEST_RETRY_COOLDOWN_SECS", 3600)),
            max_attempts: number(&get, "PAPER_HARVEST_MAX_ATTEMPTS", 3),
        }
    }

    pub fn reputation_path(&self) -> PathBuf {
        self.data_dir.join(REPUTATION_FILE)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled_source_names.is_empty() || self.enabled_source_names.iter().any(|n| n == name)
    }

    pub fn fulltext_config(&self) -> FullTextConfig {
        FullTextConfig {
            budget: self.resolution_budget,
            public_ttl: self.public_ttl,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                cooldown: self.retry_cooldown,
            },
        }
    }

    /// Shared HTTP transport backed by the persisted degraded-TLS host list.
    pub fn build_transport(&self) -> Result<Arc<Transport>, reqwest::Error> {
        let reputation = Arc::new(DomainReputation::load(self.reputation_path()));
        Ok(Arc::new(Transport::new(self.request_timeout, reputation)?))
    }

    /// The enabled search sources, plus the Semantic Scholar client the resolver
    /// uses for paper-id lookups whether or not it is enabled for search.
    pub fn build_sources(&self, transport: &Arc<Transport>) -> (SourceSet, Arc<SemanticScholarClient>) {
        let semantic_scholar = Arc::new(SemanticScholarClient::new(
            Arc::clone(transport),
            self.semantic_scholar_api_key.clone(),
        ));
        let mut sources: Vec<Arc<dyn PaperSource>> = Vec::new();

        if self.is_enabled(apis::arxiv::NAME) {
            sources.push(Arc::new(apis::arxiv::ArxivClient::new(Arc::clone(transport))));
        }
        if self.is_enabled(apis::google_scholar::NAME) {
            sources.push(Arc::new(apis::google_scholar::GoogleScholarClient::new(Arc::clone(
                transport,
            ))));
        }
        if self.is_enabled(apis::ieee::NAME) {
            match &self.ieee_api_key {
                Some(key) => sources.push(Arc::new(apis::ieee::IeeeClient::new(
                    Arc::clone(transport),
                    key.clone(),
                ))),
                None => tracing::warn!("IEEE disabled: IEEE_API_KEY not set"),
            }
        }
        if self.is_enabled(apis::semantic_scholar::NAME) {
            sources.push(semantic_scholar.clone());
        }

        for name in &self.enabled_source_names {
            if !ALL_SOURCES.contains(&name.as_str()) {
                tracing::warn!("Unknown source {:?} in PAPER_HARVEST_SOURCES", name);
            }
        }

        (SourceSet::new(sources), semantic_scholar)
    }

    pub fn build_resolver(&self, transport: &Arc<Transport>, semantic_scholar: Arc<SemanticScholarClient>) -> Resolver {
        Resolver::new(Arc::clone(transport), self.host_interval, self.max_depth).with_semantic_scholar(semantic_scholar)
    }

    /// Status of every known source, with breaker state for the running ones.
    pub fn source_status(&self, running: &SourceSet) -> Vec<SourceStatus> {
        ALL_SOURCES
            .iter()
            .map(|&name| {
                let live = running.iter().find(|s| s.name() == name);
                let note = if !self.is_enabled(name) {
                    "Disabled by PAPER_HARVEST_SOURCES filter".to_string()
                } else {
                    match name {
                        apis::semantic_scholar::NAME if self.semantic_scholar_api_key.is_some() => {
                            "API key set; runs after the other sources".to_string()
                        }
                        apis::semantic_scholar::NAME => {
                            "No API key (strictly paced); runs after the other sources".to_string()
                        }
                        apis::google_scholar::NAME => "HTML scraping".to_string(),
                        apis::ieee::NAME if self.ieee_api_key.is_none() => {
                            "Disabled: IEEE_API_KEY not set".to_string()
                        }
                        apis::ieee::NAME => "API key set".to_string(),
                        _ => "No API key required".to_string(),
                    }
                };
                SourceStatus {
                    name: name.to_string(),
                    enabled: live.is_some(),
                    note,
                    throttle: live.map(|s| s.throttle().status()),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleStatus>,
}

fn number<T: FromStr + std::fmt::Display + Copy>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {}={:?}, using default {}", key, raw, default);
            default
        }),
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
