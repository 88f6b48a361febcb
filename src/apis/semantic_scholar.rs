use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::query_cache::QueryCache;
use super::{
    display_authors, get_with_retry, guarded, truncate_chars, PaperRecord, PaperSource, SourceError, YearFilter,
};
use crate::transport::backoff::Backoff;
use crate::transport::throttle::{Throttle, ThrottleConfig};
use crate::transport::{identity, HttpResponse, RequestSpec, Transport};

const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const SEARCH_FIELDS: &str = "title,authors,year,venue,abstract,url,citationCount,openAccessPdf,externalIds";
const DETAIL_FIELDS: &str = "title,url,openAccessPdf,externalIds";
const MAX_LIMIT: u32 = 20;

pub const NAME: &str = "semantic_scholar";

pub fn throttle_config() -> ThrottleConfig {
    ThrottleConfig {
        min_delay: Duration::from_secs(30),
        daily_limit: 1000,
        failure_threshold: 5,
        cooldown: Duration::from_secs(10 * 60),
    }
}

pub struct SemanticScholarClient {
    transport: Arc<Transport>,
    api_key: Option<String>,
    base_url: String,
    throttle: Throttle,
    backoff: Backoff,
    cache: QueryCache<Vec<PaperRecord>>,
}

/// Where the full text of a Semantic Scholar paper might live.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperDetails {
    pub pdf_url: Option<String>,
    pub doi: Option<String>,
    pub url: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(transport: Arc<Transport>, api_key: Option<String>) -> Self {
        Self {
            transport,
            api_key,
            base_url: BASE_URL.to_string(),
            throttle: Throttle::new(NAME, throttle_config()),
            backoff: Backoff::new(4, Duration::from_secs(2), Duration::from_secs(16)),
            cache: QueryCache::new(Duration::from_secs(24 * 60 * 60), 50),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[cfg(test)]
    fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.throttle = Throttle::new(NAME, ThrottleConfig { min_delay, ..throttle_config() });
        self
    }

    fn request(&self) -> RequestSpec {
        let spec = RequestSpec::new(identity::api_headers("application/json"));
        match &self.api_key {
            Some(key) => spec.header("x-api-key", key),
            None => spec,
        }
    }

    /// Look up one paper's open-access document and DOI.
    ///
    /// Shares the breaker with search but skips the search pacing delay, since it
    /// runs inside a resolution chain with its own budget.
    pub async fn paper_details(&self, paper_id: &str) -> Result<PaperDetails, SourceError> {
        let id = paper_id
            .strip_prefix("ss_")
            .or_else(|| paper_id.strip_prefix("s2:"))
            .unwrap_or(paper_id);
        if !self.throttle.can_proceed() {
            return Err(SourceError::CircuitOpen(NAME.to_string()));
        }

        let url = format!("{}/paper/{}", self.base_url, id);
        let spec = self.request().query("fields", DETAIL_FIELDS);
        let result = self
            .get_ok(&url, &spec)
            .await
            .and_then(|resp| resp.json::<S2Paper>().map_err(|e| SourceError::Parse(e.to_string())));
        self.throttle.record_outcome(result.is_ok());

        let paper = result?;
        Ok(PaperDetails {
            pdf_url: paper.open_access_pdf.and_then(|p| p.url).filter(|u| !u.is_empty()),
            doi: paper.external_ids.and_then(|e| e.doi),
            url: paper.url,
        })
    }

    async fn fetch_search(
        &self,
        query: &str,
        years: &YearFilter,
        limit: u32,
    ) -> Result<Vec<PaperRecord>, SourceError> {
        let url = format!("{}/paper/search", self.base_url);
        let mut spec = self
            .request()
            .query("query", query)
            .query("limit", limit.min(MAX_LIMIT).to_string())
            .query("fields", SEARCH_FIELDS);
        if let Some(range) = years.as_range() {
            spec = spec.query("year", range);
        }

        let resp = self.get_ok(&url, &spec).await?;
        let body: S2SearchResponse = resp
            .json()
            .map_err(|e| SourceError::Parse(format!("search response: {}", e)))?;
        Ok(body.data.unwrap_or_default().into_iter().filter_map(to_record).collect())
    }

    /// 202 means the result is still being computed and 429 means slow down.
    /// Both are retried with backoff; anything but 200 afterwards is an error.
    async fn get_ok(&self, url: &str, spec: &RequestSpec) -> Result<HttpResponse, SourceError> {
        let resp = get_with_retry(&self.transport, url, spec, &self.backoff, NAME, &[202, 429]).await?;
        if resp.status != 200 {
            return Err(SourceError::Api(format!("HTTP {} from {}", resp.status, url)));
        }
        Ok(resp)
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    data: Option<Vec<S2Paper>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<u32>,
    venue: Option<String>,
    external_ids: Option<S2ExternalIds>,
    citation_count: Option<u32>,
    url: Option<String>,
    open_access_pdf: Option<S2Pdf>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

#[derive(Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

fn to_record(p: S2Paper) -> Option<PaperRecord> {
    let paper_id = p.paper_id.filter(|id| !id.is_empty())?;
    let names: Vec<String> = p
        .authors
        .unwrap_or_default()
        .into_iter()
        .filter_map(|a| a.name)
        .collect();
    Some(PaperRecord {
        id: format!("ss_{}", paper_id),
        title: p.title.unwrap_or_else(|| "Untitled".to_string()),
        authors: display_authors(&names),
        year: p.year.filter(|y| *y > 0),
        venue: p
            .venue
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "Semantic Scholar".to_string()),
        source: "Semantic Scholar".to_string(),
        link: p.url.unwrap_or_default(),
        pdf_url: p.open_access_pdf.and_then(|pdf| pdf.url).filter(|u| !u.is_empty()),
        summary: p
            .abstract_text
            .map(|a| truncate_chars(&a, 300))
            .unwrap_or_else(|| "No abstract available".to_string()),
        citation_count: p.citation_count,
        doi: p.external_ids.and_then(|e| e.doi),
    })
}

#[async_trait]
impl PaperSource for SemanticScholarClient {
    fn name(&self) -> &str {
        NAME
    }

    fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    fn serialized(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query: &str,
        years: &YearFilter,
        limit: u32,
    ) -> Result<Vec<PaperRecord>, SourceError> {
        let limit = limit.min(MAX_LIMIT);
        let key = QueryCache::<Vec<PaperRecord>>::key(query, &format!("{}|{}", years, limit));
        if let Some(hit) = self.cache.get(&key) {
            tracing::info!("Semantic Scholar cache hit for {:?}", query);
            return Ok(hit);
        }

        let records = guarded(&self.throttle, NAME, self.fetch_search(query, years, limit)).await?;
        tracing::info!("Found {} papers from Semantic Scholar", records.len());
        self.cache.insert(key, records.clone());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::reputation::DomainReputation;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SEARCH_BODY: &str = r#"{
        "total": 2,
        "data": [
            {
                "paperId": "abc123",
                "title": "Graph Neural Networks for Molecules",
                "authors": [{"name": "A. One"}, {"name": "B. Two"}, {"name": "C. Three"}, {"name": "D. Four"}],
                "year": 2021,
                "venue": "",
                "abstract": null,
                "url": "https://www.semanticscholar.org/paper/abc123",
                "citationCount": 42,
                "openAccessPdf": {"url": "https://example.org/gnn.pdf"},
                "externalIds": {"DOI": "10.1000/gnn"}
            },
            {"paperId": null, "title": "dropped"}
        ]
    }"#;

    fn client(server: &MockServer) -> SemanticScholarClient {
        let transport = Arc::new(
            Transport::new(Duration::from_secs(5), Arc::new(DomainReputation::in_memory())).unwrap(),
        );
        SemanticScholarClient::new(transport, Some("secret".to_string()))
            .with_base_url(server.uri())
            .with_backoff(Backoff::new(4, Duration::from_millis(1), Duration::from_millis(5)).without_jitter())
            .with_min_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_search_maps_records_and_sends_year_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .and(query_param("year", "2019-2021"))
            .and(query_param("limit", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_BODY))
            .expect(1)
            .mount(&server)
            .await;

        let records = client(&server)
            .search("gnn", &YearFilter::parse("2019-2021"), 50)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.id, "ss_abc123");
        assert_eq!(r.authors, "A. One, B. Two, C. Three et al.");
        assert_eq!(r.venue, "Semantic Scholar");
        assert_eq!(r.summary, "No abstract available");
        assert_eq!(r.pdf_url.as_deref(), Some("https://example.org/gnn.pdf"));
        assert_eq!(r.doi.as_deref(), Some("10.1000/gnn"));
        assert_eq!(r.citation_count, Some(42));
    }

    #[tokio::test]
    async fn test_processing_status_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .respond_with(ResponseTemplate::new(202))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_BODY))
            .mount(&server)
            .await;

        let records = client(&server)
            .search("gnn", &YearFilter::any(), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let c = client(&server);
        let err = c.search("gnn", &YearFilter::any(), 10).await.unwrap_err();
        assert!(matches!(err, SourceError::RateLimited { .. }));
        assert_eq!(c.throttle().status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_repeated_query_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_BODY))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        let first = c.search("Graph networks", &YearFilter::any(), 10).await.unwrap();
        let second = c.search("graph   networks", &YearFilter::any(), 10).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cache_key_includes_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_BODY))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .and(query_param("limit", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_BODY))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        c.search("gnn", &YearFilter::any(), 5).await.unwrap();
        c.search("gnn", &YearFilter::any(), 20).await.unwrap();
        c.search("gnn", &YearFilter::any(), 20).await.unwrap();
    }

    #[tokio::test]
    async fn test_paper_details() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"paperId":"abc123","url":"https://www.semanticscholar.org/paper/abc123",
                    "openAccessPdf":null,"externalIds":{"DOI":"10.1000/gnn"}}"#,
            ))
            .mount(&server)
            .await;

        let details = client(&server).paper_details("ss_abc123").await.unwrap();
        assert_eq!(details.pdf_url, None);
        assert_eq!(details.doi.as_deref(), Some("10.1000/gnn"));
    }
}
