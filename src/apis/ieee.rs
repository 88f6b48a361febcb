use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    display_authors, get_with_retry, guarded, truncate_chars, PaperRecord, PaperSource, SourceError, YearFilter,
};
use crate::transport::backoff::Backoff;
use crate::transport::throttle::{Throttle, ThrottleConfig};
use crate::transport::{identity, RequestSpec, Transport};

const BASE_URL: &str = "https://ieeexploreapi.ieee.org/api/v1/search/articles";
const STAMP_URL: &str = "https://ieeexplore.ieee.org/stamp/stamp.jsp?tp=&arnumber=";
const MAX_LIMIT: u32 = 20;

pub const NAME: &str = "ieee";

pub fn throttle_config() -> ThrottleConfig {
    ThrottleConfig {
        min_delay: Duration::from_millis(100),
        daily_limit: 200,
        failure_threshold: 5,
        cooldown: Duration::from_secs(10 * 60),
    }
}

pub struct IeeeClient {
    transport: Arc<Transport>,
    api_key: String,
    base_url: String,
    throttle: Throttle,
    backoff: Backoff,
}

impl IeeeClient {
    pub fn new(transport: Arc<Transport>, api_key: String) -> Self {
        Self {
            transport,
            api_key,
            base_url: BASE_URL.to_string(),
            throttle: Throttle::new(NAME, throttle_config()),
            backoff: Backoff::new(3, Duration::from_secs(2), Duration::from_secs(8)),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn fetch(
        &self,
        query: &str,
        years: &YearFilter,
        limit: u32,
    ) -> Result<Vec<PaperRecord>, SourceError> {
        if self.api_key.trim().is_empty() {
            return Err(SourceError::MissingKey("IEEE_API_KEY".to_string()));
        }
        let mut spec = RequestSpec::new(identity::api_headers("application/json"))
            .query("apikey", self.api_key.as_str())
            .query("querytext", query)
            .query("max_records", limit.min(MAX_LIMIT).to_string())
            .query("format", "json")
            .query("start_record", "1");
        if let Some(start) = years.start {
            spec = spec.query("start_year", start.to_string());
        }
        if let Some(end) = years.end {
            spec = spec.query("end_year", end.to_string());
        }

        let resp = get_with_retry(&self.transport, &self.base_url, &spec, &self.backoff, NAME, &[429, 503]).await?;
        match resp.status {
            200 => {}
            401 | 403 => return Err(SourceError::Api(format!("IEEE rejected the API key (HTTP {})", resp.status))),
            status => return Err(SourceError::Api(format!("IEEE API returned HTTP {}", status))),
        }

        let body: IeeeResponse = resp
            .json()
            .map_err(|e| SourceError::Parse(format!("IEEE response: {}", e)))?;
        Ok(body.articles.unwrap_or_default().into_iter().filter_map(to_record).collect())
    }
}

#[async_trait]
impl PaperSource for IeeeClient {
    fn name(&self) -> &str {
        NAME
    }

    fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    async fn search(
        &self,
        query: &str,
        years: &YearFilter,
        limit: u32,
    ) -> Result<Vec<PaperRecord>, SourceError> {
        let records = guarded(&self.throttle, NAME, self.fetch(query, years, limit)).await?;
        let status = self.throttle.status();
        tracing::info!(
            "Found {} papers from IEEE ({}/{} requests today)",
            records.len(),
            status.requests_in_window,
            status.daily_limit
        );
        Ok(records)
    }
}

#[derive(Deserialize)]
struct IeeeResponse {
    articles: Option<Vec<IeeeArticle>>,
}

#[derive(Deserialize)]
struct IeeeArticle {
    title: Option<String>,
    authors: Option<IeeeAuthors>,
    publication_year: Option<serde_json::Value>,
    doi: Option<String>,
    html_url: Option<String>,
    pdf_url: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    publication_title: Option<String>,
    article_number: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct IeeeAuthors {
    #[serde(default)]
    authors: Vec<IeeeAuthor>,
}

#[derive(Deserialize)]
struct IeeeAuthor {
    full_name: Option<String>,
}

/// The API returns some numeric fields as numbers and others as strings.
fn loose_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_record(a: IeeeArticle) -> Option<PaperRecord> {
    let title = a.title.filter(|t| !t.trim().is_empty())?;
    let arnumber = a.article_number.as_ref().and_then(loose_string);
    let doi = a.doi.filter(|d| !d.trim().is_empty());
    let id = arnumber.clone().or_else(|| doi.clone())?;

    let link = match (&doi, &a.html_url, &a.pdf_url) {
        (Some(doi), _, _) => format!("https://doi.org/{}", doi),
        (None, Some(html), _) if !html.is_empty() => html.clone(),
        (None, _, Some(pdf)) => pdf.clone(),
        _ => String::new(),
    };
    let names: Vec<String> = a
        .authors
        .map(|a| a.authors.into_iter().filter_map(|x| x.full_name).collect())
        .unwrap_or_default();

    Some(PaperRecord {
        id: format!("ieee_{}", id),
        title,
        authors: display_authors(&names),
        year: a
            .publication_year
            .as_ref()
            .and_then(loose_string)
            .and_then(|y| y.parse().ok()),
        venue: a
            .publication_title
            .unwrap_or_else(|| "IEEE Publication".to_string()),
        source: "IEEE".to_string(),
        link,
        pdf_url: arnumber.map(|n| format!("{}{}", STAMP_URL, n)),
        summary: a
            .abstract_text
            .map(|s| truncate_chars(&s, 300))
            .unwrap_or_else(|| "No abstract available".to_string()),
        citation_count: None,
        doi,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::reputation::DomainReputation;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = r#"{
        "total_records": 2,
        "articles": [
            {
                "title": "Low-Power Wireless Sensor Networks",
                "authors": {"authors": [{"full_name": "P. Ng"}, {"full_name": "Q. Ho"}]},
                "publication_year": 2022,
                "doi": "10.1109/LPWSN.2022.1",
                "html_url": "https://ieeexplore.ieee.org/document/9700001/",
                "abstract": "Energy harvesting for sensor nodes.",
                "publication_title": "IEEE Sensors Journal",
                "article_number": "9700001"
            },
            {
                "title": "No DOI Paper",
                "publication_year": "2019",
                "html_url": "https://ieeexplore.ieee.org/document/8000002/",
                "article_number": "8000002"
            }
        ]
    }"#;

    fn client(server: &MockServer, key: &str) -> IeeeClient {
        let transport = Arc::new(
            Transport::new(Duration::from_secs(5), Arc::new(DomainReputation::in_memory())).unwrap(),
        );
        IeeeClient::new(transport, key.to_string())
            .with_base_url(server.uri())
            .with_backoff(Backoff::new(3, Duration::from_millis(1), Duration::from_millis(5)).without_jitter())
    }

    #[tokio::test]
    async fn test_search_maps_articles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("apikey", "k"))
            .and(query_param("start_year", "2019"))
            .and(query_param("end_year", "2023"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let records = client(&server, "k")
            .search("sensor networks", &YearFilter::parse("2019-2023"), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        let a = &records[0];
        assert_eq!(a.id, "ieee_9700001");
        assert_eq!(a.link, "https://doi.org/10.1109/LPWSN.2022.1");
        assert_eq!(
            a.pdf_url.as_deref(),
            Some("https://ieeexplore.ieee.org/stamp/stamp.jsp?tp=&arnumber=9700001")
        );
        assert_eq!(a.year, Some(2022));
        assert_eq!(a.venue, "IEEE Sensors Journal");

        let b = &records[1];
        assert_eq!(b.link, "https://ieeexplore.ieee.org/document/8000002/");
        assert_eq!(b.year, Some(2019));
        assert_eq!(b.doi, None);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_within_one_search() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server, "k");
        let records = c.search("sensor networks", &YearFilter::any(), 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(c.throttle().status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_rejected_key_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, "bad")
            .search("x", &YearFilter::any(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Api(_)));
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server, "")
            .search("x", &YearFilter::any(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingKey(_)));
    }
}
