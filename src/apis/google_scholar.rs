use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::{get_with_retry, guarded, truncate_chars, PaperRecord, PaperSource, SourceError, YearFilter};
use crate::resolver::html::challenge_element;
use crate::transport::backoff::Backoff;
use crate::transport::throttle::{Throttle, ThrottleConfig};
use crate::transport::{identity, RequestSpec, Transport};

const BASE_URL: &str = "https://scholar.google.com/scholar";
const MAX_LIMIT: u32 = 20;

pub const NAME: &str = "google_scholar";

pub fn throttle_config() -> ThrottleConfig {
    ThrottleConfig {
        min_delay: Duration::from_secs(5),
        daily_limit: 100,
        failure_threshold: 10,
        cooldown: Duration::from_secs(5 * 60),
    }
}

/// Scrapes the rendered results page; there is no structured API.
pub struct GoogleScholarClient {
    transport: Arc<Transport>,
    base_url: String,
    throttle: Throttle,
    backoff: Backoff,
}

impl GoogleScholarClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            base_url: BASE_URL.to_string(),
            throttle: Throttle::new(NAME, throttle_config()),
            backoff: Backoff::new(2, Duration::from_secs(10), Duration::from_secs(30)),
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
        let limit = limit.min(MAX_LIMIT);
        let mut spec = RequestSpec::new(identity::search_page_headers())
            .query("q", query)
            .query("hl", "en")
            .query("as_sdt", "0,5")
            .query("num", limit.to_string());
        if let Some(start) = years.start {
            spec = spec.query("as_ylo", start.to_string());
        }
        if let Some(end) = years.end {
            spec = spec.query("as_yhi", end.to_string());
        }

        // Challenges are never retried: a second request only deepens the block.
        let resp = get_with_retry(&self.transport, &self.base_url, &spec, &self.backoff, NAME, &[429]).await?;
        match resp.status {
            200 => {}
            403 => {
                return Err(SourceError::Blocked {
                    name: NAME.to_string(),
                    detail: "HTTP 403, likely an IP block".to_string(),
                })
            }
            status => return Err(SourceError::Api(format!("Google Scholar returned HTTP {}", status))),
        }

        let html = resp.text();
        let mut records = parse_results(&html)?;
        if records.is_empty() {
            if let Some(element) = challenge_element(&html) {
                return Err(SourceError::Blocked {
                    name: NAME.to_string(),
                    detail: format!("challenge page ({})", element),
                });
            }
        }
        records.truncate(limit as usize);
        Ok(records)
    }
}

#[async_trait]
impl PaperSource for GoogleScholarClient {
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
        tracing::info!("Found {} papers from Google Scholar", records.len());
        Ok(records)
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("{:?}", e)))
}

fn text_of(el: ElementRef) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_results(html: &str) -> Result<Vec<PaperRecord>, SourceError> {
    let doc = Html::parse_document(html);
    let result_sel = selector("div.gs_r")?;
    let body_sel = selector("div.gs_ri")?;
    let title_sel = selector("h3.gs_rt")?;
    let title_link_sel = selector("h3.gs_rt a[href]")?;
    let meta_sel = selector("div.gs_a")?;
    let snippet_sel = selector("div.gs_rs")?;
    let side_link_sel = selector("div.gs_ggs a[href], div.gs_or_ggsm a[href]")?;
    let any_link_sel = selector("a[href]")?;
    let year_re = Regex::new(r"\b(19|20)\d{2}\b").map_err(|e| SourceError::Parse(e.to_string()))?;

    let mut records = Vec::new();
    for result in doc.select(&result_sel) {
        let Some(body) = result.select(&body_sel).next() else {
            continue;
        };
        let Some(title_el) = body.select(&title_sel).next() else {
            continue;
        };
        let title = strip_markers(&text_of(title_el));
        if title.is_empty() {
            continue;
        }
        let link = body
            .select(&title_link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .to_string();

        // "A Author, B Author - Venue, 2020 - publisher.com"
        let meta = body.select(&meta_sel).next().map(text_of).unwrap_or_default();
        let mut parts = meta.split(" - ");
        let authors = parts.next().unwrap_or_default().trim().to_string();
        let venue = parts
            .next()
            .map(|v| v.trim().trim_end_matches(|c: char| c.is_ascii_digit() || c == ',' || c == ' '))
            .filter(|v| !v.is_empty())
            .unwrap_or("Google Scholar")
            .to_string();
        let year = year_re
            .find(&meta)
            .and_then(|m| m.as_str().parse::<u32>().ok());

        let summary = body
            .select(&snippet_sel)
            .next()
            .map(text_of)
            .filter(|s| !s.is_empty())
            .map(|s| truncate_chars(&s, 300))
            .unwrap_or_else(|| "No summary available".to_string());

        let pdf_url = result
            .select(&side_link_sel)
            .chain(result.select(&any_link_sel))
            .filter_map(|a| a.value().attr("href"))
            .find(|href| href.to_lowercase().contains(".pdf") || href.contains("/pdf/"))
            .map(str::to_string);

        records.push(PaperRecord {
            id: format!("gs_{}", title_hash(&title)),
            title,
            authors,
            year,
            venue,
            source: "Google Scholar".to_string(),
            link,
            pdf_url,
            summary,
            citation_count: None,
            doi: None,
        });
    }
    Ok(records)
}

fn strip_markers(title: &str) -> String {
    let mut t = title.to_string();
    for marker in ["[PDF]", "[HTML]", "[BOOK]", "[B]", "[CITATION]", "[C]"] {
        t = t.replace(marker, "");
    }
    t.trim().to_string()
}

fn title_hash(title: &str) -> String {
    let mut hasher = DefaultHasher::new();
    title.to_lowercase().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::reputation::DomainReputation;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESULTS_PAGE: &str = r#"<html><body><div id="gs_res_ccl_mid">
      <div class="gs_r gs_or gs_scl">
        <div class="gs_ggs gs_fl"><div class="gs_or_ggsm"><a href="https://repo.example.edu/paper.pdf">[PDF] example.edu</a></div></div>
        <div class="gs_ri">
          <h3 class="gs_rt"><span class="gs_ctg2">[PDF]</span> <a href="https://journal.example.org/article/7">Soil Moisture Retrieval with Radar</a></h3>
          <div class="gs_a">J Smith, K Lee - Remote Sensing, 2020 - journal.example.org</div>
          <div class="gs_rs">We present a method for estimating soil moisture.</div>
        </div>
      </div>
      <div class="gs_r gs_or gs_scl">
        <div class="gs_ri">
          <h3 class="gs_rt"><a href="https://books.example.com/b1">Hydrology Basics</a></h3>
          <div class="gs_a">A Author - 1998 - books.example.com</div>
        </div>
      </div>
    </div></body></html>"#;

    fn client(server: &MockServer) -> GoogleScholarClient {
        let transport = Arc::new(
            Transport::new(Duration::from_secs(5), Arc::new(DomainReputation::in_memory())).unwrap(),
        );
        GoogleScholarClient::new(transport)
            .with_base_url(server.uri())
            .with_backoff(Backoff::new(2, Duration::from_millis(1), Duration::from_millis(5)).without_jitter())
    }

    #[test]
    fn test_parse_results() {
        let records = parse_results(RESULTS_PAGE).unwrap();
        assert_eq!(records.len(), 2);

        let r = &records[0];
        assert_eq!(r.title, "Soil Moisture Retrieval with Radar");
        assert_eq!(r.authors, "J Smith, K Lee");
        assert_eq!(r.venue, "Remote Sensing");
        assert_eq!(r.year, Some(2020));
        assert_eq!(r.link, "https://journal.example.org/article/7");
        assert_eq!(r.pdf_url.as_deref(), Some("https://repo.example.edu/paper.pdf"));
        assert!(r.id.starts_with("gs_"));

        let b = &records[1];
        assert_eq!(b.year, Some(1998));
        assert_eq!(b.pdf_url, None);
        assert_eq!(b.summary, "No summary available");
    }

    #[tokio::test]
    async fn test_year_bounds_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("as_ylo", "2018"))
            .and(query_param("as_yhi", "2021"))
            .and(query_param("q", "soil moisture"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RESULTS_PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let records = client(&server)
            .search("soil moisture", &YearFilter::parse("2018-2021"), 1)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_challenge_page_is_a_hard_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><body><form id=\"gs_captcha_f\"><h1>Please show you're not a robot</h1></form></body></html>",
            ))
            .mount(&server)
            .await;

        let c = client(&server);
        let err = c.search("anything", &YearFilter::any(), 10).await.unwrap_err();
        assert!(matches!(err, SourceError::Blocked { .. }));
        assert_eq!(c.throttle().status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_results_about_captchas_are_not_a_challenge() {
        let page = r#"<html><body><div id="gs_res_ccl_mid">
          <div class="gs_r gs_or gs_scl"><div class="gs_ri">
            <h3 class="gs_rt"><a href="https://conf.example.org/p/12">Breaking Text CAPTCHA with Deep Learning</a></h3>
            <div class="gs_a">M Chen - Security Symposium, 2021 - conf.example.org</div>
            <div class="gs_rs">Proving you are not a robot is harder under unusual traffic.</div>
          </div></div>
        </div></body></html>"#;
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&server)
            .await;

        let records = client(&server)
            .search("captcha", &YearFilter::any(), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Breaking Text CAPTCHA with Deep Learning");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "soil"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("q", "soil"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RESULTS_PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let records = client(&server)
            .search("soil", &YearFilter::any(), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_sorry_interstitial_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><form action="https://www.google.com/sorry/index"></form></body></html>"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .search("blocked", &YearFilter::any(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_forbidden_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server)
            .search("anything", &YearFilter::any(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Blocked { .. }));
    }
}
