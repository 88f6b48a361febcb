use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{
    display_authors, get_with_retry, guarded, truncate_words, PaperRecord, PaperSource, SourceError, YearFilter,
};
use crate::transport::backoff::Backoff;
use crate::transport::throttle::{Throttle, ThrottleConfig};
use crate::transport::{identity, RequestSpec, Transport};

const BASE_URL: &str = "https://export.arxiv.org/api/query";
const MAX_LIMIT: u32 = 20;

pub const NAME: &str = "arxiv";

pub fn throttle_config() -> ThrottleConfig {
    ThrottleConfig {
        min_delay: Duration::from_secs(3),
        daily_limit: 2000,
        failure_threshold: 5,
        cooldown: Duration::from_secs(5 * 60),
    }
}

pub struct ArxivClient {
    transport: Arc<Transport>,
    base_url: String,
    throttle: Throttle,
    backoff: Backoff,
}

impl ArxivClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            base_url: BASE_URL.to_string(),
            throttle: Throttle::new(NAME, throttle_config()),
            backoff: Backoff::new(3, Duration::from_secs(3), Duration::from_secs(12)),
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

    async fn fetch(&self, query: &str, limit: u32) -> Result<Vec<PaperRecord>, SourceError> {
        let spec = RequestSpec::new(identity::api_headers("application/atom+xml"))
            .query("search_query", format!("all:{}", query))
            .query("start", "0")
            .query("max_results", limit.min(MAX_LIMIT).to_string());

        // arXiv answers bursts with 503 as often as with 429.
        let resp = get_with_retry(&self.transport, &self.base_url, &spec, &self.backoff, NAME, &[429, 503]).await?;
        if !resp.is_success() {
            return Err(SourceError::Api(format!("arXiv API returned HTTP {}", resp.status)));
        }
        parse_atom_feed(&resp.text())
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
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
        let records = guarded(&self.throttle, NAME, self.fetch(query, limit)).await?;
        // The query API has no date-range parameter; filter here.
        let records: Vec<PaperRecord> = records
            .into_iter()
            .filter(|r| years.contains(r.year))
            .collect();
        tracing::info!("Found {} papers from arXiv", records.len());
        Ok(records)
    }
}

#[derive(Default)]
struct Entry {
    id_url: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    doi: Option<String>,
}

impl Entry {
    fn into_record(self) -> Option<PaperRecord> {
        let arxiv_id = self.id_url.trim().rsplit("/abs/").next()?.trim().to_string();
        let title = collapse(&self.title);
        if arxiv_id.is_empty() || title.is_empty() {
            return None;
        }
        Some(PaperRecord {
            id: format!("arxiv_{}", arxiv_id),
            title,
            authors: display_authors(&self.authors),
            year: self.published.get(..4).and_then(|y| y.parse().ok()),
            venue: "arXiv".to_string(),
            source: "arXiv".to_string(),
            link: format!("https://arxiv.org/abs/{}", arxiv_id),
            pdf_url: Some(format!("https://arxiv.org/pdf/{}.pdf", arxiv_id)),
            summary: truncate_words(&self.summary, 30),
            citation_count: None,
            doi: self.doi.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Id,
    Title,
    Summary,
    Published,
    AuthorName,
    Doi,
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_atom_feed(xml: &str) -> Result<Vec<PaperRecord>, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut papers = Vec::new();
    let mut entry: Option<Entry> = None;
    let mut field = Field::None;
    let mut in_author = false;
    let mut author = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match (local_name(&e).as_str(), entry.is_some()) {
                ("entry", _) => entry = Some(Entry::default()),
                ("author", true) => {
                    in_author = true;
                    author.clear();
                }
                ("name", true) if in_author => field = Field::AuthorName,
                ("id", true) => field = Field::Id,
                ("title", true) => field = Field::Title,
                ("summary", true) => field = Field::Summary,
                ("published", true) => field = Field::Published,
                ("doi", true) => field = Field::Doi,
                _ => field = Field::None,
            },
            Ok(Event::Text(e)) => {
                let Some(current) = entry.as_mut() else {
                    continue;
                };
                let text = e
                    .unescape()
                    .map_err(|e| SourceError::Parse(format!("XML text: {}", e)))?;
                match field {
                    Field::Id => current.id_url.push_str(&text),
                    Field::Title => current.title.push_str(&text),
                    Field::Summary => current.summary.push_str(&text),
                    Field::Published => current.published.push_str(&text),
                    Field::AuthorName => author.push_str(&text),
                    Field::Doi => current.doi.get_or_insert_with(String::new).push_str(&text),
                    Field::None => {}
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "entry" => {
                        if let Some(record) = entry.take().and_then(Entry::into_record) {
                            papers.push(record);
                        }
                    }
                    "author" if in_author => {
                        in_author = false;
                        if let Some(current) = entry.as_mut() {
                            if !author.trim().is_empty() {
                                current.authors.push(author.trim().to_string());
                            }
                        }
                    }
                    _ => {}
                }
                field = Field::None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Parse(format!("XML parse error: {}", e))),
            _ => {}
        }
    }
    Ok(papers)
}
