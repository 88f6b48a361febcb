use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36 Edg/121.0.0.0",
];

const HTML_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const DOCUMENT_ACCEPT: &str = "application/pdf,application/x-pdf,text/html,application/xhtml+xml,*/*;q=0.8";

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Headers for a structured API call.
pub fn api_headers(accept: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    headers
}

/// Headers that look like a person opening a search results page.
pub fn search_page_headers() -> HeaderMap {
    let mut rng = rand::thread_rng();
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers.insert(ACCEPT, HeaderValue::from_static(HTML_ACCEPT));
    let language = ["en-US,en;q=0.9", "en-US,en;q=0.9,id;q=0.8", "en;q=0.9"]
        .choose(&mut rng)
        .copied()
        .unwrap_or("en-US,en;q=0.9");
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(language));
    headers.insert(
        HeaderName::from_static("upgrade-insecure-requests"),
        HeaderValue::from_static("1"),
    );
    if rng.gen_bool(0.3) {
        let referer = [
            "https://www.google.com/",
            "https://scholar.google.com/",
            "https://duckduckgo.com/",
        ]
        .choose(&mut rng)
        .copied()
        .unwrap_or("https://www.google.com/");
        headers.insert(REFERER, HeaderValue::from_static(referer));
    }
    headers
}

/// Headers for fetching a publisher page or document during resolution.
///
/// Hosts that check the referrer get one pointing at their own front page.
pub fn document_headers(host: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(random_user_agent()));
    headers.insert(ACCEPT, HeaderValue::from_static(DOCUMENT_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    let origin = referer_origin(host);
    if let Ok(value) = HeaderValue::from_str(&format!("{}/", origin)) {
        headers.insert(REFERER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(HeaderName::from_static("origin"), value);
    }
    headers
}

fn referer_origin(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    let known = [
        ("researchgate.net", "https://www.researchgate.net"),
        ("semanticscholar.org", "https://www.semanticscholar.org"),
        ("arxiv.org", "https://arxiv.org"),
        ("springer.com", "https://link.springer.com"),
        ("sciencedirect.com", "https://www.sciencedirect.com"),
    ];
    known
        .iter()
        .find(|(suffix, _)| host == *suffix || host.ends_with(&format!(".{}", suffix)))
        .map(|(_, origin)| origin.to_string())
        .unwrap_or_else(|| format!("https://{}", host))
}
