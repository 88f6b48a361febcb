//! Landing-page scanning: find the document link (or a DOI) on a publisher page.

use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Path fragments that mark navigation pages rather than documents.
pub const NON_DOCUMENT_WORDS: &[&str] = &[
    "about",
    "policies",
    "editorial",
    "contact",
    "login",
    "register",
    "help",
    "instruction",
];

/// Elements that only appear on interstitial bot checks. Page text is never
/// consulted: papers and landing pages routinely discuss CAPTCHAs.
const CHALLENGE_SELECTORS: &[&str] = &[
    "form#challenge-form",
    "#cf-challenge-running",
    "form[action*='__cf_chl']",
    "div.cf-turnstile",
    "div.g-recaptcha",
    "div.h-captcha",
    "iframe[src*='recaptcha']",
    "iframe[src*='hcaptcha']",
    "script[src*='recaptcha']",
    "script[src*='hcaptcha']",
    "form[action*='/sorry/']",
    "#gs_captcha_f",
    "#gs_captcha_ccl",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFinding {
    /// Absolute URL of something that looks like the document.
    Document(String),
    /// Bare DOI such as `10.1000/xyz`.
    Doi(String),
}

pub fn is_non_document_path(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    NON_DOCUMENT_WORDS.iter().any(|w| path.contains(w))
}

/// The first challenge element present on the page, if any.
pub fn challenge_element(html: &str) -> Option<&'static str> {
    let doc = Html::parse_document(html);
    CHALLENGE_SELECTORS.iter().copied().find(|css| {
        Selector::parse(css)
            .map(|sel| doc.select(&sel).next().is_some())
            .unwrap_or(false)
    })
}

pub fn looks_like_challenge(html: &str) -> bool {
    challenge_element(html).is_some()
}

/// Extract a DOI from free text or a `doi.org` URL.
pub fn extract_doi(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    let start = lower.find("10.")?;
    let candidate = raw[start..]
        .split(|c: char| c.is_whitespace() || c == '"' || c == '<' || c == '>' || c == '#')
        .next()?
        .trim_end_matches(['.', ',', ';', ')']);
    let (prefix, suffix) = candidate.split_once('/')?;
    if prefix.len() < 4 || suffix.is_empty() || !prefix[3..].chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    Some(candidate.to_string())
}

struct Scanner<'a> {
    doc: Html,
    page: &'a Url,
}

impl<'a> Scanner<'a> {
    fn anchors(&self, css: &str) -> Vec<ElementRef<'_>> {
        match Selector::parse(css) {
            Ok(sel) => self.doc.select(&sel).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Absolute URL for `href` unless it is excluded or points back at this page.
    fn candidate(&self, href: &str) -> Option<String> {
        let href = href.trim();
        let lower = href.to_ascii_lowercase();
        if href.is_empty()
            || href.starts_with('#')
            || lower.starts_with("javascript:")
            || lower.starts_with("mailto:")
            || NON_DOCUMENT_WORDS.iter().any(|w| lower.contains(w))
        {
            return None;
        }
        let mut absolute = self.page.join(href).ok()?;
        absolute.set_fragment(None);
        let mut page = self.page.clone();
        page.set_fragment(None);
        if absolute == page {
            return None;
        }
        Some(absolute.to_string())
    }

    fn first(&self, css: &str, accept: impl Fn(&ElementRef, &str) -> bool) -> Option<String> {
        self.anchors(css).into_iter().find_map(|a| {
            let href = a.value().attr("href")?;
            if !accept(&a, &href.to_ascii_lowercase()) {
                return None;
            }
            self.candidate(href)
        })
    }

    /// Explicit view/download controls.
    fn controls(&self) -> Option<String> {
        let by_class = self.first(
            "a.file, a.pdf, a.obj_galley_link, a[class*=\"pdf\"], a[class*=\"download\"]",
            |a, href| anchor_text(a).contains("pdf") || href.ends_with(".pdf") || href.contains("/download/"),
        );
        by_class.or_else(|| {
            self.first("a[href]", |a, href| {
                let text = anchor_text(a);
                let labelled = ["pdf", "download", "view", "fulltext", "full text"]
                    .iter()
                    .any(|w| text.contains(w));
                labelled && ["pdf", "view", "download", "file"].iter().any(|w| href.contains(w))
            })
        })
    }

    fn meta(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| {
            let css = format!("meta[name=\"{}\"], meta[property=\"{}\"]", name, name);
            self.anchors(&css)
                .into_iter()
                .find_map(|m| m.value().attr("content").map(str::trim).filter(|c| !c.is_empty()).map(str::to_string))
        })
    }

    fn document_meta(&self) -> Option<String> {
        let content = self.meta(&["citation_pdf_url"])?;
        let mut url = self.page.join(&content).ok()?;
        url.set_fragment(None);
        Some(url.to_string())
    }

    /// Links whose path says document.
    fn document_paths(&self) -> Option<String> {
        self.first("a[href]", |_, href| {
            let path = href.split(['?', '#']).next().unwrap_or_default();
            path.ends_with(".pdf")
        })
        .or_else(|| {
            self.first("a[href]", |_, href| {
                href.contains("/download")
                    || href.contains("viewfile")
                    || href.contains("fulltext")
                    || (href.contains("/view/") && href.contains("article"))
            })
        })
        .or_else(|| {
            self.first(
                "a[type=\"application/pdf\"], a[data-mime-type=\"application/pdf\"]",
                |_, _| true,
            )
        })
    }

    fn doi(&self) -> Option<String> {
        self.meta(&["citation_doi", "dc.identifier", "DC.identifier", "prism.doi"])
            .and_then(|c| extract_doi(&c))
            .or_else(|| {
                self.anchors("a[href*=\"doi.org/10.\"]")
                    .into_iter()
                    .find_map(|a| a.value().attr("href").and_then(extract_doi))
            })
    }
}

fn anchor_text(a: &ElementRef) -> String {
    a.text().collect::<String>().to_lowercase()
}

/// Search a landing page for the document, in priority order:
/// view/download controls, the `citation_pdf_url` tag, then links whose path
/// indicates a document. Falls back to a DOI if no document link exists.
pub fn scan_landing_page(html: &str, page: &Url) -> Option<PageFinding> {
    let scanner = Scanner {
        doc: Html::parse_document(html),
        page,
    };

    if let Some(url) = scanner.controls() {
        tracing::debug!("Document control found on {}: {}", page, url);
        return Some(PageFinding::Document(url));
    }
    if let Some(url) = scanner.document_meta() {
        tracing::debug!("citation_pdf_url found on {}: {}", page, url);
        return Some(PageFinding::Document(url));
    }
    if let Some(url) = scanner.document_paths() {
        tracing::debug!("Document-like link found on {}: {}", page, url);
        return Some(PageFinding::Document(url));
    }
    scanner.doi().map(PageFinding::Doi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Url {
        Url::parse("https://host/paper/42").unwrap()
    }

    #[test]
    fn test_file_control_resolves_relative_link() {
        let html = r#"<html><body><a class="file pdf" href="/files/123.pdf"></a></body></html>"#;
        assert_eq!(
            scan_landing_page(html, &page()),
            Some(PageFinding::Document("https://host/files/123.pdf".to_string()))
        );
    }

    #[test]
    fn test_meta_tag_beats_plain_links() {
        let html = r#"<html><head>
            <meta name="citation_pdf_url" content="https://cdn.host/final.pdf">
            </head><body><a href="/supplement.pdf">Supplement</a></body></html>"#;
        assert_eq!(
            scan_landing_page(html, &page()),
            Some(PageFinding::Document("https://cdn.host/final.pdf".to_string()))
        );
    }

    #[test]
    fn test_ojs_view_button() {
        let html = r#"<a href="/index.php/jurnal/article/view/55/40" class="obj_galley_link">PDF</a>"#;
        assert_eq!(
            scan_landing_page(html, &page()),
            Some(PageFinding::Document(
                "https://host/index.php/jurnal/article/view/55/40".to_string()
            ))
        );
    }

    #[test]
    fn test_excluded_and_self_links_are_skipped() {
        let html = r#"
            <a href="/about/editorialPolicies.pdf">Policies PDF</a>
            <a href="/paper/42">View article</a>
            <a class="pdf" href="/paper/42#pdf">PDF</a>
            <a href="/login?next=/files/1.pdf">Login to download PDF</a>"#;
        assert_eq!(scan_landing_page(html, &page()), None);
    }

    #[test]
    fn test_doi_fallback() {
        let html = r#"<head><meta name="citation_doi" content="10.5555/abc.123"></head>"#;
        assert_eq!(
            scan_landing_page(html, &page()),
            Some(PageFinding::Doi("10.5555/abc.123".to_string()))
        );

        let html = r#"<p>See <a href="https://doi.org/10.1000/xyz-9">publisher</a></p>"#;
        assert_eq!(
            scan_landing_page(html, &page()),
            Some(PageFinding::Doi("10.1000/xyz-9".to_string()))
        );
    }

    #[test]
    fn test_challenge_needs_a_challenge_element() {
        let article = r#"<html><head><title>Breaking text CAPTCHA with deep learning</title></head>
            <body><p>We show the model is not a robot detector but a CAPTCHA solver.</p>
            <p>Unusual traffic patterns are discussed in section 4.</p></body></html>"#;
        assert!(!looks_like_challenge(article));

        let recaptcha = r#"<html><body><form action="/verify">
            <div class="g-recaptcha" data-sitekey="k"></div></form>
            <script src="https://www.google.com/recaptcha/api.js"></script></body></html>"#;
        assert_eq!(challenge_element(recaptcha), Some("div.g-recaptcha"));

        let cloudflare = r#"<html><body><form id="challenge-form" action="/cdn-cgi/x?__cf_chl_f_tk=1"></form></body></html>"#;
        assert!(looks_like_challenge(cloudflare));

        let sorry = r#"<html><body><form action="https://www.google.com/sorry/index" method="post"></form></body></html>"#;
        assert!(looks_like_challenge(sorry));
    }

    #[test]
    fn test_extract_doi() {
        assert_eq!(extract_doi("doi:10.1000/182").as_deref(), Some("10.1000/182"));
        assert_eq!(
            extract_doi("https://doi.org/10.1109/5.771073.").as_deref(),
            Some("10.1109/5.771073")
        );
        assert_eq!(extract_doi("version 10.2 of the software"), None);
        assert_eq!(extract_doi("no identifier"), None);
    }

    #[test]
    fn test_non_document_path() {
        assert!(is_non_document_path(&Url::parse("https://j.example/index.php/j/about/contact").unwrap()));
        assert!(!is_non_document_path(&Url::parse("https://j.example/files/123.pdf").unwrap()));
    }
}
