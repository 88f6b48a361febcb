//! PDF bytes to normalized plain text.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use lopdf::Document;
use regex::Regex;
use thiserror::Error;

use crate::failure::ErrorClass;

/// Shorter output means the document has no usable text layer.
pub const MIN_TEXT_CHARS: usize = 50;
/// A line seen on this many pages is a running header or footer.
const REPEATED_LINE_PAGES: usize = 3;

#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    #[error("cannot parse document: {0}")]
    Parse(String),
    #[error("document yielded only {length} characters of text (likely scanned or image-only)")]
    InsufficientText { length: usize },
    #[error("scratch file error: {0}")]
    Io(String),
}

impl ExtractError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Decode
    }
}

impl From<std::io::Error> for ExtractError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Extract and normalize text. CPU-bound: call from a blocking context.
///
/// The bytes are staged in a scratch file that is removed when this returns.
pub fn extract(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut scratch = tempfile::Builder::new()
        .prefix("paper-harvest-")
        .suffix(".pdf")
        .tempfile()?;
    scratch.write_all(bytes)?;
    scratch.flush()?;
    extract_file(scratch.path())
}

pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let document = Document::load(path)
        .map_err(|e| ExtractError::Parse(format!("{}: {}", path.display(), e)))?;
    if document.is_encrypted() {
        return Err(ExtractError::Parse("document is encrypted".to_string()));
    }

    let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
    let mut pages = Vec::with_capacity(page_numbers.len());
    for number in &page_numbers {
        match document.extract_text(&[*number]) {
            Ok(text) => pages.push(text),
            Err(e) => tracing::debug!("Skipping page {} of {}: {}", number, path.display(), e),
        }
    }

    let text = normalize_pages(&pages);
    tracing::info!(
        "Extracted {} characters from {} pages",
        text.len(),
        page_numbers.len()
    );
    if text.len() < MIN_TEXT_CHARS {
        return Err(ExtractError::InsufficientText { length: text.len() });
    }
    Ok(text)
}

/// Run [`extract`] on the blocking pool.
pub async fn extract_async(bytes: Vec<u8>) -> Result<String, ExtractError> {
    tokio::task::spawn_blocking(move || extract(&bytes))
        .await
        .map_err(|e| ExtractError::Parse(format!("extraction task failed: {}", e)))?
}

/// Strip boilerplate lines and collapse the rest into a single run of text.
pub fn normalize_pages(pages: &[String]) -> String {
    let page_lines: Vec<Vec<&str>> = pages
        .iter()
        .map(|p| p.lines().map(str::trim).filter(|l| !l.is_empty()).collect())
        .collect();

    let mut seen_on: HashMap<&str, usize> = HashMap::new();
    for lines in &page_lines {
        let mut distinct: Vec<&str> = lines.clone();
        distinct.sort_unstable();
        distinct.dedup();
        for line in distinct {
            *seen_on.entry(line).or_default() += 1;
        }
    }

    let kept: Vec<&str> = page_lines
        .iter()
        .flatten()
        .copied()
        .filter(|line| seen_on.get(line).copied().unwrap_or(0) < REPEATED_LINE_PAGES)
        .filter(|line| !is_boilerplate(line))
        .collect();

    let joined = kept.join("\n");
    let ascii: String = joined
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { ' ' })
        .collect();
    ascii.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_boilerplate(line: &str) -> bool {
    let lower = line.to_lowercase();
    if line.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if lower.starts_with("copyright")
        || lower.starts_with('©')
        || lower.starts_with("(c) ")
        || lower.contains("all rights reserved")
    {
        return true;
    }
    boilerplate_patterns().iter().any(|re| re.is_match(line))
}

fn boilerplate_patterns() -> &'static [Regex] {
    static PATTERNS: std::sync::OnceLock<Vec<Regex>> = std::sync::OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^page\s+\d+(\s+of\s+\d+)?$",
            r"(?i)^(https?://|www\.)\S*$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}
