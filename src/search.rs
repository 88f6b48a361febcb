use std::collections::HashSet;
use std::sync::Arc;

use crate::apis::{PaperRecord, PaperSource, YearFilter};

const PER_SOURCE_LIMIT: u32 = 20;
const TITLE_KEY_CHARS: usize = 120;
const WORD_OVERLAP: f64 = 0.7;
const NEAR_IDENTICAL: f64 = 0.95;

/// The enabled sources, in the order their results are merged.
#[derive(Clone, Default)]
pub struct SourceSet {
    sources: Vec<Arc<dyn PaperSource>>,
}

impl SourceSet {
    pub fn new(sources: Vec<Arc<dyn PaperSource>>) -> Self {
        Self { sources }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PaperSource>> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Close every breaker and clear request counters.
    pub fn reset_all(&self) {
        for source in &self.sources {
            source.throttle().reset();
        }
    }
}

/// Query every source and merge the results.
///
/// Independent sources run concurrently. Sources marked serialized run afterwards,
/// one at a time. A failing source is logged and skipped; it never aborts the others.
pub async fn search_all_sources(
    sources: &SourceSet,
    query: &str,
    years: &YearFilter,
) -> Vec<PaperRecord> {
    tracing::info!("Searching papers for {:?} (years: {})", query, years);

    let handles: Vec<_> = sources
        .iter()
        .filter(|s| !s.serialized())
        .map(|source| {
            let source = Arc::clone(source);
            let query = query.to_string();
            let years = *years;
            let name = source.name().to_string();
            (
                name,
                tokio::spawn(async move { source.search(&query, &years, PER_SOURCE_LIMIT).await }),
            )
        })
        .collect();

    let mut all_results = Vec::new();
    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(results)) => all_results.extend(results),
            Ok(Err(e)) => tracing::warn!("Source {} failed: {}", name, e),
            Err(e) => tracing::warn!("Source {} task panicked: {}", name, e),
        }
    }

    for source in sources.iter().filter(|s| s.serialized()) {
        match source.search(query, years, PER_SOURCE_LIMIT).await {
            Ok(results) => all_results.extend(results),
            Err(e) => tracing::warn!("Source {} failed: {}", source.name(), e),
        }
    }

    let total = all_results.len();
    let merged = deduplicate(all_results);
    tracing::info!("Found {} unique papers ({} before dedup)", merged.len(), total);
    merged
}

/// Collapse records whose titles describe the same paper.
///
/// First occurrence wins and keeps its title; fields it lacks are filled from the
/// duplicates. Kept records are pairwise distinct, so a second pass changes nothing.
pub fn deduplicate(records: Vec<PaperRecord>) -> Vec<PaperRecord> {
    let mut kept: Vec<(String, HashSet<String>, PaperRecord)> = Vec::new();

    for record in records {
        let key = normalize_title(&record.title);
        let words = word_set(&key);
        match kept
            .iter_mut()
            .find(|(k, w, _)| is_same_title(&key, &words, k, w))
        {
            Some((_, _, existing)) => absorb(existing, record),
            None => kept.push((key, words, record)),
        }
    }

    kept.into_iter().map(|(_, _, r)| r).collect()
}

/// Lowercase, drop punctuation, collapse whitespace and truncate.
pub fn normalize_title(title: &str) -> String {
    let cleaned = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    match cleaned.char_indices().nth(TITLE_KEY_CHARS) {
        Some((idx, _)) => cleaned[..idx].trim_end().to_string(),
        None => cleaned,
    }
}

fn word_set(key: &str) -> HashSet<String> {
    key.split_whitespace().map(str::to_string).collect()
}

fn is_same_title(a: &str, a_words: &HashSet<String>, b: &str, b_words: &HashSet<String>) -> bool {
    if a == b {
        return true;
    }
    if !a_words.is_empty() && !b_words.is_empty() {
        let overlap = a_words.intersection(b_words).count() as f64;
        let shorter = a_words.len().min(b_words.len()) as f64;
        if overlap / shorter > WORD_OVERLAP {
            return true;
        }
    }
    strsim::normalized_levenshtein(a, b) >= NEAR_IDENTICAL
}

fn absorb(kept: &mut PaperRecord, dup: PaperRecord) {
    if kept.pdf_url.is_none() {
        kept.pdf_url = dup.pdf_url;
    }
    if kept.doi.is_none() {
        kept.doi = dup.doi;
    }
    if kept.year.is_none() {
        kept.year = dup.year;
    }
    if kept.citation_count.is_none() {
        kept.citation_count = dup.citation_count;
    }
    if kept.link.is_empty() {
        kept.link = dup.link;
    }
}
