use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Small TTL cache of search responses keyed by normalized query.
///
/// When full, the entry that expires first is evicted.
#[derive(Debug)]
pub struct QueryCache<V> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Lowercase and collapse whitespace so trivially different queries share an entry.
    pub fn key(query: &str, qualifier: &str) -> String {
        let normalized = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        format!("{}|{}", normalized, qualifier)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some((expires, value)) if Instant::now() < *expires => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, value: V) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.insert(key, (Instant::now() + self.ttl, value));
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (expires, _))| *expires)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalizes_query() {
        assert_eq!(
            QueryCache::<u32>::key("  Deep   Learning ", "all"),
            QueryCache::<u32>::key("deep learning", "all")
        );
        assert_ne!(
            QueryCache::<u32>::key("deep learning", "2020-"),
            QueryCache::<u32>::key("deep learning", "all")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = QueryCache::new(Duration::from_secs(60), 10);
        cache.insert("q".to_string(), 1);
        assert_eq!(cache.get("q"), Some(1));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get("q"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_entry_is_evicted() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("b".to_string(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("c".to_string(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }
}
