use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hosts that failed certificate validation at least once.
///
/// The set only grows while the process runs. Every time a new host is added the
/// whole document is rewritten so the learned set survives restarts. A missing or
/// unreadable file degrades to an empty set instead of failing startup.
#[derive(Debug)]
pub struct DomainReputation {
    path: Option<PathBuf>,
    hosts: RwLock<BTreeMap<String, HostRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub failures: u32,
    pub last_failure: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct PersistedHost {
    host: String,
    #[serde(flatten)]
    record: HostRecord,
}

/// Accepts both the structured layout and a bare list of host names.
#[derive(Deserialize)]
#[serde(untagged)]
enum PersistedFile {
    Detailed { hosts: Vec<PersistedHost> },
    Plain(Vec<String>),
}

impl DomainReputation {
    /// Reputation store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            hosts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load the persisted host list, or start empty if it is absent or corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let hosts = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<PersistedFile>(&raw) {
                Ok(file) => {
                    let hosts = into_map(file);
                    tracing::info!(
                        "Loaded {} degraded-TLS hosts from {}",
                        hosts.len(),
                        path.display()
                    );
                    hosts
                }
                Err(e) => {
                    tracing::warn!(
                        "Ignoring corrupt degraded-TLS host file {}: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            hosts: RwLock::new(hosts),
        }
    }

    pub fn should_degrade_tls(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts
            .read()
            .map(|hosts| hosts.contains_key(&host))
            .unwrap_or(false)
    }

    /// Mark `host` as failing certificate validation. Returns true if the host was new.
    pub fn record_certificate_failure(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }

        let (added, snapshot) = {
            let Ok(mut hosts) = self.hosts.write() else {
                return false;
            };
            let now = Utc::now();
            let added = match hosts.get_mut(&host) {
                Some(record) => {
                    record.failures += 1;
                    record.last_failure = now;
                    false
                }
                None => {
                    hosts.insert(
                        host.clone(),
                        HostRecord {
                            failures: 1,
                            last_failure: now,
                        },
                    );
                    true
                }
            };
            (added, if added { Some(hosts.clone()) } else { None })
        };

        if let Some(hosts) = snapshot {
            tracing::warn!("Host {} failed certificate validation, verification disabled for it", host);
            if let Some(path) = &self.path {
                if let Err(e) = persist(path, &hosts) {
                    tracing::error!("Failed to persist degraded-TLS hosts to {}: {}", path.display(), e);
                }
            }
        }
        added
    }

    #[cfg(test)]
    pub fn record(&self, host: &str) -> Option<HostRecord> {
        let host = host.to_ascii_lowercase();
        self.hosts.read().ok()?.get(&host).cloned()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.hosts.read().map(|h| h.len()).unwrap_or(0)
    }
}

fn into_map(file: PersistedFile) -> BTreeMap<String, HostRecord> {
    match file {
        PersistedFile::Detailed { hosts } => hosts
            .into_iter()
            .map(|h| (h.host.to_ascii_lowercase(), h.record))
            .collect(),
        PersistedFile::Plain(names) => {
            let now = Utc::now();
            names
                .into_iter()
                .filter(|n| !n.trim().is_empty())
                .map(|n| {
                    (
                        n.trim().to_ascii_lowercase(),
                        HostRecord {
                            failures: 1,
                            last_failure: now,
                        },
                    )
                })
                .collect()
        }
    }
}

fn persist(path: &Path, hosts: &BTreeMap<String, HostRecord>) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let document = serde_json::json!({
        "hosts": hosts
            .iter()
            .map(|(host, record)| PersistedHost { host: host.clone(), record: record.clone() })
            .collect::<Vec<_>>(),
    });
    let body = serde_json::to_vec_pretty(&document)?;

    // Write beside the target and rename so a crash never leaves half a file.
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&body)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_host_is_not_degraded() {
        let rep = DomainReputation::in_memory();
        assert!(!rep.should_degrade_tls("example.org"));
    }

    #[test]
    fn test_failure_marks_host_and_counts() {
        let rep = DomainReputation::in_memory();
        assert!(rep.record_certificate_failure("Journal.Example.ac.id"));
        assert!(!rep.record_certificate_failure("journal.example.ac.id"));
        assert!(rep.should_degrade_tls("journal.example.ac.id"));
        assert_eq!(rep.record("journal.example.ac.id").unwrap().failures, 2);
        assert!(!rep.should_degrade_tls("other.example.ac.id"));
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("degraded_hosts.json");

        let rep = DomainReputation::load(&path);
        rep.record_certificate_failure("bad-cert.example.com");
        assert!(path.exists());

        let reloaded = DomainReputation::load(&path);
        assert!(reloaded.should_degrade_tls("bad-cert.example.com"));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("degraded_hosts.json");
        std::fs::write(&path, "{ not json").unwrap();

        let rep = DomainReputation::load(&path);
        assert_eq!(rep.len(), 0);
    }

    #[test]
    fn test_plain_host_list_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("degraded_hosts.json");
        std::fs::write(&path, r#"["ejournal.example.ac.id", "repo.example.ac.id"]"#).unwrap();

        let rep = DomainReputation::load(&path);
        assert!(rep.should_degrade_tls("repo.example.ac.id"));
        assert_eq!(rep.len(), 2);
    }
}
