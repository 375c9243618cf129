//! Host-partitioned persistence for transitions and semantic rules.
//!
//! Knowledge is best effort: reads of a missing or unreadable host record
//! yield empty collections, and write failures are reported to the caller
//! (the cache's background writer) which logs them and moves on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::core::types::Transition;
use crate::io::atomic::write_json_atomic;
use crate::io::keyed_lock::KeyedLocks;

/// Partition used when a locator has no recognizable host.
pub const UNKNOWN_HOST: &str = "unknown";

/// A learned, host-scoped hint for the policy layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticRule {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SemanticRule {
    /// Rule whose id is derived from its whitespace-normalized text, so the
    /// same lesson learned twice upserts one record.
    pub fn from_text(text: &str) -> Self {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let digest = Sha256::digest(normalized.to_lowercase().as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(16);
        let now = Utc::now();
        Self {
            id,
            text: normalized,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Everything persisted for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostKnowledge {
    pub host: String,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub rules: Vec<SemanticRule>,
}

impl HostKnowledge {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            ..Self::default()
        }
    }

    fn upsert_transition(&mut self, transition: &Transition) {
        match self.transitions.iter_mut().find(|existing| {
            existing.from_key == transition.from_key && existing.action_key == transition.action_key
        }) {
            Some(existing) => *existing = transition.clone(),
            None => self.transitions.push(transition.clone()),
        }
    }

    fn upsert_rule(&mut self, rule: &SemanticRule) {
        match self.rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => {
                existing.text = rule.text.clone();
                existing.updated_at = rule.updated_at;
            }
            None => self.rules.push(rule.clone()),
        }
    }
}

/// Durable, host-partitioned knowledge persistence.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// All transitions recorded for `host`; empty when nothing is readable.
    async fn load_transitions(&self, host: &str) -> Vec<Transition>;
    /// Upsert by `(from_key, action_key)`.
    async fn record_transition(&self, host: &str, transition: &Transition) -> Result<()>;
    async fn get_semantic_rules(&self, host: &str) -> Vec<SemanticRule>;
    /// Upsert by rule id.
    async fn record_semantic_rule(&self, host: &str, rule: &SemanticRule) -> Result<()>;
    async fn list_hosts(&self) -> Vec<String>;
}

/// Partition key for a state locator.
///
/// URLs map to their lowercase host (plus an explicit port); anything else
/// maps to its leading path segment, sanitized.
pub fn host_for(locator: &str) -> String {
    if let Ok(url) = Url::parse(locator)
        && let Some(host) = url.host_str()
    {
        let host = host.to_ascii_lowercase();
        return match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
    }
    let head = locator
        .split(['/', '#', '?'])
        .find(|segment| !segment.is_empty())
        .unwrap_or_default();
    let sanitized = sanitize(head);
    if sanitized.is_empty() {
        UNKNOWN_HOST.to_string()
    } else {
        sanitized
    }
}

fn sanitize(value: &str) -> String {
    value
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One JSON document per host under a knowledge directory.
#[derive(Debug)]
pub struct FileKnowledgeStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl FileKnowledgeStore {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn host_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(host)))
    }

    async fn load(&self, host: &str) -> HostKnowledge {
        let path = self.host_path(host);
        match read_host_file(&path).await {
            Ok(Some(knowledge)) => knowledge,
            Ok(None) => HostKnowledge::new(host),
            Err(err) => {
                warn!(host, path = %path.display(), error = %format!("{err:#}"), "unreadable knowledge record, treating as empty");
                HostKnowledge::new(host)
            }
        }
    }

    async fn update(&self, host: &str, apply: impl FnOnce(&mut HostKnowledge)) -> Result<()> {
        let _guard = self.locks.lock(host).await;
        let mut knowledge = self.load(host).await;
        apply(&mut knowledge);
        let path = self.host_path(host);
        write_json_atomic(&path, &knowledge)
            .await
            .with_context(|| format!("persist knowledge for {host}"))
    }
}

async fn read_host_file(path: &Path) -> Result<Option<HostKnowledge>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let knowledge =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(knowledge))
}

#[async_trait]
impl KnowledgeStore for FileKnowledgeStore {
    async fn load_transitions(&self, host: &str) -> Vec<Transition> {
        let transitions = self.load(host).await.transitions;
        debug!(host, count = transitions.len(), "loaded transitions");
        transitions
    }

    async fn record_transition(&self, host: &str, transition: &Transition) -> Result<()> {
        self.update(host, |knowledge| knowledge.upsert_transition(transition))
            .await
    }

    async fn get_semantic_rules(&self, host: &str) -> Vec<SemanticRule> {
        self.load(host).await.rules
    }

    async fn record_semantic_rule(&self, host: &str, rule: &SemanticRule) -> Result<()> {
        self.update(host, |knowledge| knowledge.upsert_rule(rule)).await
    }

    async fn list_hosts(&self) -> Vec<String> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut hosts = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_host_file(&path).await {
                Ok(Some(knowledge)) => hosts.push(knowledge.host),
                _ => {
                    if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                        hosts.push(stem.to_string());
                    }
                }
            }
        }
        hosts.sort();
        hosts
    }
}

/// In-process knowledge store.
#[derive(Debug, Default)]
pub struct MemoryKnowledgeStore {
    hosts: RwLock<HashMap<String, HostKnowledge>>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn load_transitions(&self, host: &str) -> Vec<Transition> {
        self.hosts
            .read()
            .await
            .get(host)
            .map(|knowledge| knowledge.transitions.clone())
            .unwrap_or_default()
    }

    async fn record_transition(&self, host: &str, transition: &Transition) -> Result<()> {
        self.hosts
            .write()
            .await
            .entry(host.to_string())
            .or_insert_with(|| HostKnowledge::new(host))
            .upsert_transition(transition);
        Ok(())
    }

    async fn get_semantic_rules(&self, host: &str) -> Vec<SemanticRule> {
        self.hosts
            .read()
            .await
            .get(host)
            .map(|knowledge| knowledge.rules.clone())
            .unwrap_or_default()
    }

    async fn record_semantic_rule(&self, host: &str, rule: &SemanticRule) -> Result<()> {
        self.hosts
            .write()
            .await
            .entry(host.to_string())
            .or_insert_with(|| HostKnowledge::new(host))
            .upsert_rule(rule);
        Ok(())
    }

    async fn list_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.read().await.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{State, uncertainty_for};

    fn transition(from: &str, action: &str, visits: u32) -> Transition {
        let now = Utc::now();
        Transition {
            from_key: from.to_string(),
            action_key: action.to_string(),
            to_state: State::new("https://a.test/next", Vec::new()),
            delta: None,
            uncertainty: uncertainty_for(visits),
            visits,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn host_for_urls_and_plain_locators() {
        assert_eq!(host_for("https://Shop.Example.com/cart?x=1"), "shop.example.com");
        assert_eq!(host_for("http://localhost:3000/"), "localhost:3000");
        assert_eq!(host_for("app/screens/login"), "app");
        assert_eq!(host_for(""), UNKNOWN_HOST);
    }

    #[tokio::test]
    async fn missing_host_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileKnowledgeStore::new(temp.path().join("knowledge"));
        assert!(store.load_transitions("a.test").await.is_empty());
        assert!(store.get_semantic_rules("a.test").await.is_empty());
        assert!(store.list_hosts().await.is_empty());
    }

    #[tokio::test]
    async fn unreadable_host_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileKnowledgeStore::new(temp.path());
        std::fs::write(store.host_path("a.test"), "{not json").expect("write");
        assert!(store.load_transitions("a.test").await.is_empty());
    }

    #[tokio::test]
    async fn transitions_upsert_by_pair() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileKnowledgeStore::new(temp.path().join("knowledge"));

        store
            .record_transition("a.test", &transition("s1", "click", 1))
            .await
            .expect("first");
        store
            .record_transition("a.test", &transition("s1", "click", 2))
            .await
            .expect("second");
        store
            .record_transition("a.test", &transition("s2", "click", 1))
            .await
            .expect("third");

        let loaded = store.load_transitions("a.test").await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].visits, 2);
        assert_eq!(store.list_hosts().await, vec!["a.test".to_string()]);
    }

    #[tokio::test]
    async fn rules_upsert_by_id() {
        let store = MemoryKnowledgeStore::new();
        let rule = SemanticRule::from_text("Date  pickers need a click first");
        let same = SemanticRule::from_text("date pickers need a click first");
        assert_eq!(rule.id, same.id);

        store.record_semantic_rule("a.test", &rule).await.expect("record");
        store.record_semantic_rule("a.test", &same).await.expect("record");

        let rules = store.get_semantic_rules("a.test").await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].text, "date pickers need a click first");
    }

    #[tokio::test]
    async fn concurrent_file_writes_keep_every_transition() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(FileKnowledgeStore::new(temp.path()));
        let writes = (0..8).map(|idx| {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .record_transition("a.test", &transition(&format!("s{idx}"), "click", 1))
                    .await
            })
        });
        for write in writes.collect::<Vec<_>>() {
            write.await.expect("join").expect("write");
        }
        assert_eq!(store.load_transitions("a.test").await.len(), 8);
    }
}
