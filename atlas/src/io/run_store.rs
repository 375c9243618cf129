//! Durable run records (`<data_dir>/runs/<id>.json`).
//!
//! One JSON document per run holds the summary header, the ordered event log
//! and, once finished, the final artifacts. Every mutation is a
//! read-modify-write under a per-run async lock, so overlapping appends for
//! the same run never lose updates while different runs proceed in parallel.
//!
//! Reads tolerate torn files through the recovery chain in
//! [`crate::core::recovery`]; a record that needed repair is written back
//! once so the next read is clean. A record beyond repair is replaced by a
//! minimal `error` record (the original bytes are kept as
//! `<id>.json.corrupt`) so the run never disappears from listings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::events::{EndedReason, RunEvent};
use crate::core::recovery::{RepairStage, recover};
use crate::core::types::{State, Transition};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::keyed_lock::KeyedLocks;

const EVENTS_KEY: &str = "events";
const UNTITLED: &str = "Untitled run";
const NAME_LIMIT: usize = 80;

/// Persisted run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

/// One logged event with its server-assigned timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRunEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Final outputs attached when a run completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifacts {
    pub ended_reason: EndedReason,
    pub steps_taken: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_met_reason: Option<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

/// The full durable record of a run.
///
/// `events` and `artifacts` are serialized last so a torn write damages the
/// log rather than the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub start_url: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub beam_size: usize,
    #[serde(default)]
    pub max_steps: u32,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_reason: Option<EndedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub events: Vec<StoredRunEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<RunArtifacts>,
}

impl StoredRun {
    /// The event that ended this run, or `None` while it is still running.
    ///
    /// Prefers the logged terminal event; otherwise rebuilds one from the
    /// header and artifacts.
    pub fn terminal_event(&self) -> Option<RunEvent> {
        if self.status == RunStatus::Running {
            return None;
        }
        if let Some(last) = self.events.last()
            && last.event.is_terminal()
        {
            return Some(last.event.clone());
        }
        let artifacts = self.artifacts.as_ref();
        let ended_reason = self
            .ended_reason
            .or_else(|| artifacts.map(|artifacts| artifacts.ended_reason));
        match (self.status, ended_reason) {
            (RunStatus::Completed, Some(ended_reason)) => Some(RunEvent::Done {
                ended_reason,
                steps: artifacts.map_or(0, |artifacts| artifacts.steps_taken),
                goal_met_reason: artifacts.and_then(|artifacts| artifacts.goal_met_reason.clone()),
                final_state: artifacts.and_then(|artifacts| artifacts.final_state.clone()),
            }),
            _ => Some(RunEvent::Error {
                message: self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "run ended without a recorded reason".to_string()),
            }),
        }
    }
}

/// A run record without its event log and artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub name: String,
    pub goal: String,
    pub start_url: String,
    pub mode: String,
    pub env: String,
    pub beam_size: usize,
    pub max_steps: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_reason: Option<EndedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&StoredRun> for RunSummary {
    fn from(run: &StoredRun) -> Self {
        Self {
            id: run.id.clone(),
            name: run.name.clone(),
            goal: run.goal.clone(),
            start_url: run.start_url.clone(),
            mode: run.mode.clone(),
            env: run.env.clone(),
            beam_size: run.beam_size,
            max_steps: run.max_steps,
            status: run.status,
            created_at: run.created_at,
            updated_at: run.updated_at,
            ended_reason: run.ended_reason,
            error_message: run.error_message.clone(),
        }
    }
}

/// Parameters for a new run record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRunOptions {
    /// Defaults to the goal, shortened.
    pub name: Option<String>,
    pub goal: String,
    pub start_url: String,
    pub mode: String,
    pub env: String,
    pub beam_size: usize,
    pub max_steps: u32,
}

enum Loaded {
    Intact(StoredRun),
    Repaired(StoredRun, RepairStage),
    /// Nothing salvageable; holds the synthesized record and the raw bytes.
    Synthesized(StoredRun, String),
}

impl Loaded {
    fn run(&self) -> &StoredRun {
        match self {
            Loaded::Intact(run) | Loaded::Repaired(run, _) | Loaded::Synthesized(run, _) => run,
        }
    }

    fn into_run(self) -> StoredRun {
        match self {
            Loaded::Intact(run) | Loaded::Repaired(run, _) | Loaded::Synthesized(run, _) => run,
        }
    }
}

/// File-backed run store.
#[derive(Debug)]
pub struct RunStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl RunStore {
    /// The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn run_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn create_run(&self, options: CreateRunOptions) -> Result<StoredRun> {
        let now = Utc::now();
        let name = options
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_name(&options.goal));
        let run = StoredRun {
            id: Uuid::new_v4().to_string(),
            name,
            goal: options.goal,
            start_url: options.start_url,
            mode: options.mode,
            env: options.env,
            beam_size: options.beam_size,
            max_steps: options.max_steps,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
            ended_reason: None,
            error_message: None,
            events: Vec::new(),
            artifacts: None,
        };
        let _guard = self.locks.lock(&run.id).await;
        write_json_atomic(&self.run_path(&run.id), &run).await?;
        info!(run_id = %run.id, "run created");
        Ok(run)
    }

    /// Append `event` with a server timestamp.
    ///
    /// A missing record drops the event instead of failing the caller.
    pub async fn append_event(&self, id: &str, event: RunEvent) -> Result<()> {
        let kind = event.kind();
        let updated = self
            .update(id, |run| {
                let now = Utc::now();
                run.events.push(StoredRunEvent { ts: now, event });
                run.updated_at = now;
            })
            .await?;
        if updated.is_none() {
            debug!(run_id = id, kind, "run record missing, event dropped");
        }
        Ok(())
    }

    /// Terminal success. Overwrites any earlier terminal fields.
    pub async fn mark_completed(&self, id: &str, artifacts: RunArtifacts) -> Result<()> {
        let updated = self
            .update(id, |run| {
                run.status = RunStatus::Completed;
                run.ended_reason = Some(artifacts.ended_reason);
                run.error_message = None;
                run.artifacts = Some(artifacts);
                run.updated_at = Utc::now();
            })
            .await?;
        if updated.is_none() {
            warn!(run_id = id, "run record missing, completion dropped");
        }
        Ok(())
    }

    /// Terminal failure. Overwrites any earlier terminal fields.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        let updated = self
            .update(id, |run| {
                run.status = RunStatus::Error;
                run.ended_reason = Some(EndedReason::Error);
                run.error_message = Some(message.to_string());
                run.updated_at = Utc::now();
            })
            .await?;
        if updated.is_none() {
            warn!(run_id = id, "run record missing, error dropped");
        }
        Ok(())
    }

    /// Rename a run; blank names are ignored. Returns the record if it exists.
    pub async fn rename_run(&self, id: &str, name: &str) -> Result<Option<StoredRun>> {
        let name = name.trim();
        if name.is_empty() {
            return self.get_run(id).await;
        }
        self.update(id, |run| {
            run.name = name.to_string();
            run.updated_at = Utc::now();
        })
        .await
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<StoredRun>> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        let Some(loaded) = self.load(id).await? else {
            return Ok(None);
        };
        self.heal(id, &loaded).await;
        Ok(Some(loaded.into_run()))
    }

    /// Summaries of every run, newest first.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.dir.display()));
            }
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(id) = path.file_stem().and_then(|stem| stem.to_str())
                && validate_id(id).is_ok()
            {
                ids.push(id.to_string());
            }
        }

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_run(&id).await {
                Ok(Some(run)) => summaries.push(RunSummary::from(&run)),
                Ok(None) => {}
                Err(err) => warn!(run_id = %id, error = %format!("{err:#}"), "skipping unreadable run"),
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }

    async fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut StoredRun),
    ) -> Result<Option<StoredRun>> {
        validate_id(id)?;
        let _guard = self.locks.lock(id).await;
        let Some(loaded) = self.load(id).await? else {
            return Ok(None);
        };
        if let Loaded::Synthesized(_, raw) = &loaded {
            self.preserve_corrupt(id, raw).await;
        }
        let mut run = loaded.into_run();
        apply(&mut run);
        write_json_atomic(&self.run_path(id), &run).await?;
        Ok(Some(run))
    }

    /// Read and recover a record. Caller holds the run's lock.
    async fn load(&self, id: &str) -> Result<Option<Loaded>> {
        let path = self.run_path(id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                // Not UTF-8: nothing the JSON scanners can use.
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("read {}", path.display()))?;
                let raw = String::from_utf8_lossy(&bytes).into_owned();
                let run = synthesize(id, &path).await;
                return Ok(Some(Loaded::Synthesized(run, raw)));
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };

        match recover::<StoredRun>(&raw, EVENTS_KEY) {
            Some(recovered) => {
                let mut run = recovered.value;
                run.id = id.to_string();
                Ok(Some(match recovered.repair {
                    None => Loaded::Intact(run),
                    Some(stage) => {
                        warn!(run_id = id, ?stage, "recovered damaged run record");
                        Loaded::Repaired(run, stage)
                    }
                }))
            }
            None => {
                warn!(run_id = id, path = %path.display(), "run record unrecoverable, synthesizing");
                let run = synthesize(id, &path).await;
                Ok(Some(Loaded::Synthesized(run, raw)))
            }
        }
    }

    /// Write a repaired record back. Failures only cost a repeat repair.
    async fn heal(&self, id: &str, loaded: &Loaded) {
        match loaded {
            Loaded::Intact(_) => return,
            Loaded::Repaired(_, stage) => debug!(run_id = id, ?stage, "healing run record"),
            Loaded::Synthesized(_, raw) => self.preserve_corrupt(id, raw).await,
        }
        match write_json_atomic(&self.run_path(id), loaded.run()).await {
            Ok(()) => debug!(run_id = id, "healed run record"),
            Err(err) => warn!(run_id = id, error = %format!("{err:#}"), "failed to heal run record"),
        }
    }

    async fn preserve_corrupt(&self, id: &str, raw: &str) {
        let path = self.dir.join(format!("{id}.json.corrupt"));
        if let Err(err) = write_atomic(&path, raw).await {
            warn!(run_id = id, error = %format!("{err:#}"), "failed to preserve corrupt run record");
        }
    }
}

/// Minimal error record standing in for an unreadable file.
async fn synthesize(id: &str, path: &Path) -> StoredRun {
    let now = Utc::now();
    let created_at = match tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified),
        Err(_) => now,
    };
    StoredRun {
        id: id.to_string(),
        name: id.to_string(),
        goal: String::new(),
        start_url: String::new(),
        mode: String::new(),
        env: String::new(),
        beam_size: 0,
        max_steps: 0,
        status: RunStatus::Error,
        created_at,
        updated_at: now,
        ended_reason: Some(EndedReason::Error),
        error_message: Some("run record was unreadable and has been reset".to_string()),
        events: Vec::new(),
        artifacts: None,
    }
}

fn default_name(goal: &str) -> String {
    let goal = goal.split_whitespace().collect::<Vec<_>>().join(" ");
    if goal.is_empty() {
        return UNTITLED.to_string();
    }
    match goal.char_indices().nth(NAME_LIMIT) {
        Some((cut, _)) => format!("{}…", goal[..cut].trim_end()),
        None => goal,
    }
}

/// Run ids become file names; reject anything that could escape the directory.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("run id cannot be empty");
    }
    if id.contains(['/', '\\', '\0']) || id.contains("..") || id.chars().any(char::is_control) {
        bail!("run id contains invalid characters: {id:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::events::Plan;

    fn options(goal: &str) -> CreateRunOptions {
        CreateRunOptions {
            name: None,
            goal: goal.to_string(),
            start_url: "https://shop.test".to_string(),
            mode: "atlas".to_string(),
            env: "local".to_string(),
            beam_size: 3,
            max_steps: 10,
        }
    }

    fn plan_event(note: &str) -> RunEvent {
        RunEvent::Plan {
            plan: Plan {
                summary: note.to_string(),
                steps: vec!["a {tricky] step".to_string()],
            },
        }
    }

    #[tokio::test]
    async fn create_append_complete_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path().join("runs"));

        let run = store.create_run(options("buy socks")).await.expect("create");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.name, "buy socks");

        store
            .append_event(&run.id, plan_event("first"))
            .await
            .expect("append");
        store
            .mark_completed(
                &run.id,
                RunArtifacts {
                    ended_reason: EndedReason::GoalMet,
                    steps_taken: 1,
                    final_state: None,
                    goal_met_reason: Some("done".to_string()),
                    transitions: Vec::new(),
                },
            )
            .await
            .expect("complete");

        let loaded = store.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.ended_reason, Some(EndedReason::GoalMet));
        assert_eq!(loaded.events.len(), 1);
        assert!(loaded.updated_at >= loaded.created_at);
        assert!(loaded.artifacts.is_some());
    }

    #[tokio::test]
    async fn error_after_completion_keeps_event_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let run = store.create_run(options("goal")).await.expect("create");
        store
            .append_event(&run.id, plan_event("p"))
            .await
            .expect("append");
        store.mark_error(&run.id, "boom").await.expect("error");

        let loaded = store.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(loaded.status, RunStatus::Error);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
        assert_eq!(loaded.events.len(), 1);
    }

    #[tokio::test]
    async fn rename_ignores_blank_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let run = store.create_run(options("goal")).await.expect("create");

        let renamed = store
            .rename_run(&run.id, "  Checkout flow ")
            .await
            .expect("rename")
            .expect("exists");
        assert_eq!(renamed.name, "Checkout flow");

        let unchanged = store
            .rename_run(&run.id, "   ")
            .await
            .expect("rename")
            .expect("exists");
        assert_eq!(unchanged.name, "Checkout flow");
    }

    #[tokio::test]
    async fn missing_run_is_none_and_append_is_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        assert!(store.get_run("nope").await.expect("get").is_none());
        store
            .append_event("nope", plan_event("x"))
            .await
            .expect("dropped silently");
        assert!(!store.run_path("nope").exists());
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        assert!(store.get_run("../escape").await.is_err());
        assert!(store.get_run("").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_appends_are_serialized() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(RunStore::new(temp.path()));
        let run = store.create_run(options("goal")).await.expect("create");

        let appends: Vec<_> = (0..25)
            .map(|idx| {
                let store = Arc::clone(&store);
                let id = run.id.clone();
                tokio::spawn(async move { store.append_event(&id, plan_event(&idx.to_string())).await })
            })
            .collect();
        for append in appends {
            append.await.expect("join").expect("append");
        }

        let loaded = store.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(loaded.events.len(), 25);
        let mut notes: Vec<String> = loaded
            .events
            .iter()
            .map(|stored| match &stored.event {
                RunEvent::Plan { plan } => plan.summary.clone(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        notes.sort();
        notes.dedup();
        assert_eq!(notes.len(), 25);
    }

    #[tokio::test]
    async fn truncated_events_recover_header_and_heal_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let run = store.create_run(options("keep me")).await.expect("create");
        for idx in 0..3 {
            store
                .append_event(&run.id, plan_event(&format!("event {idx}")))
                .await
                .expect("append");
        }

        let path = store.run_path(&run.id);
        let full = std::fs::read_to_string(&path).expect("read");
        let events_at = full.find("\"events\"").expect("events key");
        let cut = events_at + (full.len() - events_at) / 2;
        std::fs::write(&path, &full[..cut]).expect("truncate");

        let recovered = store.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(recovered.goal, "keep me");
        assert_eq!(recovered.max_steps, 10);
        assert_eq!(recovered.status, RunStatus::Running);

        let healed = std::fs::read_to_string(&path).expect("read healed");
        let reparsed: StoredRun = serde_json::from_str(&healed).expect("healed parses");
        assert_eq!(reparsed.goal, "keep me");

        let listed = store.list_runs().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, run.id);
    }

    #[tokio::test]
    async fn tear_inside_artifacts_keeps_the_event_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let run = store.create_run(options("finish me")).await.expect("create");
        for idx in 0..3 {
            store
                .append_event(&run.id, plan_event(&format!("event {idx}")))
                .await
                .expect("append");
        }
        store
            .mark_completed(
                &run.id,
                RunArtifacts {
                    ended_reason: EndedReason::FlowEnd,
                    steps_taken: 3,
                    final_state: None,
                    goal_met_reason: Some("receipt page reached".to_string()),
                    transitions: Vec::new(),
                },
            )
            .await
            .expect("complete");

        let path = store.run_path(&run.id);
        let full = std::fs::read_to_string(&path).expect("read");
        let cut = full.find("\"artifacts\"").expect("artifacts key") + 30;
        std::fs::write(&path, &full[..cut]).expect("truncate");

        let recovered = store.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(recovered.status, RunStatus::Completed);
        assert_eq!(recovered.ended_reason, Some(EndedReason::FlowEnd));
        assert_eq!(recovered.events.len(), 3);
        assert!(recovered.artifacts.is_none());

        let healed: StoredRun =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read healed"))
                .expect("healed parses");
        assert_eq!(healed.events.len(), 3);
    }

    #[tokio::test]
    async fn unrecoverable_record_is_synthesized_and_preserved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        std::fs::write(store.run_path("broken"), "{\"id\": \"bro").expect("write");

        let run = store.get_run("broken").await.expect("get").expect("exists");
        assert_eq!(run.status, RunStatus::Error);
        assert!(run.events.is_empty());
        assert!(temp.path().join("broken.json.corrupt").exists());

        let listed = store.list_runs().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn terminal_event_comes_from_log_or_header() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());

        let live = store.create_run(options("live")).await.expect("create");
        assert_eq!(live.terminal_event(), None);

        let completed = store.create_run(options("done")).await.expect("create");
        store
            .mark_completed(
                &completed.id,
                RunArtifacts {
                    ended_reason: EndedReason::JudgeSatisfied,
                    steps_taken: 4,
                    final_state: None,
                    goal_met_reason: None,
                    transitions: Vec::new(),
                },
            )
            .await
            .expect("complete");
        let completed = store.get_run(&completed.id).await.expect("get").expect("exists");
        assert!(matches!(
            completed.terminal_event(),
            Some(RunEvent::Done {
                ended_reason: EndedReason::JudgeSatisfied,
                steps: 4,
                ..
            })
        ));

        let failed = store.create_run(options("fail")).await.expect("create");
        store
            .append_event(
                &failed.id,
                RunEvent::Error {
                    message: "logged".to_string(),
                },
            )
            .await
            .expect("append");
        store.mark_error(&failed.id, "header").await.expect("error");
        let failed = store.get_run(&failed.id).await.expect("get").expect("exists");
        assert_eq!(
            failed.terminal_event(),
            Some(RunEvent::Error {
                message: "logged".to_string()
            })
        );
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let older = store.create_run(options("older")).await.expect("create");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = store.create_run(options("newer")).await.expect("create");

        let listed = store.list_runs().await.expect("list");
        let ids: Vec<&str> = listed.iter().map(|run| run.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
    }

    #[test]
    fn default_name_shortens_long_goals() {
        assert_eq!(default_name("  "), UNTITLED);
        assert_eq!(default_name("book\na   flight"), "book a flight");
        let long = "x".repeat(120);
        let name = default_name(&long);
        assert_eq!(name.chars().count(), NAME_LIMIT + 1);
        assert!(name.ends_with('…'));
    }
}
