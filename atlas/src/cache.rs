//! Cognitive map: a confidence-weighted cache of observed transitions.
//!
//! Edges are keyed by `(state key, action key)`. Every observation bumps the
//! visit counter and recomputes `uncertainty = 1 / (1 + visits)`. When a
//! [`KnowledgeStore`] is attached, hosts are hydrated lazily and every
//! record is written through on a background task, so persistence never
//! blocks or fails the caller.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{OnceCell, mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::types::{Action, PLACEHOLDER_SCHEME, State, Transition, uncertainty_for};
use crate::io::knowledge_store::{KnowledgeStore, SemanticRule, host_for};

type EdgeKey = (String, String);

enum PersistJob {
    Transition { host: String, transition: Transition },
    Rule { host: String, rule: SemanticRule },
    Flush(oneshot::Sender<()>),
}

/// In-memory transition cache with optional write-through persistence.
pub struct TransitionCache {
    edges: Mutex<HashMap<EdgeKey, Transition>>,
    loaded_hosts: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    store: Option<Arc<dyn KnowledgeStore>>,
    writer: Option<mpsc::UnboundedSender<PersistJob>>,
}

impl Default for TransitionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionCache {
    /// Cache without persistence.
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
            loaded_hosts: Mutex::new(HashMap::new()),
            store: None,
            writer: None,
        }
    }

    /// Cache backed by `store`. Spawns the background writer, so this must be
    /// called within a tokio runtime.
    pub fn with_store(store: Arc<dyn KnowledgeStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&store), rx));
        Self {
            store: Some(store),
            writer: Some(tx),
            ..Self::new()
        }
    }

    fn edges(&self) -> MutexGuard<'_, HashMap<EdgeKey, Transition>> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exact-match lookup of the state `action` led to from `from`.
    pub fn lookup(&self, from: &State, action: &Action) -> Option<State> {
        self.edges()
            .get(&(from.key(), action.key()))
            .map(|transition| transition.to_state.clone())
    }

    /// Stored uncertainty, or `1.0` for a pair never observed.
    pub fn get_uncertainty(&self, from: &State, action: &Action) -> f64 {
        self.edges()
            .get(&(from.key(), action.key()))
            .map_or(1.0, |transition| transition.uncertainty)
    }

    pub fn get_transition(&self, from: &State, action: &Action) -> Option<Transition> {
        self.edges().get(&(from.key(), action.key())).cloned()
    }

    /// Record that `action` from `from` produced `to`.
    pub fn record(
        &self,
        from: &State,
        action: &Action,
        to: &State,
        delta: Option<String>,
    ) -> Transition {
        let now = Utc::now();
        let key = (from.key(), action.key());
        let transition = match self.edges().entry(key) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.visits += 1;
                existing.uncertainty = uncertainty_for(existing.visits);
                existing.to_state = to.clone();
                existing.delta = delta;
                existing.last_seen_at = now;
                existing.clone()
            }
            Entry::Vacant(entry) => {
                let (from_key, action_key) = entry.key().clone();
                entry
                    .insert(Transition {
                        from_key,
                        action_key,
                        to_state: to.clone(),
                        delta,
                        uncertainty: uncertainty_for(1),
                        visits: 1,
                        first_seen_at: now,
                        last_seen_at: now,
                    })
                    .clone()
            }
        };
        debug!(
            from_key = %transition.from_key,
            action_key = %transition.action_key,
            visits = transition.visits,
            "transition recorded"
        );
        self.persist(PersistJob::Transition {
            host: host_for(&from.locator),
            transition: transition.clone(),
        });
        transition
    }

    /// Hydrate `locator`'s host from the store, once per host.
    ///
    /// Concurrent callers for the same host wait for the first hydration to
    /// finish. On key conflicts the transition seen most recently wins.
    pub async fn ensure_domain_loaded(&self, locator: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let host = host_for(locator);
        let loaded = {
            let mut hosts = self
                .loaded_hosts
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(hosts.entry(host.clone()).or_default())
        };
        loaded
            .get_or_init(|| self.hydrate(&**store, &host))
            .await;
    }

    async fn hydrate(&self, store: &dyn KnowledgeStore, host: &str) {
        let stored = store.load_transitions(host).await;
        let count = stored.len();
        let mut edges = self.edges();
        for transition in stored {
            let key = (transition.from_key.clone(), transition.action_key.clone());
            match edges.entry(key) {
                Entry::Occupied(mut entry) => {
                    if transition.last_seen_at > entry.get().last_seen_at {
                        entry.insert(transition);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(transition);
                }
            }
        }
        debug!(host, count, "hydrated transitions");
    }

    /// Synthesized stand-in for an unobserved outcome. Never cached.
    pub fn placeholder(&self, from: &State, action: &Action) -> State {
        State {
            locator: format!("{PLACEHOLDER_SCHEME}{}", from.key()),
            title: format!("Unobserved result of \"{}\"", action.description.trim()),
            affordances: Vec::new(),
            inputs: Vec::new(),
            placeholder: true,
        }
    }

    /// Deep copy of every edge, ordered by key.
    pub fn snapshot(&self) -> Vec<Transition> {
        let mut transitions: Vec<Transition> = self.edges().values().cloned().collect();
        transitions.sort_by(|a, b| {
            (&a.from_key, &a.action_key).cmp(&(&b.from_key, &b.action_key))
        });
        transitions
    }

    pub fn len(&self) -> usize {
        self.edges().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges().is_empty()
    }

    /// Number of edges leaving states on `host`.
    pub fn host_edge_count(&self, host: &str) -> usize {
        self.edges()
            .keys()
            .filter(|(from_key, _)| host_for(from_key) == host)
            .count()
    }

    /// Semantic rules persisted for `locator`'s host.
    pub async fn semantic_rules(&self, locator: &str) -> Vec<SemanticRule> {
        match &self.store {
            Some(store) => store.get_semantic_rules(&host_for(locator)).await,
            None => Vec::new(),
        }
    }

    /// Persist a learned rule for `locator`'s host in the background.
    pub fn record_rule(&self, locator: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.persist(PersistJob::Rule {
            host: host_for(locator),
            rule: SemanticRule::from_text(text),
        });
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.persist(PersistJob::Flush(tx));
        let _ = rx.await;
    }

    fn persist(&self, job: PersistJob) {
        let Some(writer) = &self.writer else {
            if let PersistJob::Flush(done) = job {
                let _ = done.send(());
            }
            return;
        };
        if writer.send(job).is_err() {
            warn!("knowledge writer stopped, dropping write");
        }
    }
}

async fn run_writer(store: Arc<dyn KnowledgeStore>, mut rx: mpsc::UnboundedReceiver<PersistJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            PersistJob::Transition { host, transition } => {
                if let Err(err) = store.record_transition(&host, &transition).await {
                    warn!(host, error = %format!("{err:#}"), "failed to persist transition");
                }
            }
            PersistJob::Rule { host, rule } => {
                if let Err(err) = store.record_semantic_rule(&host, &rule).await {
                    warn!(host, error = %format!("{err:#}"), "failed to persist semantic rule");
                }
            }
            PersistJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
