//! Scripted collaborators and builders for loop and launcher tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::events::{Candidate, Critique, FlowKind, Plan, RankedCandidate};
use crate::core::types::{Action, InputField, State};
use crate::io::config::AtlasConfig;
use crate::io::paths::AtlasPaths;
use crate::launcher::RunLauncher;
use crate::policy::{CritiqueRequest, Environment, KnowledgeContext, Policy};

/// File-backed launcher over a fresh temporary data directory.
///
/// Keep the returned directory alive for as long as the launcher is used.
pub fn temp_launcher(config: AtlasConfig) -> (tempfile::TempDir, AtlasPaths, RunLauncher) {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AtlasPaths::new(dir.path());
    let launcher = RunLauncher::open(&paths, config);
    (dir, paths, launcher)
}

/// State at `locator` with the given affordances and no inputs.
pub fn page(locator: &str, affordances: Vec<Action>) -> State {
    State::new(locator, affordances)
}

pub fn click(description: &str, selector: &str) -> Action {
    Action::deterministic(description, selector, "click", Vec::new())
}

pub fn fill(description: &str, selector: &str, value: &str) -> Action {
    Action::deterministic(description, selector, "fill", vec![value.to_string()])
}

/// A required input that is still empty.
pub fn required_input(label: &str, kind: &str) -> InputField {
    InputField {
        label: label.to_string(),
        kind: kind.to_string(),
        required: true,
        empty: true,
    }
}

/// Critique picking `chosen`, with `scores[i]` for candidate `i`.
pub fn critique_choosing(chosen: usize, scores: &[f64]) -> Critique {
    let mut ranked: Vec<RankedCandidate> = scores
        .iter()
        .enumerate()
        .map(|(index, score)| RankedCandidate {
            index,
            score: *score,
        })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    Critique {
        chosen_index: chosen,
        ranked,
        ..Critique::default()
    }
}

/// Shared view of what a [`ScriptedEnvironment`] did, usable after the
/// environment moved into a run.
#[derive(Debug, Clone, Default)]
pub struct EnvTrace {
    acted: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl EnvTrace {
    /// Keys of every action acted on, in order.
    pub fn acted(&self) -> Vec<String> {
        self.acted.lock().expect("acted lock").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Environment walking a fixed action graph.
///
/// Acting on an action with a scripted edge moves to its target state; any
/// other action leaves the current state unchanged.
#[derive(Debug)]
pub struct ScriptedEnvironment {
    current: State,
    edges: HashMap<String, State>,
    failing: HashSet<String>,
    trace: EnvTrace,
}

impl ScriptedEnvironment {
    pub fn new(start: State) -> Self {
        Self {
            current: start,
            edges: HashMap::new(),
            failing: HashSet::new(),
            trace: EnvTrace::default(),
        }
    }

    pub fn with_edge(mut self, action: &Action, to: State) -> Self {
        self.edges.insert(action.key(), to);
        self
    }

    /// Make acting on `action` fail.
    pub fn failing_on(mut self, action: &Action) -> Self {
        self.failing.insert(action.key());
        self
    }

    pub fn trace(&self) -> EnvTrace {
        self.trace.clone()
    }

    pub fn acted(&self) -> Vec<String> {
        self.trace.acted()
    }
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    async fn observe(&mut self) -> Result<State> {
        Ok(self.current.clone())
    }

    async fn act(&mut self, action: &Action) -> Result<()> {
        let key = action.key();
        self.trace.acted.lock().expect("acted lock").push(key.clone());
        if self.failing.contains(&key) {
            return Err(anyhow!("scripted failure"));
        }
        if let Some(next) = self.edges.get(&key) {
            self.current = next.clone();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.trace.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Policy with queued answers and simple defaults.
///
/// Defaults: propose the state's first `n` affordances, pick the first with
/// descending scores starting at 1.0, classify every state as intermediate
/// and never judge a state satisfied.
#[derive(Debug, Default)]
pub struct ScriptedPolicy {
    proposals: Mutex<VecDeque<Vec<Candidate>>>,
    critiques: Mutex<VecDeque<Critique>>,
    flows: HashMap<String, FlowKind>,
    satisfied: HashSet<String>,
    propose_delay: Option<Duration>,
    panic_in_propose: bool,
    proposed_goals: Mutex<Vec<String>>,
    knowledge_seen: Mutex<Vec<KnowledgeContext>>,
}

impl ScriptedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proposals(self, proposals: Vec<Vec<Candidate>>) -> Self {
        *self.proposals.lock().expect("proposals lock") = proposals.into();
        self
    }

    pub fn with_critiques(self, critiques: Vec<Critique>) -> Self {
        *self.critiques.lock().expect("critiques lock") = critiques.into();
        self
    }

    pub fn with_flow(mut self, locator: &str, flow: FlowKind) -> Self {
        self.flows.insert(locator.to_string(), flow);
        self
    }

    pub fn judging_satisfied(mut self, locator: &str) -> Self {
        self.satisfied.insert(locator.to_string());
        self
    }

    /// Sleep before every proposal, leaving room to steer a live run.
    pub fn with_propose_delay(mut self, delay: Duration) -> Self {
        self.propose_delay = Some(delay);
        self
    }

    /// Panic inside `propose`, as a buggy policy would.
    pub fn panicking_in_propose(mut self) -> Self {
        self.panic_in_propose = true;
        self
    }

    /// Goals passed to `propose`, in call order.
    pub fn proposed_goals(&self) -> Vec<String> {
        self.proposed_goals.lock().expect("goals lock").clone()
    }

    /// Knowledge contexts passed to `propose`, in call order.
    pub fn knowledge_seen(&self) -> Vec<KnowledgeContext> {
        self.knowledge_seen.lock().expect("knowledge lock").clone()
    }
}

#[async_trait]
impl Policy for ScriptedPolicy {
    async fn plan(&self, goal: &str, _state: &State, _knowledge: &KnowledgeContext) -> Result<Plan> {
        Ok(Plan {
            summary: format!("plan for {goal}"),
            steps: vec![goal.to_string()],
        })
    }

    async fn propose(
        &self,
        goal: &str,
        _plan: &Plan,
        state: &State,
        n: usize,
        knowledge: &KnowledgeContext,
    ) -> Result<Vec<Candidate>> {
        if let Some(delay) = self.propose_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_in_propose {
            panic!("policy exploded");
        }
        self.proposed_goals
            .lock()
            .expect("goals lock")
            .push(goal.to_string());
        self.knowledge_seen
            .lock()
            .expect("knowledge lock")
            .push(knowledge.clone());
        if let Some(scripted) = self.proposals.lock().expect("proposals lock").pop_front() {
            return Ok(scripted);
        }
        Ok(state
            .affordances
            .iter()
            .take(n)
            .cloned()
            .map(Candidate::new)
            .collect())
    }

    async fn critique(&self, request: CritiqueRequest<'_>) -> Result<Critique> {
        if let Some(scripted) = self.critiques.lock().expect("critiques lock").pop_front() {
            return Ok(scripted);
        }
        let scores: Vec<f64> = (0..request.candidates.len())
            .map(|index| 1.0 - 0.1 * index as f64)
            .collect();
        Ok(critique_choosing(0, &scores))
    }

    async fn analyze_flow(&self, _goal: &str, state: &State) -> Result<FlowKind> {
        Ok(self
            .flows
            .get(&state.locator)
            .copied()
            .unwrap_or(FlowKind::Intermediate))
    }

    async fn judge(&self, _goal: &str, state: &State, _flow: FlowKind) -> Result<bool> {
        Ok(self.satisfied.contains(&state.locator))
    }
}
