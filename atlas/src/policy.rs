//! Collaborator seams: the environment a run acts on and the policy that
//! decides what to do next.
//!
//! Both are async traits so the loop can hold them as trait objects. Any
//! error they return is fatal to the run.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::events::{Candidate, Critique, FlowKind, Plan};
use crate::core::guards::GuardRules;
use crate::core::types::{Action, State};

/// Perceives and acts on the external world.
#[async_trait]
pub trait Environment: Send {
    async fn observe(&mut self) -> Result<State>;

    async fn act(&mut self, action: &Action) -> Result<()>;

    /// Teardown. Runs once when the run ends, whatever the outcome.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Host knowledge exposed to the policy before each decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnowledgeContext {
    pub host: String,
    pub rules: Vec<String>,
    /// Number of cached edges for the host.
    pub known_transitions: usize,
}

/// Everything the critic sees for one candidate set.
#[derive(Debug, Clone, Copy)]
pub struct CritiqueRequest<'a> {
    pub goal: &'a str,
    pub plan: &'a Plan,
    pub state: &'a State,
    pub candidates: &'a [Candidate],
    /// Cached next state, or a placeholder, per candidate.
    pub lookaheads: &'a [State],
    pub uncertainties: &'a [f64],
    pub knowledge: &'a KnowledgeContext,
}

/// Planner, actor, critic, flow analyst and judge.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn plan(&self, goal: &str, state: &State, knowledge: &KnowledgeContext) -> Result<Plan>;

    /// Up to `n` candidate actions for `state`.
    async fn propose(
        &self,
        goal: &str,
        plan: &Plan,
        state: &State,
        n: usize,
        knowledge: &KnowledgeContext,
    ) -> Result<Vec<Candidate>>;

    async fn critique(&self, request: CritiqueRequest<'_>) -> Result<Critique>;

    async fn analyze_flow(&self, goal: &str, state: &State) -> Result<FlowKind>;

    async fn judge(&self, goal: &str, state: &State, flow: FlowKind) -> Result<bool>;

    /// Action shapes the readiness guard keys on.
    fn guard_rules(&self) -> GuardRules {
        GuardRules::default()
    }
}
