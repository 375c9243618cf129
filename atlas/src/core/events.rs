//! Run events emitted by the orchestration loop.
//!
//! One tagged enum covers every event kind. The same values flow to the live
//! bus and to the run store, so the serialized shape (`{"type": ..., ...}`)
//! is the persisted shape.

use serde::{Deserialize, Serialize};

use crate::core::types::{Action, State};

/// Plan produced by the planner collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// A proposed next action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Candidate {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            rationale: None,
        }
    }
}

/// Score assigned to one candidate by the critic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub index: usize,
    pub score: f64,
}

/// Critic verdict over a candidate set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub chosen_index: usize,
    /// Best first.
    #[serde(default)]
    pub ranked: Vec<RankedCandidate>,
    #[serde(default)]
    pub goal_met: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_met_reason: Option<String>,
    /// Host-level lessons worth keeping across runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub learned_rules: Vec<String>,
}

impl Critique {
    pub fn top_score(&self) -> Option<f64> {
        self.ranked.first().map(|ranked| ranked.score)
    }
}

/// Flow position of a state relative to the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowKind {
    Start,
    End,
    Intermediate,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedReason {
    MaxSteps,
    NoCandidates,
    GoalMet,
    FlowEnd,
    JudgeSatisfied,
    TimeBudget,
    Stopped,
    Error,
}

impl EndedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndedReason::MaxSteps => "max_steps",
            EndedReason::NoCandidates => "no_candidates",
            EndedReason::GoalMet => "goal_met",
            EndedReason::FlowEnd => "flow_end",
            EndedReason::JudgeSatisfied => "judge_satisfied",
            EndedReason::TimeBudget => "time_budget",
            EndedReason::Stopped => "stopped",
            EndedReason::Error => "error",
        }
    }
}

/// Why the loop asked for a fresh candidate set or plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanReason {
    /// No progress across the replan window.
    Stalled,
    /// The control requested a rewind to an earlier step.
    Rewind,
    /// Readiness guard rejected a click while required inputs were empty.
    FillRequired,
    /// Top-ranked candidate scored below the veto threshold.
    LowValue,
}

/// Guard decision attached to a selected action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardNote {
    /// The enabling click repeated the previous action and was replaced.
    RepeatSuppressed { replaced: String },
}

/// Event emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Init {
        goal: String,
        start_url: String,
        state_key: String,
        max_steps: u32,
        beam_size: usize,
    },
    Plan {
        plan: Plan,
    },
    Propose {
        step: u32,
        candidates: Vec<Candidate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ReplanReason>,
    },
    Critique {
        step: u32,
        critique: Critique,
        uncertainties: Vec<f64>,
    },
    SelectedAction {
        step: u32,
        action: Action,
        action_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guard: Option<GuardNote>,
    },
    ActionExecuted {
        step: u32,
        action_key: String,
    },
    ObservationAfter {
        step: u32,
        state_key: String,
        locator: String,
        title: String,
        affordances: usize,
        required_empty: usize,
    },
    MapUpdate {
        step: u32,
        from_key: String,
        action_key: String,
        to_key: String,
        visits: u32,
        uncertainty: f64,
    },
    Replan {
        step: u32,
        reason: ReplanReason,
        plan: Plan,
    },
    Analysis {
        step: u32,
        flow: FlowKind,
    },
    Judgement {
        step: u32,
        satisfied: bool,
    },
    Done {
        ended_reason: EndedReason,
        steps: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        goal_met_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_state: Option<State>,
    },
    Error {
        message: String,
    },
}

impl RunEvent {
    /// `done` and `error` end a run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Done { .. } | RunEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::Init { .. } => "init",
            RunEvent::Plan { .. } => "plan",
            RunEvent::Propose { .. } => "propose",
            RunEvent::Critique { .. } => "critique",
            RunEvent::SelectedAction { .. } => "selected_action",
            RunEvent::ActionExecuted { .. } => "action_executed",
            RunEvent::ObservationAfter { .. } => "observation_after",
            RunEvent::MapUpdate { .. } => "map_update",
            RunEvent::Replan { .. } => "replan",
            RunEvent::Analysis { .. } => "analysis",
            RunEvent::Judgement { .. } => "judgement",
            RunEvent::Done { .. } => "done",
            RunEvent::Error { .. } => "error",
        }
    }
}

/// A run event tagged with its run id, as delivered to bus subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStreamEvent {
    pub run_id: String,
    #[serde(flatten)]
    pub event: RunEvent,
}
