//! Shared deterministic types for the orchestration core.
//!
//! States, actions and transitions form the vocabulary shared by the cache,
//! the loop and the policy collaborators. Identity keys are computed from
//! content so the same page and the same affordance always map to the same
//! cache entry.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of affordances that contribute to a state's signature.
pub const SIGNATURE_AFFORDANCES: usize = 3;

/// Hex characters kept from the signature digest.
const SIGNATURE_LEN: usize = 12;

/// Locator scheme used by synthesized placeholder states.
pub const PLACEHOLDER_SCHEME: &str = "unknown://";

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// How an action is carried out by the environment.
///
/// Exactly one form exists per action: either a deterministic
/// selector/method pair or a natural-language instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionForm {
    Deterministic {
        selector: String,
        method: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        arguments: Vec<String>,
    },
    Instruction {
        instruction: String,
    },
}

/// A single interactable capability on a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub description: String,
    #[serde(flatten)]
    pub form: ActionForm,
}

impl Action {
    /// Deterministic action targeting `selector` with `method`.
    pub fn deterministic(
        description: impl Into<String>,
        selector: impl Into<String>,
        method: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            description: description.into(),
            form: ActionForm::Deterministic {
                selector: selector.into(),
                method: method.into(),
                arguments,
            },
        }
    }

    /// Natural-language fallback action.
    pub fn instruction(description: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            form: ActionForm::Instruction {
                instruction: instruction.into(),
            },
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.form {
            ActionForm::Deterministic { method, .. } => Some(method),
            ActionForm::Instruction { .. } => None,
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match &self.form {
            ActionForm::Deterministic { selector, .. } => Some(selector),
            ActionForm::Instruction { .. } => None,
        }
    }

    pub fn instruction_text(&self) -> Option<&str> {
        match &self.form {
            ActionForm::Deterministic { .. } => None,
            ActionForm::Instruction { instruction } => Some(instruction),
        }
    }

    /// Normalized cache key: `method::selector::instruction::description`.
    ///
    /// Whitespace is collapsed in every part; description and instruction are
    /// lowercased because their casing carries no meaning for the environment.
    pub fn key(&self) -> String {
        let method = collapse(self.method().unwrap_or_default());
        let selector = collapse(self.selector().unwrap_or_default());
        let instruction = collapse(self.instruction_text().unwrap_or_default()).to_lowercase();
        let description = collapse(&self.description).to_lowercase();
        format!("{method}::{selector}::{instruction}::{description}")
    }
}

/// An input field visible on a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputField {
    pub label: String,
    /// Input kind as reported by the environment (`text`, `date`, ...).
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub empty: bool,
}

impl InputField {
    pub fn is_required_empty(&self) -> bool {
        self.required && self.empty
    }
}

/// An identity-bearing snapshot of the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub locator: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub affordances: Vec<Action>,
    #[serde(default)]
    pub inputs: Vec<InputField>,
    /// Set only on synthesized lookahead states that were never observed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

impl State {
    pub fn new(locator: impl Into<String>, affordances: Vec<Action>) -> Self {
        Self {
            locator: locator.into(),
            title: String::new(),
            affordances,
            inputs: Vec::new(),
            placeholder: false,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<InputField>) -> Self {
        self.inputs = inputs;
        self
    }

    /// `locator#signature`, where the signature covers the first three affordances.
    pub fn key(&self) -> String {
        format!("{}#{}", self.locator, self.signature())
    }

    fn signature(&self) -> String {
        let descriptor = self
            .affordances
            .iter()
            .take(SIGNATURE_AFFORDANCES)
            .map(Action::key)
            .collect::<Vec<_>>()
            .join("|");
        let digest = Sha256::digest(descriptor.as_bytes());
        let mut signature = hex::encode(digest);
        signature.truncate(SIGNATURE_LEN);
        signature
    }

    /// Number of required inputs that are still empty.
    pub fn required_empty_count(&self) -> usize {
        self.inputs
            .iter()
            .filter(|input| input.is_required_empty())
            .count()
    }
}

/// A cached observation that `action` taken from `from_key` led to `to_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_key: String,
    pub action_key: String,
    pub to_state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    pub uncertainty: f64,
    pub visits: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Uncertainty for a pair observed `visits` times.
pub fn uncertainty_for(visits: u32) -> f64 {
    1.0 / (1.0 + f64::from(visits))
}

fn collapse(value: &str) -> String {
    WHITESPACE.replace_all(value.trim(), " ").into_owned()
}
