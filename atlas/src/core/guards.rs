//! Deterministic guard rules applied between critique and execution.
//!
//! The policy layer supplies a declarative [`GuardRules`] table describing
//! which action methods fill inputs, which ones click, and which input kinds
//! only progress through an enabling click (date pickers and the like). The
//! functions here never talk to collaborators; the loop acts on their
//! verdicts.

use serde::{Deserialize, Serialize};

use crate::core::events::{Candidate, Critique};
use crate::core::types::{Action, State};

/// Declarative guard-rule table supplied by the policy layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardRules {
    /// Methods that put a value into an input.
    pub fill_methods: Vec<String>,
    /// Methods that activate an element.
    pub click_methods: Vec<String>,
    /// Input kinds whose only way to progress is an enabling click.
    pub click_enabled_kinds: Vec<String>,
}

impl Default for GuardRules {
    fn default() -> Self {
        Self {
            fill_methods: vec![
                "fill".to_string(),
                "type".to_string(),
                "selectOption".to_string(),
                "check".to_string(),
            ],
            click_methods: vec!["click".to_string(), "dblclick".to_string()],
            click_enabled_kinds: vec![
                "date".to_string(),
                "datetime-local".to_string(),
                "time".to_string(),
            ],
        }
    }
}

impl GuardRules {
    pub fn is_fill(&self, action: &Action) -> bool {
        action
            .method()
            .is_some_and(|method| contains_ignore_case(&self.fill_methods, method))
    }

    pub fn is_click(&self, action: &Action) -> bool {
        action
            .method()
            .is_some_and(|method| contains_ignore_case(&self.click_methods, method))
    }

    fn is_click_enabled(&self, kind: &str) -> bool {
        contains_ignore_case(&self.click_enabled_kinds, kind)
    }
}

/// Outcome of the readiness guard for the chosen candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Execute the chosen candidate.
    Proceed,
    /// A click was chosen while fillable required inputs are empty.
    FillFirst { required_empty: Vec<String> },
    /// The chosen enabling click repeats the last action; use `replacement`.
    SuppressRepeat { replacement: usize },
}

/// Decide whether the chosen candidate may run on `state`.
///
/// A click is blocked when required inputs are empty and a fill-shaped
/// candidate exists, unless every empty required input is click-enabled. In
/// that case the click runs, but not twice in a row: a repeat of
/// `last_action_key` is swapped for the first non-repeat candidate, if any.
pub fn check_readiness(
    rules: &GuardRules,
    state: &State,
    candidates: &[Candidate],
    chosen: usize,
    last_action_key: Option<&str>,
) -> Readiness {
    let Some(choice) = candidates.get(chosen) else {
        return Readiness::Proceed;
    };
    if !rules.is_click(&choice.action) {
        return Readiness::Proceed;
    }

    let required_empty: Vec<_> = state
        .inputs
        .iter()
        .filter(|input| input.is_required_empty())
        .collect();
    if required_empty.is_empty() {
        return Readiness::Proceed;
    }
    if !candidates
        .iter()
        .any(|candidate| rules.is_fill(&candidate.action))
    {
        return Readiness::Proceed;
    }

    let only_click_enabled = required_empty
        .iter()
        .all(|input| rules.is_click_enabled(&input.kind));
    if !only_click_enabled {
        return Readiness::FillFirst {
            required_empty: required_empty
                .iter()
                .map(|input| input.label.clone())
                .collect(),
        };
    }

    let chosen_key = choice.action.key();
    if last_action_key != Some(chosen_key.as_str()) {
        return Readiness::Proceed;
    }
    match candidates
        .iter()
        .position(|candidate| candidate.action.key() != chosen_key)
    {
        Some(replacement) => Readiness::SuppressRepeat { replacement },
        None => Readiness::Proceed,
    }
}

/// True when the critic's best score falls below `veto`.
///
/// A critique without scores is never vetoed.
pub fn is_low_value(critique: &Critique, veto: f64) -> bool {
    critique.top_score().is_some_and(|score| score < veto)
}

/// Goal text nudging the proposer toward filling the listed inputs.
pub fn fill_first_goal(goal: &str, required_empty: &[String]) -> String {
    format!(
        "{goal}\n\nBefore clicking anything, fill these required empty fields: {}.",
        required_empty.join(", ")
    )
}

/// Goal text nudging the proposer toward actions that complete the task.
pub fn completeness_goal(goal: &str) -> String {
    format!(
        "{goal}\n\nThe previous candidates were weak. Prefer actions that move the task to completion."
    )
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::RankedCandidate;
    use crate::core::types::InputField;

    fn click(description: &str) -> Candidate {
        Candidate::new(Action::deterministic(
            description,
            format!("#{description}"),
            "click",
            Vec::new(),
        ))
    }

    fn fill(description: &str) -> Candidate {
        Candidate::new(Action::deterministic(
            description,
            format!("#{description}"),
            "fill",
            vec!["value".to_string()],
        ))
    }

    fn input(label: &str, kind: &str) -> InputField {
        InputField {
            label: label.to_string(),
            kind: kind.to_string(),
            required: true,
            empty: true,
        }
    }

    fn form(inputs: Vec<InputField>) -> State {
        State::new("https://shop.test/checkout", Vec::new()).with_inputs(inputs)
    }

    #[test]
    fn click_with_fillable_required_inputs_is_rejected() {
        let state = form(vec![input("Email", "email")]);
        let candidates = vec![click("submit"), fill("email")];

        let verdict = check_readiness(&GuardRules::default(), &state, &candidates, 0, None);

        assert_eq!(
            verdict,
            Readiness::FillFirst {
                required_empty: vec!["Email".to_string()]
            }
        );
    }

    #[test]
    fn click_proceeds_without_fill_candidates() {
        let state = form(vec![input("Email", "email")]);
        let candidates = vec![click("submit"), click("cancel")];

        let verdict = check_readiness(&GuardRules::default(), &state, &candidates, 0, None);
        assert_eq!(verdict, Readiness::Proceed);
    }

    #[test]
    fn fill_choice_always_proceeds() {
        let state = form(vec![input("Email", "email")]);
        let candidates = vec![click("submit"), fill("email")];

        let verdict = check_readiness(&GuardRules::default(), &state, &candidates, 1, None);
        assert_eq!(verdict, Readiness::Proceed);
    }

    #[test]
    fn enabling_click_allowed_for_date_inputs() {
        let state = form(vec![input("Departure", "date")]);
        let candidates = vec![click("open-calendar"), fill("notes")];

        let verdict = check_readiness(&GuardRules::default(), &state, &candidates, 0, None);
        assert_eq!(verdict, Readiness::Proceed);
    }

    #[test]
    fn repeated_enabling_click_is_suppressed() {
        let state = form(vec![input("Departure", "date")]);
        let candidates = vec![click("open-calendar"), fill("notes"), click("day-12")];
        let last = candidates[0].action.key();

        let verdict = check_readiness(
            &GuardRules::default(),
            &state,
            &candidates,
            0,
            Some(last.as_str()),
        );
        assert_eq!(verdict, Readiness::SuppressRepeat { replacement: 1 });
    }

    #[test]
    fn mixed_inputs_still_require_fill() {
        let state = form(vec![input("Departure", "date"), input("Name", "text")]);
        let candidates = vec![click("open-calendar"), fill("name")];

        let verdict = check_readiness(&GuardRules::default(), &state, &candidates, 0, None);
        assert!(matches!(verdict, Readiness::FillFirst { .. }));
    }

    #[test]
    fn low_value_uses_top_ranked_score() {
        let critique = Critique {
            ranked: vec![
                RankedCandidate {
                    index: 1,
                    score: 0.1,
                },
                RankedCandidate {
                    index: 0,
                    score: 0.05,
                },
            ],
            ..Critique::default()
        };
        assert!(is_low_value(&critique, 0.2));
        assert!(!is_low_value(&critique, 0.1));
        assert!(!is_low_value(&Critique::default(), 0.2));
    }
}
