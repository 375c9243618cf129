//! The Atlas loop: plan, propose, critique, guard, act, observe, learn.
//!
//! One call drives a single run to an [`EndedReason`]. The loop is
//! cooperative: it consults the [`RunControl`] only at step boundaries, so a
//! stop or budget change lands after the in-flight step completes. Policy and
//! environment errors are returned as-is and end the run; everything else
//! that ends a run is an ordinary outcome.
//!
//! Events are handed to `emit` in the order they happen. The loop never emits
//! the terminal `done`/`error` events; the caller decides those once the
//! outcome is known.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cache::TransitionCache;
use crate::control::RunControl;
use crate::core::budget::remaining_budget;
use crate::core::events::{
    Candidate, Critique, EndedReason, FlowKind, GuardNote, Plan, ReplanReason, RunEvent,
};
use crate::core::guards::{
    GuardRules, Readiness, check_readiness, completeness_goal, fill_first_goal, is_low_value,
};
use crate::core::progress::{Progress, ProgressTracker};
use crate::core::types::State;
use crate::io::knowledge_store::host_for;
use crate::policy::{CritiqueRequest, Environment, KnowledgeContext, Policy};

/// Static inputs of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub goal: String,
    pub start_url: String,
    pub beam_size: usize,
    /// Top critic score below which candidates are re-proposed once.
    pub low_value_veto: f64,
    /// Stalled steps between full replans.
    pub replan_window: u32,
    pub time_budget: Duration,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub ended_reason: EndedReason,
    pub steps_taken: u32,
    pub final_state: State,
    pub goal_met_reason: Option<String>,
}

/// Candidates and the critic's verdict on them.
struct Decision {
    candidates: Vec<Candidate>,
    critique: Critique,
}

struct AtlasLoop<'a, F> {
    config: &'a LoopConfig,
    env: &'a mut dyn Environment,
    policy: &'a dyn Policy,
    cache: &'a TransitionCache,
    control: &'a RunControl,
    rules: GuardRules,
    emit: F,
}

/// Drive one run until it ends.
pub async fn run_atlas<F>(
    config: &LoopConfig,
    env: &mut dyn Environment,
    policy: &dyn Policy,
    cache: &TransitionCache,
    control: &RunControl,
    emit: F,
) -> Result<LoopOutcome>
where
    F: FnMut(RunEvent) + Send,
{
    let mut atlas = AtlasLoop {
        config,
        env,
        policy,
        cache,
        control,
        rules: policy.guard_rules(),
        emit,
    };
    atlas.run().await
}

impl<F> AtlasLoop<'_, F>
where
    F: FnMut(RunEvent) + Send,
{
    async fn run(&mut self) -> Result<LoopOutcome> {
        let deadline = tokio::time::Instant::now() + self.config.time_budget;
        let goal = self.config.goal.clone();

        let mut state = self
            .env
            .observe()
            .await
            .context("observe start state")?;
        self.cache.ensure_domain_loaded(&state.locator).await;
        (self.emit)(RunEvent::Init {
            goal: goal.clone(),
            start_url: self.config.start_url.clone(),
            state_key: state.key(),
            max_steps: self.control.max_steps(),
            beam_size: self.config.beam_size,
        });

        let knowledge = knowledge_context(self.cache, &state).await;
        let mut plan = self
            .policy
            .plan(&goal, &state, &knowledge)
            .await
            .context("plan")?;
        (self.emit)(RunEvent::Plan { plan: plan.clone() });

        let mut progress = ProgressTracker::new(self.config.replan_window);
        progress.baseline(&state.key(), state.required_empty_count());
        let mut judged: HashSet<String> = HashSet::new();
        let mut last_action_key: Option<String> = None;
        let mut goal_met_reason = None;

        let ended_reason = loop {
            self.control.wait_if_paused().await;
            if self.control.is_stopping() {
                break EndedReason::Stopped;
            }
            if let Some(step) = self.control.take_rewind() {
                info!(step, "rewinding and replanning");
                plan = self.replan(&goal, &state, step, ReplanReason::Rewind).await?;
                progress.reset();
                progress.baseline(&state.key(), state.required_empty_count());
                last_action_key = None;
            }
            if self.control.budget_exhausted() {
                break EndedReason::MaxSteps;
            }
            if remaining_budget(deadline).is_none() {
                break EndedReason::TimeBudget;
            }

            let step = self.control.advance_step();
            debug!(step, state_key = %state.key(), "step started");

            let Some(mut decision) = self.decide(&goal, &plan, &state, step, None).await? else {
                break EndedReason::NoCandidates;
            };
            if decision.critique.goal_met {
                goal_met_reason = decision.critique.goal_met_reason.clone();
                break EndedReason::GoalMet;
            }

            let mut chosen = decision.chosen();
            let mut guard = None;
            match check_readiness(
                &self.rules,
                &state,
                &decision.candidates,
                chosen,
                last_action_key.as_deref(),
            ) {
                Readiness::Proceed => {}
                Readiness::FillFirst { required_empty } => {
                    debug!(step, fields = ?required_empty, "click blocked until required fields are filled");
                    let nudged = fill_first_goal(&goal, &required_empty);
                    let reason = Some(ReplanReason::FillRequired);
                    match self.decide(&nudged, &plan, &state, step, reason).await? {
                        Some(retry) => decision = retry,
                        None => break EndedReason::NoCandidates,
                    }
                    if decision.critique.goal_met {
                        goal_met_reason = decision.critique.goal_met_reason.clone();
                        break EndedReason::GoalMet;
                    }
                    chosen = decision.chosen();
                }
                Readiness::SuppressRepeat { replacement } => {
                    let replaced = decision.candidates[chosen].action.key();
                    debug!(step, replaced = %replaced, "suppressed repeated enabling click");
                    guard = Some(GuardNote::RepeatSuppressed { replaced });
                    chosen = replacement;
                }
            }

            if guard.is_none() && is_low_value(&decision.critique, self.config.low_value_veto) {
                debug!(step, score = ?decision.critique.top_score(), "weak candidates, re-proposing");
                let nudged = completeness_goal(&goal);
                let reason = Some(ReplanReason::LowValue);
                // An empty re-proposal keeps the original choice.
                if let Some(retry) = self.decide(&nudged, &plan, &state, step, reason).await? {
                    if retry.critique.goal_met {
                        goal_met_reason = retry.critique.goal_met_reason.clone();
                        break EndedReason::GoalMet;
                    }
                    chosen = retry.chosen();
                    decision = retry;
                }
            }

            let action = decision.candidates[chosen].action.clone();
            let action_key = action.key();
            (self.emit)(RunEvent::SelectedAction {
                step,
                action: action.clone(),
                action_key: action_key.clone(),
                guard,
            });
            self.env
                .act(&action)
                .await
                .with_context(|| format!("act on step {step}: {}", action.description))?;
            (self.emit)(RunEvent::ActionExecuted {
                step,
                action_key: action_key.clone(),
            });

            let next = self
                .env
                .observe()
                .await
                .with_context(|| format!("observe after step {step}"))?;
            let next_key = next.key();
            (self.emit)(RunEvent::ObservationAfter {
                step,
                state_key: next_key.clone(),
                locator: next.locator.clone(),
                title: next.title.clone(),
                affordances: next.affordances.len(),
                required_empty: next.required_empty_count(),
            });

            let transition = self
                .cache
                .record(&state, &action, &next, describe_delta(&state, &next));
            (self.emit)(RunEvent::MapUpdate {
                step,
                from_key: transition.from_key,
                action_key: transition.action_key,
                to_key: next_key.clone(),
                visits: transition.visits,
                uncertainty: transition.uncertainty,
            });
            self.cache.ensure_domain_loaded(&next.locator).await;
            last_action_key = Some(action_key);
            state = next;

            let flow = self
                .policy
                .analyze_flow(&goal, &state)
                .await
                .context("analyze flow")?;
            (self.emit)(RunEvent::Analysis { step, flow });
            if flow == FlowKind::End {
                break EndedReason::FlowEnd;
            }
            if judged.insert(next_key.clone()) {
                let satisfied = self
                    .policy
                    .judge(&goal, &state, flow)
                    .await
                    .context("judge")?;
                (self.emit)(RunEvent::Judgement { step, satisfied });
                if satisfied {
                    break EndedReason::JudgeSatisfied;
                }
            }

            match progress.observe(&next_key, state.required_empty_count()) {
                Progress::Advanced => {}
                Progress::Stalled { steps } => debug!(step, stalled = steps, "no progress"),
                Progress::ReplanDue { steps } => {
                    info!(step, stalled = steps, "stalled, replanning");
                    plan = self.replan(&goal, &state, step, ReplanReason::Stalled).await?;
                }
            }
        };

        let steps_taken = self.control.current_step();
        info!(ended_reason = ended_reason.as_str(), steps_taken, "run loop ended");
        Ok(LoopOutcome {
            ended_reason,
            steps_taken,
            final_state: state,
            goal_met_reason,
        })
    }

    /// Propose and critique one candidate set. `None` when nothing was proposed.
    async fn decide(
        &mut self,
        goal: &str,
        plan: &Plan,
        state: &State,
        step: u32,
        reason: Option<ReplanReason>,
    ) -> Result<Option<Decision>> {
        let knowledge = knowledge_context(self.cache, state).await;
        let candidates = self
            .policy
            .propose(goal, plan, state, self.config.beam_size, &knowledge)
            .await
            .with_context(|| format!("propose on step {step}"))?;
        (self.emit)(RunEvent::Propose {
            step,
            candidates: candidates.clone(),
            reason,
        });
        if candidates.is_empty() {
            return Ok(None);
        }

        let lookaheads: Vec<State> = candidates
            .iter()
            .map(|candidate| {
                self.cache
                    .lookup(state, &candidate.action)
                    .unwrap_or_else(|| self.cache.placeholder(state, &candidate.action))
            })
            .collect();
        let uncertainties: Vec<f64> = candidates
            .iter()
            .map(|candidate| self.cache.get_uncertainty(state, &candidate.action))
            .collect();
        let critique = self
            .policy
            .critique(CritiqueRequest {
                goal,
                plan,
                state,
                candidates: &candidates,
                lookaheads: &lookaheads,
                uncertainties: &uncertainties,
                knowledge: &knowledge,
            })
            .await
            .with_context(|| format!("critique on step {step}"))?;
        (self.emit)(RunEvent::Critique {
            step,
            critique: critique.clone(),
            uncertainties,
        });
        for rule in &critique.learned_rules {
            self.cache.record_rule(&state.locator, rule);
        }
        Ok(Some(Decision {
            candidates,
            critique,
        }))
    }

    async fn replan(
        &mut self,
        goal: &str,
        state: &State,
        step: u32,
        reason: ReplanReason,
    ) -> Result<Plan> {
        let knowledge = knowledge_context(self.cache, state).await;
        let plan = self
            .policy
            .plan(goal, state, &knowledge)
            .await
            .with_context(|| format!("replan on step {step}"))?;
        (self.emit)(RunEvent::Replan {
            step,
            reason,
            plan: plan.clone(),
        });
        Ok(plan)
    }
}

/// Host knowledge for `state`, read without touching the cache's edges.
async fn knowledge_context(cache: &TransitionCache, state: &State) -> KnowledgeContext {
    let host = host_for(&state.locator);
    let rules = cache
        .semantic_rules(&state.locator)
        .await
        .into_iter()
        .map(|rule| rule.text)
        .collect();
    KnowledgeContext {
        known_transitions: cache.host_edge_count(&host),
        host,
        rules,
    }
}

impl Decision {
    /// The critic's pick, clamped to the candidate set.
    fn chosen(&self) -> usize {
        self.critique
            .chosen_index
            .min(self.candidates.len().saturating_sub(1))
    }
}

/// Short human-readable summary of what changed between two states.
fn describe_delta(from: &State, to: &State) -> Option<String> {
    let mut changes = Vec::new();
    if from.locator != to.locator {
        changes.push(format!("locator {} -> {}", from.locator, to.locator));
    }
    if from.title != to.title {
        changes.push(format!("title {:?} -> {:?}", from.title, to.title));
    }
    let (before, after) = (from.required_empty_count(), to.required_empty_count());
    if before != after {
        changes.push(format!("required empty {before} -> {after}"));
    }
    if changes.is_empty() {
        None
    } else {
        Some(changes.join("; "))
    }
}
