//! Run launcher: wires one run's control, loop, store and bus together.
//!
//! The launcher owns the injected registries. Each execution gets its own
//! [`RunControl`] registered on the bus, a [`TransitionCache`] backed by the
//! shared knowledge store, and a single sequential persistence task so the
//! run store sees events in exactly the order subscribers do.
//!
//! Terminal events are persisted and the record finalized before they are
//! published, so a subscriber that reacts to `done` reads a finished record.
//! A panic inside the policy or environment is treated as a loop-fatal error,
//! so teardown runs however the loop exits.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{RunEventBus, Subscription};
use crate::cache::TransitionCache;
use crate::control::{RunControl, RunControlState};
use crate::core::events::{RunEvent, RunStreamEvent};
use crate::io::config::AtlasConfig;
use crate::io::knowledge_store::{FileKnowledgeStore, KnowledgeStore};
use crate::io::paths::AtlasPaths;
use crate::io::run_store::{CreateRunOptions, RunArtifacts, RunStore, RunSummary, StoredRun};
use crate::looping::{LoopConfig, LoopOutcome, run_atlas};
use crate::policy::{Environment, Policy};

/// What to run. Unset limits fall back to the launcher's config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub name: Option<String>,
    pub goal: String,
    pub start_url: String,
    pub max_steps: Option<u32>,
    pub beam_size: Option<usize>,
}

/// Creates, executes and steers runs.
#[derive(Clone)]
pub struct RunLauncher {
    store: Arc<RunStore>,
    bus: RunEventBus,
    knowledge: Arc<dyn KnowledgeStore>,
    config: AtlasConfig,
}

impl RunLauncher {
    /// File-backed launcher rooted at `paths`.
    pub fn open(paths: &AtlasPaths, config: AtlasConfig) -> Self {
        Self::with_parts(
            Arc::new(RunStore::new(&paths.runs_dir)),
            RunEventBus::with_retired_capacity(config.retired_run_capacity),
            Arc::new(FileKnowledgeStore::new(&paths.knowledge_dir)),
            config,
        )
    }

    pub fn with_parts(
        store: Arc<RunStore>,
        bus: RunEventBus,
        knowledge: Arc<dyn KnowledgeStore>,
        config: AtlasConfig,
    ) -> Self {
        Self {
            store,
            bus,
            knowledge,
            config,
        }
    }

    pub fn bus(&self) -> &RunEventBus {
        &self.bus
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    pub async fn create(&self, request: RunRequest) -> Result<StoredRun> {
        self.store
            .create_run(CreateRunOptions {
                name: request.name,
                goal: request.goal,
                start_url: request.start_url,
                mode: self.config.mode.clone(),
                env: self.config.env.clone(),
                beam_size: request.beam_size.unwrap_or(self.config.beam_size),
                max_steps: request.max_steps.unwrap_or(self.config.max_steps),
            })
            .await
    }

    /// Execute `run` on a background task.
    ///
    /// The run is steerable through the launcher as soon as this returns.
    pub fn launch(
        &self,
        run: StoredRun,
        mut env: Box<dyn Environment>,
        policy: Arc<dyn Policy>,
    ) -> JoinHandle<Result<LoopOutcome>> {
        let token = CancellationToken::new();
        let control = self.register(&run, token.clone());
        let launcher = self.clone();
        tokio::spawn(async move {
            launcher
                .drive(&run, env.as_mut(), policy.as_ref(), control, token)
                .await
        })
    }

    /// Execute `run` to completion on the current task.
    ///
    /// A loop-fatal error is recorded on the run and returned.
    pub async fn execute(
        &self,
        run: &StoredRun,
        env: &mut dyn Environment,
        policy: &dyn Policy,
        token: CancellationToken,
    ) -> Result<LoopOutcome> {
        let control = self.register(run, token.clone());
        self.drive(run, env, policy, control, token).await
    }

    fn register(&self, run: &StoredRun, token: CancellationToken) -> RunControl {
        let control = RunControl::new(run.max_steps);
        self.bus
            .register_controller(&run.id, token, control.clone());
        control
    }

    async fn drive(
        &self,
        run: &StoredRun,
        env: &mut dyn Environment,
        policy: &dyn Policy,
        control: RunControl,
        token: CancellationToken,
    ) -> Result<LoopOutcome> {
        info!(run_id = %run.id, goal = %run.goal, "run started");
        control.attach_signal(token);

        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
        let writer = tokio::spawn({
            let store = Arc::clone(&self.store);
            let run_id = run.id.clone();
            async move {
                while let Some(event) = rx.recv().await {
                    let kind = event.kind();
                    if let Err(err) = store.append_event(&run_id, event).await {
                        warn!(run_id = %run_id, kind, error = %format!("{err:#}"), "failed to persist event");
                    }
                }
            }
        });

        let cache = TransitionCache::with_store(Arc::clone(&self.knowledge));
        let loop_config = LoopConfig {
            goal: run.goal.clone(),
            start_url: run.start_url.clone(),
            beam_size: run.beam_size,
            low_value_veto: self.config.low_value_veto,
            replan_window: self.config.replan_window,
            time_budget: self.config.time_budget(),
        };
        let forward = {
            let bus = self.bus.clone();
            let tx = tx.clone();
            let run_id = run.id.clone();
            move |event: RunEvent| {
                bus.publish(&run_id, event.clone());
                // The writer only stops once every sender is gone.
                let _ = tx.send(event);
            }
        };

        let result = match AssertUnwindSafe(run_atlas(
            &loop_config,
            env,
            policy,
            &cache,
            &control,
            forward,
        ))
        .catch_unwind()
        .await
        {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("run panicked: {}", panic_message(&*payload))),
        };

        if let Err(err) = env.close().await {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "environment close failed");
        }
        control.detach_signal();
        cache.flush().await;

        let terminal = match &result {
            Ok(outcome) => RunEvent::Done {
                ended_reason: outcome.ended_reason,
                steps: outcome.steps_taken,
                goal_met_reason: outcome.goal_met_reason.clone(),
                final_state: Some(outcome.final_state.clone()),
            },
            Err(err) => RunEvent::Error {
                message: format!("{err:#}"),
            },
        };
        let _ = tx.send(terminal.clone());
        drop(tx);
        if let Err(err) = writer.await {
            warn!(run_id = %run.id, error = %err, "event writer task failed");
        }

        let finalized = match &result {
            Ok(outcome) => {
                info!(
                    run_id = %run.id,
                    ended_reason = outcome.ended_reason.as_str(),
                    steps = outcome.steps_taken,
                    "run finished"
                );
                self.store
                    .mark_completed(
                        &run.id,
                        RunArtifacts {
                            ended_reason: outcome.ended_reason,
                            steps_taken: outcome.steps_taken,
                            final_state: Some(outcome.final_state.clone()),
                            goal_met_reason: outcome.goal_met_reason.clone(),
                            transitions: cache.snapshot(),
                        },
                    )
                    .await
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %format!("{err:#}"), "run failed");
                self.store.mark_error(&run.id, &format!("{err:#}")).await
            }
        };
        if let Err(err) = finalized {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "failed to finalize run record");
        }

        self.bus.publish(&run.id, terminal);
        result
    }

    /// Abort a live run. False when the run is not live.
    pub fn stop(&self, run_id: &str) -> bool {
        self.bus.abort(run_id)
    }

    pub fn pause(&self, run_id: &str) -> bool {
        self.with_control(run_id, RunControl::pause)
    }

    pub fn resume(&self, run_id: &str) -> bool {
        self.with_control(run_id, RunControl::resume)
    }

    /// Replace a live run's step budget.
    pub fn set_budget(&self, run_id: &str, max_steps: u32) -> bool {
        self.with_control(run_id, |control| control.update_max_steps(max_steps))
    }

    /// Continue a live run from an earlier step with a fresh plan.
    pub fn rewind(&self, run_id: &str, step: u32) -> bool {
        self.with_control(run_id, |control| control.rewind_to(step))
    }

    pub fn control_state(&self, run_id: &str) -> Option<RunControlState> {
        self.bus.control(run_id).map(|control| control.snapshot())
    }

    fn with_control(&self, run_id: &str, apply: impl FnOnce(&RunControl)) -> bool {
        match self.bus.control(run_id) {
            Some(control) => {
                apply(&control);
                true
            }
            None => false,
        }
    }

    pub async fn rename(&self, run_id: &str, name: &str) -> Result<Option<StoredRun>> {
        self.store.rename_run(run_id, name).await
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<StoredRun>> {
        self.store.get_run(run_id).await
    }

    pub async fn list(&self) -> Result<Vec<RunSummary>> {
        self.store.list_runs().await
    }

    /// Subscribe to a run's events.
    ///
    /// A run that finished where this launcher's bus never saw it (another
    /// process, or evicted from the retired set) still delivers its terminal
    /// event, rebuilt from the stored record.
    pub async fn subscribe<F>(&self, run_id: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&RunStreamEvent) + Send + Sync + 'static,
    {
        self.settle_finished(run_id).await?;
        Ok(self.bus.subscribe(run_id, handler))
    }

    pub async fn subscribe_channel(
        &self,
        run_id: &str,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<RunStreamEvent>)> {
        self.settle_finished(run_id).await?;
        Ok(self.bus.subscribe_channel(run_id))
    }

    async fn settle_finished(&self, run_id: &str) -> Result<()> {
        if self.bus.knows(run_id) {
            return Ok(());
        }
        if let Some(terminal) = self
            .store
            .get_run(run_id)
            .await?
            .and_then(|run| run.terminal_event())
        {
            debug!(run_id, kind = terminal.kind(), "replaying stored terminal event");
            self.bus.publish_if_unknown(run_id, terminal);
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
