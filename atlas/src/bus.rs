//! In-memory fan-out of run events to live subscribers.
//!
//! The bus is keyed by run id. Publishing dispatches synchronously to every
//! handler registered at that moment, in registration order, and never
//! persists anything. A terminal event (`done` or `error`) retires the run:
//! its handlers and controller are dropped and the terminal event is
//! remembered so a subscriber arriving late still learns how the run ended.
//!
//! Handlers run on the publisher's task and must not block. Consumers that
//! need to await use [`RunEventBus::subscribe_channel`].

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::RunControl;
use crate::core::events::{RunEvent, RunStreamEvent};

/// Default number of retired runs whose terminal event is remembered.
pub const DEFAULT_RETIRED_CAPACITY: usize = 256;

type Handler = Arc<dyn Fn(&RunStreamEvent) + Send + Sync>;

struct Controller {
    token: CancellationToken,
    control: RunControl,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, Vec<(u64, Handler)>>,
    controllers: HashMap<String, Controller>,
    retired: HashMap<String, RunStreamEvent>,
    retired_order: VecDeque<String>,
}

struct Shared {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    retired_capacity: usize,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_listener(&self, run_id: &str, id: u64) {
        let mut registry = self.registry();
        if let Some(handlers) = registry.listeners.get_mut(run_id) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.is_empty() {
                registry.listeners.remove(run_id);
            }
        }
    }
}

/// Pub/sub registry for run events and live run controllers.
#[derive(Clone)]
pub struct RunEventBus {
    shared: Arc<Shared>,
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.shared.registry();
        f.debug_struct("RunEventBus")
            .field("live_runs", &registry.listeners.len())
            .field("controllers", &registry.controllers.len())
            .field("retired", &registry.retired.len())
            .finish()
    }
}

/// Handle returned by [`RunEventBus::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`Subscription::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    run_id: String,
    id: u64,
    active: AtomicBool,
    bus: Weak<Shared>,
}

impl Subscription {
    fn inert(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            id: 0,
            active: AtomicBool::new(false),
            bus: Weak::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stop receiving events. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.bus.upgrade() {
            shared.remove_listener(&self.run_id, self.id);
        }
    }
}

impl RunEventBus {
    pub fn new() -> Self {
        Self::with_retired_capacity(DEFAULT_RETIRED_CAPACITY)
    }

    pub fn with_retired_capacity(retired_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                retired_capacity,
            }),
        }
    }

    /// Register `handler` for `run_id`.
    ///
    /// If the run already finished, the handler receives its terminal event
    /// immediately and the returned subscription is inert.
    pub fn subscribe<F>(&self, run_id: &str, handler: F) -> Subscription
    where
        F: Fn(&RunStreamEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let terminal = {
            let mut registry = self.shared.registry();
            if let Some(terminal) = registry.retired.get(run_id).cloned() {
                terminal
            } else {
                let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                registry
                    .listeners
                    .entry(run_id.to_string())
                    .or_default()
                    .push((id, handler));
                debug!(run_id, subscriber = id, "bus subscriber added");
                return Subscription {
                    run_id: run_id.to_string(),
                    id,
                    active: AtomicBool::new(true),
                    bus: Arc::downgrade(&self.shared),
                };
            }
        };
        dispatch(&handler, &terminal);
        Subscription::inert(run_id)
    }

    /// Subscribe through an unbounded channel instead of a callback.
    ///
    /// The receiver closes after the terminal event once the subscription is
    /// dropped by retirement.
    pub fn subscribe_channel(
        &self,
        run_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<RunStreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(run_id, move |event| {
            // A closed receiver just means the consumer went away.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Deliver `event` to the run's current subscribers.
    pub fn publish(&self, run_id: &str, event: RunEvent) {
        let terminal = event.is_terminal();
        let stream_event = RunStreamEvent {
            run_id: run_id.to_string(),
            event,
        };
        let handlers: Vec<Handler> = {
            let registry = self.shared.registry();
            registry
                .listeners
                .get(run_id)
                .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in &handlers {
            dispatch(handler, &stream_event);
        }
        if terminal {
            self.retire(run_id, stream_event);
        }
    }

    fn retire(&self, run_id: &str, terminal: RunStreamEvent) {
        let mut registry = self.shared.registry();
        registry.listeners.remove(run_id);
        registry.controllers.remove(run_id);
        if self.shared.retired_capacity == 0 {
            return;
        }
        if registry
            .retired
            .insert(run_id.to_string(), terminal)
            .is_none()
        {
            registry.retired_order.push_back(run_id.to_string());
        }
        while registry.retired_order.len() > self.shared.retired_capacity {
            if let Some(oldest) = registry.retired_order.pop_front() {
                registry.retired.remove(&oldest);
            }
        }
        debug!(run_id, "bus retired run");
    }

    /// Make a live run abortable through this bus.
    pub fn register_controller(&self, run_id: &str, token: CancellationToken, control: RunControl) {
        self.shared
            .registry()
            .controllers
            .insert(run_id.to_string(), Controller { token, control });
    }

    /// Stop then cancel a live run. Returns false when nothing is registered.
    pub fn abort(&self, run_id: &str) -> bool {
        let controller = self.shared.registry().controllers.remove(run_id);
        match controller {
            Some(Controller { token, control }) => {
                control.stop();
                token.cancel();
                debug!(run_id, "bus aborted run");
                true
            }
            None => false,
        }
    }

    pub fn control(&self, run_id: &str) -> Option<RunControl> {
        self.shared
            .registry()
            .controllers
            .get(run_id)
            .map(|controller| controller.control.clone())
    }

    /// Whether the run is live here or retired with a remembered ending.
    pub fn knows(&self, run_id: &str) -> bool {
        let registry = self.shared.registry();
        registry.controllers.contains_key(run_id) || registry.retired.contains_key(run_id)
    }

    /// Publish a terminal event for a run that finished outside this bus.
    ///
    /// Ignored when the run is live or already retired here, and for
    /// non-terminal events.
    pub fn publish_if_unknown(&self, run_id: &str, event: RunEvent) {
        if !event.is_terminal() || self.knows(run_id) {
            return;
        }
        self.publish(run_id, event);
    }

    /// Drop every listener and controller of a run.
    pub fn clear(&self, run_id: &str) {
        let mut registry = self.shared.registry();
        registry.listeners.remove(run_id);
        registry.controllers.remove(run_id);
    }

    pub fn listener_count(&self, run_id: &str) -> usize {
        self.shared
            .registry()
            .listeners
            .get(run_id)
            .map_or(0, Vec::len)
    }
}

fn dispatch(handler: &Handler, event: &RunStreamEvent) {
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        warn!(run_id = %event.run_id, kind = event.event.kind(), "bus subscriber panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EndedReason, Plan};

    fn plan() -> RunEvent {
        RunEvent::Plan {
            plan: Plan::default(),
        }
    }

    fn done() -> RunEvent {
        RunEvent::Done {
            ended_reason: EndedReason::MaxSteps,
            steps: 2,
            goal_met_reason: None,
            final_state: None,
        }
    }

    fn recorder() -> (
        Arc<Mutex<Vec<String>>>,
        impl Fn(&RunStreamEvent) + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &RunStreamEvent| {
            sink.lock()
                .expect("lock")
                .push(format!("{}:{}", event.run_id, event.event.kind()));
        })
    }

    #[test]
    fn delivers_in_order_to_every_subscriber_of_the_run() {
        let bus = RunEventBus::new();
        let (first, first_handler) = recorder();
        let (second, second_handler) = recorder();
        let (other, other_handler) = recorder();
        let _a = bus.subscribe("r1", first_handler);
        let _b = bus.subscribe("r1", second_handler);
        let _c = bus.subscribe("r2", other_handler);

        bus.publish("r1", plan());
        bus.publish("r1", done());

        let expected = vec!["r1:plan".to_string(), "r1:done".to_string()];
        assert_eq!(*first.lock().expect("lock"), expected);
        assert_eq!(*second.lock().expect("lock"), expected);
        assert!(other.lock().expect("lock").is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = RunEventBus::new();
        let (seen, handler) = recorder();
        let subscription = bus.subscribe("r1", handler);
        assert_eq!(bus.listener_count("r1"), 1);

        subscription.unsubscribe();
        subscription.unsubscribe();
        bus.publish("r1", plan());

        assert_eq!(bus.listener_count("r1"), 0);
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_reach_publisher_or_peers() {
        let bus = RunEventBus::new();
        let _bad = bus.subscribe("r1", |_| panic!("subscriber bug"));
        let (seen, handler) = recorder();
        let _good = bus.subscribe("r1", handler);

        bus.publish("r1", plan());

        assert_eq!(seen.lock().expect("lock").len(), 1);
    }

    #[test]
    fn terminal_event_retires_run_and_replays_to_late_subscribers() {
        let bus = RunEventBus::new();
        let (early, handler) = recorder();
        let _sub = bus.subscribe("r1", handler);
        bus.register_controller("r1", CancellationToken::new(), RunControl::new(3));

        bus.publish("r1", done());
        assert_eq!(bus.listener_count("r1"), 0);
        assert!(bus.control("r1").is_none());

        bus.publish("r1", plan());
        assert_eq!(early.lock().expect("lock").len(), 1);

        let (late, late_handler) = recorder();
        let late_sub = bus.subscribe("r1", late_handler);
        assert_eq!(*late.lock().expect("lock"), vec!["r1:done".to_string()]);
        late_sub.unsubscribe();
    }

    #[test]
    fn endings_from_elsewhere_only_apply_to_unknown_runs() {
        let bus = RunEventBus::new();
        bus.register_controller("live", CancellationToken::new(), RunControl::new(3));
        bus.publish_if_unknown("live", done());
        assert!(bus.control("live").is_some());

        bus.publish_if_unknown("cold", plan());
        assert!(!bus.knows("cold"));

        let (waiting, handler) = recorder();
        let _sub = bus.subscribe("cold", handler);
        bus.publish_if_unknown("cold", done());
        assert_eq!(*waiting.lock().expect("lock"), vec!["cold:done".to_string()]);
        assert!(bus.knows("cold"));

        let (late, late_handler) = recorder();
        let _late = bus.subscribe("cold", late_handler);
        assert_eq!(*late.lock().expect("lock"), vec!["cold:done".to_string()]);
    }

    #[test]
    fn retired_memory_is_bounded() {
        let bus = RunEventBus::with_retired_capacity(2);
        for run in ["a", "b", "c"] {
            bus.publish(run, done());
        }
        let (seen, handler) = recorder();
        let _a = bus.subscribe("a", handler);
        assert!(seen.lock().expect("lock").is_empty());
        assert_eq!(bus.listener_count("a"), 1);

        let (seen_c, handler_c) = recorder();
        let _c = bus.subscribe("c", handler_c);
        assert_eq!(seen_c.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn abort_stops_and_cancels() {
        let bus = RunEventBus::new();
        let token = CancellationToken::new();
        let control = RunControl::new(5);
        bus.register_controller("r1", token.clone(), control.clone());

        assert!(bus.abort("r1"));
        assert!(token.is_cancelled());
        assert!(control.is_stopping());
        assert!(!bus.abort("r1"));
        assert!(!bus.abort("unknown"));
    }

    #[test]
    fn clear_drops_listeners_and_controller() {
        let bus = RunEventBus::new();
        let (_seen, handler) = recorder();
        let _sub = bus.subscribe("r1", handler);
        bus.register_controller("r1", CancellationToken::new(), RunControl::new(1));

        bus.clear("r1");

        assert_eq!(bus.listener_count("r1"), 0);
        assert!(!bus.abort("r1"));
    }

    #[tokio::test]
    async fn channel_subscription_receives_events() {
        let bus = RunEventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel("r1");

        bus.publish("r1", plan());
        bus.publish("r1", done());

        assert_eq!(rx.recv().await.expect("plan").event.kind(), "plan");
        assert_eq!(rx.recv().await.expect("done").event.kind(), "done");
        assert!(rx.recv().await.is_none());
    }
}
