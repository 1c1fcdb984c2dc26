//! Named-hook dispatcher used at enqueue, perform, and failure.
//!
//! Two listener behaviors are contractual: a `beforeEnqueue` listener can
//! veto the enqueue, and a `beforePerform` listener can veto the perform
//! without that counting as a failure. Rather than model those as
//! exceptions-as-control-flow (as the originating PHP event bus does),
//! listeners return a `Decision` explicitly; the bus runs every listener
//! registered for the event regardless of earlier votes, then reports
//! `Veto` to the caller if any one of them vetoed — a three-valued return
//! is simpler to reason about than exception-based control flow and was
//! flagged as a desired redesign.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Veto,
}

pub type Listener = Arc<dyn Fn(&Value) -> Decision + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<&'static str, Vec<Listener>>>>,
}

pub const BEFORE_ENQUEUE: &str = "beforeEnqueue";
pub const AFTER_ENQUEUE: &str = "afterEnqueue";
pub const BEFORE_FIRST_FORK: &str = "beforeFirstFork";
pub const BEFORE_FORK: &str = "beforeFork";
pub const AFTER_FORK: &str = "afterFork";
pub const BEFORE_PERFORM: &str = "beforePerform";
pub const AFTER_PERFORM: &str = "afterPerform";
pub const ON_FAILURE: &str = "onFailure";

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &'static str, listener: Listener) {
        self.listeners
            .write()
            .unwrap()
            .entry(event)
            .or_default()
            .push(listener);
    }

    /// Dispatch to every listener registered under `event`. Only
    /// `beforeEnqueue` and `beforePerform` give their `Veto` return value
    /// any meaning to the caller; for every other event the bus always
    /// reports `Continue`, but listeners still all run.
    pub fn trigger(&self, event: &'static str, payload: &Value) -> Decision {
        let listeners = self.listeners.read().unwrap();
        let mut decision = Decision::Continue;
        if let Some(list) = listeners.get(event) {
            for listener in list {
                if listener(payload) == Decision::Veto {
                    decision = Decision::Veto;
                }
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn no_listeners_continues() {
        let bus = EventBus::new();
        assert_eq!(bus.trigger(BEFORE_ENQUEUE, &json!(null)), Decision::Continue);
    }

    #[test]
    fn a_single_veto_short_circuits_the_decision() {
        let bus = EventBus::new();
        bus.on(BEFORE_ENQUEUE, Arc::new(|_| Decision::Continue));
        bus.on(BEFORE_ENQUEUE, Arc::new(|_| Decision::Veto));
        assert_eq!(bus.trigger(BEFORE_ENQUEUE, &json!(null)), Decision::Veto);
    }

    #[test]
    fn all_listeners_run_even_after_a_veto() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        bus.on(
            BEFORE_PERFORM,
            Arc::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
                Decision::Veto
            }),
        );
        bus.on(
            BEFORE_PERFORM,
            Arc::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
                Decision::Continue
            }),
        );
        bus.trigger(BEFORE_PERFORM, &json!(null));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
