//! Per-component state fan-out.
//!
//! Each component id maps to a latest-value channel: publishing overwrites
//! any undelivered state, so a slow subscriber sees a coalesced stream that
//! is never older than what it already received. Subscribing delivers the
//! current state immediately (once one exists). Dropping a [`Subscription`]
//! is cancellation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use foreman_model::ComponentState;

type Slot = Arc<watch::Sender<Option<ComponentState>>>;

/// Fan-out hub shared between the reconciler and the component runtimes.
#[derive(Default)]
pub struct StateBus {
    slots: Mutex<HashMap<String, Slot>>,
}

impl StateBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, component_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(component_id.to_string())
            .or_insert_with(|| Arc::new(watch::channel(None).0))
            .clone()
    }

    /// Publish the latest state for a component. Intermediate states may be
    /// coalesced; only the newest one matters to subscribers.
    pub fn publish(&self, component_id: &str, state: ComponentState) {
        self.slot(component_id).send_replace(Some(state));
    }

    /// Subscribe to a component's state stream. Works before the component
    /// exists; the subscriber then sees its first published state.
    pub fn subscribe(&self, component_id: &str) -> Subscription {
        let mut rx = self.slot(component_id).subscribe();
        rx.mark_changed();
        Subscription { rx }
    }

    /// Drop a component's slot after teardown. Live subscribers receive the
    /// final published state and then end.
    pub fn remove(&self, component_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(component_id);
    }

    /// Snapshot of every component's latest state.
    pub fn snapshot(&self) -> BTreeMap<String, ComponentState> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .filter_map(|(id, slot)| slot.borrow().clone().map(|state| (id.clone(), state)))
            .collect()
    }
}

/// Handle yielding a component's state stream.
pub struct Subscription {
    rx: watch::Receiver<Option<ComponentState>>,
}

impl Subscription {
    /// Next state, or `None` once the component is torn down and its final
    /// state has been delivered.
    pub async fn recv(&mut self) -> Option<ComponentState> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(state) = self.rx.borrow_and_update().clone() {
                return Some(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::UnitState;

    fn state(msg: &str) -> ComponentState {
        let mut s = ComponentState::starting(msg);
        s.state = UnitState::Healthy;
        s
    }

    #[tokio::test]
    async fn subscriber_gets_current_state_immediately() {
        let bus = StateBus::new();
        bus.publish("c1", state("first"));

        let mut sub = bus.subscribe("c1");
        let got = sub.recv().await.unwrap();
        assert_eq!(got.message, "first");
    }

    #[tokio::test]
    async fn subscribe_before_publish_yields_first_state() {
        let bus = Arc::new(StateBus::new());
        let mut sub = bus.subscribe("c1");

        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            publisher.publish("c1", state("hello"));
        });

        let got = sub.recv().await.unwrap();
        assert_eq!(got.message, "hello");
    }

    #[tokio::test]
    async fn slow_subscriber_sees_only_latest() {
        let bus = StateBus::new();
        let mut sub = bus.subscribe("c1");

        bus.publish("c1", state("one"));
        bus.publish("c1", state("two"));
        bus.publish("c1", state("three"));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.message, "three");
    }

    #[tokio::test]
    async fn removal_ends_the_stream_after_final_state() {
        let bus = StateBus::new();
        let mut sub = bus.subscribe("c1");
        bus.publish("c1", state("final"));
        bus.remove("c1");

        assert_eq!(sub.recv().await.unwrap().message, "final");
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn snapshot_reflects_latest_states() {
        let bus = StateBus::new();
        bus.publish("a", state("sa"));
        bus.publish("b", state("sb"));

        let snap = bus.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["a"].message, "sa");
        assert_eq!(snap["b"].message, "sb");
    }
}
