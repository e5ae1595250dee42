//! Action correlation.
//!
//! Every outbound action carries a freshly generated UUID; the tracker maps
//! it to a waiter completed by the matching response frame. Deadlines are
//! enforced per call: the caller races a timeout, and the runtime's check-in
//! tick sweeps expired entries so the map cannot leak. Waiters survive a
//! worker restart (the next live instance may still answer inside the
//! deadline); they are failed with `ConnectionClosed` only when the runtime
//! itself tears down.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use foreman_wire::{ActionResponse, ActionStatus};

/// Errors surfaced by `perform_action`.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The action did not complete within the caller's deadline.
    #[error("action deadline exceeded")]
    DeadlineExceeded,

    /// The component has no live worker connection to dispatch on.
    #[error("worker is not connected")]
    NotConnected,

    /// The owning runtime was torn down with the action in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The worker answered with an error (including `action undefined`).
    #[error("{0}")]
    Worker(String),

    /// No component with the given id exists in the current model.
    #[error("unknown component: {0}")]
    UnknownComponent(String),

    /// The manager is not running.
    #[error("manager unavailable")]
    Unavailable,
}

pub(crate) struct PendingAction {
    reply: oneshot::Sender<Result<Value, ActionError>>,
    deadline: Instant,
}

/// Correlation map for one component runtime.
#[derive(Default)]
pub(crate) struct ActionTracker {
    pending: HashMap<String, PendingAction>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(
        &mut self,
        id: String,
        reply: oneshot::Sender<Result<Value, ActionError>>,
        deadline: Instant,
    ) {
        self.pending.insert(id, PendingAction { reply, deadline });
    }

    /// Complete the waiter matching a response frame. Returns false for
    /// unknown (already expired) correlation ids.
    pub fn complete(&mut self, response: ActionResponse) -> bool {
        let Some(pending) = self.pending.remove(&response.id) else {
            return false;
        };
        let result = match response.status {
            ActionStatus::Ok => Ok(response.result),
            ActionStatus::Error => Err(ActionError::Worker(
                response
                    .error
                    .unwrap_or_else(|| "action failed".to_string()),
            )),
        };
        let _ = pending.reply.send(result);
        true
    }

    /// Sweep waiters whose deadline has passed.
    pub fn prune_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(ActionError::DeadlineExceeded));
            }
        }
    }

    /// Fail every in-flight waiter; used at runtime teardown.
    pub fn fail_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(ActionError::ConnectionClosed));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
