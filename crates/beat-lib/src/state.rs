//! Agent lifecycle state
//!
//! The supervisor owns the only writer. Every other component holds a
//! [`AgentStateHandle`] clone and can read or wait on the state.

use crate::error::StateError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Process-wide lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl AgentState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: AgentState) -> bool {
        matches!(
            (self, next),
            (AgentState::Starting, AgentState::Running)
                | (AgentState::Starting, AgentState::Draining)
                | (AgentState::Running, AgentState::Draining)
                | (AgentState::Draining, AgentState::Stopped)
        )
    }

    /// Numeric code exported as a gauge
    pub fn as_code(self) -> i64 {
        match self {
            AgentState::Starting => 0,
            AgentState::Running => 1,
            AgentState::Draining => 2,
            AgentState::Stopped => 3,
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Starting => write!(f, "starting"),
            AgentState::Running => write!(f, "running"),
            AgentState::Draining => write!(f, "draining"),
            AgentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Typed readiness signal, published once the agent enters `Running`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessEvent {
    pub beat: String,
    pub version: String,
    pub collectors: Vec<String>,
}

/// Shared, cloneable view of the agent state
#[derive(Debug, Clone)]
pub struct AgentStateHandle {
    state: Arc<watch::Sender<AgentState>>,
    readiness: Arc<watch::Sender<Option<ReadinessEvent>>>,
}

impl Default for AgentStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AgentState::Starting);
        let (readiness, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            readiness: Arc::new(readiness),
        }
    }

    /// Current state
    pub fn get(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Move to `next`, rejecting anything but a forward transition
    pub fn transition(&self, next: AgentState) -> Result<AgentState, StateError> {
        let mut result = Ok(next);
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                let previous = *current;
                *current = next;
                result = Ok(previous);
                true
            } else {
                result = Err(StateError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Wait until the state is at least `target`
    ///
    /// Returns the state that satisfied the wait.
    pub async fn wait_for(&self, target: AgentState) -> AgentState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| *s >= target).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close while we wait
            Err(_) => self.get(),
        };
        state
    }

    /// Record the typed readiness signal
    pub fn mark_ready(&self, event: ReadinessEvent) {
        self.readiness.send_replace(Some(event));
    }

    /// Readiness signal, if the agent has become ready
    pub fn readiness(&self) -> Option<ReadinessEvent> {
        self.readiness.borrow().clone()
    }

    /// Wait for the readiness signal
    pub async fn wait_ready(&self) -> ReadinessEvent {
        let mut rx = self.readiness.subscribe();
        loop {
            if let Some(event) = rx.borrow_and_update().clone() {
                return event;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender; park forever like a pending future
                std::future::pending::<()>().await;
            }
        }
    }
}
