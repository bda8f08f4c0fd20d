//! Connection state machine and per-instance event ring buffer (§4.1).
//! Grounded on the typed state tracker + broadcast state-change events in
//! `other_examples/33d7db9d_...connection-manager.rs.rs`.

use std::collections::VecDeque;
use chrono::{DateTime, Utc};
use serde::Serialize;

const TRANSITION_BUFFER_LEN: usize = 50;
const EVENT_BUFFER_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether `to` is a permitted transition out of `self` (§4.1 table).
    /// Setting the same state twice is defined as a no-op, not a transition.
    fn allows(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        if self == to {
            return false;
        }
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Failed, Reconnecting)
                | (Failed, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Reconnecting,
    ReconnectSuccess,
    ReconnectFailed,
    HealthFail,
    RateLimited,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub instance_name: String,
    pub kind: ConnectionEventKind,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

/// Owns the current state, the last 50 transitions, and the last 100 events
/// for one instance. Lives behind the pool's per-connection lock; callers
/// never hold it across an `.await`. State-change notification is the
/// pool's job (`SshPool::subscribe_state_changes`), not this tracker's —
/// one broadcast channel per instance would mean callers have to resubscribe
/// across `close()`/reconnect churn, which `SshPool` does not need to expose.
pub struct StateTracker {
    state: ConnectionState,
    transitions: VecDeque<StateTransition>,
    events: VecDeque<ConnectionEvent>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transitions: VecDeque::with_capacity(TRANSITION_BUFFER_LEN),
            events: VecDeque::with_capacity(EVENT_BUFFER_LEN),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attempts the transition; no-op (and returns false) if `to == state` or
    /// the transition is not in the permitted table.
    pub fn transition(&mut self, to: ConnectionState, reason: impl Into<String>) -> bool {
        if !self.state.allows(to) {
            return false;
        }
        let record = StateTransition {
            from: self.state,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        };
        self.state = to;
        if self.transitions.len() >= TRANSITION_BUFFER_LEN {
            self.transitions.pop_front();
        }
        self.transitions.push_back(record);
        true
    }

    pub fn record_event(&mut self, instance_name: &str, kind: ConnectionEventKind, details: impl Into<String>) {
        if self.events.len() >= EVENT_BUFFER_LEN {
            self.events.pop_front();
        }
        self.events.push_back(ConnectionEvent {
            instance_name: instance_name.to_string(),
            kind,
            timestamp: Utc::now(),
            details: details.into(),
        });
    }

    pub fn recent_events(&self, n: usize) -> Vec<ConnectionEvent> {
        let len = self.events.len();
        let start = len.saturating_sub(n);
        self.events.iter().skip(start).cloned().collect()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.iter().cloned().collect()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_disconnected() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn permitted_transitions_apply_in_order() {
        let mut tracker = StateTracker::new();
        assert!(tracker.transition(ConnectionState::Connecting, "connect begin"));
        assert!(tracker.transition(ConnectionState::Connected, "handshake ok"));
        assert!(tracker.transition(ConnectionState::Reconnecting, "health failure"));
        assert!(tracker.transition(ConnectionState::Failed, "retries exhausted"));

        let transitions = tracker.transitions();
        assert_eq!(transitions[0].from, ConnectionState::Disconnected);
        for pair in transitions.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }

    #[test]
    fn repeated_state_is_noop() {
        let mut tracker = StateTracker::new();
        tracker.transition(ConnectionState::Connecting, "x");
        tracker.transition(ConnectionState::Connected, "x");
        assert!(!tracker.transition(ConnectionState::Connected, "x"));
        assert_eq!(tracker.transitions().len(), 2);
    }

    #[test]
    fn disallowed_transition_rejected() {
        let mut tracker = StateTracker::new();
        // Disconnected -> Connected is not in the permitted table.
        assert!(!tracker.transition(ConnectionState::Connected, "skip"));
        assert_eq!(tracker.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn event_buffer_caps_and_returns_tail() {
        let mut tracker = StateTracker::new();
        for i in 0..150 {
            tracker.record_event("agent-1", ConnectionEventKind::HealthFail, format!("tick {i}"));
        }
        let recent = tracker.recent_events(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent.last().unwrap().details, "tick 149");
    }
}
