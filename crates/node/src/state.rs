//! Session state machine states and the edge-triggered tracker.
//!
//! The tracker holds the current [`SessionState`] and notifies an observer
//! exactly once per distinct transition. A redundant `set` to the current
//! state is a no-op: no observer call, no history entry. The protocol
//! logic that decides *when* to transition lives in the agent; this type
//! only guarantees the observation contract.

use std::fmt;

/// Protocol lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Boot,
    Hello,
    PairSubmit,
    PendingPoll,
    /// Momentary: tokens just arrived; immediately followed by `Active`.
    Granted,
    Active,
    TunnelConnecting,
    TunnelConnected,
    /// Sink with recovery: re-enters `Hello` after the current backoff
    /// unless the cause was configuration-fatal.
    Error,
}

impl SessionState {
    /// States in which the node holds (or is about to hold) credentials.
    pub fn is_authed(self) -> bool {
        matches!(
            self,
            SessionState::Granted
                | SessionState::Active
                | SessionState::TunnelConnecting
                | SessionState::TunnelConnected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Boot => "BOOT",
            SessionState::Hello => "HELLO",
            SessionState::PairSubmit => "PAIR_SUBMIT",
            SessionState::PendingPoll => "PENDING_POLL",
            SessionState::Granted => "GRANTED",
            SessionState::Active => "ACTIVE",
            SessionState::TunnelConnecting => "TUNNEL_CONNECTING",
            SessionState::TunnelConnected => "TUNNEL_CONNECTED",
            SessionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Observer invoked once per distinct transition with `(from, to)`.
pub type StateObserver = Box<dyn Fn(SessionState, SessionState) + Send>;

/// Current state plus the edge-triggered observer.
pub struct StateTracker {
    current: SessionState,
    observer: Option<StateObserver>,
    transitions: u64,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: SessionState::Boot,
            observer: None,
            transitions: 0,
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    /// Total distinct transitions observed (redundant sets excluded).
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    pub fn set_observer(&mut self, observer: StateObserver) {
        self.observer = Some(observer);
    }

    /// Transitions to `next`. A redundant set is a no-op.
    pub fn set(&mut self, next: SessionState) {
        if next == self.current {
            return;
        }
        let from = self.current;
        self.current = next;
        self.transitions += 1;
        tracing::debug!(%from, to = %next, "state transition");
        if let Some(observer) = &self.observer {
            observer(from, next);
        }
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
