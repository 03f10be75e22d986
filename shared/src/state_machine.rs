//! Connection Lifecycle State Machine
//!
//! Defines the valid phases of the reader connection and the events that move
//! it between them. `Closed` is terminal.

use std::fmt;

/// Phase of the shared reader connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, `start()` not called yet
    Idle,
    /// A connect attempt is outstanding
    Connecting,
    /// The current attempt produced a live connection
    Connected,
    /// The last attempt failed or the connection was lost; a reconnect is scheduled
    Disconnected,
    /// Permanently shut down
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Events that can trigger lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `start()` was called
    Start,
    /// The current attempt connected
    Connected,
    /// The current attempt failed, or its established connection was lost
    ConnectFailed,
    /// The reconnect delay elapsed
    ReconnectDue,
    /// `close()` was called
    Close,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and the state changed
    Success(LifecycleState),
    /// Event was valid but has no effect in the current state (e.g. a second `start()`)
    Unchanged(LifecycleState),
    /// Transition was invalid from the current state
    Invalid {
        from: LifecycleState,
        event: LifecycleEvent,
    },
}

/// State machine tracking the connection lifecycle
#[derive(Debug)]
pub struct LifecycleStateMachine {
    current_state: LifecycleState,
    failures_in_a_row: u32,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self {
            current_state: LifecycleState::Idle,
            failures_in_a_row: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> LifecycleState {
        self.current_state
    }

    /// Number of failed attempts since the last successful connect
    pub fn failures_in_a_row(&self) -> u32 {
        self.failures_in_a_row
    }

    pub fn is_closed(&self) -> bool {
        self.current_state == LifecycleState::Closed
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LifecycleEvent) -> TransitionResult {
        use LifecycleEvent::*;
        use LifecycleState::*;

        let next = match (self.current_state, event) {
            // Closing is always possible, once
            (Closed, _) => None,
            (_, Close) => Some(Closed),

            // start() is idempotent
            (Idle, Start) => Some(Connecting),
            (state, Start) => return TransitionResult::Unchanged(state),

            (Connecting, LifecycleEvent::Connected) => Some(LifecycleState::Connected),
            (Connecting | LifecycleState::Connected, ConnectFailed) => Some(Disconnected),
            (Disconnected, ReconnectDue) => Some(Connecting),

            _ => None,
        };

        match next {
            Some(state) => {
                match state {
                    LifecycleState::Connected => self.failures_in_a_row = 0,
                    Disconnected => {
                        self.failures_in_a_row = self.failures_in_a_row.saturating_add(1)
                    }
                    _ => {}
                }
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LifecycleStateMachine::new();
        assert_eq!(fsm.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_reconnect_cycle() {
        let mut fsm = LifecycleStateMachine::new();

        let result = fsm.process_event(LifecycleEvent::Start);
        assert_eq!(result, TransitionResult::Success(LifecycleState::Connecting));

        let result = fsm.process_event(LifecycleEvent::ConnectFailed);
        assert_eq!(result, TransitionResult::Success(LifecycleState::Disconnected));
        assert_eq!(fsm.failures_in_a_row(), 1);

        let result = fsm.process_event(LifecycleEvent::ReconnectDue);
        assert_eq!(result, TransitionResult::Success(LifecycleState::Connecting));

        let result = fsm.process_event(LifecycleEvent::Connected);
        assert_eq!(result, TransitionResult::Success(LifecycleState::Connected));
        assert_eq!(fsm.failures_in_a_row(), 0);

        // Connection lost
        let result = fsm.process_event(LifecycleEvent::ConnectFailed);
        assert_eq!(result, TransitionResult::Success(LifecycleState::Disconnected));
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut fsm = LifecycleStateMachine::new();
        fsm.process_event(LifecycleEvent::Start);

        let result = fsm.process_event(LifecycleEvent::Start);
        assert_eq!(result, TransitionResult::Unchanged(LifecycleState::Connecting));
        assert_eq!(fsm.state(), LifecycleState::Connecting);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut fsm = LifecycleStateMachine::new();
        fsm.process_event(LifecycleEvent::Start);
        fsm.process_event(LifecycleEvent::Close);
        assert!(fsm.is_closed());

        let result = fsm.process_event(LifecycleEvent::Connected);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        let result = fsm.process_event(LifecycleEvent::Start);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = LifecycleStateMachine::new();

        // Can't connect before start
        let result = fsm.process_event(LifecycleEvent::Connected);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), LifecycleState::Idle);

        // Reconnect timer only fires while disconnected
        fsm.process_event(LifecycleEvent::Start);
        let result = fsm.process_event(LifecycleEvent::ReconnectDue);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }
}
