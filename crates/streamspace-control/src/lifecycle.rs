//! Session lifecycle state machine.
//!
//! This module defines the valid state transitions for sessions and provides
//! validation logic to ensure state machine invariants are maintained.
//!
//! # State Machine
//!
//! ```text
//!              ┌───────────┐ (start fails / stuck + agent gone) ┌────────┐
//!              │  Pending  │───────────────────────────────────▶│ Failed │
//!              └─────┬─────┘                                    └────────┘
//!                    │ (start completes)                             ▲
//!                    ▼                                               │
//!              ┌───────────┐      (agent reports failure)            │
//!              │  Running  │─────────────────────────────────────────┘
//!              │           │ (hibernate) ┌────────────┐
//!              │           │────────────▶│ Hibernated │
//!              │           │◀────────────│            │
//!              └─────┬─────┘   (wake)    └─────┬──────┘
//!                    │ (stop)                  │ (stop)
//!                    ▼                         │
//!              ┌─────────────┐◀────────────────┘
//!              │ Terminating │
//!              └─────┬───────┘
//!                    │ (stop completes / stuck + agent gone)
//!                    ▼
//!              ┌────────────┐
//!              │ Terminated │
//!              └────────────┘
//! ```
//!
//! A `Pending` session may also be stopped straight into `Terminating`.
//!
//! The reconciler only ever pushes sessions toward `Terminated` or `Failed`.

use streamspace_core::{SessionId, SessionState};

use crate::error::{ControlError, Result};

const ALL_STATES: [SessionState; 6] = [
    SessionState::Pending,
    SessionState::Running,
    SessionState::Hibernated,
    SessionState::Terminating,
    SessionState::Terminated,
    SessionState::Failed,
];

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidSessionState` if the transition is not
/// allowed.
pub fn validate_transition(
    session_id: &SessionId,
    from: SessionState,
    to: SessionState,
) -> Result<SessionState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidSessionState {
            session_id: session_id.clone(),
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Failed, Hibernated, Pending, Running, Terminated, Terminating};

    matches!(
        (from, to),
        (Pending, Running | Failed | Terminating)
            | (Running, Hibernated | Terminating | Failed)
            | (Hibernated, Running | Terminating)
            | (Terminating, Terminated)
    )
}

/// Returns every state from which `to` may be entered.
///
/// Used as the expected-state set of a compare-and-set write.
#[must_use]
pub fn sources_for(to: SessionState) -> Vec<SessionState> {
    ALL_STATES
        .into_iter()
        .filter(|from| is_valid_transition(*from, to))
        .collect()
}

/// Returns true for states with no outgoing transitions.
#[must_use]
pub const fn is_terminal(state: SessionState) -> bool {
    matches!(state, SessionState::Terminated | SessionState::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use SessionState::*;

        assert!(is_valid_transition(Pending, Running));
        assert!(is_valid_transition(Pending, Failed));
        assert!(is_valid_transition(Running, Terminating));
        assert!(is_valid_transition(Running, Hibernated));
        assert!(is_valid_transition(Hibernated, Running));
        assert!(is_valid_transition(Terminating, Terminated));
    }

    #[test]
    fn invalid_transitions() {
        use SessionState::*;

        // Nothing leaves a terminal state
        for to in ALL_STATES {
            assert!(!is_valid_transition(Terminated, to));
            assert!(!is_valid_transition(Failed, to));
        }
        // Terminating never goes back to running
        assert!(!is_valid_transition(Terminating, Running));
        // Waking is explicit, never a jump from pending
        assert!(!is_valid_transition(Pending, Hibernated));
        // A hibernated session is stopped, never failed directly
        assert!(!is_valid_transition(Hibernated, Failed));
    }

    #[test]
    fn validate_transition_error() {
        let session_id = SessionId::new("sess-1").unwrap();
        let err =
            validate_transition(&session_id, SessionState::Terminated, SessionState::Running)
                .unwrap_err();
        assert!(matches!(err, ControlError::InvalidSessionState { .. }));
    }

    #[test]
    fn sources_for_running() {
        assert_eq!(
            sources_for(SessionState::Running),
            vec![SessionState::Pending, SessionState::Hibernated]
        );
        assert_eq!(
            sources_for(SessionState::Terminated),
            vec![SessionState::Terminating]
        );
    }

    #[test]
    fn terminal_states() {
        assert!(is_terminal(SessionState::Failed));
        assert!(is_terminal(SessionState::Terminated));
        assert!(!is_terminal(SessionState::Terminating));
    }
}
