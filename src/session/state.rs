//! Session lifecycle states

use serde::Serialize;

/// Lifecycle of one debug session
///
/// `Idle → Launching/Attaching → Running ⇄ Stopped → Terminating → Terminated`.
/// `Terminated` is absorbing; a new launch creates a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Launching,
    Attaching,
    Running,
    Stopped,
    Terminating,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Launching => write!(f, "launching"),
            SessionState::Attaching => write!(f, "attaching"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Terminating => write!(f, "terminating"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

impl SessionState {
    /// Whether the session owns a live adapter connection
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopped)
    }

    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Launching | Attaching) => true,
            // A failed start returns to Idle
            (Launching | Attaching, Idle | Running | Terminating) => true,
            (Running, Stopped | Terminating) => true,
            (Stopped, Running | Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The user asked for it
    Requested,
    /// Disconnected from an attached target, leaving it running
    Detached,
    /// The adapter reported the debuggee exited or the session terminated
    Exited { code: Option<i32> },
    /// The channel to the adapter was lost without an exit report
    Crashed { detail: String },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Requested => write!(f, "terminated by user"),
            TerminationReason::Detached => write!(f, "detached"),
            TerminationReason::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            TerminationReason::Exited { code: None } => write!(f, "exited"),
            TerminationReason::Crashed { detail } => write!(f, "crashed: {}", detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_terminated_is_absorbing() {
        for next in [Idle, Launching, Attaching, Running, Stopped, Terminating, Terminated] {
            assert!(!Terminated.can_transition_to(next), "terminated -> {}", next);
        }
    }

    #[test]
    fn test_run_stop_cycle() {
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Terminated));
        assert!(Launching.can_transition_to(Idle));
    }

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(
            TerminationReason::Exited { code: Some(3) }.to_string(),
            "exited with code 3"
        );
        assert_eq!(
            TerminationReason::Crashed {
                detail: "adapter killed by signal 9".into()
            }
            .to_string(),
            "crashed: adapter killed by signal 9"
        );
    }
}
