//! Observer notifications
//!
//! Everything the presentation layer needs to react to is broadcast as a
//! [`Notification`]. The current state is additionally published on a watch
//! channel so callers can wait for a state without missing it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::breakpoints::{BreakpointEntry, BreakpointUnit, BreakpointWarning};
use super::model::FrameSummary;
use super::state::SessionState;
use super::watch::Watch;

/// Capacity of the notification channel; slow observers lag rather than block
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    StateChanged {
        session: u64,
        old: SessionState,
        new: SessionState,
        reason: String,
    },
    /// The ledger or the adapter's view of one unit changed
    BreakpointsChanged {
        unit: BreakpointUnit,
        breakpoints: Vec<BreakpointEntry>,
    },
    /// The adapter could not accept a breakpoint (typically a bad condition)
    BreakpointWarning(BreakpointWarning),
    Stopped {
        session: u64,
        thread_id: i64,
        reason: String,
        description: Option<String>,
        frame: Option<FrameSummary>,
    },
    WatchesUpdated { watches: Vec<Watch> },
    Output { category: String, text: String },
    /// The adapter or target went away without reporting an exit
    TargetCrashed { session: u64, detail: String },
    Exited { session: u64, code: Option<i32> },
}

/// State as published on the watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub session: u64,
    pub state: SessionState,
}

/// Cloneable sender side of both channels
#[derive(Clone)]
pub struct Notifier {
    events: broadcast::Sender<Notification>,
    state: Arc<watch::Sender<StateSnapshot>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state, _) = watch::channel(StateSnapshot {
            session: 0,
            state: SessionState::Idle,
        });
        Self {
            events,
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<StateSnapshot> {
        self.state.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        // No observers is fine
        let _ = self.events.send(notification);
    }

    /// Publish a transition on both channels
    pub fn state_changed(&self, session: u64, old: SessionState, new: SessionState, reason: &str) {
        self.state.send_replace(StateSnapshot {
            session,
            state: new,
        });
        self.emit(Notification::StateChanged {
            session,
            old,
            new,
            reason: reason.to_string(),
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_changes_reach_both_channels() {
        let notifier = Notifier::new();
        let mut events = notifier.subscribe();
        let state = notifier.watch_state();

        notifier.state_changed(1, SessionState::Idle, SessionState::Launching, "launch");

        assert_eq!(state.borrow().state, SessionState::Launching);
        match events.recv().await.unwrap() {
            Notification::StateChanged { old, new, .. } => {
                assert_eq!(old, SessionState::Idle);
                assert_eq!(new, SessionState::Launching);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_observers() {
        let notifier = Notifier::new();
        notifier.emit(Notification::Output {
            category: "stdout".into(),
            text: "hi".into(),
        });
    }
}
