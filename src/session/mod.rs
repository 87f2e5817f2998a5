//! Debug session management
//!
//! A [`SessionManager`] task owns the current [`DebugSession`] together with
//! the breakpoint ledger and watch registry, which survive across sessions.
//! Front ends drive it through a [`SessionHandle`] and observe it through
//! [`Notification`]s.

pub mod breakpoints;
pub mod endpoint;
mod handler;
pub mod manager;
pub mod model;
pub mod notify;
#[allow(clippy::module_inception)]
pub mod session;
pub mod state;
pub mod watch;

pub use breakpoints::{
    AdapterUpdate, BreakpointEntry, BreakpointLedger, BreakpointLocation, BreakpointSpec,
    BreakpointUnit, BreakpointWarning,
};
pub use endpoint::{AdapterConnector, LocalPortAllocator, PortProvider, RetryPolicy};
pub use manager::{Command, SessionHandle, SessionManager};
pub use model::{ExecutionModel, FrameSummary, StopInfo, ThreadInfo};
pub use notify::{Notification, Notifier, StateSnapshot};
pub use session::{
    AttachTarget, AttachTo, DebugSession, LaunchTarget, OutputLine, SessionStatus, StepKind,
    Target, Workspace,
};
pub use state::{SessionState, TerminationReason};
pub use watch::{Watch, WatchRegistry, WatchValue};
