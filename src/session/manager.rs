//! Session manager task and the handle used to drive it
//!
//! All session state lives in one task. Callers talk to it through a
//! [`SessionHandle`], which sends [`Command`]s over a channel and waits for
//! the reply. Adapter events and commands are processed strictly one at a
//! time, so a command never observes a half-applied event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::dap::types::{EvaluateResponseBody, Scope, StackFrame, Variable};

use super::breakpoints::{BreakpointEntry, BreakpointSpec, BreakpointUnit};
use super::endpoint::{AdapterConnector, PortProvider};
use super::model::{FrameSummary, ThreadInfo};
use super::notify::{Notification, Notifier, StateSnapshot};
use super::session::{
    AttachTarget, DebugSession, LaunchTarget, OutputLine, SessionStatus, StepKind, Target,
    Workspace,
};
use super::state::SessionState;
use super::watch::Watch;

/// Queue depth for pending commands
const COMMAND_QUEUE: usize = 64;

pub(super) type Reply<T> = oneshot::Sender<Result<T>>;

/// A request to the session manager
pub enum Command {
    Launch(LaunchTarget, Reply<u64>),
    Attach(AttachTarget, Reply<u64>),
    Restart(Reply<()>),
    Terminate(Reply<()>),
    Detach(Reply<()>),
    Continue(Option<i64>, Reply<()>),
    Step(StepKind, Option<i64>, Reply<()>),
    Pause(Option<i64>, Reply<()>),

    AddBreakpoint(BreakpointSpec, Reply<u32>),
    RemoveBreakpoint(u32, Reply<()>),
    UpdateBreakpoint(u32, BreakpointSpec, Reply<()>),
    EnableBreakpoint(u32, bool, Reply<()>),
    EnableAllBreakpoints(bool, Reply<()>),
    SetBreakpoints(BreakpointUnit, Vec<BreakpointSpec>, Reply<Vec<u32>>),
    CloseUnit(BreakpointUnit, Reply<Vec<u32>>),
    ListBreakpoints(Option<BreakpointUnit>, Reply<Vec<BreakpointEntry>>),
    SaveBreakpoints(PathBuf, Reply<()>),
    LoadBreakpoints(PathBuf, Reply<usize>),

    Threads(Reply<Vec<ThreadInfo>>),
    SelectThread(i64, Reply<()>),
    Frames(Option<i64>, Reply<Vec<StackFrame>>),
    SelectFrame(usize, Reply<FrameSummary>),
    Scopes(Option<i64>, Reply<Vec<Scope>>),
    Variables(i64, Reply<Vec<Variable>>),
    Evaluate {
        expression: String,
        frame_id: Option<i64>,
        reply: Reply<EvaluateResponseBody>,
    },

    AddWatch(String, Reply<u32>),
    RemoveWatch(u32, Reply<()>),
    ListWatches(Reply<Vec<Watch>>),

    Output {
        tail: Option<usize>,
        clear: bool,
        reply: Reply<Vec<OutputLine>>,
    },
    Status(Reply<Option<SessionStatus>>),
    Shutdown(Reply<()>),
}

/// Owner of the current session and the state that outlives it
pub struct SessionManager {
    pub(super) config: Arc<Config>,
    pub(super) connector: AdapterConnector,
    pub(super) notifier: Notifier,
    pub(super) session: Option<DebugSession>,
    pub(super) workspace: Workspace,
    pub(super) next_session_id: u64,
    commands: mpsc::Receiver<Command>,
}

impl SessionManager {
    /// Start the manager task and return a handle to it
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: Config, ports: Arc<dyn PortProvider>) -> SessionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let notifier = Notifier::new();
        let connector = AdapterConnector::new(ports, &config.endpoint, &config.timeouts);

        let manager = Self {
            config: Arc::new(config),
            connector,
            notifier: notifier.clone(),
            session: None,
            workspace: Workspace::default(),
            next_session_id: 0,
            commands: rx,
        };
        tokio::spawn(manager.run());

        SessionHandle { tx, notifier }
    }

    async fn run(mut self) {
        tracing::debug!("Session manager started");
        loop {
            tokio::select! {
                biased;

                event = next_session_event(&mut self.session) => match event {
                    Some(event) => {
                        if let Some(session) = self.session.as_mut() {
                            session.handle_event(event, &mut self.workspace).await;
                        }
                    }
                    None => {
                        if let Some(session) = self.session.as_mut() {
                            session.on_transport_closed(&mut self.workspace).await;
                        }
                    }
                },

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    // Every handle is gone
                    None => break,
                },
            }
        }

        if let Some(mut session) = self.session.take() {
            session.terminate(&mut self.workspace).await;
        }
        tracing::debug!("Session manager stopped");
    }

    /// Terminate any previous session, then start a new one
    pub(super) async fn start_session(&mut self, target: Target) -> Result<u64> {
        if let Some(mut previous) = self.session.take() {
            tracing::debug!(session = previous.id(), "Ending previous session before starting a new one");
            previous.terminate(&mut self.workspace).await;
        }

        let name = target
            .adapter()
            .unwrap_or(&self.config.defaults.adapter)
            .to_string();
        let adapter = self
            .config
            .get_adapter(&name)
            .ok_or_else(|| Error::adapter_not_found(&name, &["config file", "PATH"]))?;

        self.next_session_id += 1;
        let id = self.next_session_id;
        tracing::info!(session = id, adapter = %name, "Starting session: {}", target);

        let mut session = DebugSession::new(id, target, &self.config, self.notifier.clone());
        let result = session
            .start(&self.connector, &adapter, &mut self.workspace)
            .await;
        self.session = Some(session);
        result.map(|_| id)
    }
}

async fn next_session_event(
    session: &mut Option<DebugSession>,
) -> Option<crate::dap::types::Event> {
    match session.as_mut() {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

/// Cloneable front end of the session manager
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    notifier: Notifier,
}

impl SessionHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Internal("session manager is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("session manager dropped the request".to_string()))?
    }

    /// Observe notifications from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Latest published session state
    pub fn state(&self) -> StateSnapshot {
        *self.notifier.watch_state().borrow()
    }

    /// Wait until the current session reaches `state`
    pub async fn wait_for_state(&self, state: SessionState, timeout: Duration) -> Result<StateSnapshot> {
        let mut rx = self.notifier.watch_state();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|snapshot| snapshot.state == state)
                .await
                .map(|snapshot| *snapshot)
        })
        .await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(Error::Internal("session manager is not running".to_string())),
            Err(_) => Err(Error::Timeout(
                format!("waiting for {}", state),
                timeout.as_millis() as u64,
            )),
        }
    }

    // === Session lifecycle ===

    /// Launch a program; returns the new session's id
    pub async fn launch(&self, target: LaunchTarget) -> Result<u64> {
        self.call(|reply| Command::Launch(target, reply)).await
    }

    pub async fn attach(&self, target: AttachTarget) -> Result<u64> {
        self.call(|reply| Command::Attach(target, reply)).await
    }

    pub async fn restart(&self) -> Result<()> {
        self.call(Command::Restart).await
    }

    /// Terminate the debuggee; succeeds when there is nothing to terminate
    pub async fn terminate(&self) -> Result<()> {
        self.call(Command::Terminate).await
    }

    pub async fn detach(&self) -> Result<()> {
        self.call(Command::Detach).await
    }

    pub async fn continue_execution(&self, thread: Option<i64>) -> Result<()> {
        self.call(|reply| Command::Continue(thread, reply)).await
    }

    pub async fn step(&self, kind: StepKind, thread: Option<i64>) -> Result<()> {
        self.call(|reply| Command::Step(kind, thread, reply)).await
    }

    pub async fn pause(&self, thread: Option<i64>) -> Result<()> {
        self.call(|reply| Command::Pause(thread, reply)).await
    }

    // === Breakpoints ===

    pub async fn add_breakpoint(&self, spec: BreakpointSpec) -> Result<u32> {
        self.call(|reply| Command::AddBreakpoint(spec, reply)).await
    }

    pub async fn remove_breakpoint(&self, id: u32) -> Result<()> {
        self.call(|reply| Command::RemoveBreakpoint(id, reply)).await
    }

    pub async fn update_breakpoint(&self, id: u32, spec: BreakpointSpec) -> Result<()> {
        self.call(|reply| Command::UpdateBreakpoint(id, spec, reply)).await
    }

    pub async fn enable_breakpoint(&self, id: u32, enabled: bool) -> Result<()> {
        self.call(|reply| Command::EnableBreakpoint(id, enabled, reply)).await
    }

    pub async fn enable_all_breakpoints(&self, enabled: bool) -> Result<()> {
        self.call(|reply| Command::EnableAllBreakpoints(enabled, reply)).await
    }

    /// Replace every breakpoint of one unit
    pub async fn set_breakpoints(&self, unit: BreakpointUnit, specs: Vec<BreakpointSpec>) -> Result<Vec<u32>> {
        self.call(|reply| Command::SetBreakpoints(unit, specs, reply)).await
    }

    /// Drop every breakpoint of a unit and clear it on the adapter
    ///
    /// Returns the ids that were removed.
    pub async fn close_unit(&self, unit: BreakpointUnit) -> Result<Vec<u32>> {
        self.call(|reply| Command::CloseUnit(unit, reply)).await
    }

    pub async fn breakpoints(&self, unit: Option<BreakpointUnit>) -> Result<Vec<BreakpointEntry>> {
        self.call(|reply| Command::ListBreakpoints(unit, reply)).await
    }

    pub async fn save_breakpoints(&self, path: PathBuf) -> Result<()> {
        self.call(|reply| Command::SaveBreakpoints(path, reply)).await
    }

    pub async fn load_breakpoints(&self, path: PathBuf) -> Result<usize> {
        self.call(|reply| Command::LoadBreakpoints(path, reply)).await
    }

    // === Inspection ===

    pub async fn threads(&self) -> Result<Vec<ThreadInfo>> {
        self.call(Command::Threads).await
    }

    pub async fn select_thread(&self, thread_id: i64) -> Result<()> {
        self.call(|reply| Command::SelectThread(thread_id, reply)).await
    }

    pub async fn frames(&self, thread: Option<i64>) -> Result<Vec<StackFrame>> {
        self.call(|reply| Command::Frames(thread, reply)).await
    }

    pub async fn select_frame(&self, index: usize) -> Result<FrameSummary> {
        self.call(|reply| Command::SelectFrame(index, reply)).await
    }

    pub async fn scopes(&self, frame_id: Option<i64>) -> Result<Vec<Scope>> {
        self.call(|reply| Command::Scopes(frame_id, reply)).await
    }

    pub async fn variables(&self, reference: i64) -> Result<Vec<Variable>> {
        self.call(|reply| Command::Variables(reference, reply)).await
    }

    pub async fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<EvaluateResponseBody> {
        let expression = expression.to_string();
        self.call(|reply| Command::Evaluate {
            expression,
            frame_id,
            reply,
        })
        .await
    }

    // === Watches ===

    pub async fn add_watch(&self, expression: &str) -> Result<u32> {
        let expression = expression.to_string();
        self.call(|reply| Command::AddWatch(expression, reply)).await
    }

    pub async fn remove_watch(&self, id: u32) -> Result<()> {
        self.call(|reply| Command::RemoveWatch(id, reply)).await
    }

    pub async fn watches(&self) -> Result<Vec<Watch>> {
        self.call(Command::ListWatches).await
    }

    // === Misc ===

    pub async fn output(&self, tail: Option<usize>, clear: bool) -> Result<Vec<OutputLine>> {
        self.call(|reply| Command::Output { tail, clear, reply }).await
    }

    /// Status of the current session, `None` if none was ever started
    pub async fn status(&self) -> Result<Option<SessionStatus>> {
        self.call(Command::Status).await
    }

    /// Terminate any session and stop the manager task
    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }
}
