//! One debug session: one adapter connection and one target
//!
//! A `DebugSession` is driven exclusively by the session manager task, so
//! none of its methods need locking. The breakpoint ledger and the watch
//! registry outlive sessions and are passed in as a [`Workspace`].

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::common::config::{AdapterConfig, Config, Timeouts};
use crate::common::{Error, Result};
use crate::dap::engine::{Closure, EventSubscription, ProtocolEngine, Started};
use crate::dap::transport::{AdapterProcess, Transport};
use crate::dap::types::{
    AttachArguments, Capabilities, ContinueArguments, DisconnectArguments, EvaluateArguments,
    EvaluateResponseBody, Event, InitializeArguments, LaunchArguments, OutputEventBody,
    PauseArguments, ResponseMessage, Scope, SetBreakpointsResponseBody, StackFrame,
    StepArguments, StoppedEventBody, Variable,
};

use super::breakpoints::{BreakpointLedger, BreakpointUnit};
use super::endpoint::AdapterConnector;
use super::model::{ExecutionModel, FrameSummary, StopInfo, ThreadInfo};
use super::notify::{Notification, Notifier};
use super::state::{SessionState, TerminationReason};
use super::watch::WatchRegistry;

/// How long to wait for the adapter process to exit after the channel drops
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// State that outlives individual sessions
#[derive(Debug, Default)]
pub struct Workspace {
    pub ledger: BreakpointLedger,
    pub watches: WatchRegistry,
}

/// A program to start under the debugger
#[derive(Debug, Clone, Default)]
pub struct LaunchTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stop_on_entry: bool,
    /// Adapter name; the configured default when `None`
    pub adapter: Option<String>,
    /// Adapter-specific launch keys
    pub extra: Map<String, Value>,
}

impl LaunchTarget {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }
}

/// What to attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTo {
    Pid(u32),
    /// A remote debug server the adapter should connect to
    Remote { host: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct AttachTarget {
    pub to: AttachTo,
    pub adapter: Option<String>,
}

/// Target descriptor of a session
#[derive(Debug, Clone)]
pub enum Target {
    Launch(LaunchTarget),
    Attach(AttachTarget),
}

impl Target {
    pub fn adapter(&self) -> Option<&str> {
        match self {
            Target::Launch(t) => t.adapter.as_deref(),
            Target::Attach(t) => t.adapter.as_deref(),
        }
    }

    fn starting_state(&self) -> SessionState {
        match self {
            Target::Launch(_) => SessionState::Launching,
            Target::Attach(_) => SessionState::Attaching,
        }
    }

    /// Command and arguments that start the debuggee
    fn start_request(&self) -> Result<(&'static str, Value)> {
        match self {
            Target::Launch(t) => Ok((
                "launch",
                serde_json::to_value(LaunchArguments {
                    program: t.program.display().to_string(),
                    args: t.args.clone(),
                    cwd: t.cwd.as_ref().map(|p| p.display().to_string()),
                    env: t.env.clone(),
                    stop_on_entry: t.stop_on_entry,
                    extra: t.extra.clone(),
                })?,
            )),
            Target::Attach(t) => {
                let (pid, host, port) = match &t.to {
                    AttachTo::Pid(pid) => (Some(*pid), None, None),
                    AttachTo::Remote { host, port } => (None, Some(host.clone()), Some(*port)),
                };
                Ok((
                    "attach",
                    serde_json::to_value(AttachArguments {
                        pid,
                        host,
                        port,
                        extra: Map::new(),
                    })?,
                ))
            }
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Launch(t) => write!(f, "launch {}", t.program.display()),
            Target::Attach(AttachTarget {
                to: AttachTo::Pid(pid),
                ..
            }) => write!(f, "attach pid {}", pid),
            Target::Attach(AttachTarget {
                to: AttachTo::Remote { host, port },
                ..
            }) => write!(f, "attach {}:{}", host, port),
        }
    }
}

/// Step granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    In,
    Out,
}

impl StepKind {
    fn command(self) -> &'static str {
        match self {
            StepKind::Over => "next",
            StepKind::In => "stepIn",
            StepKind::Out => "stepOut",
        }
    }
}

/// Buffered adapter output line
#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub category: String,
    pub text: String,
}

/// Bounded buffer of adapter output
///
/// Enforces both an event count and a byte limit by dropping the oldest
/// entries first.
#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    max_events: usize,
    max_bytes: usize,
    bytes: usize,
}

impl OutputBuffer {
    fn new(max_events: usize, max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_events: max_events.max(1),
            max_bytes: max_bytes.max(1),
            bytes: 0,
        }
    }

    fn push(&mut self, category: &str, text: &str) {
        let text = if text.len() > self.max_bytes {
            tracing::warn!(
                "Output message ({} bytes) exceeds max buffer size ({} bytes), truncating",
                text.len(),
                self.max_bytes
            );
            let mut end = self.max_bytes;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        } else {
            text.to_string()
        };

        while (self.bytes + text.len() > self.max_bytes || self.lines.len() >= self.max_events)
            && !self.lines.is_empty()
        {
            if let Some(removed) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(removed.text.len());
            }
        }

        self.bytes += text.len();
        self.lines.push_back(OutputLine {
            category: category.to_string(),
            text,
        });
    }

    fn get(&mut self, tail: Option<usize>, clear: bool) -> Vec<OutputLine> {
        let result: Vec<OutputLine> = match tail {
            Some(n) => self.lines.iter().rev().take(n).cloned().rev().collect(),
            None => self.lines.iter().cloned().collect(),
        };
        if clear {
            self.lines.clear();
            self.bytes = 0;
        }
        result
    }
}

/// Snapshot for the `status` command
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: u64,
    pub state: SessionState,
    pub target: String,
    pub adapter_pid: Option<u32>,
    pub stopped_thread: Option<i64>,
    pub stop_reason: Option<String>,
    /// Index into the stopped thread's frames
    pub selected_frame: Option<usize>,
    pub exit_code: Option<i32>,
    pub termination: Option<TerminationReason>,
    pub features: Vec<&'static str>,
}

fn supported_features(caps: &Capabilities) -> Vec<&'static str> {
    [
        (caps.supports_conditional_breakpoints, "conditional breakpoints"),
        (caps.supports_hit_conditional_breakpoints, "hit conditions"),
        (caps.supports_log_points, "logpoints"),
        (caps.supports_function_breakpoints, "function breakpoints"),
        (caps.supports_instruction_breakpoints, "instruction breakpoints"),
        (caps.supports_data_breakpoints, "data breakpoints"),
        (!caps.exception_breakpoint_filters.is_empty(), "exception filters"),
        (caps.supports_restart_request, "restart"),
    ]
    .into_iter()
    .filter_map(|(supported, name)| supported.then_some(name))
    .collect()
}

async fn with_timeout<T>(
    command: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(command.to_string(), limit.as_millis() as u64))?
}

/// Debug session driving one adapter
pub struct DebugSession {
    id: u64,
    state: SessionState,
    target: Target,
    engine: Option<ProtocolEngine>,
    events: Option<EventSubscription>,
    process: Option<AdapterProcess>,
    capabilities: Capabilities,
    model: ExecutionModel,
    output: OutputBuffer,
    exit_code: Option<i32>,
    /// The adapter sent `exited` or `terminated`
    exit_reported: bool,
    termination: Option<TerminationReason>,
    timeouts: Timeouts,
    notifier: Notifier,
}

impl DebugSession {
    pub fn new(id: u64, target: Target, config: &Config, notifier: Notifier) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            target,
            engine: None,
            events: None,
            process: None,
            capabilities: Capabilities::default(),
            model: ExecutionModel::new(config.execution.stack_levels),
            output: OutputBuffer::new(
                config.output.max_events,
                config.output.max_bytes_mb * 1024 * 1024,
            ),
            exit_code: None,
            exit_reported: false,
            termination: None,
            timeouts: config.timeouts.clone(),
            notifier,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn set_state(&mut self, new: SessionState, reason: &str) {
        let old = self.state;
        if old == new {
            return;
        }
        if !old.can_transition_to(new) {
            tracing::error!(session = self.id, %old, %new, "Refusing illegal state transition");
            return;
        }
        tracing::info!(session = self.id, %old, %new, reason, "Session state changed");
        self.state = new;
        self.notifier.state_changed(self.id, old, new, reason);
    }

    fn require(&self, allowed: &[SessionState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::invalid_state(action, self.state))
        }
    }

    fn engine(&self) -> Result<&ProtocolEngine> {
        self.engine.as_ref().ok_or(Error::NotConnected)
    }

    async fn call<T: DeserializeOwned>(&self, command: &str, arguments: Option<Value>) -> Result<T> {
        let pending = self.engine()?.submit(command, arguments)?;
        with_timeout(command, self.timeouts.request(), pending.body()).await
    }

    /// Next event from the adapter
    ///
    /// `None` means the channel closed. Never resolves when there is no
    /// channel, so it can sit in a `select!` unconditionally.
    pub async fn next_event(&mut self) -> Option<Event> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    // === Startup ===

    /// Reach the adapter, run the handshake and flush the ledger
    ///
    /// On failure everything started so far is torn down and the session is
    /// back in `Idle`.
    pub async fn start(
        &mut self,
        connector: &AdapterConnector,
        adapter: &AdapterConfig,
        ws: &mut Workspace,
    ) -> Result<()> {
        self.require(&[SessionState::Idle], "start")?;
        let starting = self.target.starting_state();
        let description = self.target.to_string();
        self.set_state(starting, &description);

        let tag = format!("{}-{}", std::process::id(), self.id);
        let result = match connector.connect(adapter, &tag).await {
            Ok(transport) => {
                let adapter_id = adapter.adapter_id.clone().unwrap_or_else(|| {
                    adapter
                        .path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "dapsession".to_string())
                });
                self.handshake(transport, &adapter_id, ws).await
            }
            Err(e) => Err(e),
        };

        if let Err(mut e) = result {
            // Losing the adapter mid-handshake is a crash when it exited
            if e.is_disconnect() {
                if let Some(process) = self.process.as_mut() {
                    if let Some(detail) = process.wait_exit_detail(EXIT_GRACE).await {
                        e = Error::TargetCrashed(detail);
                    }
                }
            }
            tracing::warn!(session = self.id, "Session start failed: {}", e);
            self.abandon(ws).await;
            self.set_state(SessionState::Idle, &format!("start failed: {}", e));
            return Err(e);
        }

        self.set_state(SessionState::Running, "configuration done");
        Ok(())
    }

    async fn handshake(&mut self, transport: Transport, adapter_id: &str, ws: &mut Workspace) -> Result<()> {
        let Started {
            engine,
            events,
            process,
        } = ProtocolEngine::start(transport);
        let mut initialized = engine.on_event("initialized");
        self.engine = Some(engine);
        self.events = Some(events);
        self.process = process;

        let engine = self.engine()?;
        let init = engine.submit(
            "initialize",
            Some(serde_json::to_value(InitializeArguments::for_adapter(adapter_id))?),
        )?;
        self.capabilities = with_timeout("initialize", self.timeouts.initialize(), init.body()).await?;
        tracing::debug!(capabilities = ?self.capabilities, "Adapter initialized");

        let (command, arguments) = self.target.start_request()?;
        let engine = self.engine()?;
        let mut start = engine.submit(command, Some(arguments))?;
        let mut start_response: Option<ResponseMessage> = None;

        // Some adapters only send `initialized` after the launch request
        // arrives, some answer the launch first; a failed launch may never
        // be followed by `initialized` at all.
        let deadline = tokio::time::Instant::now() + self.timeouts.initialize();
        loop {
            tokio::select! {
                event = initialized.recv() => match event {
                    Some(_) => break,
                    None => return Err(Error::SessionTerminated),
                },
                response = &mut start, if start_response.is_none() => {
                    let response = response?;
                    if !response.success {
                        return Err(Error::adapter_failed(command, &response.error_message()));
                    }
                    start_response = Some(response);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout(
                        "initialized".to_string(),
                        self.timeouts.initialize().as_millis() as u64,
                    ));
                }
            }
        }

        self.flush_breakpoints(ws).await;

        if self.capabilities.supports_configuration_done_request {
            self.call::<Value>("configurationDone", None).await?;
        }

        let response = match start_response {
            Some(response) => response,
            None => with_timeout(command, self.timeouts.request(), start).await?,
        };
        if !response.success {
            return Err(Error::adapter_failed(command, &response.error_message()));
        }
        Ok(())
    }

    /// Send every unit in the ledger; failures are logged, not fatal
    async fn flush_breakpoints(&mut self, ws: &mut Workspace) {
        for unit in ws.ledger.units() {
            if let Err(e) = self.sync_unit(&mut ws.ledger, &unit).await {
                tracing::warn!(%unit, "Could not set breakpoints: {}", e);
            }
        }
    }

    /// Tear down a session that never got going
    async fn abandon(&mut self, ws: &mut Workspace) {
        self.events = None;
        if let Some(engine) = self.engine.take() {
            engine.close();
        }
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
        self.model.clear();
        ws.ledger.reset_bound();
    }

    // === Breakpoints ===

    /// Send the complete batch for one unit and merge the answer
    ///
    /// Warnings for conditions the adapter could not accept, and for
    /// exception filters it does not offer, are published as notifications;
    /// they do not fail the call.
    pub async fn sync_unit(&mut self, ledger: &mut BreakpointLedger, unit: &BreakpointUnit) -> Result<()> {
        let offered = &self.capabilities.exception_breakpoint_filters;
        let batch = ledger.batch_with_filters(unit, Some(offered))?;
        tracing::debug!(%unit, count = batch.ids.len(), "Syncing breakpoints");

        let body: SetBreakpointsResponseBody = self
            .call(batch.command(), Some(batch.arguments.clone()))
            .await?;
        for warning in ledger.merge_bound(&batch, &body.breakpoints) {
            tracing::warn!(id = warning.id, location = %warning.location, "{}", warning.message);
            self.notifier.emit(Notification::BreakpointWarning(warning));
        }
        self.notifier.emit(Notification::BreakpointsChanged {
            unit: unit.clone(),
            breakpoints: ledger.list_for(unit),
        });
        Ok(())
    }

    // === Execution control ===

    fn resolve_thread(&self, thread: Option<i64>) -> Result<i64> {
        thread
            .or_else(|| self.model.selected_thread())
            .or_else(|| self.model.stop_info().map(|s| s.thread_id))
            .or_else(|| self.model.cached_threads().first().map(|t| t.id))
            .ok_or_else(|| Error::invalid_state("pick a thread", "without threads"))
    }

    pub async fn continue_execution(&mut self, thread: Option<i64>, ws: &mut Workspace) -> Result<()> {
        self.require(&[SessionState::Stopped], "continue")?;
        let thread_id = self.resolve_thread(thread)?;
        let args = serde_json::to_value(ContinueArguments {
            thread_id,
            single_thread: false,
        })?;
        self.resume("continue", args, ws).await
    }

    pub async fn step(&mut self, kind: StepKind, thread: Option<i64>, ws: &mut Workspace) -> Result<()> {
        self.require(&[SessionState::Stopped], "step")?;
        let thread_id = self.resolve_thread(thread)?;
        let args = serde_json::to_value(StepArguments {
            thread_id,
            granularity: None,
        })?;
        self.resume(kind.command(), args, ws).await
    }

    /// Leave the stopped state
    ///
    /// Stop-scoped caches are dropped before the request is sent. If the
    /// adapter refuses, the session returns to `Stopped`.
    async fn resume(&mut self, command: &str, args: Value, ws: &mut Workspace) -> Result<()> {
        let previous_stop = self.model.stop_info().cloned();
        self.model.invalidate();
        ws.watches.mark_unavailable();

        let pending = self.engine()?.submit(command, Some(args))?;
        self.set_state(SessionState::Running, command);

        let response = with_timeout(command, self.timeouts.request(), pending).await?;
        if response.success {
            return Ok(());
        }

        if self.state == SessionState::Running {
            if let Some(stop) = previous_stop {
                self.model.on_stopped(stop);
            }
            self.set_state(SessionState::Stopped, &format!("{} rejected", command));
        }
        Err(Error::adapter_failed(command, &response.error_message()))
    }

    pub async fn pause(&mut self, thread: Option<i64>) -> Result<()> {
        self.require(&[SessionState::Running], "pause")?;
        let thread_id = match self.resolve_thread(thread) {
            Ok(id) => id,
            Err(_) => {
                let engine = self.engine.as_ref().ok_or(Error::NotConnected)?;
                let threads = self.model.fetch_threads(engine).await?;
                threads
                    .first()
                    .map(|t| t.id)
                    .ok_or(Error::ThreadNotFound(0))?
            }
        };
        self.call::<Value>("pause", Some(serde_json::to_value(PauseArguments { thread_id })?))
            .await?;
        Ok(())
    }

    /// Restart in place when the adapter supports it
    ///
    /// Returns `false` when the caller has to terminate and relaunch instead.
    pub async fn restart(&mut self, ws: &mut Workspace) -> Result<bool> {
        self.require(&[SessionState::Running, SessionState::Stopped], "restart")?;
        if !self.capabilities.supports_restart_request {
            return Ok(false);
        }

        let (_, arguments) = self.target.start_request()?;
        self.model.invalidate();
        ws.watches.mark_unavailable();
        self.call::<Value>("restart", Some(serde_json::json!({ "arguments": arguments })))
            .await?;
        self.set_state(SessionState::Running, "restarted");
        Ok(true)
    }

    // === Inspection ===

    pub async fn threads(&mut self) -> Result<Vec<ThreadInfo>> {
        self.require(&[SessionState::Running, SessionState::Stopped], "list threads")?;
        let limit = self.timeouts.request();
        let engine = self.engine.as_ref().ok_or(Error::NotConnected)?;
        with_timeout("threads", limit, self.model.fetch_threads(engine)).await
    }

    pub async fn frames(&mut self, thread: Option<i64>) -> Result<Vec<StackFrame>> {
        self.require(&[SessionState::Stopped], "read frames")?;
        let thread_id = self.resolve_thread(thread)?;
        let limit = self.timeouts.request();
        let engine = self.engine.as_ref().ok_or(Error::NotConnected)?;
        with_timeout("stackTrace", limit, self.model.frames(engine, thread_id)).await
    }

    /// Id of the selected frame, fetching the selected thread's stack if needed
    async fn current_frame_id(&mut self) -> Result<Option<i64>> {
        if self.state != SessionState::Stopped {
            return Ok(None);
        }
        if self.model.current_frame_id().is_none() {
            self.frames(None).await?;
        }
        Ok(self.model.current_frame_id())
    }

    pub async fn scopes(&mut self, frame: Option<i64>) -> Result<Vec<Scope>> {
        self.require(&[SessionState::Stopped], "read scopes")?;
        let frame_id = match frame {
            Some(id) => id,
            None => self
                .current_frame_id()
                .await?
                .ok_or(Error::FrameNotFound(0))?,
        };
        let limit = self.timeouts.request();
        let engine = self.engine.as_ref().ok_or(Error::NotConnected)?;
        with_timeout("scopes", limit, self.model.scopes(engine, frame_id)).await
    }

    pub async fn variables(&mut self, reference: i64) -> Result<Vec<Variable>> {
        self.require(&[SessionState::Stopped], "read variables")?;
        let limit = self.timeouts.request();
        let engine = self.engine.as_ref().ok_or(Error::NotConnected)?;
        with_timeout("variables", limit, self.model.variables(engine, reference)).await
    }

    pub async fn evaluate(&mut self, expression: &str, frame: Option<i64>) -> Result<EvaluateResponseBody> {
        self.require(&[SessionState::Running, SessionState::Stopped], "evaluate")?;
        if expression.trim().is_empty() {
            return Err(Error::InvalidExpression("empty expression".to_string()));
        }
        let frame_id = match frame {
            Some(id) => Some(id),
            None => self.current_frame_id().await?,
        };
        let args = EvaluateArguments {
            expression: expression.to_string(),
            frame_id,
            context: Some("repl".to_string()),
        };
        let body: EvaluateResponseBody = self
            .call("evaluate", Some(serde_json::to_value(&args)?))
            .await?;
        if self.state == SessionState::Stopped {
            self.model.register_reference(body.variables_reference);
        }
        Ok(body)
    }

    pub fn select_thread(&mut self, thread_id: i64) -> Result<()> {
        self.require(&[SessionState::Stopped], "select a thread")?;
        self.model.select_thread(thread_id)
    }

    pub async fn select_frame(&mut self, index: usize, ws: &mut Workspace) -> Result<FrameSummary> {
        self.require(&[SessionState::Stopped], "select a frame")?;
        self.frames(None).await?;
        let summary = FrameSummary::from(self.model.select_frame(index)?);
        self.refresh_watches(ws).await;
        Ok(summary)
    }

    /// Re-evaluate all watches against the selected frame and publish them
    pub async fn refresh_watches(&mut self, ws: &mut Workspace) {
        if ws.watches.is_empty() {
            return;
        }
        if self.state != SessionState::Stopped {
            ws.watches.mark_unavailable();
        } else if let Some(engine) = self.engine.as_ref() {
            let frame_id = self.model.current_frame_id();
            ws.watches
                .reevaluate_all(engine, frame_id, self.timeouts.request())
                .await;
            for reference in ws.watches.references() {
                self.model.register_reference(reference);
            }
        }
        self.notifier.emit(Notification::WatchesUpdated {
            watches: ws.watches.list(),
        });
    }

    pub fn output(&mut self, tail: Option<usize>, clear: bool) -> Vec<OutputLine> {
        self.output.get(tail, clear)
    }

    pub fn status(&self) -> SessionStatus {
        let stop = self.model.stop_info();
        SessionStatus {
            session: self.id,
            state: self.state,
            target: self.target.to_string(),
            adapter_pid: self.process.as_ref().and_then(|p| p.id()),
            stopped_thread: stop.map(|s| s.thread_id),
            stop_reason: stop.map(|s| s.reason.clone()),
            selected_frame: stop.map(|_| self.model.selected_frame_index()),
            exit_code: self.exit_code,
            termination: self.termination.clone(),
            features: supported_features(&self.capabilities),
        }
    }

    // === Events ===

    /// Apply one adapter event
    pub async fn handle_event(&mut self, event: Event, ws: &mut Workspace) {
        if !self.state.is_live() {
            tracing::debug!(session = self.id, state = %self.state, event = event.name(), "Ignoring event");
            return;
        }

        match event {
            Event::Stopped(body) => self.on_stopped(body, ws).await,
            Event::Continued { thread_id, .. } => {
                if self.state == SessionState::Stopped {
                    tracing::debug!(thread_id, "Adapter resumed the target");
                    self.model.invalidate();
                    ws.watches.mark_unavailable();
                    self.set_state(SessionState::Running, "continued");
                }
            }
            Event::Exited(body) => {
                tracing::info!(session = self.id, code = body.exit_code, "Debuggee exited");
                self.exit_code = Some(body.exit_code);
                self.exit_reported = true;
            }
            Event::Terminated(_) => {
                self.exit_reported = true;
                let code = self.exit_code;
                self.finish(TerminationReason::Exited { code }, ws).await;
            }
            Event::Thread(body) => self.model.on_thread_event(&body),
            Event::Output(body) => self.on_output(body),
            Event::Breakpoint { reason, breakpoint } => {
                if let Some(update) = ws.ledger.apply_adapter_update(&breakpoint) {
                    tracing::debug!(id = update.id, %reason, verified = breakpoint.verified, "Breakpoint updated by adapter");
                    if let Some(warning) = update.warning {
                        tracing::warn!(id = warning.id, location = %warning.location, "{}", warning.message);
                        self.notifier.emit(Notification::BreakpointWarning(warning));
                    }
                    self.notifier.emit(Notification::BreakpointsChanged {
                        breakpoints: ws.ledger.list_for(&update.unit),
                        unit: update.unit,
                    });
                }
            }
            Event::Initialized => {}
            Event::Unknown { event, .. } => {
                tracing::debug!(event = %event, "Unhandled adapter event");
            }
        }
    }

    fn on_output(&mut self, body: OutputEventBody) {
        let category = body.category.unwrap_or_else(|| "console".to_string());
        if category == "telemetry" {
            return;
        }
        self.output.push(&category, &body.output);
        self.notifier.emit(Notification::Output {
            category,
            text: body.output,
        });
    }

    async fn on_stopped(&mut self, body: StoppedEventBody, ws: &mut Workspace) {
        let mut thread_id = body
            .thread_id
            .or_else(|| self.model.selected_thread())
            .or_else(|| self.model.cached_threads().first().map(|t| t.id));
        if thread_id.is_none() {
            if let Ok(threads) = self.threads().await {
                thread_id = threads.first().map(|t| t.id);
            }
        }
        let Some(thread_id) = thread_id else {
            tracing::warn!("Stopped event without a usable thread id");
            return;
        };

        self.model.on_stopped(StopInfo {
            thread_id,
            reason: body.reason.clone(),
            description: body.description.clone(),
            all_threads_stopped: body.all_threads_stopped,
        });
        self.set_state(SessionState::Stopped, &body.reason);

        if let Err(e) = self.threads().await {
            tracing::warn!("Failed to refresh threads: {}", e);
        }
        let frame = match self.frames(Some(thread_id)).await {
            Ok(frames) => frames.first().map(FrameSummary::from),
            Err(e) => {
                tracing::warn!(thread_id, "Failed to fetch stack: {}", e);
                None
            }
        };

        self.notifier.emit(Notification::Stopped {
            session: self.id,
            thread_id,
            reason: body.reason,
            description: body.description.or(body.text),
            frame,
        });
        self.refresh_watches(ws).await;
    }

    /// The event stream ended: the channel to the adapter is gone
    pub async fn on_transport_closed(&mut self, ws: &mut Workspace) {
        self.events = None;
        if !self.state.is_live() {
            return;
        }

        if self.exit_reported {
            let code = self.exit_code;
            self.finish(TerminationReason::Exited { code }, ws).await;
            return;
        }

        let closure = self.engine.as_ref().and_then(|e| e.closure());
        if closure == Some(Closure::Requested) {
            return;
        }
        let exit = match self.process.as_mut() {
            Some(process) => process.wait_exit_detail(EXIT_GRACE).await,
            None => None,
        };
        let detail = exit.unwrap_or_else(|| match closure {
            Some(Closure::Failed(reason)) => format!("connection to adapter failed: {}", reason),
            _ => "connection to adapter lost".to_string(),
        });
        tracing::error!(session = self.id, "{}", detail);
        self.finish(TerminationReason::Crashed { detail }, ws).await;
    }

    // === Teardown ===

    /// Terminate the debuggee and end the session; idempotent
    pub async fn terminate(&mut self, ws: &mut Workspace) {
        self.finish(TerminationReason::Requested, ws).await;
    }

    /// End the session but leave the debuggee running
    pub async fn detach(&mut self, ws: &mut Workspace) -> Result<()> {
        self.require(&[SessionState::Running, SessionState::Stopped], "detach")?;
        self.finish(TerminationReason::Detached, ws).await;
        Ok(())
    }

    async fn finish(&mut self, reason: TerminationReason, ws: &mut Workspace) {
        if !self.state.is_live() {
            return;
        }
        self.set_state(SessionState::Terminating, &reason.to_string());

        if let Some(engine) = self.engine.take() {
            let crashed = matches!(reason, TerminationReason::Crashed { .. });
            if engine.is_connected() && !crashed {
                let args = DisconnectArguments {
                    restart: false,
                    terminate_debuggee: Some(reason != TerminationReason::Detached),
                };
                let disconnect = serde_json::to_value(&args)
                    .map_err(Error::from)
                    .and_then(|args| engine.submit("disconnect", Some(args)));
                match disconnect {
                    Ok(pending) => {
                        match tokio::time::timeout(self.timeouts.disconnect(), pending).await {
                            Ok(Ok(_)) => tracing::debug!("Adapter acknowledged disconnect"),
                            Ok(Err(e)) => tracing::debug!("Disconnect failed: {}", e),
                            Err(_) => tracing::debug!("Disconnect timed out"),
                        }
                    }
                    Err(e) => tracing::debug!("Could not send disconnect: {}", e),
                }
            }
            engine.close();
        }
        self.events = None;
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }

        self.model.clear();
        ws.ledger.reset_bound();
        ws.watches.mark_unavailable();
        for unit in ws.ledger.units() {
            self.notifier.emit(Notification::BreakpointsChanged {
                breakpoints: ws.ledger.list_for(&unit),
                unit,
            });
        }

        self.termination = Some(reason.clone());
        self.set_state(SessionState::Terminated, &reason.to_string());
        match reason {
            TerminationReason::Crashed { detail } => {
                self.notifier.emit(Notification::TargetCrashed {
                    session: self.id,
                    detail,
                })
            }
            _ => self.notifier.emit(Notification::Exited {
                session: self.id,
                code: self.exit_code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_limits() {
        let mut buffer = OutputBuffer::new(3, 1024);
        for i in 0..5 {
            buffer.push("stdout", &format!("line {}", i));
        }
        let lines = buffer.get(None, false);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "line 2");

        let tail = buffer.get(Some(1), true);
        assert_eq!(tail[0].text, "line 4");
        assert!(buffer.get(None, false).is_empty());
    }

    #[test]
    fn test_output_buffer_truncates_on_char_boundary() {
        let mut buffer = OutputBuffer::new(10, 5);
        buffer.push("stdout", "aé€bbbb");
        let lines = buffer.get(None, false);
        assert!(lines[0].text.len() <= 5);
        assert!(lines[0].text.starts_with('a'));
    }

    #[test]
    fn test_launch_request_arguments() {
        let mut target = LaunchTarget::new("/bin/app");
        target.args = vec!["--fast".to_string()];
        target.stop_on_entry = true;
        let (command, args) = Target::Launch(target).start_request().unwrap();
        assert_eq!(command, "launch");
        assert_eq!(args["program"], "/bin/app");
        assert_eq!(args["args"][0], "--fast");
        assert_eq!(args["stopOnEntry"], true);
    }

    #[test]
    fn test_attach_request_arguments() {
        let target = Target::Attach(AttachTarget {
            to: AttachTo::Remote {
                host: "10.0.0.2".to_string(),
                port: 2345,
            },
            adapter: None,
        });
        assert_eq!(target.to_string(), "attach 10.0.0.2:2345");
        let (command, args) = target.start_request().unwrap();
        assert_eq!(command, "attach");
        assert_eq!(args["port"], 2345);
        assert!(args.get("pid").is_none());
    }

    #[tokio::test]
    async fn test_commands_rejected_while_idle() {
        let config = Config::default();
        let mut session = DebugSession::new(1, Target::Launch(LaunchTarget::new("/bin/app")), &config, Notifier::new());
        let mut ws = Workspace::default();

        let err = session.continue_execution(None, &mut ws).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot continue while session is idle");
        assert!(matches!(session.frames(Some(1)).await, Err(Error::InvalidState { .. })));

        // Terminating an idle session is a no-op
        session.terminate(&mut ws).await;
        assert_eq!(session.state(), SessionState::Idle);
    }
}
