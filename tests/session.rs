//! End-to-end tests for the session engine
//!
//! Each test drives a [`SessionHandle`] against the `mock_adapter` binary,
//! which runs from breakpoint to breakpoint and exits when none is left.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use dapsession::common::config::{AdapterConfig, Config, TransportMode};
use dapsession::session::{
    BreakpointLocation, BreakpointSpec, BreakpointUnit, LaunchTarget, LocalPortAllocator,
    Notification, PortProvider, SessionHandle, SessionManager, SessionState, StepKind,
    TerminationReason, WatchValue,
};
use dapsession::{Error, Result};

const WAIT: Duration = Duration::from_secs(10);

/// Test context: a manager wired to the mock adapter
struct TestContext {
    handle: SessionHandle,
    notifications: broadcast::Receiver<Notification>,
}

impl TestContext {
    fn new(args: &[&str]) -> Self {
        Self::with_transport(TransportMode::Stdio, args, Arc::new(LocalPortAllocator))
    }

    fn with_transport(transport: TransportMode, args: &[&str], ports: Arc<dyn PortProvider>) -> Self {
        let mut config = Config::default();
        config.adapters = HashMap::from([(
            "mock".to_string(),
            AdapterConfig {
                path: PathBuf::from(env!("CARGO_BIN_EXE_mock_adapter")),
                args: args.iter().map(|s| s.to_string()).collect(),
                transport,
                adapter_id: Some("mock".to_string()),
            },
        )]);
        config.defaults.adapter = "mock".to_string();
        config.endpoint.max_attempts = 3;
        config.endpoint.initial_backoff_millis = 1;
        config.endpoint.max_backoff_millis = 5;

        let handle = SessionManager::spawn(config, ports);
        let notifications = handle.subscribe();
        Self {
            handle,
            notifications,
        }
    }

    async fn add_breakpoint(&self, location: &str) -> u32 {
        let location = BreakpointLocation::parse(location).expect("valid location");
        self.handle
            .add_breakpoint(BreakpointSpec::new(location))
            .await
            .expect("breakpoint added")
    }

    async fn launch(&self, program: &str) -> u64 {
        self.handle
            .launch(LaunchTarget::new(program))
            .await
            .expect("launch succeeds")
    }

    async fn wait_for(&self, state: SessionState) {
        self.handle
            .wait_for_state(state, WAIT)
            .await
            .unwrap_or_else(|e| panic!("never reached {}: {}", state, e));
    }

    /// Next notification matching `pred`, skipping others
    async fn expect(&mut self, pred: impl Fn(&Notification) -> bool) -> Notification {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.notifications.recv().await {
                    Ok(n) if pred(&n) => return n,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("notification channel closed: {}", e),
                }
            }
        })
        .await
        .expect("expected notification")
    }

    /// Everything published so far
    fn drain(&mut self) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            seen.push(n);
        }
        seen
    }
}

fn source(path: &str) -> BreakpointUnit {
    BreakpointUnit::Source(PathBuf::from(path))
}

#[tokio::test]
async fn test_launch_stops_at_breakpoint() {
    let mut ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:42").await;

    let id = ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    let stopped = ctx
        .expect(|n| matches!(n, Notification::Stopped { .. }))
        .await;
    match stopped {
        Notification::Stopped {
            session,
            reason,
            frame,
            ..
        } => {
            assert_eq!(session, id);
            assert_eq!(reason, "breakpoint");
            let frame = frame.expect("top frame");
            assert_eq!(frame.path.as_deref(), Some("file.ext"));
            assert_eq!(frame.line, 42);
        }
        _ => unreachable!(),
    }

    let frames = ctx.handle.frames(None).await.unwrap();
    assert_eq!(frames[0].line, 42);
    assert_eq!(frames[0].source_path(), Some("file.ext"));

    let status = ctx.handle.status().await.unwrap().unwrap();
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.stop_reason.as_deref(), Some("breakpoint"));

    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_port_exhaustion_leaves_session_idle() {
    struct Exhausted(AtomicU32);

    #[async_trait]
    impl PortProvider for Exhausted {
        async fn allocate(&self) -> Result<u16> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("no free ports".to_string()))
        }
    }

    let ports = Arc::new(Exhausted(AtomicU32::new(0)));
    let ctx = TestContext::with_transport(TransportMode::Tcp, &["--listen", "{port}"], ports.clone());

    let err = ctx
        .handle
        .launch(LaunchTarget::new("file.ext"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PortUnavailable { attempts: 3 }), "got {err}");
    assert_eq!(ports.0.load(Ordering::SeqCst), 3);

    let status = ctx.handle.status().await.unwrap().unwrap();
    assert_eq!(status.state, SessionState::Idle);
}

#[tokio::test]
async fn test_adapter_crash_terminates_session_once() {
    let mut ctx = TestContext::new(&["--crash-on", "continue"]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    let err = ctx.handle.continue_execution(None).await.unwrap_err();
    assert!(matches!(err, Error::SessionTerminated), "got {err}");

    ctx.wait_for(SessionState::Terminated).await;
    ctx.expect(|n| matches!(n, Notification::TargetCrashed { .. }))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let again = ctx
        .drain()
        .into_iter()
        .filter(|n| matches!(n, Notification::TargetCrashed { .. }))
        .count();
    assert_eq!(again, 0);

    let status = ctx.handle.status().await.unwrap().unwrap();
    assert!(matches!(status.termination, Some(TerminationReason::Crashed { .. })));

    // Terminated is final
    let err = ctx.handle.continue_execution(None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test]
async fn test_breakpoints_round_trip_while_stopped() {
    let mut ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    let added = ctx.add_breakpoint("file.ext:20").await;
    let first = ctx.handle.breakpoints(Some(source("file.ext"))).await.unwrap();
    let second = ctx.handle.breakpoints(Some(source("file.ext"))).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|e| e.is_bound()));

    let duplicate = ctx
        .handle
        .add_breakpoint(BreakpointSpec::new(
            BreakpointLocation::parse("file.ext:20").unwrap(),
        ))
        .await;
    assert!(matches!(duplicate, Err(Error::DuplicateBreakpoint { .. })));
    assert_eq!(ctx.handle.breakpoints(None).await.unwrap().len(), 2);

    ctx.handle.remove_breakpoint(added).await.unwrap();
    assert_eq!(ctx.handle.breakpoints(None).await.unwrap().len(), 1);

    ctx.handle.terminate().await.unwrap();
    // Records survive the session, without adapter state
    let after = ctx.handle.breakpoints(None).await.unwrap();
    assert_eq!(after.len(), 1);
    assert!(!after[0].is_bound());
    ctx.drain();
}

#[tokio::test]
async fn test_rejected_condition_is_reported() {
    let mut ctx = TestContext::new(&["--reject-conditions"]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    let spec = BreakpointSpec::new(BreakpointLocation::parse("file.ext:30").unwrap())
        .with_condition("count >");
    let id = ctx.handle.add_breakpoint(spec).await.unwrap();

    let warning = ctx
        .expect(|n| matches!(n, Notification::BreakpointWarning(_)))
        .await;
    match warning {
        Notification::BreakpointWarning(w) => {
            assert_eq!(w.id, id);
            assert_eq!(w.message, "condition could not be parsed");
        }
        _ => unreachable!(),
    }

    let entries = ctx.handle.breakpoints(None).await.unwrap();
    let entry = entries.iter().find(|e| e.id == id).unwrap();
    assert!(!entry.is_bound());
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_adapter_rejection_rolls_back_ledger() {
    let ctx = TestContext::new(&["--refuse-breakpoints"]);
    ctx.handle
        .launch(LaunchTarget {
            stop_on_entry: true,
            ..LaunchTarget::new("file.ext")
        })
        .await
        .unwrap();
    ctx.wait_for(SessionState::Stopped).await;

    let result = ctx
        .handle
        .add_breakpoint(BreakpointSpec::new(
            BreakpointLocation::parse("file.ext:5").unwrap(),
        ))
        .await;
    assert!(matches!(result, Err(Error::AdapterReportedFailure { .. })));
    assert!(ctx.handle.breakpoints(None).await.unwrap().is_empty());
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_continue_invalidates_frames_and_references() {
    let ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.add_breakpoint("file.ext:20").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    let frames = ctx.handle.frames(None).await.unwrap();
    assert_eq!(frames[0].line, 10);
    let old_frame = frames[0].id;
    let scopes = ctx.handle.scopes(Some(old_frame)).await.unwrap();
    let locals = scopes[0].variables_reference;
    let variables = ctx.handle.variables(locals).await.unwrap();
    let point = variables.iter().find(|v| v.name == "point").unwrap();
    assert!(point.is_expandable());
    let fields = ctx.handle.variables(point.variables_reference).await.unwrap();
    assert_eq!(fields.len(), 2);

    ctx.handle.continue_execution(None).await.unwrap();
    ctx.wait_for(SessionState::Stopped).await;

    let frames = ctx.handle.frames(None).await.unwrap();
    assert_eq!(frames[0].line, 20);
    assert_ne!(frames[0].id, old_frame);

    assert!(matches!(
        ctx.handle.scopes(Some(old_frame)).await,
        Err(Error::FrameNotFound(_))
    ));
    assert!(matches!(
        ctx.handle.variables(locals).await,
        Err(Error::UnknownReference(_))
    ));
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_step_and_select_frame() {
    let ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    ctx.handle.step(StepKind::Over, None).await.unwrap();
    ctx.wait_for(SessionState::Stopped).await;
    assert_eq!(ctx.handle.frames(None).await.unwrap()[0].line, 11);

    let caller = ctx.handle.select_frame(1).await.unwrap();
    assert_eq!(caller.name, "main");
    let status = ctx.handle.status().await.unwrap().unwrap();
    assert_eq!(status.selected_frame, Some(1));
    assert!(matches!(
        ctx.handle.select_frame(7).await,
        Err(Error::FrameNotFound(_))
    ));
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_watches_follow_stops() {
    let mut ctx = TestContext::new(&[]);
    ctx.handle.add_watch("count").await.unwrap();
    ctx.handle.add_watch("nope").await.unwrap();
    assert!(ctx
        .handle
        .watches()
        .await
        .unwrap()
        .iter()
        .all(|w| w.value == WatchValue::Unavailable));

    ctx.add_breakpoint("file.ext:10").await;
    ctx.add_breakpoint("file.ext:20").await;
    ctx.launch("file.ext").await;
    ctx.expect(|n| matches!(n, Notification::WatchesUpdated { watches } if watches.iter().all(|w| w.value != WatchValue::Unavailable)))
        .await;

    let watches = ctx.handle.watches().await.unwrap();
    assert!(matches!(&watches[0].value, WatchValue::Value { result, .. } if result == "10"));
    assert!(matches!(&watches[1].value, WatchValue::Error { message } if message.contains("nope")));

    ctx.handle.continue_execution(None).await.unwrap();
    ctx.expect(|n| matches!(n, Notification::WatchesUpdated { watches } if matches!(&watches[0].value, WatchValue::Value { result, .. } if result == "20")))
        .await;

    ctx.handle.terminate().await.unwrap();
    assert!(ctx
        .handle
        .watches()
        .await
        .unwrap()
        .iter()
        .all(|w| w.value == WatchValue::Unavailable));
}

#[tokio::test]
async fn test_evaluate_registers_reference() {
    let ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    let result = ctx.handle.evaluate("point", None).await.unwrap();
    assert!(result.variables_reference > 0);
    let fields = ctx.handle.variables(result.variables_reference).await.unwrap();
    assert_eq!(fields[0].name, "x");

    let err = ctx.handle.evaluate("missing", None).await.unwrap_err();
    assert!(matches!(err, Error::AdapterReportedFailure { .. }));
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let ctx = TestContext::new(&[]);
    // Nothing to terminate yet
    ctx.handle.terminate().await.unwrap();

    ctx.add_breakpoint("file.ext:10").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    ctx.handle.terminate().await.unwrap();
    ctx.wait_for(SessionState::Terminated).await;
    ctx.handle.terminate().await.unwrap();

    let status = ctx.handle.status().await.unwrap().unwrap();
    assert_eq!(status.state, SessionState::Terminated);
    assert_eq!(status.termination, Some(TerminationReason::Requested));
    assert!(matches!(
        ctx.handle.frames(None).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_program_runs_to_exit() {
    let mut ctx = TestContext::new(&["--exit-code", "3"]);
    ctx.launch("file.ext").await;

    let exited = ctx
        .expect(|n| matches!(n, Notification::Exited { .. }))
        .await;
    assert!(matches!(exited, Notification::Exited { code: Some(3), .. }));
    ctx.wait_for(SessionState::Terminated).await;

    let output = ctx.handle.output(None, false).await.unwrap();
    assert!(output.iter().any(|line| line.text.contains("file.ext finished")));
}

#[tokio::test]
async fn test_failed_launch_returns_to_idle_and_relaunch_works() {
    let ctx = TestContext::new(&["--fail-launch"]);
    let err = ctx
        .handle
        .launch(LaunchTarget::new("file.ext"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AdapterReportedFailure { .. }), "got {err}");
    assert_eq!(
        ctx.handle.status().await.unwrap().unwrap().state,
        SessionState::Idle
    );

    let ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    let first = ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;
    let second = ctx.launch("file.ext").await;
    assert_ne!(first, second);
    ctx.wait_for(SessionState::Stopped).await;
    assert_eq!(ctx.handle.state().session, second);
    ctx.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_in_place() {
    let ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    let id = ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;

    ctx.handle.restart().await.unwrap();
    ctx.wait_for(SessionState::Stopped).await;
    let status = ctx.handle.status().await.unwrap().unwrap();
    assert_eq!(status.session, id);
    assert_eq!(status.stop_reason.as_deref(), Some("entry"));
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_tcp_transport() {
    let ctx = TestContext::with_transport(
        TransportMode::Tcp,
        &["--listen", "{port}"],
        Arc::new(LocalPortAllocator),
    );
    ctx.add_breakpoint("file.ext:42").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;
    assert_eq!(ctx.handle.frames(None).await.unwrap()[0].line, 42);
    ctx.handle.terminate().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_socket_transport() {
    let ctx = TestContext::with_transport(
        TransportMode::Socket,
        &["--socket", "{socket}"],
        Arc::new(LocalPortAllocator),
    );
    ctx.add_breakpoint("file.ext:7").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;
    assert_eq!(ctx.handle.frames(None).await.unwrap()[0].line, 7);
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_breakpoint_store_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("breakpoints.json");

    let ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:10").await;
    ctx.add_breakpoint("compute").await;
    ctx.handle.save_breakpoints(path.clone()).await.unwrap();

    let other = TestContext::new(&[]);
    assert_eq!(other.handle.load_breakpoints(path).await.unwrap(), 2);
    other.launch("file.ext").await;
    other.wait_for(SessionState::Stopped).await;
    assert_eq!(other.handle.frames(None).await.unwrap()[0].line, 10);
    other.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_adapter_unverifying_condition_warns() {
    let mut ctx = TestContext::new(&["--revoke-conditions"]);
    ctx.handle
        .launch(LaunchTarget {
            stop_on_entry: true,
            ..LaunchTarget::new("file.ext")
        })
        .await
        .unwrap();
    ctx.wait_for(SessionState::Stopped).await;

    let spec = BreakpointSpec::new(BreakpointLocation::parse("file.ext:12").unwrap())
        .with_condition("missing > 1");
    let id = ctx.handle.add_breakpoint(spec).await.unwrap();

    let warning = ctx
        .expect(|n| matches!(n, Notification::BreakpointWarning(_)))
        .await;
    match warning {
        Notification::BreakpointWarning(w) => {
            assert_eq!(w.id, id);
            assert_eq!(w.message, "condition refers to an unknown variable");
        }
        _ => unreachable!(),
    }
    let entries = ctx.handle.breakpoints(None).await.unwrap();
    assert!(!entries.iter().find(|e| e.id == id).unwrap().is_bound());
    ctx.handle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_exception_filter_stops_on_uncaught() {
    let mut ctx = TestContext::new(&[]);
    ctx.add_breakpoint("exception:uncaught").await;
    let unknown = ctx.add_breakpoint("exception:segfault").await;
    ctx.launch("file.ext").await;

    let stopped = ctx
        .expect(|n| matches!(n, Notification::Stopped { .. }))
        .await;
    assert!(matches!(stopped, Notification::Stopped { ref reason, .. } if reason == "exception"));

    let entries = ctx
        .handle
        .breakpoints(Some(BreakpointUnit::Exceptions))
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &entries {
        assert_eq!(entry.is_bound(), entry.id != unknown);
    }
    let status = ctx.handle.status().await.unwrap().unwrap();
    assert!(status.features.contains(&"exception filters"));

    ctx.handle.continue_execution(None).await.unwrap();
    ctx.expect(|n| matches!(n, Notification::Exited { .. }))
        .await;
}

#[tokio::test]
async fn test_close_unit_clears_adapter_side() {
    let mut ctx = TestContext::new(&[]);
    ctx.add_breakpoint("file.ext:5").await;
    ctx.add_breakpoint("file.ext:9").await;
    let kept = ctx.add_breakpoint("compute").await;
    ctx.launch("file.ext").await;
    ctx.wait_for(SessionState::Stopped).await;
    assert_eq!(ctx.handle.frames(None).await.unwrap()[0].line, 5);

    let removed = ctx.handle.close_unit(source("file.ext")).await.unwrap();
    assert_eq!(removed.len(), 2);
    let remaining = ctx.handle.breakpoints(None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, kept);

    // Line 9 is gone on the adapter too, so the program runs to the end
    ctx.handle.continue_execution(None).await.unwrap();
    ctx.expect(|n| matches!(n, Notification::Exited { .. }))
        .await;
}

#[tokio::test]
async fn test_crash_during_handshake_reports_exit() {
    let ctx = TestContext::new(&["--crash-on", "initialize"]);
    let err = ctx
        .handle
        .launch(LaunchTarget::new("file.ext"))
        .await
        .unwrap_err();
    match err {
        Error::TargetCrashed(detail) => assert!(detail.contains("70"), "got {detail}"),
        other => panic!("expected a crash, got {other}"),
    }
    assert_eq!(
        ctx.handle.status().await.unwrap().unwrap().state,
        SessionState::Idle
    );
}
