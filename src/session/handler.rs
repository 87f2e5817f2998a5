//! Command handler for the session manager
//!
//! Translates [`Command`]s into session and ledger operations.

use crate::common::{Error, Result};

use super::breakpoints::{BreakpointLedger, BreakpointUnit};
use super::manager::{Command, Reply, SessionManager};
use super::notify::Notification;
use super::session::{DebugSession, Target};
use super::state::SessionState;

/// The current session, or an `InvalidState` error naming `action`
fn active<'a>(session: &'a mut Option<DebugSession>, action: &str) -> Result<&'a mut DebugSession> {
    session
        .as_mut()
        .ok_or_else(|| Error::invalid_state(action, SessionState::Idle))
}

fn respond<T>(reply: Reply<T>, result: Result<T>) {
    if reply.send(result).is_err() {
        tracing::debug!("Caller went away before the reply was sent");
    }
}

impl SessionManager {
    /// Handle one command; returns `false` when the manager should stop
    pub(super) async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            // === Session Management ===
            Command::Launch(target, reply) => {
                respond(reply, self.start_session(Target::Launch(target)).await)
            }
            Command::Attach(target, reply) => {
                respond(reply, self.start_session(Target::Attach(target)).await)
            }
            Command::Restart(reply) => respond(reply, self.restart().await),
            Command::Terminate(reply) => {
                if let Some(session) = self.session.as_mut() {
                    session.terminate(&mut self.workspace).await;
                }
                respond(reply, Ok(()))
            }
            Command::Detach(reply) => {
                let result = match active(&mut self.session, "detach") {
                    Ok(session) => session.detach(&mut self.workspace).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::Continue(thread, reply) => {
                let result = match active(&mut self.session, "continue") {
                    Ok(session) => session.continue_execution(thread, &mut self.workspace).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::Step(kind, thread, reply) => {
                let result = match active(&mut self.session, "step") {
                    Ok(session) => session.step(kind, thread, &mut self.workspace).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::Pause(thread, reply) => {
                let result = match active(&mut self.session, "pause") {
                    Ok(session) => session.pause(thread).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }

            // === Breakpoints ===
            Command::AddBreakpoint(spec, reply) => {
                let unit = spec.location.unit();
                let result = self
                    .change_breakpoints(move |ledger| Ok((ledger.add(spec)?, vec![unit])))
                    .await;
                respond(reply, result)
            }
            Command::RemoveBreakpoint(id, reply) => {
                let result = self
                    .change_breakpoints(move |ledger| {
                        let removed = ledger.remove(id)?;
                        Ok(((), vec![removed.location().unit()]))
                    })
                    .await;
                respond(reply, result)
            }
            Command::UpdateBreakpoint(id, spec, reply) => {
                let result = self
                    .change_breakpoints(move |ledger| Ok(((), ledger.update(id, spec)?)))
                    .await;
                respond(reply, result)
            }
            Command::EnableBreakpoint(id, enabled, reply) => {
                let result = self
                    .change_breakpoints(move |ledger| Ok(((), vec![ledger.set_enabled(id, enabled)?])))
                    .await;
                respond(reply, result)
            }
            Command::EnableAllBreakpoints(enabled, reply) => {
                let result = self
                    .change_breakpoints(move |ledger| Ok(((), ledger.set_all_enabled(enabled))))
                    .await;
                respond(reply, result)
            }
            Command::SetBreakpoints(unit, specs, reply) => {
                let result = self
                    .change_breakpoints(move |ledger| {
                        let ids = ledger.replace_unit(&unit, specs)?;
                        Ok((ids, vec![unit]))
                    })
                    .await;
                respond(reply, result)
            }
            Command::CloseUnit(unit, reply) => {
                let result = self
                    .change_breakpoints(move |ledger| {
                        let removed: Vec<u32> = ledger.remove_unit(&unit).into_iter().map(|e| e.id).collect();
                        Ok((removed, vec![unit]))
                    })
                    .await;
                respond(reply, result)
            }
            Command::ListBreakpoints(unit, reply) => {
                let ledger = &self.workspace.ledger;
                let entries = match unit {
                    Some(unit) => ledger.list_for(&unit),
                    None => ledger.all(),
                };
                respond(reply, Ok(entries))
            }
            Command::SaveBreakpoints(path, reply) => {
                respond(reply, self.workspace.ledger.save(&path))
            }
            Command::LoadBreakpoints(path, reply) => {
                let result = self.load_breakpoints(&path).await;
                respond(reply, result)
            }

            // === Inspection ===
            Command::Threads(reply) => {
                let result = match active(&mut self.session, "list threads") {
                    Ok(session) => session.threads().await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::SelectThread(thread_id, reply) => {
                let result = active(&mut self.session, "select a thread")
                    .and_then(|session| session.select_thread(thread_id));
                respond(reply, result)
            }
            Command::Frames(thread, reply) => {
                let result = match active(&mut self.session, "read frames") {
                    Ok(session) => session.frames(thread).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::SelectFrame(index, reply) => {
                let result = match active(&mut self.session, "select a frame") {
                    Ok(session) => session.select_frame(index, &mut self.workspace).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::Scopes(frame, reply) => {
                let result = match active(&mut self.session, "read scopes") {
                    Ok(session) => session.scopes(frame).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::Variables(reference, reply) => {
                let result = match active(&mut self.session, "read variables") {
                    Ok(session) => session.variables(reference).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }
            Command::Evaluate {
                expression,
                frame_id,
                reply,
            } => {
                let result = match active(&mut self.session, "evaluate") {
                    Ok(session) => session.evaluate(&expression, frame_id).await,
                    Err(e) => Err(e),
                };
                respond(reply, result)
            }

            // === Watches ===
            Command::AddWatch(expression, reply) => {
                let result = self.workspace.watches.add(&expression);
                if result.is_ok() {
                    self.refresh_watches().await;
                }
                respond(reply, result)
            }
            Command::RemoveWatch(id, reply) => {
                let result = self.workspace.watches.remove(id).map(|_| ());
                if result.is_ok() {
                    self.notifier.emit(Notification::WatchesUpdated {
                        watches: self.workspace.watches.list(),
                    });
                }
                respond(reply, result)
            }
            Command::ListWatches(reply) => respond(reply, Ok(self.workspace.watches.list())),

            // === Misc ===
            Command::Output { tail, clear, reply } => {
                let lines = self
                    .session
                    .as_mut()
                    .map(|s| s.output(tail, clear))
                    .unwrap_or_default();
                respond(reply, Ok(lines))
            }
            Command::Status(reply) => {
                respond(reply, Ok(self.session.as_ref().map(DebugSession::status)))
            }
            Command::Shutdown(reply) => {
                if let Some(session) = self.session.as_mut() {
                    session.terminate(&mut self.workspace).await;
                }
                respond(reply, Ok(()));
                return false;
            }
        }
        true
    }

    async fn restart(&mut self) -> Result<()> {
        let session = active(&mut self.session, "restart")?;
        if session.restart(&mut self.workspace).await? {
            return Ok(());
        }
        // No restart request: terminate and launch the same target again
        let target = session.target().clone();
        self.start_session(target).await.map(|_| ())
    }

    async fn refresh_watches(&mut self) {
        match self.session.as_mut() {
            Some(session) if session.state() == SessionState::Stopped => {
                session.refresh_watches(&mut self.workspace).await
            }
            _ => self.notifier.emit(Notification::WatchesUpdated {
                watches: self.workspace.watches.list(),
            }),
        }
    }

    async fn load_breakpoints(&mut self, path: &std::path::Path) -> Result<usize> {
        let mut units = self.workspace.ledger.units();
        let count = self.workspace.ledger.load(path)?;
        for unit in self.workspace.ledger.units() {
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        self.sync_units(&units).await;
        Ok(count)
    }

    /// Sync units after a load; failures leave the ledger as loaded
    async fn sync_units(&mut self, units: &[BreakpointUnit]) {
        if let Some(session) = self.session.as_mut().filter(|s| s.state().is_live()) {
            for unit in units {
                if let Err(e) = session.sync_unit(&mut self.workspace.ledger, unit).await {
                    tracing::warn!(%unit, "Could not set breakpoints: {}", e);
                }
            }
        } else {
            for unit in units {
                self.notifier.emit(Notification::BreakpointsChanged {
                    unit: unit.clone(),
                    breakpoints: self.workspace.ledger.list_for(unit),
                });
            }
        }
    }

    /// Apply a ledger mutation and push the affected units to the adapter
    ///
    /// If the adapter rejects a batch the ledger is restored and already
    /// pushed units are re-sent from the restored state. When the channel is
    /// gone the change is kept; it is flushed on the next session start.
    async fn change_breakpoints<R>(
        &mut self,
        change: impl FnOnce(&mut BreakpointLedger) -> Result<(R, Vec<BreakpointUnit>)>,
    ) -> Result<R> {
        let snapshot = self.workspace.ledger.snapshot();
        let (value, units) = change(&mut self.workspace.ledger)?;

        let Some(session) = self.session.as_mut().filter(|s| s.state().is_live()) else {
            for unit in &units {
                self.notifier.emit(Notification::BreakpointsChanged {
                    unit: unit.clone(),
                    breakpoints: self.workspace.ledger.list_for(unit),
                });
            }
            return Ok(value);
        };

        for (done, unit) in units.iter().enumerate() {
            match session.sync_unit(&mut self.workspace.ledger, unit).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => {
                    tracing::warn!(%unit, "Adapter gone while setting breakpoints: {}", e);
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(%unit, "Adapter rejected breakpoints, rolling back: {}", e);
                    self.workspace.ledger.restore(snapshot);
                    for unit in units.iter().take(done + 1) {
                        if let Err(e) = session.sync_unit(&mut self.workspace.ledger, unit).await {
                            tracing::warn!(%unit, "Could not restore breakpoints: {}", e);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(value)
    }
}
