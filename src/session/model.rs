//! Execution model: threads, frames, scopes and variables
//!
//! A read-only projection of what the adapter last reported. Everything
//! except the thread list is only valid while the target is stopped; any
//! resume clears it before the resume request is sent.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::json;

use crate::common::{Error, Result};
use crate::dap::engine::ProtocolEngine;
use crate::dap::types::{
    Scope, ScopesResponseBody, StackFrame, StackTraceArguments, StackTraceResponseBody,
    ThreadEventBody, ThreadsResponseBody, Variable, VariablesResponseBody,
};

/// A target thread as last reported
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
    pub stopped: bool,
}

/// One-line description of a frame for notifications and listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub id: i64,
    pub name: String,
    pub path: Option<String>,
    pub line: u32,
    pub address: Option<String>,
}

impl From<&StackFrame> for FrameSummary {
    fn from(frame: &StackFrame) -> Self {
        Self {
            id: frame.id,
            name: frame.name.clone(),
            path: frame.source_path().map(String::from),
            line: frame.line,
            address: frame.instruction_pointer_reference.clone(),
        }
    }
}

impl std::fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.path, &self.address) {
            (Some(path), _) => write!(f, "{} at {}:{}", self.name, path, self.line),
            (None, Some(addr)) => write!(f, "{} at {}", self.name, addr),
            (None, None) => write!(f, "{}", self.name),
        }
    }
}

/// Where and why the target last stopped
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopInfo {
    pub thread_id: i64,
    pub reason: String,
    pub description: Option<String>,
    pub all_threads_stopped: bool,
}

/// Per-session cache of the adapter's view of the target
#[derive(Debug, Default)]
pub struct ExecutionModel {
    threads: Vec<ThreadInfo>,
    stop: Option<StopInfo>,
    selected_thread: Option<i64>,
    selected_frame: usize,
    frames: HashMap<i64, Vec<StackFrame>>,
    scopes: HashMap<i64, Vec<Scope>>,
    variables: HashMap<i64, Vec<Variable>>,
    /// References handed out during the current stop
    references: HashSet<i64>,
    /// Bumped whenever stop-scoped data is discarded
    generation: u64,
    stack_levels: i64,
}

impl ExecutionModel {
    /// `stack_levels` limits frames per request; 0 asks for all of them
    pub fn new(stack_levels: i64) -> Self {
        Self {
            stack_levels,
            ..Default::default()
        }
    }

    pub fn stop_info(&self) -> Option<&StopInfo> {
        self.stop.as_ref()
    }

    pub fn selected_thread(&self) -> Option<i64> {
        self.selected_thread
    }

    pub fn selected_frame_index(&self) -> usize {
        self.selected_frame
    }

    pub fn cached_threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    /// Frames cached for a thread during the current stop
    pub fn cached_frames(&self, thread_id: i64) -> Option<&[StackFrame]> {
        self.frames.get(&thread_id).map(Vec::as_slice)
    }

    /// Record a stop and start a fresh stop-scoped cache
    pub fn on_stopped(&mut self, stop: StopInfo) {
        self.clear_stop_data();
        for thread in &mut self.threads {
            if stop.all_threads_stopped || thread.id == stop.thread_id {
                thread.stopped = true;
            }
        }
        if !self.threads.iter().any(|t| t.id == stop.thread_id) {
            self.threads.push(ThreadInfo {
                id: stop.thread_id,
                name: format!("Thread {}", stop.thread_id),
                stopped: true,
            });
        }
        self.selected_thread = Some(stop.thread_id);
        self.selected_frame = 0;
        self.stop = Some(stop);
    }

    /// Discard everything that was only valid while stopped
    ///
    /// Called before a resume request is sent.
    pub fn invalidate(&mut self) {
        self.clear_stop_data();
        self.stop = None;
        for thread in &mut self.threads {
            thread.stopped = false;
        }
    }

    fn clear_stop_data(&mut self) {
        self.frames.clear();
        self.scopes.clear();
        self.variables.clear();
        self.references.clear();
        self.selected_frame = 0;
        self.generation += 1;
    }

    /// Forget everything, including threads
    pub fn clear(&mut self) {
        self.invalidate();
        self.threads.clear();
        self.selected_thread = None;
    }

    /// Apply a `thread` event
    pub fn on_thread_event(&mut self, body: &ThreadEventBody) {
        match body.reason.as_str() {
            "started" => {
                if !self.threads.iter().any(|t| t.id == body.thread_id) {
                    self.threads.push(ThreadInfo {
                        id: body.thread_id,
                        name: format!("Thread {}", body.thread_id),
                        stopped: false,
                    });
                }
            }
            "exited" => {
                self.threads.retain(|t| t.id != body.thread_id);
                self.frames.remove(&body.thread_id);
                if self.selected_thread == Some(body.thread_id) {
                    self.selected_thread = self.threads.first().map(|t| t.id);
                    self.selected_frame = 0;
                }
            }
            other => tracing::trace!(reason = other, thread_id = body.thread_id, "Thread event"),
        }
    }

    /// Refresh the thread list from the adapter
    pub async fn fetch_threads(&mut self, engine: &ProtocolEngine) -> Result<Vec<ThreadInfo>> {
        let body: ThreadsResponseBody = engine.request("threads", None).await?;
        let stop = self.stop.as_ref();
        self.threads = body
            .threads
            .into_iter()
            .map(|t| ThreadInfo {
                stopped: stop.is_some_and(|s| s.all_threads_stopped || s.thread_id == t.id),
                id: t.id,
                name: t.name,
            })
            .collect();
        if self
            .selected_thread
            .is_some_and(|id| !self.threads.iter().any(|t| t.id == id))
        {
            self.selected_thread = self.threads.first().map(|t| t.id);
        }
        Ok(self.threads.clone())
    }

    /// Call stack of a stopped thread, fetched once per stop
    pub async fn frames(&mut self, engine: &ProtocolEngine, thread_id: i64) -> Result<Vec<StackFrame>> {
        if let Some(frames) = self.frames.get(&thread_id) {
            return Ok(frames.clone());
        }
        if !self.threads.is_empty() && !self.threads.iter().any(|t| t.id == thread_id) {
            return Err(Error::ThreadNotFound(thread_id));
        }

        let generation = self.generation;
        let args = StackTraceArguments {
            thread_id,
            start_frame: Some(0),
            levels: (self.stack_levels > 0).then_some(self.stack_levels),
        };
        let body: StackTraceResponseBody = engine
            .request("stackTrace", Some(serde_json::to_value(&args)?))
            .await?;

        // A resume while we waited makes the answer stale
        if generation != self.generation {
            return Err(Error::invalid_state("read frames", "running"));
        }
        tracing::debug!(thread_id, count = body.stack_frames.len(), "Fetched stack frames");
        self.frames.insert(thread_id, body.stack_frames.clone());
        Ok(body.stack_frames)
    }

    /// Scopes of a frame of the current stop
    pub async fn scopes(&mut self, engine: &ProtocolEngine, frame_id: i64) -> Result<Vec<Scope>> {
        if let Some(scopes) = self.scopes.get(&frame_id) {
            return Ok(scopes.clone());
        }
        if !self.frames.values().flatten().any(|f| f.id == frame_id) {
            return Err(Error::FrameNotFound(frame_id));
        }

        let body: ScopesResponseBody = engine
            .request("scopes", Some(json!({ "frameId": frame_id })))
            .await?;
        self.references
            .extend(body.scopes.iter().map(|s| s.variables_reference).filter(|r| *r > 0));
        self.scopes.insert(frame_id, body.scopes.clone());
        Ok(body.scopes)
    }

    /// Children of a scope or compound value; each expansion is one request
    pub async fn variables(&mut self, engine: &ProtocolEngine, reference: i64) -> Result<Vec<Variable>> {
        if let Some(vars) = self.variables.get(&reference) {
            return Ok(vars.clone());
        }
        if !self.references.contains(&reference) {
            return Err(Error::UnknownReference(reference));
        }

        let body: VariablesResponseBody = engine
            .request("variables", Some(json!({ "variablesReference": reference })))
            .await?;
        self.references.extend(
            body.variables
                .iter()
                .filter(|v| v.is_expandable())
                .map(|v| v.variables_reference),
        );
        self.variables.insert(reference, body.variables.clone());
        Ok(body.variables)
    }

    /// Make a reference returned by an evaluation expandable
    pub fn register_reference(&mut self, reference: i64) {
        if reference > 0 {
            self.references.insert(reference);
        }
    }

    pub fn select_thread(&mut self, thread_id: i64) -> Result<()> {
        if !self.threads.iter().any(|t| t.id == thread_id) {
            return Err(Error::ThreadNotFound(thread_id));
        }
        if self.selected_thread != Some(thread_id) {
            self.selected_thread = Some(thread_id);
            self.selected_frame = 0;
        }
        Ok(())
    }

    /// Select a frame by index in the selected thread's cached stack
    pub fn select_frame(&mut self, index: usize) -> Result<&StackFrame> {
        let thread_id = self
            .selected_thread
            .ok_or_else(|| Error::invalid_state("select a frame", "running"))?;
        let frame = self
            .frames
            .get(&thread_id)
            .and_then(|frames| frames.get(index))
            .ok_or(Error::FrameNotFound(index as i64))?;
        self.selected_frame = index;
        Ok(frame)
    }

    /// Id of the selected frame, if its stack has been fetched
    pub fn current_frame_id(&self) -> Option<i64> {
        let thread_id = self.selected_thread?;
        self.frames
            .get(&thread_id)?
            .get(self.selected_frame)
            .map(|f| f.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(thread_id: i64, all: bool) -> StopInfo {
        StopInfo {
            thread_id,
            reason: "breakpoint".to_string(),
            description: None,
            all_threads_stopped: all,
        }
    }

    fn frame(id: i64, line: u32) -> StackFrame {
        StackFrame {
            id,
            name: format!("f{}", id),
            source: None,
            line,
            column: 0,
            instruction_pointer_reference: Some("0x1000".to_string()),
        }
    }

    #[test]
    fn test_stop_marks_threads() {
        let mut model = ExecutionModel::new(0);
        model.on_thread_event(&ThreadEventBody {
            reason: "started".into(),
            thread_id: 1,
        });
        model.on_thread_event(&ThreadEventBody {
            reason: "started".into(),
            thread_id: 2,
        });

        model.on_stopped(stop(2, false));
        let stopped: Vec<bool> = model.cached_threads().iter().map(|t| t.stopped).collect();
        assert_eq!(stopped, vec![false, true]);
        assert_eq!(model.selected_thread(), Some(2));

        model.invalidate();
        assert!(model.cached_threads().iter().all(|t| !t.stopped));
        assert!(model.stop_info().is_none());
    }

    #[test]
    fn test_invalidate_drops_frames_and_references() {
        let mut model = ExecutionModel::new(0);
        model.on_stopped(stop(1, true));
        model.frames.insert(1, vec![frame(100, 42)]);
        model.register_reference(7);
        let before = model.generation;

        assert_eq!(model.current_frame_id(), Some(100));
        model.invalidate();

        assert!(model.cached_frames(1).is_none());
        assert!(model.current_frame_id().is_none());
        assert!(!model.references.contains(&7));
        assert!(model.generation > before);
    }

    #[test]
    fn test_select_frame_and_thread() {
        let mut model = ExecutionModel::new(0);
        model.on_stopped(stop(1, true));
        model.frames.insert(1, vec![frame(100, 42), frame(101, 7)]);

        assert_eq!(model.select_frame(1).unwrap().id, 101);
        assert_eq!(model.current_frame_id(), Some(101));
        assert!(matches!(model.select_frame(5), Err(Error::FrameNotFound(5))));
        assert!(matches!(model.select_thread(9), Err(Error::ThreadNotFound(9))));

        model.on_thread_event(&ThreadEventBody {
            reason: "exited".into(),
            thread_id: 1,
        });
        assert_eq!(model.selected_thread(), None);
    }

    #[test]
    fn test_frame_summary_display() {
        let summary = FrameSummary::from(&frame(3, 9));
        assert_eq!(summary.to_string(), "f3 at 0x1000");
    }
}
