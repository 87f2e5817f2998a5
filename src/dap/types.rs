//! DAP message types
//!
//! These types represent the Debug Adapter Protocol messages.
//! See: https://microsoft.github.io/debug-adapter-protocol/specification

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::Error;

// === Base Protocol Messages ===

/// DAP request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl RequestMessage {
    pub fn new(seq: i64, command: &str, arguments: Option<Value>) -> Self {
        Self {
            seq,
            message_type: "request".to_string(),
            command: command.to_string(),
            arguments,
        }
    }
}

/// DAP response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ResponseMessage {
    /// Error text the adapter attached to a failed response.
    ///
    /// Adapters put it either in `message` or in `body.error.format`.
    pub fn error_message(&self) -> String {
        self.body
            .as_ref()
            .and_then(|b| b.get("error"))
            .and_then(|e| e.get("format"))
            .and_then(|f| f.as_str())
            .map(String::from)
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Unknown error".to_string())
    }

    /// Convert into the typed body, mapping `success:false` to an error
    pub fn into_body<T: serde::de::DeserializeOwned>(self) -> Result<T, Error> {
        if !self.success {
            return Err(Error::adapter_failed(&self.command, &self.error_message()));
        }
        let command = self.command;
        // A missing body reads as an empty object so bodies with only
        // defaulted fields still decode
        let body = self.body.unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(body).map_err(|e| {
            Error::AdapterProtocol(format!("Failed to parse {} response: {}", command, e))
        })
    }
}

/// DAP event message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A decoded inbound frame
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Response(ResponseMessage),
    Event(EventMessage),
    /// Reverse request issued by the adapter (e.g. `runInTerminal`)
    Request(RequestMessage),
}

impl InboundMessage {
    /// Decode a frame body
    ///
    /// Anything that is not a well-formed response, event or request is an
    /// [`Error::AdapterProtocol`].
    pub fn decode(json: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| Error::AdapterProtocol(format!("Invalid JSON: {}", e)))?;

        let msg_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let decoded = match msg_type.as_str() {
            "response" => serde_json::from_value(value).map(Self::Response),
            "event" => serde_json::from_value(value).map(Self::Event),
            "request" => serde_json::from_value(value).map(Self::Request),
            other => {
                return Err(Error::AdapterProtocol(format!(
                    "Unknown message type: {}",
                    other
                )))
            }
        };

        decoded.map_err(|e| Error::AdapterProtocol(format!("Malformed {}: {}", msg_type, e)))
    }
}

// === Request Arguments ===

/// Initialize request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(rename = "adapterID")]
    pub adapter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default = "default_true")]
    pub lines_start_at1: bool,
    #[serde(default = "default_true")]
    pub columns_start_at1: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_format: Option<String>,
    #[serde(default)]
    pub supports_variable_type: bool,
    #[serde(default)]
    pub supports_variable_paging: bool,
    #[serde(default)]
    pub supports_run_in_terminal_request: bool,
    #[serde(default)]
    pub supports_memory_references: bool,
    #[serde(default)]
    pub supports_progress_reporting: bool,
}

fn default_true() -> bool {
    true
}

impl InitializeArguments {
    pub fn for_adapter(adapter_id: &str) -> Self {
        Self {
            client_id: Some("dapsession".to_string()),
            client_name: Some("dapsession".to_string()),
            adapter_id: adapter_id.to_string(),
            locale: None,
            lines_start_at1: true,
            columns_start_at1: true,
            path_format: Some("path".to_string()),
            supports_variable_type: true,
            supports_variable_paging: false,
            supports_run_in_terminal_request: false,
            supports_memory_references: true,
            supports_progress_reporting: false,
        }
    }
}

/// Launch request arguments
///
/// Adapter-specific keys (`MIMode`, `justMyCode`, ...) travel in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchArguments {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub stop_on_entry: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Attach request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachArguments {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// SetBreakpoints request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    pub source: Source,
    /// Always serialized: an empty list clears the unit on the adapter side
    #[serde(default)]
    pub breakpoints: Vec<SourceBreakpoint>,
}

/// SetFunctionBreakpoints request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFunctionBreakpointsArguments {
    pub breakpoints: Vec<FunctionBreakpoint>,
}

/// SetInstructionBreakpoints request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetInstructionBreakpointsArguments {
    pub breakpoints: Vec<InstructionBreakpoint>,
}

/// SetDataBreakpoints request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDataBreakpointsArguments {
    pub breakpoints: Vec<DataBreakpoint>,
}

/// SetExceptionBreakpoints request arguments
///
/// Filters without a condition go in `filters`; conditional ones in
/// `filter_options`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetExceptionBreakpointsArguments {
    pub filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_options: Vec<ExceptionFilterOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionFilterOptions {
    pub filter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Continue request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueArguments {
    pub thread_id: i64,
    #[serde(default)]
    pub single_thread: bool,
}

/// Step request arguments (next, stepIn, stepOut)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepArguments {
    pub thread_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
}

/// Pause request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseArguments {
    pub thread_id: i64,
}

/// StackTrace request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_frame: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub levels: Option<i64>,
}

/// Scopes request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: i64,
}

/// Variables request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

/// Evaluate request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Disconnect request arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectArguments {
    #[serde(default)]
    pub restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_debuggee: Option<bool>,
}

// === Response Bodies ===

/// Capabilities returned by initialize response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub supports_configuration_done_request: bool,
    #[serde(default)]
    pub supports_function_breakpoints: bool,
    #[serde(default)]
    pub supports_conditional_breakpoints: bool,
    #[serde(default)]
    pub supports_hit_conditional_breakpoints: bool,
    #[serde(default)]
    pub supports_log_points: bool,
    #[serde(default)]
    pub supports_evaluate_for_hovers: bool,
    #[serde(default)]
    pub supports_restart_request: bool,
    #[serde(default)]
    pub supports_data_breakpoints: bool,
    #[serde(default)]
    pub supports_instruction_breakpoints: bool,
    #[serde(default)]
    pub supports_terminate_request: bool,
    #[serde(default)]
    pub supports_exception_filter_options: bool,
    /// Exception categories the adapter can break on
    #[serde(default)]
    pub exception_breakpoint_filters: Vec<ExceptionBreakpointsFilter>,
}

/// One exception category offered by the adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionBreakpointsFilter {
    pub filter: String,
    pub label: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub supports_condition: bool,
}

/// Response body shared by every set*Breakpoints request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetBreakpointsResponseBody {
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
}

/// StackTrace response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceResponseBody {
    pub stack_frames: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<i64>,
}

/// Threads response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsResponseBody {
    pub threads: Vec<Thread>,
}

/// Scopes response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopesResponseBody {
    pub scopes: Vec<Scope>,
}

/// Variables response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariablesResponseBody {
    pub variables: Vec<Variable>,
}

/// Evaluate response body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponseBody {
    pub result: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}

/// Continue response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseBody {
    #[serde(default = "default_true")]
    pub all_threads_continued: bool,
}

// === Common Types ===

/// Source location
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<i64>,
}

/// Breakpoint to set at a source location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

/// Function breakpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionBreakpoint {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
}

/// Instruction (address) breakpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstructionBreakpoint {
    pub instruction_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
}

/// Data breakpoint (watchpoint)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpoint {
    pub data_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
}

/// Breakpoint information returned by the adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

/// Stack frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction_pointer_reference: Option<String>,
}

impl StackFrame {
    /// Source path of the frame, if it has one
    pub fn source_path(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.path.as_deref())
    }
}

/// Thread
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: i64,
    pub name: String,
}

/// Scope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    #[serde(default)]
    pub expensive: bool,
}

/// Variable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}

impl Variable {
    /// Compound values carry a reference that can be expanded
    pub fn is_expandable(&self) -> bool {
        self.variables_reference > 0
    }
}

// === Event Bodies ===

/// Stopped event body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEventBody {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub all_threads_stopped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hit_breakpoint_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Output event body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEventBody {
    pub category: Option<String>,
    pub output: String,
}

/// Thread event body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadEventBody {
    pub reason: String,
    pub thread_id: i64,
}

/// Exited event body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedEventBody {
    pub exit_code: i32,
}

/// Terminated event body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminatedEventBody {
    #[serde(default)]
    pub restart: bool,
}

// === Parsed Events ===

/// Parsed DAP event
#[derive(Debug, Clone)]
pub enum Event {
    Initialized,
    Stopped(StoppedEventBody),
    Continued { thread_id: i64, all_threads_continued: bool },
    Exited(ExitedEventBody),
    Terminated(Option<TerminatedEventBody>),
    Thread(ThreadEventBody),
    Output(OutputEventBody),
    Breakpoint { reason: String, breakpoint: Breakpoint },
    Unknown { event: String, body: Option<Value> },
}

impl Event {
    /// Wire name of the event
    pub fn name(&self) -> &str {
        match self {
            Event::Initialized => "initialized",
            Event::Stopped(_) => "stopped",
            Event::Continued { .. } => "continued",
            Event::Exited(_) => "exited",
            Event::Terminated(_) => "terminated",
            Event::Thread(_) => "thread",
            Event::Output(_) => "output",
            Event::Breakpoint { .. } => "breakpoint",
            Event::Unknown { event, .. } => event,
        }
    }

    /// Parse an event from an EventMessage
    ///
    /// Known events with bodies that fail to parse degrade to `Unknown`
    /// instead of failing the session.
    pub fn from_message(msg: &EventMessage) -> Self {
        let unknown = || Event::Unknown {
            event: msg.event.clone(),
            body: msg.body.clone(),
        };
        fn parse<T: serde::de::DeserializeOwned>(body: &Option<Value>) -> Option<T> {
            body.as_ref()
                .and_then(|b| serde_json::from_value(b.clone()).ok())
        }

        match msg.event.as_str() {
            "initialized" => Event::Initialized,
            "stopped" => parse(&msg.body).map(Event::Stopped).unwrap_or_else(unknown),
            "continued" => {
                let thread_id = msg
                    .body
                    .as_ref()
                    .and_then(|b| b.get("threadId"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let all_threads_continued = msg
                    .body
                    .as_ref()
                    .and_then(|b| b.get("allThreadsContinued"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                Event::Continued {
                    thread_id,
                    all_threads_continued,
                }
            }
            "exited" => Event::Exited(
                parse(&msg.body).unwrap_or(ExitedEventBody { exit_code: 0 }),
            ),
            "terminated" => Event::Terminated(parse(&msg.body)),
            "thread" => parse(&msg.body).map(Event::Thread).unwrap_or_else(unknown),
            "output" => parse(&msg.body).map(Event::Output).unwrap_or_else(unknown),
            "breakpoint" => {
                let parsed = msg.body.as_ref().and_then(|body| {
                    let reason = body
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let breakpoint = serde_json::from_value(body.get("breakpoint")?.clone()).ok()?;
                    Some(Event::Breakpoint { reason, breakpoint })
                });
                parsed.unwrap_or_else(unknown)
            }
            _ => unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, body: Value) -> EventMessage {
        EventMessage {
            seq: 1,
            message_type: "event".to_string(),
            event: name.to_string(),
            body: Some(body),
        }
    }

    #[test]
    fn test_decode_response() {
        let msg = InboundMessage::decode(
            r#"{"seq":4,"type":"response","request_seq":2,"success":true,"command":"threads","body":{"threads":[]}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::Response(r) => assert_eq!(r.request_seq, 2),
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = InboundMessage::decode(r#"{"seq":1,"type":"gossip"}"#).unwrap_err();
        assert!(matches!(err, Error::AdapterProtocol(_)));
        let err = InboundMessage::decode("not json").unwrap_err();
        assert!(matches!(err, Error::AdapterProtocol(_)));
    }

    #[test]
    fn test_failed_response_message() {
        let response: ResponseMessage = serde_json::from_value(json!({
            "seq": 9, "type": "response", "request_seq": 3, "success": false,
            "command": "evaluate",
            "body": { "error": { "id": 1, "format": "no symbol 'q'" } }
        }))
        .unwrap();
        let err = response.into_body::<EvaluateResponseBody>().unwrap_err();
        match err {
            Error::AdapterReportedFailure { command, message } => {
                assert_eq!(command, "evaluate");
                assert_eq!(message, "no symbol 'q'");
            }
            other => panic!("Unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_response_without_body_uses_defaults() {
        let response: ResponseMessage = serde_json::from_value(json!({
            "seq": 5, "type": "response", "request_seq": 4, "success": true,
            "command": "setExceptionBreakpoints"
        }))
        .unwrap();
        let body = response.into_body::<SetBreakpointsResponseBody>().unwrap();
        assert!(body.breakpoints.is_empty());

        let caps: Capabilities = serde_json::from_value(json!({
            "exceptionBreakpointFilters": [
                { "filter": "raised", "label": "Raised", "supportsCondition": true }
            ]
        }))
        .unwrap();
        assert_eq!(caps.exception_breakpoint_filters[0].filter, "raised");
        assert!(caps.exception_breakpoint_filters[0].supports_condition);
        assert!(!caps.exception_breakpoint_filters[0].default);
    }

    #[test]
    fn test_stopped_event_parsing() {
        let ev = Event::from_message(&event(
            "stopped",
            json!({ "reason": "breakpoint", "threadId": 1, "hitBreakpointIds": [3] }),
        ));
        match ev {
            Event::Stopped(body) => {
                assert_eq!(body.thread_id, Some(1));
                assert_eq!(body.hit_breakpoint_ids, vec![3]);
            }
            other => panic!("Expected stopped, got {:?}", other),
        }
    }

    #[test]
    fn test_each_event_body_parses_to_its_own_type() {
        let ev = Event::from_message(&event("exited", json!({ "exitCode": 3 })));
        assert!(matches!(ev, Event::Exited(ExitedEventBody { exit_code: 3 })));

        let ev = Event::from_message(&event("terminated", json!({ "restart": true })));
        assert!(matches!(ev, Event::Terminated(Some(TerminatedEventBody { restart: true }))));

        let ev = Event::from_message(&event("thread", json!({ "reason": "started", "threadId": 2 })));
        assert!(matches!(ev, Event::Thread(ref body) if body.thread_id == 2 && body.reason == "started"));

        let ev = Event::from_message(&event("output", json!({ "category": "stdout", "output": "hi\n" })));
        assert!(matches!(ev, Event::Output(ref body) if body.output == "hi\n"));
    }

    #[test]
    fn test_unknown_and_malformed_events_are_preserved() {
        let ev = Event::from_message(&event("progressStart", json!({ "title": "x" })));
        assert_eq!(ev.name(), "progressStart");
        assert!(matches!(ev, Event::Unknown { .. }));

        // A known event whose body is missing its required fields
        let ev = Event::from_message(&event("stopped", json!({ "threadId": 1 })));
        assert!(matches!(ev, Event::Unknown { ref event, .. } if event == "stopped"));
    }

    #[test]
    fn test_launch_arguments_flatten_extra() {
        let mut extra = Map::new();
        extra.insert("MIMode".to_string(), json!("gdb"));
        let args = LaunchArguments {
            program: "/bin/app".to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            stop_on_entry: false,
            extra,
        };
        let value = serde_json::to_value(&args).unwrap();
        assert_eq!(value["MIMode"], "gdb");
        assert_eq!(value["program"], "/bin/app");
        assert!(value.get("args").is_none());
    }
}
