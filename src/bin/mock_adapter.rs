//! Mock DAP adapter for integration testing
//!
//! Simulates a target that runs from breakpoint to breakpoint. Every source
//! breakpoint that is set becomes a stop location, visited in path/line
//! order; when none is left the target exits, unless the `uncaught`
//! exception filter is set, in which case it first stops on an exception.
//!
//! Speaks DAP on stdin/stdout by default, or serves one connection on
//! `--listen PORT` (TCP) or `--socket PATH` (Unix socket).

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};

use clap::Parser;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "mock_adapter")]
struct Args {
    /// Serve one TCP connection on this port instead of stdio
    #[arg(long)]
    listen: Option<u16>,

    /// Serve one connection on this Unix socket path instead of stdio
    #[arg(long)]
    socket: Option<String>,

    /// Exit abruptly, without answering, when this command arrives
    #[arg(long)]
    crash_on: Option<String>,

    /// Report conditional breakpoints as unverified
    #[arg(long)]
    reject_conditions: bool,

    /// Accept conditional breakpoints, then unverify them with a
    /// `breakpoint` event
    #[arg(long)]
    revoke_conditions: bool,

    /// Refuse breakpoints on lines above this number
    #[arg(long)]
    max_line: Option<u64>,

    /// Answer every setBreakpoints request with a failure
    #[arg(long)]
    refuse_breakpoints: bool,

    /// Answer the launch request with a failure
    #[arg(long)]
    fail_launch: bool,

    /// Do not advertise the restart request
    #[arg(long)]
    no_restart: bool,

    /// Exit code reported when the program finishes
    #[arg(long, default_value_t = 0)]
    exit_code: i32,
}

fn main() {
    let args = Args::parse();

    if let Some(port) = args.listen {
        let listener = match std::net::TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("mock_adapter: cannot bind port {}: {}", port, e);
                std::process::exit(2);
            }
        };
        println!("DAP server listening at: 127.0.0.1:{}", port);
        std::io::stdout().flush().ok();
        if let Ok((stream, _)) = listener.accept() {
            if let Ok(writer) = stream.try_clone() {
                serve(&args, BufReader::new(stream), writer);
            }
        }
        return;
    }

    #[cfg(unix)]
    {
        if let Some(path) = args.socket.as_deref() {
            let listener = match std::os::unix::net::UnixListener::bind(path) {
                Ok(listener) => listener,
                Err(e) => {
                    eprintln!("mock_adapter: cannot bind {}: {}", path, e);
                    std::process::exit(2);
                }
            };
            if let Ok((stream, _)) = listener.accept() {
                if let Ok(writer) = stream.try_clone() {
                    serve(&args, BufReader::new(stream), writer);
                }
            }
            std::fs::remove_file(path).ok();
            return;
        }
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(&args, BufReader::new(stdin.lock()), stdout.lock());
}

fn serve<R: BufRead, W: Write>(args: &Args, mut reader: R, mut writer: W) {
    let mut state = MockState::new(args);

    while let Some(message) = read_message(&mut reader) {
        let command = message.get("command").and_then(Value::as_str).unwrap_or("");
        if args.crash_on.as_deref() == Some(command) {
            eprintln!("mock_adapter: crashing on '{}'", command);
            std::process::exit(70);
        }

        let outgoing = state.process_message(&message);
        for msg in &outgoing {
            if send_message(&mut writer, msg).is_err() {
                return;
            }
        }
        if state.finished {
            return;
        }
    }
}

fn read_message<R: BufRead>(reader: &mut R) -> Option<Value> {
    loop {
        let mut content_length = None;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).ok()? == 0 {
                return None;
            }
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }

        let Some(length) = content_length else {
            continue;
        };
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).ok()?;
        if let Ok(message) = serde_json::from_slice(&body) {
            return Some(message);
        }
    }
}

fn send_message<W: Write>(writer: &mut W, message: &Value) -> std::io::Result<()> {
    let body = message.to_string();
    write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
    writer.flush()
}

struct MockState {
    seq: i64,
    reject_conditions: bool,
    revoke_conditions: bool,
    max_line: Option<u64>,
    fail_launch: bool,
    refuse_breakpoints: bool,
    supports_restart: bool,
    exit_code: i32,
    program: String,
    stop_on_entry: bool,
    /// Source breakpoints by path: (line, adapter id)
    breakpoints: BTreeMap<String, Vec<(u64, i64)>>,
    next_breakpoint_id: i64,
    /// Exception filters currently set
    exception_filters: Vec<String>,
    /// The uncaught exception has been raised in this run
    thrown: bool,
    /// Index into the sorted stop locations of the last breakpoint hit
    position: Option<usize>,
    current: (String, u64),
    /// Bumped on every stop; frame ids and references derive from it
    stop_count: i64,
    finished: bool,
}

impl MockState {
    fn new(args: &Args) -> Self {
        Self {
            seq: 1,
            reject_conditions: args.reject_conditions,
            revoke_conditions: args.revoke_conditions,
            max_line: args.max_line,
            fail_launch: args.fail_launch,
            refuse_breakpoints: args.refuse_breakpoints,
            supports_restart: !args.no_restart,
            exit_code: args.exit_code,
            program: "main.ext".to_string(),
            stop_on_entry: false,
            breakpoints: BTreeMap::new(),
            next_breakpoint_id: 1,
            exception_filters: Vec::new(),
            thrown: false,
            position: None,
            current: ("main.ext".to_string(), 1),
            stop_count: 0,
            finished: false,
        }
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn event(&mut self, event: &str, body: Value) -> Value {
        json!({ "seq": self.next_seq(), "type": "event", "event": event, "body": body })
    }

    fn stop_locations(&self) -> Vec<(String, u64, i64)> {
        self.breakpoints
            .iter()
            .flat_map(|(path, lines)| lines.iter().map(move |(line, id)| (path.clone(), *line, *id)))
            .collect()
    }

    fn stopped(&mut self, reason: &str, hit: Option<i64>) -> Value {
        self.stop_count += 1;
        let mut body = json!({ "reason": reason, "threadId": 1, "allThreadsStopped": true });
        if let Some(id) = hit {
            body["hitBreakpointIds"] = json!([id]);
        }
        self.event("stopped", body)
    }

    /// Resume and run to the next stop location, or to the end
    fn run(&mut self, events: &mut Vec<Value>) {
        let locations = self.stop_locations();
        let next = self.position.map(|p| p + 1).unwrap_or(0);
        match locations.get(next) {
            Some((path, line, id)) => {
                self.position = Some(next);
                self.current = (path.clone(), *line);
                let stopped = self.stopped("breakpoint", Some(*id));
                events.push(stopped);
            }
            None if !self.thrown && self.exception_filters.iter().any(|f| f == "uncaught") => {
                self.thrown = true;
                let mut stopped = self.stopped("exception", None);
                stopped["body"]["description"] = json!("Unhandled ValueError");
                events.push(stopped);
            }
            None => {
                let output = self.event(
                    "output",
                    json!({ "category": "stdout", "output": format!("{} finished\n", self.program) }),
                );
                events.push(output);
                let exited = self.event("exited", json!({ "exitCode": self.exit_code }));
                events.push(exited);
                let terminated = self.event("terminated", json!({}));
                events.push(terminated);
            }
        }
    }

    fn verify(&mut self, requested: &Value) -> Value {
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        let line = requested.get("line").and_then(Value::as_u64);
        let conditional = requested.get("condition").is_some();

        if self.reject_conditions && conditional {
            return json!({ "id": id, "verified": false, "line": line,
                           "message": "condition could not be parsed" });
        }
        if let (Some(line), Some(max)) = (line, self.max_line) {
            if line > max {
                return json!({ "id": id, "verified": false, "line": line,
                               "message": "no code at this line" });
            }
        }
        json!({ "id": id, "verified": true, "line": line })
    }

    fn process_message(&mut self, message: &Value) -> Vec<Value> {
        if message.get("type").and_then(Value::as_str) != Some("request") {
            return Vec::new();
        }
        let command = message.get("command").and_then(Value::as_str).unwrap_or("");
        let request_seq = message.get("seq").and_then(Value::as_i64).unwrap_or(0);
        let arguments = message.get("arguments").cloned().unwrap_or(json!({}));

        let seq = self.next_seq();
        let mut events = Vec::new();

        let result: Result<Value, String> = match command {
            "initialize" => {
                events.push(self.event("initialized", json!({})));
                Ok(json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsFunctionBreakpoints": true,
                    "supportsConditionalBreakpoints": true,
                    "supportsHitConditionalBreakpoints": true,
                    "supportsLogPoints": true,
                    "supportsEvaluateForHovers": true,
                    "supportsRestartRequest": self.supports_restart,
                    "supportsDataBreakpoints": true,
                    "supportsInstructionBreakpoints": true,
                    "supportsTerminateRequest": true,
                    "supportsExceptionFilterOptions": true,
                    "exceptionBreakpointFilters": [
                        { "filter": "raised", "label": "Raised Exceptions", "supportsCondition": true },
                        { "filter": "uncaught", "label": "Uncaught Exceptions", "default": true }
                    ]
                }))
            }
            "launch" | "attach" => {
                if self.fail_launch {
                    Err("program does not exist".to_string())
                } else {
                    if let Some(program) = arguments.get("program").and_then(Value::as_str) {
                        self.program = program.to_string();
                        self.current = (program.to_string(), 1);
                    }
                    self.stop_on_entry = arguments
                        .get("stopOnEntry")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let text = format!("mock: {} {}\n", command, self.program);
                    events.push(self.event("output", json!({ "category": "console", "output": text })));
                    Ok(Value::Null)
                }
            }
            "configurationDone" => {
                events.push(self.event("thread", json!({ "reason": "started", "threadId": 1 })));
                if self.stop_on_entry {
                    let stopped = self.stopped("entry", None);
                    events.push(stopped);
                } else {
                    self.run(&mut events);
                }
                Ok(Value::Null)
            }
            "setBreakpoints" if self.refuse_breakpoints => {
                Err("breakpoints cannot be changed now".to_string())
            }
            "setBreakpoints" => {
                let path = arguments
                    .pointer("/source/path")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let requested = arguments
                    .get("breakpoints")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                let mut answered = Vec::new();
                let mut lines = Vec::new();
                for bp in &requested {
                    let verified = self.verify(bp);
                    if self.revoke_conditions && bp.get("condition").is_some() {
                        let revoked = json!({ "id": verified["id"], "verified": false,
                                              "message": "condition refers to an unknown variable" });
                        events.push(self.event("breakpoint", json!({ "reason": "changed", "breakpoint": revoked })));
                        answered.push(verified);
                        continue;
                    }
                    if verified["verified"] == json!(true) {
                        if let (Some(line), Some(id)) = (verified["line"].as_u64(), verified["id"].as_i64()) {
                            lines.push((line, id));
                        }
                    }
                    answered.push(verified);
                }
                lines.sort();
                if lines.is_empty() {
                    self.breakpoints.remove(&path);
                } else {
                    self.breakpoints.insert(path, lines);
                }
                Ok(json!({ "breakpoints": answered }))
            }
            "setFunctionBreakpoints" | "setInstructionBreakpoints" | "setDataBreakpoints" => {
                let requested = arguments
                    .get("breakpoints")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let answered: Vec<Value> = requested.iter().map(|bp| self.verify(bp)).collect();
                Ok(json!({ "breakpoints": answered }))
            }
            "setExceptionBreakpoints" => {
                let mut filters: Vec<String> = arguments
                    .get("filters")
                    .and_then(Value::as_array)
                    .map(|f| f.iter().filter_map(Value::as_str).map(String::from).collect())
                    .unwrap_or_default();
                if let Some(options) = arguments.get("filterOptions").and_then(Value::as_array) {
                    filters.extend(
                        options
                            .iter()
                            .filter_map(|o| o.get("filterId").and_then(Value::as_str))
                            .map(String::from),
                    );
                }
                self.exception_filters = filters;
                // No body: the filters are accepted as a whole
                Ok(Value::Null)
            }
            "continue" => {
                self.run(&mut events);
                Ok(json!({ "allThreadsContinued": true }))
            }
            "next" | "stepIn" | "stepOut" => {
                self.current.1 += 1;
                let stopped = self.stopped("step", None);
                events.push(stopped);
                Ok(Value::Null)
            }
            "pause" => {
                let stopped = self.stopped("pause", None);
                events.push(stopped);
                Ok(Value::Null)
            }
            "threads" => Ok(json!({
                "threads": [ { "id": 1, "name": "main" }, { "id": 2, "name": "worker" } ]
            })),
            "stackTrace" => {
                let base = self.stop_count * 100;
                let (path, line) = &self.current;
                Ok(json!({
                    "stackFrames": [
                        { "id": base + 1, "name": "compute",
                          "source": { "name": path, "path": path }, "line": line, "column": 1 },
                        { "id": base + 2, "name": "main",
                          "source": { "name": path, "path": path }, "line": 3, "column": 5 }
                    ],
                    "totalFrames": 2
                }))
            }
            "scopes" => {
                let base = self.stop_count * 1000;
                Ok(json!({
                    "scopes": [
                        { "name": "Locals", "variablesReference": base + 1, "expensive": false },
                        { "name": "Globals", "variablesReference": base + 2, "expensive": true }
                    ]
                }))
            }
            "variables" => {
                let reference = arguments
                    .get("variablesReference")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let base = self.stop_count * 1000;
                let variables = if reference == base + 1 {
                    json!([
                        { "name": "count", "value": self.current.1.to_string(), "type": "int", "variablesReference": 0 },
                        { "name": "point", "value": "{x:1, y:2}", "type": "Point", "variablesReference": base + 3 }
                    ])
                } else if reference == base + 3 {
                    json!([
                        { "name": "x", "value": "1", "type": "int", "variablesReference": 0 },
                        { "name": "y", "value": "2", "type": "int", "variablesReference": 0 }
                    ])
                } else {
                    json!([])
                };
                Ok(json!({ "variables": variables }))
            }
            "evaluate" => {
                let expression = arguments
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match expression {
                    "count" => Ok(json!({ "result": self.current.1.to_string(), "type": "int", "variablesReference": 0 })),
                    "point" => Ok(json!({ "result": "{x:1, y:2}", "type": "Point",
                                          "variablesReference": self.stop_count * 1000 + 3 })),
                    "1 + 1" => Ok(json!({ "result": "2", "type": "int", "variablesReference": 0 })),
                    other => Err(format!("identifier '{}' is undefined", other)),
                }
            }
            "restart" => {
                self.position = None;
                self.thrown = false;
                self.current = (self.program.clone(), 1);
                let stopped = self.stopped("entry", None);
                events.push(stopped);
                Ok(Value::Null)
            }
            "terminate" => {
                events.push(self.event("exited", json!({ "exitCode": self.exit_code })));
                events.push(self.event("terminated", json!({})));
                Ok(Value::Null)
            }
            "disconnect" => {
                self.finished = true;
                Ok(Value::Null)
            }
            other => Err(format!("Unknown command: {}", other)),
        };

        let response = match result {
            Ok(body) => json!({
                "seq": seq, "type": "response", "request_seq": request_seq,
                "success": true, "command": command, "body": body
            }),
            Err(message) => json!({
                "seq": seq, "type": "response", "request_seq": request_seq,
                "success": false, "command": command, "message": message
            }),
        };

        let mut outgoing = vec![response];
        outgoing.extend(events);
        outgoing
    }
}
