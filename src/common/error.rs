//! Error types for the debug session engine
//!
//! Errors are grouped by the layer that produces them. Command-level errors
//! travel back to the caller of the command; transport and framing errors are
//! handled inside the dispatch loop and only surface through notifications.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the session engine
#[derive(Error, Debug)]
pub enum Error {
    // === Endpoint / Transport Errors ===
    #[error("No free debug adapter port after {attempts} attempts")]
    PortUnavailable { attempts: u32 },

    #[error("Failed to connect to debug adapter: {0}")]
    ConnectFailed(String),

    #[error("Not connected to a debug adapter")]
    NotConnected,

    #[error("Debug session terminated")]
    SessionTerminated,

    // === Session Errors ===
    #[error("Cannot {action} while session is {state}")]
    InvalidState { action: String, state: String },

    #[error("Target crashed: {0}")]
    TargetCrashed(String),

    // === Adapter Errors ===
    #[error("Debug adapter '{name}' not found. Searched: {searched}")]
    AdapterNotFound { name: String, searched: String },

    #[error("Debug adapter failed to start: {0}")]
    AdapterStartFailed(String),

    #[error("Malformed adapter message: {0}")]
    AdapterProtocol(String),

    #[error("Adapter rejected '{command}': {message}")]
    AdapterReportedFailure { command: String, message: String },

    // === Breakpoint Errors ===
    #[error("Breakpoint already exists at {location}")]
    DuplicateBreakpoint { location: String },

    #[error("Invalid breakpoint location: {0}")]
    InvalidLocation(String),

    #[error("Breakpoint {id} not found")]
    BreakpointNotFound { id: u32 },

    // === Execution Model Errors ===
    #[error("Thread {0} not found")]
    ThreadNotFound(i64),

    #[error("Frame {0} not found")]
    FrameNotFound(i64),

    #[error("Watch {0} not found")]
    WatchNotFound(u32),

    #[error("Variable reference {0} is not valid in the current stop")]
    UnknownReference(i64),

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    // === Timeout Errors ===
    #[error("'{0}' timed out after {1} ms")]
    Timeout(String, u64),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an adapter not found error with search paths
    pub fn adapter_not_found<S: AsRef<str>>(name: &str, paths: &[S]) -> Self {
        Self::AdapterNotFound {
            name: name.to_string(),
            searched: paths.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
        }
    }

    /// Create an adapter-reported failure for a request
    pub fn adapter_failed(command: &str, message: &str) -> Self {
        Self::AdapterReportedFailure {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: impl ToString) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a duplicate breakpoint error
    pub fn duplicate(location: impl ToString) -> Self {
        Self::DuplicateBreakpoint {
            location: location.to_string(),
        }
    }

    /// Whether this error means the adapter connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::SessionTerminated | Self::TargetCrashed(_)
        )
    }
}
