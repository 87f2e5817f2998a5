//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Debug adapter configurations
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,

    /// Default settings
    #[serde(default)]
    pub defaults: Defaults,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Endpoint negotiation settings
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Output buffer settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Execution model settings
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// How the engine talks to the adapter process
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Adapter speaks DAP on its stdin/stdout
    #[default]
    Stdio,
    /// Adapter listens on a negotiated local TCP port
    Tcp,
    /// Adapter listens on a per-session local socket (Unix socket or named pipe)
    Socket,
}

/// Configuration for a debug adapter
#[derive(Debug, Deserialize, Clone)]
pub struct AdapterConfig {
    /// Path to the adapter executable
    pub path: PathBuf,

    /// Additional arguments to pass to the adapter.
    ///
    /// In TCP mode every `{port}` occurrence is replaced by the negotiated port,
    /// in socket mode every `{socket}` occurrence by the socket name.
    #[serde(default)]
    pub args: Vec<String>,

    /// Transport used to reach the adapter
    #[serde(default)]
    pub transport: TransportMode,

    /// Value sent as `adapterID` in the initialize request
    #[serde(default)]
    pub adapter_id: Option<String>,
}

/// Default settings
#[derive(Debug, Deserialize, Clone)]
pub struct Defaults {
    /// Default adapter to use
    #[serde(default = "default_adapter")]
    pub adapter: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
        }
    }
}

fn default_adapter() -> String {
    "lldb-dap".to_string()
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Timeout for the initialize handshake
    #[serde(default = "default_dap_initialize")]
    pub dap_initialize_secs: u64,

    /// Timeout for general DAP requests
    #[serde(default = "default_dap_request")]
    pub dap_request_secs: u64,

    /// Timeout for connecting to a TCP adapter after spawning it
    #[serde(default = "default_connect")]
    pub connect_secs: u64,

    /// Grace period for the disconnect response during teardown
    #[serde(default = "default_disconnect")]
    pub disconnect_millis: u64,
}

impl Timeouts {
    pub fn initialize(&self) -> Duration {
        Duration::from_secs(self.dap_initialize_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.dap_request_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_millis)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dap_initialize_secs: default_dap_initialize(),
            dap_request_secs: default_dap_request(),
            connect_secs: default_connect(),
            disconnect_millis: default_disconnect(),
        }
    }
}

fn default_dap_initialize() -> u64 {
    10
}
fn default_dap_request() -> u64 {
    30
}
fn default_connect() -> u64 {
    5
}
fn default_disconnect() -> u64 {
    500
}

/// Endpoint negotiation retry policy
#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Total number of negotiation attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled on each further retry
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_millis: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_max_backoff")]
    pub max_backoff_millis: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_millis: default_initial_backoff(),
            max_backoff_millis: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    2_000
}

/// Output buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Maximum number of output events to buffer
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Maximum total bytes to buffer
    #[serde(default = "default_max_bytes")]
    pub max_bytes_mb: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_bytes_mb: default_max_bytes(),
        }
    }
}

fn default_max_events() -> usize {
    10_000
}
fn default_max_bytes() -> usize {
    10
}

/// Execution model configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExecutionConfig {
    /// Frames requested per stack trace; 0 asks the adapter for all of them
    #[serde(default)]
    pub stack_levels: i64,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::from_toml_str(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Get adapter configuration by name
    ///
    /// Falls back to searching PATH if not explicitly configured
    pub fn get_adapter(&self, name: &str) -> Option<AdapterConfig> {
        if let Some(config) = self.adapters.get(name) {
            return Some(config.clone());
        }

        which::which(name).ok().map(|path| AdapterConfig {
            path,
            args: Vec::new(),
            transport: TransportMode::Stdio,
            adapter_id: Some(name.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.defaults.adapter, "lldb-dap");
        assert_eq!(config.endpoint.max_attempts, 3);
        assert_eq!(config.timeouts.disconnect(), Duration::from_millis(500));
        assert_eq!(config.execution.stack_levels, 0);
    }

    #[test]
    fn test_parse_tcp_adapter() {
        let config = Config::from_toml_str(
            r#"
[adapters.gdb]
path = "/usr/bin/gdb"
args = ["--port", "{port}"]
transport = "tcp"

[endpoint]
max_attempts = 5
initial_backoff_millis = 10
"#,
        )
        .unwrap();

        let gdb = config.get_adapter("gdb").unwrap();
        assert_eq!(gdb.transport, TransportMode::Tcp);
        assert_eq!(gdb.args, vec!["--port", "{port}"]);
        assert_eq!(config.endpoint.max_attempts, 5);
        assert_eq!(config.endpoint.max_backoff_millis, 2_000);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = Config::from_toml_str("[timeouts]\ndap_request_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, crate::common::Error::ConfigParse(_)));
    }
}
