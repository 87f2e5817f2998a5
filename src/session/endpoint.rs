//! Reaching the adapter: endpoint negotiation and adapter startup
//!
//! Stdio adapters are simply spawned. TCP adapters need a free local port,
//! which comes from a [`PortProvider`] and is retried with backoff; the
//! adapter is then started with `{port}` substituted into its arguments and
//! connected to once it listens. Socket adapters get a per-session socket
//! name in place of `{socket}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::config::{AdapterConfig, EndpointConfig, Timeouts, TransportMode};
use crate::common::{paths, Error, Result};
use crate::dap::transport::{AdapterProcess, Endpoint, Transport};

/// Placeholder replaced by the negotiated TCP port
const PORT_PLACEHOLDER: &str = "{port}";

/// Placeholder replaced by the per-session socket name
const SOCKET_PLACEHOLDER: &str = "{socket}";

/// Source of free local ports
#[async_trait]
pub trait PortProvider: Send + Sync {
    async fn allocate(&self) -> Result<u16>;
}

/// Asks the OS for an ephemeral port on the loopback interface
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPortAllocator;

#[async_trait]
impl PortProvider for LocalPortAllocator {
    async fn allocate(&self) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(port)
    }
}

/// Bounded retry with doubling backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&EndpointConfig> for RetryPolicy {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_millis),
            max_backoff: Duration::from_millis(config.max_backoff_millis),
        }
    }
}

/// Ask `provider` for a port until it succeeds or attempts run out
pub async fn negotiate_port(provider: &dyn PortProvider, policy: &RetryPolicy) -> Result<u16> {
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=attempts {
        match provider.allocate().await {
            Ok(port) => {
                tracing::debug!(port, attempt, "Negotiated adapter port");
                return Ok(port);
            }
            Err(e) => {
                tracing::warn!(attempt, max_attempts = attempts, "Port negotiation failed: {}", e);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.max_backoff);
                }
            }
        }
    }

    Err(Error::PortUnavailable { attempts })
}

fn substitute(args: &[String], placeholder: &str, value: &str) -> Vec<String> {
    args.iter().map(|a| a.replace(placeholder, value)).collect()
}

/// Opens transports to configured adapters
#[derive(Clone)]
pub struct AdapterConnector {
    ports: Arc<dyn PortProvider>,
    policy: RetryPolicy,
    timeouts: Timeouts,
}

impl AdapterConnector {
    pub fn new(ports: Arc<dyn PortProvider>, endpoint: &EndpointConfig, timeouts: &Timeouts) -> Self {
        Self {
            ports,
            policy: RetryPolicy::from(endpoint),
            timeouts: timeouts.clone(),
        }
    }

    /// Start (or reach) the adapter and return an open transport
    ///
    /// On failure nothing is left running: a spawned adapter is killed
    /// before the error is returned.
    pub async fn connect(&self, adapter: &AdapterConfig, session_tag: &str) -> Result<Transport> {
        match adapter.transport {
            TransportMode::Stdio => {
                Transport::open(&Endpoint::Stdio {
                    program: adapter.path.clone(),
                    args: adapter.args.clone(),
                })
                .await
            }
            TransportMode::Tcp => {
                let port = negotiate_port(self.ports.as_ref(), &self.policy).await?;
                let args = substitute(&adapter.args, PORT_PLACEHOLDER, &port.to_string());
                let (process, announced) = AdapterProcess::spawn_listening(&adapter.path, &args)?;
                let fallback = Endpoint::Tcp {
                    addr: format!("127.0.0.1:{}", port),
                };
                self.connect_spawned(process, fallback, Some(announced)).await
            }
            TransportMode::Socket => {
                paths::ensure_socket_dir()?;
                let name = paths::adapter_socket_name(session_tag);
                #[cfg(unix)]
                {
                    // Stale socket from an earlier session with the same tag
                    let stale = std::path::Path::new(&name);
                    if stale.exists() {
                        std::fs::remove_file(stale)?;
                    }
                }
                let args = substitute(&adapter.args, SOCKET_PLACEHOLDER, &name);
                let (process, _) = AdapterProcess::spawn_listening(&adapter.path, &args)?;
                self.connect_spawned(process, Endpoint::LocalSocket { name }, None)
                    .await
            }
        }
    }

    async fn connect_spawned(
        &self,
        mut process: AdapterProcess,
        endpoint: Endpoint,
        announced: Option<tokio::sync::watch::Receiver<Option<String>>>,
    ) -> Result<Transport> {
        let deadline = self.timeouts.connect();
        let connected = tokio::time::timeout(deadline, async {
            loop {
                // Prefer an address the adapter printed over the one we assumed
                let target = announced
                    .as_ref()
                    .and_then(|rx| rx.borrow().clone())
                    .map(|addr| Endpoint::Tcp { addr })
                    .unwrap_or_else(|| endpoint.clone());

                match Transport::open(&target).await {
                    Ok(transport) => return Ok(transport),
                    Err(e) => {
                        if let Some(detail) = process.exit_detail() {
                            return Err(Error::AdapterStartFailed(detail));
                        }
                        tracing::trace!(%target, "Adapter not listening yet: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        })
        .await;

        match connected {
            Ok(Ok(transport)) => {
                tracing::info!(%endpoint, "Connected to adapter");
                Ok(transport.with_process(process))
            }
            Ok(Err(e)) => {
                process.kill().await;
                Err(e)
            }
            Err(_) => {
                process.kill().await;
                Err(Error::ConnectFailed(format!(
                    "{} did not accept a connection within {} s",
                    endpoint,
                    deadline.as_secs()
                )))
            }
        }
    }
}
