//! Byte-stream channel to a debug adapter
//!
//! A [`Transport`] is opened once per session and split into a frame reader,
//! a frame writer and (when we spawned it) the adapter process. It knows
//! nothing about message semantics beyond the Content-Length framing.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::common::{parse_listen_address, Error, Result};

use super::codec;

#[cfg(unix)]
use interprocess::local_socket::GenericFilePath as SocketNameKind;
#[cfg(windows)]
use interprocess::local_socket::GenericNamespaced as SocketNameKind;
use interprocess::local_socket::tokio::{prelude::*, Stream as LocalStream};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where the adapter can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Spawn the adapter and speak DAP over its stdin/stdout
    Stdio { program: PathBuf, args: Vec<String> },
    /// Connect to an adapter listening on a TCP address
    Tcp { addr: String },
    /// Connect to an adapter listening on a local socket
    LocalSocket { name: String },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Stdio { program, .. } => write!(f, "stdio:{}", program.display()),
            Endpoint::Tcp { addr } => write!(f, "tcp:{}", addr),
            Endpoint::LocalSocket { name } => write!(f, "socket:{}", name),
        }
    }
}

/// Inbound half: yields decoded frame bodies
pub struct FrameReader {
    inner: BufReader<BoxedReader>,
}

impl FrameReader {
    /// Next frame body, `Ok(None)` at end of stream
    pub async fn next_frame(&mut self) -> Result<Option<String>> {
        codec::read_message(&mut self.inner).await
    }
}

/// Outbound half: frames and writes message bodies
pub struct FrameWriter {
    inner: BufWriter<BoxedWriter>,
}

impl FrameWriter {
    pub async fn send(&mut self, json: &str) -> Result<()> {
        codec::write_message(&mut self.inner, json).await
    }

    /// Flush and close the outbound direction
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!("Error shutting down adapter stream: {}", e);
        }
    }
}

/// An adapter subprocess owned by one session
///
/// The process is killed when this value is dropped.
pub struct AdapterProcess {
    child: Child,
    program: String,
}

impl AdapterProcess {
    fn command(program: &PathBuf, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    fn spawn_err(program: &PathBuf, e: std::io::Error) -> Error {
        Error::AdapterStartFailed(format!("Failed to start {}: {}", program.display(), e))
    }

    /// Spawn an adapter that listens on its own endpoint
    ///
    /// Its stdout and stderr are forwarded to the log. Addresses the adapter
    /// announces ("listening at: ...") are published on the returned channel.
    pub fn spawn_listening(
        program: &PathBuf,
        args: &[String],
    ) -> Result<(Self, watch::Receiver<Option<String>>)> {
        let mut cmd = Self::command(program, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| Self::spawn_err(program, e))?;
        let (announce_tx, announce_rx) = watch::channel(None);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "dapsession::adapter", "{}", line);
                    if let Some(addr) = parse_listen_address(&line) {
                        announce_tx.send_replace(Some(addr));
                    }
                }
            });
        }
        forward_stderr(&mut child);

        tracing::info!(pid = child.id(), "Spawned adapter {}", program.display());
        Ok((
            Self {
                child,
                program: program.display().to_string(),
            },
            announce_rx,
        ))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status of the process if it has already exited
    pub fn exit_detail(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(describe_exit(status)),
            _ => None,
        }
    }

    /// Wait briefly for the process to exit on its own and describe how it ended
    pub async fn wait_exit_detail(&mut self, grace: Duration) -> Option<String> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(describe_exit(status)),
            _ => None,
        }
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) {
        if self.exit_detail().is_some() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill adapter {}: {}", self.program, e);
        }
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[cfg(unix)]
fn describe_exit(status: std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("adapter exited with status {}", code),
        (None, Some(signal)) => format!("adapter killed by signal {}", signal),
        (None, None) => "adapter exited".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_exit(status: std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("adapter exited with status {}", code),
        None => "adapter exited".to_string(),
    }
}

fn forward_stderr(child: &mut Child) {
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "dapsession::adapter", "stderr: {}", line);
            }
        });
    }
}

/// An open channel to an adapter
pub struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
    process: Option<AdapterProcess>,
}

impl Transport {
    /// Open a channel to the given endpoint
    pub async fn open(endpoint: &Endpoint) -> Result<Self> {
        tracing::debug!(%endpoint, "Opening adapter transport");
        match endpoint {
            Endpoint::Stdio { program, args } => Self::spawn_stdio(program, args),
            Endpoint::Tcp { addr } => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| Error::ConnectFailed(format!("{}: {}", addr, e)))?;
                stream.set_nodelay(true).ok();
                Ok(Self::from_stream(stream))
            }
            Endpoint::LocalSocket { name } => {
                let stream = connect_local(name)
                    .await
                    .map_err(|e| Error::ConnectFailed(format!("{}: {}", name, e)))?;
                Ok(Self::from_stream(stream))
            }
        }
    }

    fn spawn_stdio(program: &PathBuf, args: &[String]) -> Result<Self> {
        let mut cmd = AdapterProcess::command(program, args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterProcess::spawn_err(program, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::AdapterStartFailed("Failed to get adapter stdin".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::AdapterStartFailed("Failed to get adapter stdout".to_string())
        })?;
        forward_stderr(&mut child);

        tracing::info!(pid = child.id(), "Spawned adapter {}", program.display());
        Ok(Self::from_io(stdout, stdin).with_process(AdapterProcess {
            child,
            program: program.display().to_string(),
        }))
    }

    /// Build a transport over arbitrary reader and writer halves
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader {
                inner: BufReader::new(Box::new(reader)),
            },
            writer: FrameWriter {
                inner: BufWriter::new(Box::new(writer)),
            },
            process: None,
        }
    }

    /// Build a transport over a bidirectional stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_io(reader, writer)
    }

    /// Attach the adapter process this transport talks to
    pub fn with_process(mut self, process: AdapterProcess) -> Self {
        self.process = Some(process);
        self
    }

    pub fn into_parts(self) -> (FrameReader, FrameWriter, Option<AdapterProcess>) {
        (self.reader, self.writer, self.process)
    }
}

async fn connect_local(name: &str) -> std::io::Result<LocalStream> {
    #[cfg(unix)]
    let name = name.to_fs_name::<SocketNameKind>()?;
    #[cfg(windows)]
    let name = name.to_ns_name::<SocketNameKind>()?;
    LocalStream::connect(name).await
}
