//! Protocol engine: request correlation and event routing
//!
//! The engine owns the two halves of a [`Transport`]. A reader task decodes
//! inbound frames and either resolves the matching pending request or fans
//! the event out to subscribers; a writer task serializes outgoing frames.
//! The engine knows nothing about debugging semantics.
//!
//! When the channel closes for any reason every pending request resolves to
//! [`Error::SessionTerminated`] and every event subscription ends.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::common::{Error, Result};

use super::transport::{AdapterProcess, FrameReader, FrameWriter, Transport};
use super::types::{Event, EventMessage, InboundMessage, RequestMessage, ResponseMessage};

/// Why the channel to the adapter closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    /// We closed it
    Requested,
    /// The adapter closed its end
    EndOfStream,
    /// Reading or writing failed
    Failed(String),
}

struct PendingRequest {
    command: String,
    submitted: Instant,
    reply: oneshot::Sender<Result<ResponseMessage>>,
}

#[derive(Default)]
struct PendingState {
    closed: bool,
    requests: HashMap<i64, PendingRequest>,
}

#[derive(Default)]
struct Subscribers {
    by_name: HashMap<String, Vec<mpsc::UnboundedSender<Event>>>,
    all: Vec<mpsc::UnboundedSender<Event>>,
}

struct Shared {
    seq: AtomicI64,
    pending: Mutex<PendingState>,
    subscribers: Mutex<Subscribers>,
    outgoing: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    closure: watch::Sender<Option<Closure>>,
}

impl Shared {
    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn dispatch(&self, json: &str) {
        tracing::trace!("DAP <<< {}", json);

        let message = match InboundMessage::decode(json) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping adapter frame: {}", e);
                return;
            }
        };

        match message {
            InboundMessage::Response(response) => self.resolve(response),
            InboundMessage::Event(event) => self.publish(&event),
            InboundMessage::Request(request) => self.decline_reverse_request(request),
        }
    }

    fn resolve(&self, response: ResponseMessage) {
        let entry = self.pending.lock().requests.remove(&response.request_seq);
        match entry {
            Some(pending) => {
                tracing::trace!(
                    seq = response.request_seq,
                    command = %pending.command,
                    success = response.success,
                    elapsed_ms = pending.submitted.elapsed().as_millis() as u64,
                    "Response matched"
                );
                // The caller may have stopped waiting
                let _ = pending.reply.send(Ok(response));
            }
            None => {
                tracing::warn!(
                    seq = response.request_seq,
                    command = %response.command,
                    "Discarding response with unknown request sequence number"
                );
            }
        }
    }

    fn publish(&self, message: &EventMessage) {
        let event = Event::from_message(message);
        let mut subscribers = self.subscribers.lock();

        if let Some(list) = subscribers.by_name.get_mut(event.name()) {
            list.retain(|tx| tx.send(event.clone()).is_ok());
        }
        subscribers.all.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Reverse requests (runInTerminal, startDebugging) are not supported;
    /// answer them so the adapter does not wait forever.
    fn decline_reverse_request(&self, request: RequestMessage) {
        tracing::debug!(command = %request.command, "Declining reverse request");
        let response = ResponseMessage {
            seq: self.next_seq(),
            message_type: "response".to_string(),
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(format!("'{}' is not supported by this client", request.command)),
            body: None,
        };
        match serde_json::to_string(&response) {
            Ok(json) => {
                let _ = self.outgoing.send(json);
            }
            Err(e) => tracing::warn!("Failed to encode reverse response: {}", e),
        }
    }

    /// Fail everything in flight and end all subscriptions
    ///
    /// Only the first call has any effect.
    fn teardown(&self, closure: Closure) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            if pending.closed {
                return;
            }
            pending.closed = true;
            pending.requests.drain().collect()
        };

        tracing::debug!(?closure, pending = drained.len(), "Adapter channel closed");
        for (seq, request) in drained {
            tracing::trace!(seq, command = %request.command, "Failing pending request");
            let _ = request.reply.send(Err(Error::SessionTerminated));
        }

        *self.subscribers.lock() = Subscribers::default();
        self.closure.send_replace(Some(closure));
        self.shutdown.send_replace(true);
    }
}

/// A submitted request waiting for its response
///
/// Resolves to the raw response (which may carry `success: false`) or to
/// [`Error::SessionTerminated`] if the channel closes first.
pub struct PendingResponse {
    seq: i64,
    rx: oneshot::Receiver<Result<ResponseMessage>>,
}

impl PendingResponse {
    pub fn seq(&self) -> i64 {
        self.seq
    }

    /// Wait for the response and decode its body
    pub async fn body<T: DeserializeOwned>(self) -> Result<T> {
        self.await?.into_body()
    }
}

impl Future for PendingResponse {
    type Output = Result<ResponseMessage>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::SessionTerminated)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Ordered stream of events for one subscriber
///
/// Ends (yields `None`) once the channel to the adapter has closed and all
/// events received before that have been delivered.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// A started engine together with the pieces the session takes ownership of
pub struct Started {
    pub engine: ProtocolEngine,
    /// Every event, registered before the first frame is read
    pub events: EventSubscription,
    pub process: Option<AdapterProcess>,
}

/// Sequenced request/response/event engine over one transport
pub struct ProtocolEngine {
    shared: Arc<Shared>,
    closure: watch::Receiver<Option<Closure>>,
}

impl ProtocolEngine {
    /// Take ownership of a transport and start the reader and writer tasks
    pub fn start(transport: Transport) -> Started {
        let (reader, writer, process) = transport.into_parts();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closure_tx, closure_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            seq: AtomicI64::new(1),
            pending: Mutex::new(PendingState::default()),
            subscribers: Mutex::new(Subscribers {
                by_name: HashMap::new(),
                all: vec![events_tx],
            }),
            outgoing: outgoing_tx,
            shutdown: shutdown_tx,
            closure: closure_tx,
        });

        tokio::spawn(run_reader(reader, shared.clone(), shutdown_rx.clone()));
        tokio::spawn(run_writer(writer, outgoing_rx, shared.clone(), shutdown_rx));

        Started {
            engine: Self {
                shared,
                closure: closure_rx,
            },
            events: EventSubscription { rx: events_rx },
            process,
        }
    }

    /// Send a request and return a future for its response
    ///
    /// The request is registered before its frame is queued, so the response
    /// can never race ahead of the registration.
    pub fn submit(&self, command: &str, arguments: Option<Value>) -> Result<PendingResponse> {
        let seq = self.shared.next_seq();
        let request = RequestMessage::new(seq, command, arguments);
        let json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(Error::NotConnected);
            }
            pending.requests.insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    submitted: Instant::now(),
                    reply: tx,
                },
            );
        }

        if self.shared.outgoing.send(json).is_err() {
            self.shared.pending.lock().requests.remove(&seq);
            return Err(Error::NotConnected);
        }

        tracing::debug!(seq, command, "Submitted request");
        Ok(PendingResponse { seq, rx })
    }

    /// Submit a request and decode the body of a successful response
    pub async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<T> {
        self.submit(command, arguments)?.body().await
    }

    /// Subscribe to every event with the given name
    ///
    /// After the channel has closed the subscription ends immediately.
    pub fn on_event(&self, name: &str) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        // Teardown sets `closed` before it clears the subscribers, so checking
        // it while holding the subscribers lock cannot strand a sender.
        let mut subscribers = self.shared.subscribers.lock();
        if !self.shared.pending.lock().closed {
            subscribers.by_name.entry(name.to_string()).or_default().push(tx);
        }
        EventSubscription { rx }
    }

    pub fn is_connected(&self) -> bool {
        self.closure.borrow().is_none()
    }

    /// How the channel closed, `None` while it is open
    pub fn closure(&self) -> Option<Closure> {
        self.closure.borrow().clone()
    }

    /// Wait until the channel closes
    pub async fn closed(&self) -> Closure {
        let mut rx = self.closure.clone();
        let _ = rx.wait_for(|c| c.is_some()).await;
        self.closure().unwrap_or(Closure::Requested)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().requests.len()
    }

    /// Close the channel, failing all pending requests
    pub fn close(&self) {
        self.shared.teardown(Closure::Requested);
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        self.shared.teardown(Closure::Requested);
    }
}

async fn run_reader(mut reader: FrameReader, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let closure = loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break Closure::Requested,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(json)) => shared.dispatch(&json),
            Ok(None) => break Closure::EndOfStream,
            Err(Error::AdapterProtocol(msg)) => {
                tracing::warn!("Dropping malformed adapter frame: {}", msg);
            }
            Err(e) => break Closure::Failed(e.to_string()),
        }
    };
    shared.teardown(closure);
}

async fn run_writer(
    mut writer: FrameWriter,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let json = tokio::select! {
            biased;
            json = outgoing.recv() => match json {
                Some(json) => json,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        tracing::trace!("DAP >>> {}", json);
        if let Err(e) = writer.send(&json).await {
            tracing::warn!("Failed to write to adapter: {}", e);
            shared.teardown(Closure::Failed(e.to_string()));
            break;
        }
    }
    writer.shutdown().await;
}
