//! Command channel to the coordinator.
//!
//! One persistent TCP connection per client. A writer thread drains an
//! outgoing queue and a reader thread forwards inbound frames; the loop thread
//! only ever touches `std::sync::mpsc` ends and never blocks on the socket.
//! Replies resolve [`Deferred`] handles and broadcasts go to handlers
//! registered per [`BroadcastKind`]. Both happen inside [`CommandChannel::poll`],
//! in the order frames arrived.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tandem_protocol::frame::{encode_frame, read_frame, write_encoded};
use tandem_protocol::{Broadcast, BroadcastKind, Command, Frame, Notification, Request};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Result, SessionError};

type SuccessFn = Box<dyn FnOnce(Value)>;
type FailureFn = Box<dyn FnOnce(ChannelError)>;
type BroadcastHandler = Box<dyn FnMut(&Broadcast)>;

// ═══════════════════════════════════════════════════════════════════════════════
// Deferred
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct DeferredState {
    outcome: Option<std::result::Result<Value, ChannelError>>,
    on_success: Vec<SuccessFn>,
    on_failure: Vec<FailureFn>,
}

/// Result of a command that has not necessarily completed yet.
///
/// Resolves exactly once, either successfully with the reply payload or with
/// a [`ChannelError`]. Only the callbacks for that outcome ever run, each
/// exactly once. Callbacks attached after resolution run immediately.
#[derive(Clone, Default)]
pub struct Deferred(Rc<RefCell<DeferredState>>);

impl Deferred {
    fn new() -> Self {
        Self::default()
    }

    pub fn on_success(self, callback: impl FnOnce(Value) + 'static) -> Self {
        self.0.borrow_mut().on_success.push(Box::new(callback));
        self.fire();
        self
    }

    pub fn on_failure(self, callback: impl FnOnce(ChannelError) + 'static) -> Self {
        self.0.borrow_mut().on_failure.push(Box::new(callback));
        self.fire();
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.0.borrow().outcome.is_some()
    }

    /// The outcome, once resolved.
    pub fn outcome(&self) -> Option<std::result::Result<Value, ChannelError>> {
        self.0.borrow().outcome.clone()
    }

    /// Returns `false` if the deferred had already been resolved.
    fn resolve(&self, outcome: std::result::Result<Value, ChannelError>) -> bool {
        {
            let mut state = self.0.borrow_mut();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
        }
        self.fire();
        true
    }

    fn fire(&self) {
        let (outcome, successes, failures) = {
            let mut state = self.0.borrow_mut();
            let Some(outcome) = state.outcome.clone() else {
                return;
            };
            let successes = std::mem::take(&mut state.on_success);
            let failures = std::mem::take(&mut state.on_failure);
            (outcome, successes, failures)
        };
        match outcome {
            Ok(value) => {
                for callback in successes {
                    callback(value.clone());
                }
            }
            Err(err) => {
                for callback in failures {
                    callback(err.clone());
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Channel
// ═══════════════════════════════════════════════════════════════════════════════

enum Inbound {
    Frame(Frame),
    Closed(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Disconnected,
    Closed,
}

pub struct CommandChannel {
    peer: String,
    stream: TcpStream,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    incoming: mpsc::Receiver<Inbound>,
    next_id: u64,
    pending: HashMap<u64, Deferred>,
    ready: Vec<(Deferred, std::result::Result<Value, ChannelError>)>,
    handlers: HashMap<BroadcastKind, Vec<BroadcastHandler>>,
    state: ChannelState,
}

impl CommandChannel {
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let stream = TcpStream::connect(&addr).map_err(|source| SessionError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        let io_err = |context: &str, source: std::io::Error| SessionError::Io {
            context: format!("{} for {}", context, peer),
            source,
        };

        let read_half = stream
            .try_clone()
            .map_err(|e| io_err("clone read half", e))?;
        let write_half = stream
            .try_clone()
            .map_err(|e| io_err("clone write half", e))?;

        let (outgoing, outbox) = mpsc::channel::<Vec<u8>>();
        let (inbox, incoming) = mpsc::channel::<Inbound>();

        thread::Builder::new()
            .name("tandem-writer".to_string())
            .spawn(move || write_loop(write_half, outbox))
            .map_err(|e| io_err("spawn writer", e))?;
        thread::Builder::new()
            .name("tandem-reader".to_string())
            .spawn(move || read_loop(read_half, inbox))
            .map_err(|e| io_err("spawn reader", e))?;

        info!(peer = %peer, "Connected to coordinator");
        Ok(Self {
            peer,
            stream,
            outgoing: Some(outgoing),
            incoming,
            next_id: 1,
            pending: HashMap::new(),
            ready: Vec::new(),
            handlers: HashMap::new(),
            state: ChannelState::Connected,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Queues `command` for writing and returns its result handle.
    ///
    /// Never blocks and never runs callbacks. Notification commands resolve
    /// successfully once queued; on a channel that is not connected every
    /// command fails with [`ChannelError::ConnectionLost`]. A command too
    /// large for one frame fails with [`ChannelError::Encode`] and leaves the
    /// connection up. Either way the
    /// callbacks run from the next [`poll`](Self::poll).
    pub fn send_command(&mut self, command: Command) -> Deferred {
        let deferred = Deferred::new();
        let outgoing = match (&self.outgoing, self.state) {
            (Some(outgoing), ChannelState::Connected) => outgoing.clone(),
            (_, ChannelState::Closed) => {
                self.ready
                    .push((deferred.clone(), Err(ChannelError::Cancelled)));
                return deferred;
            }
            _ => {
                self.ready
                    .push((deferred.clone(), Err(ChannelError::ConnectionLost)));
                return deferred;
            }
        };

        let name = command.name();
        let expects_reply = command.expects_reply();
        let id = self.next_id;
        let frame = if expects_reply {
            Frame::Request(Request::new(id, command))
        } else {
            Frame::Notify(Notification::new(command))
        };
        let body = match encode_frame(&frame) {
            Ok(body) => body,
            Err(err) => {
                warn!(command = name, error = %err, "Refusing to send command");
                self.ready
                    .push((deferred.clone(), Err(ChannelError::Encode(err.to_string()))));
                return deferred;
            }
        };

        if expects_reply {
            self.next_id += 1;
            self.pending.insert(id, deferred.clone());
            debug!(id, command = name, bytes = body.len(), "Sending request");
            if outgoing.send(body).is_err() {
                self.mark_disconnected(Some("writer stopped".to_string()));
            }
        } else {
            debug!(command = name, "Sending notification");
            if outgoing.send(body).is_ok() {
                self.ready.push((deferred.clone(), Ok(Value::Null)));
            } else {
                self.ready
                    .push((deferred.clone(), Err(ChannelError::ConnectionLost)));
                self.mark_disconnected(Some("writer stopped".to_string()));
            }
        }
        deferred
    }

    /// Registers a handler for one broadcast type. Handlers of the same type
    /// run in registration order.
    pub fn on_broadcast(&mut self, kind: BroadcastKind, handler: impl FnMut(&Broadcast) + 'static) {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Processes every frame received so far. Returns the number of inbound
    /// frames handled.
    pub fn poll(&mut self) -> usize {
        self.flush_ready();
        let mut handled = 0;
        loop {
            match self.incoming.try_recv() {
                Ok(inbound) => {
                    handled += usize::from(self.handle_inbound(inbound));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_disconnected(None);
                    break;
                }
            }
            self.flush_ready();
        }
        self.flush_ready();
        handled
    }

    /// Waits up to `timeout` for at least one inbound frame, then polls.
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        self.flush_ready();
        if !self.is_connected() {
            return self.poll();
        }
        match self.incoming.recv_timeout(timeout) {
            Ok(inbound) => {
                let first = usize::from(self.handle_inbound(inbound));
                self.flush_ready();
                first + self.poll()
            }
            Err(RecvTimeoutError::Timeout) => 0,
            Err(RecvTimeoutError::Disconnected) => {
                self.mark_disconnected(None);
                self.poll()
            }
        }
    }

    /// Fails every outstanding deferred with [`ChannelError::Cancelled`],
    /// drops all handlers and closes the connection.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        let cancelled = self.pending.len();
        self.state = ChannelState::Closed;
        self.handlers.clear();
        for (_, deferred) in self.pending.drain() {
            self.ready.push((deferred, Err(ChannelError::Cancelled)));
        }
        self.outgoing = None;
        let _ = self.stream.shutdown(Shutdown::Both);
        self.flush_ready();
        info!(peer = %self.peer, cancelled, "Channel closed");
    }

    fn handle_inbound(&mut self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Frame(frame) => {
                self.dispatch(frame);
                true
            }
            Inbound::Closed(reason) => {
                self.mark_disconnected(reason);
                false
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                let Some(deferred) = self.pending.remove(&response.id) else {
                    warn!(id = response.id, "Dropping reply for unknown request");
                    return;
                };
                let outcome = response.into_result().map_err(ChannelError::Remote);
                deferred.resolve(outcome);
            }
            Frame::Broadcast(broadcast) => {
                let kind = broadcast.kind();
                match self.handlers.get_mut(&kind) {
                    Some(handlers) => {
                        for handler in handlers.iter_mut() {
                            handler(&broadcast);
                        }
                    }
                    None => debug!(kind = ?kind, "No handler for broadcast"),
                }
            }
            Frame::Request(_) | Frame::Notify(_) => {
                warn!(peer = %self.peer, "Coordinator sent a client-only frame; disconnecting");
                let _ = self.stream.shutdown(Shutdown::Both);
                self.mark_disconnected(Some("protocol error".to_string()));
            }
        }
    }

    /// Every outstanding deferred fails with ConnectionLost. Idempotent.
    fn mark_disconnected(&mut self, reason: Option<String>) {
        if self.state != ChannelState::Connected {
            return;
        }
        self.state = ChannelState::Disconnected;
        self.outgoing = None;
        let failed = self.pending.len();
        for (_, deferred) in self.pending.drain() {
            self.ready.push((deferred, Err(ChannelError::ConnectionLost)));
        }
        warn!(
            peer = %self.peer,
            reason = reason.as_deref().unwrap_or("closed by coordinator"),
            failed,
            "Connection to coordinator lost"
        );
    }

    fn flush_ready(&mut self) {
        for (deferred, outcome) in std::mem::take(&mut self.ready) {
            deferred.resolve(outcome);
        }
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn write_loop(stream: TcpStream, outbox: mpsc::Receiver<Vec<u8>>) {
    let mut writer = BufWriter::new(stream);
    for body in outbox {
        if let Err(err) = write_encoded(&mut writer, &body) {
            debug!(error = %err, "Coordinator write failed");
            break;
        }
    }
    if let Ok(stream) = writer.into_inner() {
        let _ = stream.shutdown(Shutdown::Write);
    }
}

fn read_loop(stream: TcpStream, inbox: mpsc::Sender<Inbound>) {
    let mut reader = BufReader::new(stream);
    loop {
        let inbound = match read_frame(&mut reader) {
            Ok(Some(frame)) => Inbound::Frame(frame),
            Ok(None) => Inbound::Closed(None),
            Err(err) => Inbound::Closed(Some(err.to_string())),
        };
        let closed = matches!(inbound, Inbound::Closed(_));
        if inbox.send(inbound).is_err() || closed {
            break;
        }
    }
}
