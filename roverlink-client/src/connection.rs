//! Connection to the vehicle service.
//!
//! Architecture:
//! - `connect()` opens the TCP stream, writes the handshake for the selected
//!   wire format and spawns the receive thread
//! - Receive thread: owns the read half, frames bytes into lines, decodes them
//!   and hands every event to the caller's `on_event` callback. It also tracks
//!   the handshake and reports the outcome through a oneshot channel
//! - `Session`: the write half plus the shared state; `send` and `close` may be
//!   called from any thread
//!
//! Shutdown: `close()` sets the stop flag and shuts the socket down, which
//! wakes the blocked `read` so the receive thread can exit and be joined.

use derive_more::{Display, Error};
use log::{debug, error, info, warn};
use roverlink_protocol::{is_valid_token, Event, HandshakeStep, ProtocolCodec, Role};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::thread_util::spawn_named;

/// Bytes requested per `read` call
const READ_CHUNK: usize = 2048;
/// Longest partial line kept while waiting for its newline
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Connection lifecycle. `Disconnected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    HandshakeSent = 1,
    Authenticated = 2,
    Disconnected = 3,
    Failed = 4,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::HandshakeSent,
            2 => Self::Authenticated,
            3 => Self::Disconnected,
            _ => Self::Failed,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Atomic holder for [`ConnectionState`] that never leaves a terminal state
struct StateCell(AtomicU8);

impl StateCell {
    const fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`. Returns false if the state was already terminal.
    fn advance(&self, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!ConnectionState::from_u8(current).is_terminal()).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Errors from the connection
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ConnectionError {
    #[display("admin role requires a non-empty token")]
    MissingToken,
    #[display("admin token must not contain whitespace or control characters")]
    InvalidToken,
    #[display("could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[display("connection I/O error: {reason}")]
    Io { reason: String },
    #[display("connection closed by peer")]
    PeerClosed,
    #[display("connection is closed")]
    Closed,
    #[display("handshake rejected: {reason}")]
    Rejected { reason: String },
    #[display("no handshake reply within {millis} ms")]
    HandshakeTimeout { millis: u64 },
}

impl ConnectionError {
    fn io(e: &io::Error) -> Self {
        Self::Io {
            reason: e.to_string(),
        }
    }
}

/// Where to connect and as whom
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub role: Role,
    pub token: Option<String>,
    pub connect_timeout: Duration,
}

impl ConnectionSettings {
    /// Token to put in the handshake: required for admins, never sent for observers
    fn handshake_token(&self) -> Result<Option<&str>, ConnectionError> {
        match (self.role, self.token.as_deref().map(str::trim)) {
            (Role::Observer, _) => Ok(None),
            (Role::Admin, None | Some("")) => Err(ConnectionError::MissingToken),
            (Role::Admin, Some(token)) if is_valid_token(token) => Ok(Some(token)),
            (Role::Admin, Some(_)) => Err(ConnectionError::InvalidToken),
        }
    }
}

/// Outbound side of a session, as seen by the poller and command gate
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Write one complete, newline-terminated message.
    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError>;
}

/// Splits a byte stream into trimmed, non-empty lines.
///
/// Bytes after the last `\n` are kept until more data arrives.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        if self.pending.len() > MAX_PENDING_LINE {
            warn!(
                "Discarding {} bytes received without a line break",
                self.pending.len()
            );
            self.pending.clear();
        }
        lines
    }

    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// State shared between the session handle and the receive thread
struct Shared {
    state: StateCell,
    stop: AtomicBool,
    writer: Mutex<TcpStream>,
    /// Separate handle so `close()` never waits behind a blocked write
    control: TcpStream,
}

impl Shared {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stream = self.writer.lock().unwrap();
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn shutdown(&self) {
        // NotConnected after the peer is gone is expected
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

type HandshakeResult = Result<String, ConnectionError>;

/// An open connection. Dropping it closes the socket and joins the receive thread.
pub struct Session {
    shared: Arc<Shared>,
    role: Role,
    peer: SocketAddr,
    receiver: Mutex<Option<JoinHandle<()>>>,
    handshake: Mutex<Option<oneshot::Receiver<HandshakeResult>>>,
}

/// Connect, send the handshake and start the receive thread.
///
/// `on_event` runs on the receive thread for every decoded line, in arrival
/// order. `on_error` runs at most once, when the session ends for any reason
/// other than [`Session::close`].
pub fn connect<E, F>(
    settings: &ConnectionSettings,
    codec: Arc<dyn ProtocolCodec>,
    on_event: E,
    on_error: F,
) -> Result<Session, ConnectionError>
where
    E: FnMut(Event) + Send + 'static,
    F: FnOnce(&ConnectionError) + Send + 'static,
{
    let token = settings.handshake_token()?;
    let state = StateCell::new(ConnectionState::Connecting);

    info!(
        "Connecting to {}:{} as {} ({})",
        settings.host,
        settings.port,
        settings.role,
        codec.wire_format()
    );
    let stream = open_stream(settings)?;
    let peer = stream.peer_addr().map_err(|e| ConnectionError::io(&e))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {e}");
    }
    let reader = stream.try_clone().map_err(|e| ConnectionError::io(&e))?;
    let control = stream.try_clone().map_err(|e| ConnectionError::io(&e))?;

    let shared = Arc::new(Shared {
        state,
        stop: AtomicBool::new(false),
        writer: Mutex::new(stream),
        control,
    });

    let handshake = codec.handshake(settings.role, token);
    for line in &handshake {
        if let Err(e) = shared.write(line) {
            error!("Failed to send handshake to {peer}: {e}");
            shared.state.advance(ConnectionState::Failed);
            shared.shutdown();
            return Err(ConnectionError::io(&e));
        }
    }
    shared.state.advance(ConnectionState::HandshakeSent);
    // Content not logged: the admin handshake carries the token
    debug!("Handshake sent to {peer} ({} lines)", handshake.len());

    let (handshake_tx, handshake_rx) = oneshot::channel();
    let receive_loop = ReceiveLoop {
        reader,
        shared: Arc::clone(&shared),
        codec,
        role: settings.role,
        handshake_tx: Some(handshake_tx),
        on_event,
        on_error: Some(on_error),
    };
    let handle = match spawn_named("roverlink-rx", move || receive_loop.run()) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to spawn receive thread: {e}");
            shared.state.advance(ConnectionState::Failed);
            shared.shutdown();
            return Err(ConnectionError::io(&e));
        }
    };

    info!("Connected to {peer}");
    Ok(Session {
        shared,
        role: settings.role,
        peer,
        receiver: Mutex::new(Some(handle)),
        handshake: Mutex::new(Some(handshake_rx)),
    })
}

/// Resolve the host and try each address in turn
fn open_stream(settings: &ConnectionSettings) -> Result<TcpStream, ConnectionError> {
    let target = format!("{}:{}", settings.host, settings.port);
    let addrs = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(|e| ConnectionError::Connect {
            addr: target.clone(),
            reason: e.to_string(),
        })?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, settings.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("Failed to connect to {addr}: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(ConnectionError::Connect {
        addr: target,
        reason: last_error.map_or_else(|| "no addresses resolved".to_string(), |e| e.to_string()),
    })
}

impl Session {
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Write one framed message.
    pub fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        if self.shared.stop.load(Ordering::Acquire) || self.state().is_terminal() {
            return Err(ConnectionError::Closed);
        }
        match self.shared.write(bytes) {
            Ok(()) => {
                debug!("TX: {}", String::from_utf8_lossy(bytes).trim_end());
                Ok(())
            }
            Err(e) => {
                error!("Send to {} failed: {e}", self.peer);
                if self.shared.state.advance(ConnectionState::Failed) {
                    self.shared.shutdown();
                }
                Err(ConnectionError::io(&e))
            }
        }
    }

    /// Block until the peer answers the handshake.
    ///
    /// Returns the granted role name. Only the first call waits; later calls
    /// report the current state.
    pub fn wait_authenticated(&self, timeout: Duration) -> Result<String, ConnectionError> {
        let receiver = self.handshake.lock().unwrap().take();
        let Some(receiver) = receiver else {
            return match self.state() {
                ConnectionState::Authenticated => Ok(self.role.wire_name().to_string()),
                _ => Err(ConnectionError::Closed),
            };
        };

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) if self.state().is_terminal() => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Stop the session. Idempotent and safe from any thread.
    pub fn close(&self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.state.advance(ConnectionState::Disconnected) {
            info!("Closing connection to {}", self.peer);
        }
        self.shared.shutdown();
    }

    /// Wait for the receive thread to finish.
    ///
    /// Call `close()` first unless the peer is expected to hang up.
    pub fn join(&self) {
        let handle = self.receiver.lock().unwrap().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            // Called from inside an event callback; the thread ends on its own
            return;
        }
        if handle.join().is_err() {
            error!("Receive thread panicked");
        }
    }
}

impl Transport for Session {
    fn state(&self) -> ConnectionState {
        Session::state(self)
    }

    fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        Session::send(self, bytes)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
        self.join();
    }
}

/// Why the receive loop stopped reading
enum LoopExit {
    PeerClosed,
    Read(io::Error),
    Rejected(String),
}

struct ReceiveLoop<E, F> {
    reader: TcpStream,
    shared: Arc<Shared>,
    codec: Arc<dyn ProtocolCodec>,
    role: Role,
    handshake_tx: Option<oneshot::Sender<HandshakeResult>>,
    on_event: E,
    on_error: Option<F>,
}

impl<E, F> ReceiveLoop<E, F>
where
    E: FnMut(Event),
    F: FnOnce(&ConnectionError),
{
    fn run(mut self) {
        debug!("Receive loop started");
        let exit = self.read_until_exit();
        self.finish(exit);
    }

    fn read_until_exit(&mut self) -> LoopExit {
        let mut framer = LineFramer::default();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match self.reader.read(&mut chunk) {
                Ok(0) => return LoopExit::PeerClosed,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return LoopExit::Read(e),
            };
            for line in framer.push(&chunk[..n]) {
                if let Some(exit) = self.handle_line(&line) {
                    return exit;
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Option<LoopExit> {
        debug!("RX: {line}");
        let event = self.codec.decode(line);
        let step = if self.shared.state.get() == ConnectionState::HandshakeSent {
            self.codec.handshake_step(self.role, &event)
        } else {
            HandshakeStep::Pending
        };

        (self.on_event)(event);

        match step {
            HandshakeStep::Pending => None,
            HandshakeStep::Granted(role) => {
                if self.shared.state.advance(ConnectionState::Authenticated) {
                    info!("Authenticated as {role}");
                }
                if let Some(tx) = self.handshake_tx.take() {
                    let _ = tx.send(Ok(role));
                }
                None
            }
            HandshakeStep::Rejected(reason) => Some(LoopExit::Rejected(reason)),
        }
    }

    fn finish(mut self, exit: LoopExit) {
        let stopping = self.shared.stop.load(Ordering::Acquire);
        let (next, error) = match exit {
            LoopExit::PeerClosed if stopping => (ConnectionState::Disconnected, None),
            LoopExit::PeerClosed => {
                info!("Connection closed by peer");
                (ConnectionState::Disconnected, Some(ConnectionError::PeerClosed))
            }
            LoopExit::Read(e) if stopping => {
                debug!("Read ended by close: {e}");
                (ConnectionState::Disconnected, None)
            }
            LoopExit::Read(e) => {
                error!("Connection read failed: {e}");
                (ConnectionState::Failed, Some(ConnectionError::io(&e)))
            }
            LoopExit::Rejected(reason) => {
                warn!("Handshake rejected: {reason}");
                (ConnectionState::Failed, Some(ConnectionError::Rejected { reason }))
            }
        };

        self.shared.state.advance(next);
        self.shared.shutdown();

        if let Some(tx) = self.handshake_tx.take() {
            let _ = tx.send(Err(error.clone().unwrap_or(ConnectionError::Closed)));
        }
        if let (Some(error), Some(on_error)) = (error, self.on_error.take()) {
            on_error(&error);
        }
        info!("Receive loop finished, connection {}", self.shared.state.get());
    }
}
