//! Server-side WebSocket connection: lifecycle, read loop and send path.
//!
//! ## Architecture
//!
//! ```text
//! WebSocket::new / from_upgrade / from_upgraded
//!   |
//!   +-- complete_handshake(path)     (raw-stream entry only)
//!   |
//!   +-- start_reading(on_message, on_close)
//!         |
//!         +-- spawn "ws-read" thread
//!               |
//!               +-- read frame headers, dispatch:
//!               |     Text/Binary/Continuation -> Reassembler -> on_message
//!               |     Ping  -> Pong (same payload)
//!               |     Pong  -> ignored
//!               |     Close -> echo Normal, stop
//!               |
//!               +-- teardown (exactly once):
//!                     best-effort close frame -> on_close -> shutdown
//! ```
//!
//! The transport is cloned into three handles. The read thread owns one;
//! every outgoing frame goes through the other under `writer`'s mutex, so
//! frames from application threads and the read thread never interleave;
//! the third is used for shutdown and timeouts without taking any lock.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::close::{CloseCode, CloseFrame};
use crate::config::WsConfig;
use crate::error::{HandshakeError, LifecycleError, WsError, WsResult};
use crate::fragment::Reassembler;
use crate::frame::{self, FrameHeader, Opcode};
use crate::handshake::{self, UpgradeRequest};
use crate::message::Message;
use crate::socket::{cap_write_timeout, Socket};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed; the read loop has not started.
    Handshaking,
    /// The read loop is running.
    Open,
    /// Teardown has begun; no new read loop may start.
    Closing,
    /// Teardown finished and the transport was shut down.
    Closed,
}

/// A server-side WebSocket connection.
///
/// Cloning is cheap and every clone drives the same connection, so a clone
/// can be moved into the message callback to reply from the read thread.
pub struct WebSocket<S: Socket = TcpStream> {
    shared: Arc<Shared<S>>,
}

impl<S: Socket> Clone for WebSocket<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Socket> fmt::Debug for WebSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Shared<S> {
    id: u64,
    config: WsConfig,
    writer: Mutex<Writer<S>>,
    /// Read half, until the read loop takes it.
    reader: Mutex<Option<S>>,
    /// Shutdown and timeout handle; never locked.
    control: S,
    lifecycle: Mutex<Lifecycle>,
    cancelled: AtomicBool,
}

struct Writer<S> {
    stream: S,
    /// Set once the `101` is on the wire; no frame goes out before that.
    upgraded: bool,
    close_sent: bool,
}

struct Lifecycle {
    state: ConnectionState,
    handshake_attempted: bool,
    handshake_performed: bool,
    reading: bool,
    /// Close frame asked for by `close_with` while the loop was running.
    requested_close: Option<CloseFrame>,
}

/// Why the read loop stopped.
enum Exit {
    PeerClosed(CloseFrame),
    Cancelled,
    Failed(WsError),
}

impl<S: Socket> WebSocket<S> {
    /// Wrap a connection whose handshake has not been performed yet.
    ///
    /// Use [`complete_handshake`](Self::complete_handshake) next.
    pub fn new(stream: S) -> io::Result<Self> {
        Self::with_config(stream, WsConfig::default())
    }

    pub fn with_config(stream: S, config: WsConfig) -> io::Result<Self> {
        Self::build(stream, config, false)
    }

    /// Wrap a connection that an outer HTTP layer already upgraded.
    pub fn from_upgraded(stream: S, config: WsConfig) -> io::Result<Self> {
        Self::build(stream, config, true)
    }

    /// Complete the handshake for a request an HTTP layer already parsed and
    /// wrap the connection.
    ///
    /// On failure the stream is dropped after any `400` response was flushed.
    /// Callers that want to keep the transport should use
    /// [`handshake::accept_upgrade`] and [`from_upgraded`](Self::from_upgraded).
    pub fn from_upgrade(
        mut stream: S,
        request: &UpgradeRequest,
        config: WsConfig,
    ) -> Result<Self, HandshakeError> {
        handshake::accept_upgrade(&mut stream, request)?;
        Ok(Self::build(stream, config, true)?)
    }

    fn build(stream: S, config: WsConfig, handshake_performed: bool) -> io::Result<Self> {
        if let Err(e) = stream.set_nodelay(config.nodelay) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        trace!(conn = id, handshake_performed, "WebSocket created");

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                writer: Mutex::new(Writer {
                    stream,
                    upgraded: handshake_performed,
                    close_sent: false,
                }),
                reader: Mutex::new(Some(reader)),
                control,
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Handshaking,
                    handshake_attempted: handshake_performed,
                    handshake_performed,
                    reading: false,
                    requested_close: None,
                }),
                cancelled: AtomicBool::new(false),
            }),
        })
    }

    /// Read the upgrade request off the raw stream and answer it.
    ///
    /// The request path must equal `expected_path`. One attempt is allowed
    /// per connection; later calls fail with
    /// [`HandshakeError::AlreadyPerformed`], and after a failed attempt the
    /// connection never starts reading.
    ///
    /// No lock is held while waiting for the request, so
    /// [`close`](Self::close) from another thread ends the wait.
    pub fn complete_handshake(&self, expected_path: &str) -> Result<UpgradeRequest, HandshakeError> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.handshake_attempted {
                return Err(HandshakeError::AlreadyPerformed);
            }
            if lifecycle.state != ConnectionState::Handshaking {
                return Err(closed_during_handshake());
            }
            lifecycle.handshake_attempted = true;
        }

        let mut stream = self
            .shared
            .reader
            .lock()
            .take()
            .ok_or_else(closed_during_handshake)?;
        let read = handshake::read_upgrade_request(&mut stream, expected_path);
        *self.shared.reader.lock() = Some(stream);
        let (request, key) = read?;

        {
            let mut writer = self.shared.writer.lock();
            if self.shared.is_cancelled() {
                return Err(closed_during_handshake());
            }
            handshake::respond(&mut writer.stream, &request, &key)?;
            writer.upgraded = true;
        }
        self.shared.lifecycle.lock().handshake_performed = true;
        debug!(conn = self.shared.id, path = %request.path, "WebSocket handshake complete");
        Ok(request)
    }

    /// Start the background read loop.
    ///
    /// `on_message` receives each complete message in order, on the read
    /// thread. `on_close` runs exactly once, after the loop ends for any
    /// reason, with the close frame that describes why.
    pub fn start_reading<F, G>(&self, on_message: F, on_close: G) -> Result<(), LifecycleError>
    where
        F: FnMut(Message) + Send + 'static,
        G: FnOnce(CloseFrame) + Send + 'static,
    {
        let mut lifecycle = self.shared.lifecycle.lock();
        match lifecycle.state {
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(LifecycleError::Closing)
            }
            ConnectionState::Open => return Err(LifecycleError::AlreadyStarted),
            ConnectionState::Handshaking => {}
        }
        if !lifecycle.handshake_performed {
            return Err(LifecycleError::HandshakeNotPerformed);
        }
        let reader = self
            .shared
            .reader
            .lock()
            .take()
            .ok_or(LifecycleError::AlreadyStarted)?;

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(self.shared.config.read_thread_name.clone())
            .spawn(move || {
                let mut on_message = on_message;
                let exit = shared.read_loop(reader, &mut on_message);
                shared.finish(exit, on_close);
            })?;

        lifecycle.state = ConnectionState::Open;
        lifecycle.reading = true;
        debug!(conn = self.shared.id, "WebSocket read loop started");
        Ok(())
    }

    pub fn send_text(&self, text: &str) -> WsResult<()> {
        self.shared.send_frame(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&self, data: &[u8]) -> WsResult<()> {
        self.shared.send_frame(Opcode::Binary, data)
    }

    pub fn send_ping(&self, payload: &[u8]) -> WsResult<()> {
        if payload.len() as u64 > frame::MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol(format!(
                "ping payload of {} bytes exceeds 125",
                payload.len()
            )));
        }
        self.shared.send_frame(Opcode::Ping, payload)
    }

    /// Send a close frame without tearing the connection down.
    ///
    /// Only the first close frame is written; later calls and the
    /// non-sendable codes are no-ops. Returns whether a frame was written.
    pub fn send_close(&self, code: CloseCode, message: Option<&str>) -> WsResult<bool> {
        let close = CloseFrame::with_message(code, message.unwrap_or_default());
        self.shared.send_close_frame(&close)
    }

    /// Close with [`CloseCode::Normal`].
    pub fn close(&self) {
        self.close_with(CloseCode::Normal, "");
    }

    /// Begin closing the connection. Idempotent.
    ///
    /// With the read loop running, the loop is interrupted and its teardown
    /// sends this close frame and runs `on_close`. Otherwise the transport is
    /// shut down right here, after a best-effort close frame if the upgrade
    /// completed. A handshake still waiting for its request fails.
    pub fn close_with(&self, code: CloseCode, message: &str) {
        let close = CloseFrame::with_message(code, message);
        let mut lifecycle = self.shared.lifecycle.lock();
        if matches!(
            lifecycle.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        lifecycle.state = ConnectionState::Closing;
        self.shared.cancelled.store(true, Ordering::SeqCst);
        debug!(conn = self.shared.id, code = %code, "closing WebSocket");

        if lifecycle.reading {
            lifecycle.requested_close = Some(close);
            drop(lifecycle);
            // Wakes a read blocked in the loop; it observes `cancelled` next.
            if let Err(e) = self.shared.control.shutdown(Shutdown::Read) {
                trace!(conn = self.shared.id, error = %e, "read shutdown failed");
            }
        } else {
            let upgraded = lifecycle.handshake_performed;
            drop(lifecycle);
            if upgraded {
                self.shared.send_teardown_close(&close);
            }
            self.shared.release();
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().state
    }

    /// Whether a close frame has gone out on this connection.
    pub fn is_close_sent(&self) -> bool {
        self.shared.writer.lock().close_sent
    }

    pub fn config(&self) -> &WsConfig {
        &self.shared.config
    }
}

impl<S: Socket> Shared<S> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Write one frame under the send lock.
    ///
    /// Nothing goes out before the upgrade. Data frames are refused once the
    /// close frame went out; Ping and Pong still pass.
    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> WsResult<()> {
        let mut writer = self.writer.lock();
        if !writer.upgraded {
            return Err(WsError::NotUpgraded);
        }
        if writer.close_sent && !opcode.is_control() {
            return Err(WsError::ConnectionClosed);
        }
        frame::write_frame(&mut writer.stream, opcode, payload)
    }

    fn send_close_frame(&self, close: &CloseFrame) -> WsResult<bool> {
        if !close.code.is_sendable() {
            return Ok(false);
        }
        let Some(payload) = close.encode() else {
            return Ok(false);
        };
        let mut writer = self.writer.lock();
        if !writer.upgraded || writer.close_sent {
            return Ok(false);
        }
        frame::write_frame(&mut writer.stream, Opcode::Close, &payload)?;
        writer.close_sent = true;
        trace!(conn = self.id, code = %close.code, "close frame sent");
        Ok(true)
    }

    fn read_loop<F: FnMut(Message)>(&self, mut reader: S, on_message: &mut F) -> Exit {
        let mut fragments = Reassembler::new(self.config.max_message_size);
        loop {
            if self.is_cancelled() {
                return Exit::Cancelled;
            }
            match self.read_one(&mut reader, &mut fragments, on_message) {
                Ok(Some(close)) => return Exit::PeerClosed(close),
                Ok(None) => {}
                Err(_) if self.is_cancelled() => return Exit::Cancelled,
                Err(e) => return Exit::Failed(e),
            }
        }
    }

    /// Read and handle one frame. Returns the peer's close frame, if that is
    /// what arrived.
    fn read_one<F: FnMut(Message)>(
        &self,
        reader: &mut S,
        fragments: &mut Reassembler,
        on_message: &mut F,
    ) -> WsResult<Option<CloseFrame>> {
        let header = frame::read_header(reader)?;
        match header.opcode {
            Opcode::Close => {
                let payload = frame::read_payload(reader, &header)?;
                let close = CloseFrame::parse(&payload);
                debug!(conn = self.id, code = %close.code, reason = %close.message, "peer closed WebSocket");
                if let Err(e) = self.send_close_frame(&CloseFrame::new(CloseCode::Normal)) {
                    debug!(conn = self.id, error = %e, "could not echo close frame");
                }
                Ok(Some(close))
            }
            Opcode::Ping => {
                let payload = frame::read_payload(reader, &header)?;
                self.send_frame(Opcode::Pong, &payload)?;
                Ok(None)
            }
            Opcode::Pong => {
                frame::read_payload(reader, &header)?;
                trace!(conn = self.id, "pong received");
                Ok(None)
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                self.read_data(reader, &header, fragments, on_message)?;
                Ok(None)
            }
        }
    }

    fn read_data<F: FnMut(Message)>(
        &self,
        reader: &mut S,
        header: &FrameHeader,
        fragments: &mut Reassembler,
        on_message: &mut F,
    ) -> WsResult<()> {
        fragments.begin_frame(header)?;
        let payload = frame::read_payload(reader, header)?;
        if let Some(message) = fragments.push(payload, header.fin)? {
            trace!(conn = self.id, opcode = %message.opcode(), len = message.len(), "message received");
            self.deliver(on_message, message);
        }
        Ok(())
    }

    fn deliver<F: FnMut(Message)>(&self, on_message: &mut F, message: Message) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| on_message(message)));
        if let Err(payload) = result {
            if self.is_cancelled() {
                debug!(conn = self.id, "message callback ended by close");
            } else {
                error!(conn = self.id, panic = panic_message(&*payload), "WebSocket message callback panicked");
            }
        }
    }

    /// Teardown after the read loop ends. Runs once per connection.
    fn finish<G: FnOnce(CloseFrame)>(&self, exit: Exit, on_close: G) {
        let requested = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ConnectionState::Closing;
            lifecycle.requested_close.take()
        };

        let close = match exit {
            Exit::PeerClosed(close) => close,
            Exit::Cancelled => {
                let close = requested.unwrap_or_else(|| CloseFrame::new(CloseCode::Normal));
                self.send_teardown_close(&close);
                close
            }
            Exit::Failed(e) => {
                let close = self.close_for_error(&e);
                self.send_teardown_close(&close);
                close
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| on_close(close)));
        if let Err(payload) = result {
            error!(conn = self.id, panic = panic_message(&*payload), "WebSocket close callback panicked");
        }

        self.release();
    }

    fn close_for_error(&self, e: &WsError) -> CloseFrame {
        let code = e.close_code();
        match code {
            CloseCode::ConnectionLost => {
                debug!(conn = self.id, error = %e, "WebSocket peer disconnected");
                CloseFrame::new(code)
            }
            CloseCode::InternalError => {
                warn!(conn = self.id, error = %e, "WebSocket read loop failed");
                CloseFrame::new(code)
            }
            _ => {
                debug!(conn = self.id, error = %e, "closing WebSocket after protocol violation");
                CloseFrame::with_message(code, e.to_string())
            }
        }
    }

    /// Best-effort close frame with a bounded write timeout. The previous
    /// timeout is restored afterwards.
    fn send_teardown_close(&self, close: &CloseFrame) {
        let previous = match cap_write_timeout(&self.control, self.config.close_send_timeout) {
            Ok(previous) => Some(previous),
            Err(e) => {
                trace!(conn = self.id, error = %e, "could not cap write timeout");
                None
            }
        };
        if let Err(e) = self.send_close_frame(close) {
            debug!(conn = self.id, error = %e, "close frame not delivered");
        }
        if let Some(previous) = previous {
            if let Err(e) = self.control.set_write_timeout(previous) {
                trace!(conn = self.id, error = %e, "could not restore write timeout");
            }
        }
    }

    fn release(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            trace!(conn = self.id, error = %e, "transport shutdown failed");
        }
        self.lifecycle.lock().state = ConnectionState::Closed;
        debug!(conn = self.id, "WebSocket closed");
    }
}

fn closed_during_handshake() -> HandshakeError {
    HandshakeError::Io(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "WebSocket closed during handshake",
    ))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
