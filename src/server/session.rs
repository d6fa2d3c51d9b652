//! Per-connection session
//!
//! ```text
//! AwaitingHeader ──44 bytes──▶ NegotiatingBackend ──info sent──▶ Relaying
//!       │                            │                             │
//!       └──────── bad header ────────┴── open failed / hangup ─────┴──▶ Closed
//! ```
//!
//! A session owns its sockets and backend stream; nothing is shared with
//! other connections.

use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::control::{ControlChannel, ControlEvent};
use super::ServerOptions;
use crate::backend::{Backend, BackendStream};
use crate::constants::{BUFFER_CHUNKS, HEADER_SIZE};
use crate::error::{BackendError, NegotiationError, NetworkError, ProtocolError};
use crate::network::{self, is_timeout};
use crate::protocol::{decode_stream_header, encode_backend_info, BackendInfo, StreamDescriptor};

/// Transfer unit the server aims for when the device offers a larger one
const IDEAL_CHUNK_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHeader,
    NegotiatingBackend,
    Relaying,
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum EndReason {
    /// Client closed the data or control socket
    ClientHangup,
    /// Client sent `STOP`
    StopRequested,
    /// Server is shutting down
    ServerShutdown,
    /// Header, backend open or backend info failed
    Negotiation(NegotiationError),
    /// Unknown control command
    ProtocolViolation(ProtocolError),
    /// Backend refused data
    Backend(BackendError),
    Transport(NetworkError),
}

impl EndReason {
    /// Whether the session ended because something went wrong
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            EndReason::ClientHangup | EndReason::StopRequested | EndReason::ServerShutdown
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::ClientHangup => f.write_str("client disconnected"),
            EndReason::StopRequested => f.write_str("client requested stop"),
            EndReason::ServerShutdown => f.write_str("server shutting down"),
            EndReason::Negotiation(e) => write!(f, "negotiation failed: {}", e),
            EndReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            EndReason::Backend(e) => write!(f, "backend failed: {}", e),
            EndReason::Transport(e) => write!(f, "transport failed: {}", e),
        }
    }
}

/// What a finished session reports back to the listener
#[derive(Debug)]
pub struct SessionSummary {
    pub id: u64,
    pub peer: SocketAddr,
    pub descriptor: Option<StreamDescriptor>,
    pub identity: Option<String>,
    /// Bytes delivered to the backend
    pub bytes_relayed: u64,
    /// Last state before closing
    pub ended_in: SessionState,
    pub reason: EndReason,
}

/// One client connection
pub struct Session {
    id: u64,
    peer: SocketAddr,
    data: TcpStream,
    control: Option<ControlChannel>,
    backend: Arc<dyn Backend>,
    options: ServerOptions,
    running: Arc<AtomicBool>,
    state: SessionState,
    descriptor: Option<StreamDescriptor>,
    identity: Option<String>,
    /// Bytes delivered to the backend
    serv_ptr: u64,
}

impl Session {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        data: TcpStream,
        control: Option<TcpStream>,
        backend: Arc<dyn Backend>,
        options: ServerOptions,
        running: Arc<AtomicBool>,
    ) -> Self {
        let control = control.and_then(|socket| match ControlChannel::new(socket) {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::warn!(conn = id, "Dropping unusable control socket: {}", e);
                None
            }
        });

        Self {
            id,
            peer,
            data,
            control,
            backend,
            options,
            running,
            state: SessionState::AwaitingHeader,
            descriptor: None,
            identity: None,
            serv_ptr: 0,
        }
    }

    /// Drive the session to completion
    pub fn run(mut self) -> SessionSummary {
        let reason = self.negotiate_and_relay();
        self.close(reason)
    }

    fn negotiate_and_relay(&mut self) -> EndReason {
        let desc = match self.read_header() {
            Ok(desc) => desc,
            Err(reason) => return reason,
        };
        self.descriptor = Some(desc);

        self.enter(SessionState::NegotiatingBackend);
        let mut output = match self.backend.open(&desc) {
            Ok(output) => output,
            Err(e) => return EndReason::Negotiation(NegotiationError::BackendOpen(e.to_string())),
        };

        let reason = match self.send_backend_info(&desc, &*output) {
            Ok(chunk_size) => {
                tracing::info!(
                    conn = self.id,
                    "Negotiated {} with {} backend, chunk {} bytes",
                    desc,
                    self.backend.name(),
                    chunk_size
                );
                self.enter(SessionState::Relaying);
                self.relay(&mut *output, chunk_size)
            }
            Err(reason) => reason,
        };

        output.close();
        reason
    }

    fn enter(&mut self, next: SessionState) {
        tracing::debug!(conn = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    fn read_header(&mut self) -> Result<StreamDescriptor, EndReason> {
        let mut header = [0u8; HEADER_SIZE];
        network::read_exact_timeout(&mut self.data, &mut header, self.options.header_timeout)
            .map_err(EndReason::Transport)?;
        decode_stream_header(&header).map_err(|e| EndReason::Negotiation(e.into()))
    }

    /// Validate and send the backend info, returning the chunk size
    fn send_backend_info(
        &mut self,
        desc: &StreamDescriptor,
        output: &dyn BackendStream,
    ) -> Result<usize, EndReason> {
        let mut info = output.backend_info();
        if !info.is_usable() {
            return Err(EndReason::Negotiation(NegotiationError::InvalidBackendInfo {
                latency: info.latency,
                chunk_size: info.chunk_size,
            }));
        }
        info.chunk_size = network_chunk_size(info.chunk_size, desc.frame_size() as u32);
        network::set_receive_buffer(&self.data, receive_buffer_hint(&info));

        network::write_all_timeout(
            &mut self.data,
            &encode_backend_info(&info),
            self.options.header_timeout,
        )
        .map_err(EndReason::Transport)?;

        Ok(info.chunk_size as usize)
    }

    fn relay(&mut self, output: &mut dyn BackendStream, chunk_size: usize) -> EndReason {
        if let Err(e) = self.data.set_read_timeout(Some(self.options.poll_interval)) {
            return EndReason::Transport(NetworkError::ReceiveFailed(e.to_string()));
        }

        let mut chunk = vec![0u8; chunk_size];
        let mut filled = 0;

        loop {
            if !self.running.load(Ordering::Relaxed) {
                return EndReason::ServerShutdown;
            }

            if let Some(reason) = self.poll_control(output.latency()) {
                return reason;
            }

            match self.read_chunk(&mut chunk, &mut filled) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(NetworkError::PeerHangup) => return EndReason::ClientHangup,
                Err(e) => return EndReason::Transport(e),
            }
            filled = 0;

            let mut written = 0;
            while written < chunk.len() {
                match output.write(&chunk[written..]) {
                    Ok(0) => return EndReason::Backend(BackendError::ZeroWrite),
                    Ok(n) => written += n,
                    Err(e) => return EndReason::Backend(e),
                }
            }
            self.serv_ptr += written as u64;
        }
    }

    /// Handle pending control traffic; `Some` ends the session.
    fn poll_control(&mut self, latency: u32) -> Option<EndReason> {
        let control = self.control.as_mut()?;
        let event = control.poll(self.serv_ptr, latency);

        if let Some(identity) = control.identity() {
            if self.identity.as_deref() != Some(identity) {
                self.identity = Some(identity.to_string());
            }
        }

        match event {
            ControlEvent::Continue => None,
            ControlEvent::Closed => {
                tracing::debug!(conn = self.id, "Control channel closed by request");
                self.control = None;
                None
            }
            ControlEvent::Stop => Some(EndReason::StopRequested),
            ControlEvent::Hangup => Some(EndReason::ClientHangup),
            ControlEvent::Violation(e) => Some(EndReason::ProtocolViolation(e)),
        }
    }

    /// Read until `chunk` is full or one poll interval passes.
    ///
    /// `filled` carries partial progress across calls. Returns true once the
    /// chunk is complete.
    fn read_chunk(&mut self, chunk: &mut [u8], filled: &mut usize) -> Result<bool, NetworkError> {
        while *filled < chunk.len() {
            match self.data.read(&mut chunk[*filled..]) {
                Ok(0) => return Err(NetworkError::PeerHangup),
                Ok(n) => *filled += n,
                Err(e) if is_timeout(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(network::receive_error(e)),
            }
        }
        Ok(true)
    }

    fn close(mut self, reason: EndReason) -> SessionSummary {
        let ended_in = self.state;
        self.enter(SessionState::Closed);

        let _ = self.data.shutdown(Shutdown::Both);
        // Dropping the channel closes the control socket.
        self.control = None;

        if reason.is_error() {
            tracing::warn!(
                conn = self.id,
                peer = %self.peer,
                stage = ?ended_in,
                "Session closed: {}",
                reason
            );
        } else {
            tracing::info!(
                conn = self.id,
                peer = %self.peer,
                bytes = self.serv_ptr,
                "Session closed: {}",
                reason
            );
        }

        SessionSummary {
            id: self.id,
            peer: self.peer,
            descriptor: self.descriptor,
            identity: self.identity.take(),
            bytes_relayed: self.serv_ptr,
            ended_in,
            reason,
        }
    }
}

/// SO_RCVBUF for the data socket: the device buffer, but never less than
/// the client's own buffering so the window does not throttle the stream.
fn receive_buffer_hint(info: &BackendInfo) -> usize {
    (info.latency as usize).max(info.chunk_size as usize * BUFFER_CHUNKS)
}

/// Halve a large device chunk towards 1 KiB while it stays a whole number
/// of frame pairs.
fn network_chunk_size(chunk_size: u32, frame_size: u32) -> u32 {
    let unit = (frame_size * 2).max(1);
    let mut size = chunk_size;
    while size > IDEAL_CHUNK_SIZE && size % (unit * 2) == 0 {
        size /= 2;
    }
    size
}
