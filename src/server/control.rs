//! Server end of the control channel
//!
//! Polled once per relay iteration. Everything currently readable is
//! consumed and answered; the call never waits for more input.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::ProtocolError;
use crate::network::{self, is_timeout};
use crate::protocol::{ControlDecoder, ControlMessage};

const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one poll
#[derive(Debug, PartialEq, Eq)]
pub enum ControlEvent {
    /// Nothing that affects the session
    Continue,
    /// Control channel retired; audio continues without it
    Closed,
    /// Client asked to end the session
    Stop,
    /// Control socket hung up
    Hangup,
    /// Unrecoverable protocol error
    Violation(ProtocolError),
}

pub struct ControlChannel {
    socket: TcpStream,
    decoder: ControlDecoder,
    identity: Option<String>,
}

impl ControlChannel {
    pub fn new(socket: TcpStream) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            decoder: ControlDecoder::new(),
            identity: None,
        })
    }

    /// Name the client gave itself, if any
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Read and handle all pending frames.
    ///
    /// `serv_ptr` is the number of bytes delivered to the backend so far and
    /// `latency` the backend's current queue depth; position replies report
    /// the difference.
    pub fn poll(&mut self, serv_ptr: u64, latency: u32) -> ControlEvent {
        let hangup = self.fill();

        while let Some(frame) = self.decoder.next_frame() {
            let message = match frame {
                Ok(message) => message,
                Err(e) if e.is_fatal() => return ControlEvent::Violation(e),
                Err(e) => {
                    tracing::debug!("Skipping control frame: {}", e);
                    continue;
                }
            };

            tracing::debug!("Control: {}", message);

            match message {
                ControlMessage::Null => {}
                ControlMessage::Stop => return ControlEvent::Stop,
                ControlMessage::Info {
                    client_ptr,
                    serv_ptr: None,
                } => {
                    let played = serv_ptr.saturating_sub(latency as u64);
                    if let Err(e) = self.send(&ControlMessage::info_reply(client_ptr, played)) {
                        tracing::warn!("Failed to answer INFO: {}", e);
                        return ControlEvent::Hangup;
                    }
                }
                ControlMessage::Info { .. } => {
                    tracing::debug!("Ignoring position reply sent by client");
                }
                ControlMessage::Identity(name) => {
                    tracing::info!("Client identifies as {:?}", name);
                    self.identity = Some(name);
                }
                ControlMessage::CloseCtl => {
                    let _ = self.send(&ControlMessage::CloseCtlAck);
                    self.close();
                    return ControlEvent::Closed;
                }
                ControlMessage::CloseCtlAck => {
                    self.close();
                    return ControlEvent::Closed;
                }
            }
        }

        if hangup {
            ControlEvent::Hangup
        } else {
            ControlEvent::Continue
        }
    }

    /// Pull everything readable into the decoder. Returns true on EOF or a
    /// socket error.
    fn fill(&mut self) -> bool {
        let mut buf = [0u8; 512];
        loop {
            match self.socket.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if is_timeout(&e) => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("Control socket error: {}", e);
                    return true;
                }
            }
        }
    }

    fn send(&mut self, message: &ControlMessage) -> Result<(), crate::error::NetworkError> {
        self.socket
            .set_nonblocking(false)
            .map_err(network::send_error)?;
        let result = network::write_all_timeout(&mut self.socket, &message.encode(), REPLY_TIMEOUT);
        self.socket
            .set_nonblocking(true)
            .map_err(network::send_error)?;
        result
    }

    fn close(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}
