//! Accepting connection pairs
//!
//! A client opens its data socket, then its control socket. The listener is
//! non-blocking so the accept loop can notice shutdown; after each data
//! connection it waits a short grace period for the matching control
//! connection.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::NetworkError;
use crate::network::{self, is_timeout};

const GRACE_POLL: Duration = Duration::from_millis(5);

/// Data socket plus optional control socket from the same client
pub struct Connection {
    pub peer: SocketAddr,
    pub data: TcpStream,
    pub control: Option<TcpStream>,
}

pub struct Listener {
    inner: TcpListener,
    control_grace: Duration,
}

impl Listener {
    pub fn bind(endpoint: &str, control_grace: Duration) -> Result<Self, NetworkError> {
        Ok(Self {
            inner: network::bind_listener(endpoint)?,
            control_grace,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept the next client if one is waiting.
    ///
    /// `Ok(None)` means nothing is pending. A control connection from a
    /// different address than the data connection drops both.
    pub fn poll_accept(&self) -> Result<Option<Connection>, NetworkError> {
        let (data, peer) = match self.inner.accept() {
            Ok(pair) => pair,
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(NetworkError::ConnectionFailed(e.to_string())),
        };
        network::tune_accepted_socket(&data).map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        tracing::debug!(peer = %peer, "Data connection accepted");

        let control = match self.accept_control()? {
            Some((control, control_peer)) => {
                if !network::same_peer(&peer, &control_peer) {
                    return Err(NetworkError::ControlPeerMismatch {
                        data: peer.ip().to_string(),
                        control: control_peer.ip().to_string(),
                    });
                }
                network::tune_accepted_socket(&control)
                    .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
                Some(control)
            }
            None => {
                tracing::debug!(peer = %peer, "No control connection, continuing without it");
                None
            }
        };

        Ok(Some(Connection { peer, data, control }))
    }

    fn accept_control(&self) -> Result<Option<(TcpStream, SocketAddr)>, NetworkError> {
        let deadline = Instant::now() + self.control_grace;
        loop {
            match self.inner.accept() {
                Ok(pair) => return Ok(Some(pair)),
                Err(e) if is_timeout(&e) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(GRACE_POLL);
                }
                Err(e) => return Err(NetworkError::ConnectionFailed(e.to_string())),
            }
        }
    }
}
