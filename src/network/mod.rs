//! TCP helpers shared by client and server
//!
//! Plain blocking `std::net` sockets with OS-level timeouts, tuned through
//! `socket2` where std has no setter.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::error::NetworkError;

const LISTEN_BACKLOG: i32 = 64;
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Resolve `host:port` and connect to the first address that answers
pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                tracing::debug!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(NetworkError::ConnectionFailed(match last_error {
        Some(e) => format!("{}:{}: {}", host, port, e),
        None => format!("{}:{}: no addresses", host, port),
    }))
}

/// Latency-oriented options for a client socket.
///
/// The kernel send buffer is sized to the client's ring so the two stages
/// hold comparable amounts of audio.
pub fn tune_client_socket(stream: &TcpStream, send_buffer: usize) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if send_buffer > 0 {
        if let Err(e) = SockRef::from(stream).set_send_buffer_size(send_buffer) {
            tracing::warn!("Failed to set SO_SNDBUF: {}", e);
        }
    }
}

/// Hint the kernel receive buffer size
pub fn set_receive_buffer(stream: &TcpStream, size: usize) {
    if let Err(e) = SockRef::from(stream).set_recv_buffer_size(size) {
        tracing::warn!("Failed to set SO_RCVBUF: {}", e);
    }
}

/// Options for a socket returned by `accept` on a non-blocking listener
pub fn tune_accepted_socket(stream: &TcpStream) -> io::Result<()> {
    // Accepted sockets may inherit O_NONBLOCK from the listener.
    stream.set_nonblocking(false)?;

    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE)) {
        tracing::warn!("Failed to enable TCP keepalive: {}", e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    Ok(())
}

/// Bind a non-blocking listener with SO_REUSEADDR
pub fn bind_listener(endpoint: &str) -> Result<TcpListener, NetworkError> {
    let addr: SocketAddr = endpoint
        .to_socket_addrs()
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", endpoint, e)))?
        .next()
        .ok_or_else(|| NetworkError::BindFailed(format!("{}: no addresses", endpoint)))?;

    let bind_err = |e: io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(socket.into())
}

/// Read exactly `buf.len()` bytes, giving up after `timeout` in total
pub fn read_exact_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), NetworkError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;

    while filled < buf.len() {
        let remaining = remaining_until(deadline)?;
        stream
            .set_read_timeout(Some(remaining))
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(NetworkError::PeerHangup),
            Ok(n) => filled += n,
            Err(e) if is_retryable(&e) => continue,
            Err(e) => return Err(receive_error(e)),
        }
    }
    Ok(())
}

/// Write all of `buf`, giving up after `timeout` in total
pub fn write_all_timeout(
    stream: &mut TcpStream,
    buf: &[u8],
    timeout: Duration,
) -> Result<(), NetworkError> {
    let deadline = Instant::now() + timeout;
    let mut sent = 0;

    while sent < buf.len() {
        let remaining = remaining_until(deadline)?;
        stream
            .set_write_timeout(Some(remaining))
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        match stream.write(&buf[sent..]) {
            Ok(0) => return Err(NetworkError::PeerHangup),
            Ok(n) => sent += n,
            Err(e) if is_retryable(&e) => continue,
            Err(e) => return Err(send_error(e)),
        }
    }
    Ok(())
}

/// Whether two peers share an IP address.
///
/// Compares presentation strings only; ports are ignored.
pub fn same_peer(data: &SocketAddr, control: &SocketAddr) -> bool {
    data.ip().to_string() == control.ip().to_string()
}

/// Timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn is_retryable(e: &io::Error) -> bool {
    is_timeout(e) || e.kind() == io::ErrorKind::Interrupted
}

/// Errors that mean the other side went away
pub fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

pub fn receive_error(e: io::Error) -> NetworkError {
    if is_hangup(&e) {
        NetworkError::PeerHangup
    } else {
        NetworkError::ReceiveFailed(e.to_string())
    }
}

pub fn send_error(e: io::Error) -> NetworkError {
    if is_hangup(&e) {
        NetworkError::PeerHangup
    } else {
        NetworkError::SendFailed(e.to_string())
    }
}

fn remaining_until(deadline: Instant) -> Result<Duration, NetworkError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        Err(NetworkError::Timeout)
    } else {
        Ok(remaining)
    }
}
