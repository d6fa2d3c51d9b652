//! Shared fixtures for the end-to-end tests

#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use rsound::backend::{Backend, BackendStream};
use rsound::client::{RsdStream, StreamParams};
use rsound::config::ServerConfig;
use rsound::error::BackendError;
use rsound::protocol::{
    decode_backend_info, encode_stream_header, BackendInfo, SampleFormat, StreamDescriptor,
};
use rsound::server::{Server, ServerHandle};

/// What a [`MockBackend`] saw
#[derive(Debug, Default)]
pub struct Recorded {
    pub opened: Vec<StreamDescriptor>,
    pub writes: Vec<Vec<u8>>,
    pub closes: usize,
    /// `Backend::shutdown` calls
    pub shutdowns: usize,
}

impl Recorded {
    pub fn bytes_written(&self) -> usize {
        self.writes.iter().map(Vec::len).sum()
    }
}

struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

/// Backend that records everything it is given.
pub struct MockBackend {
    info: BackendInfo,
    latency: u32,
    /// 1-based index of the write that fails
    fail_on_write: Option<usize>,
    recorded: Arc<Mutex<Recorded>>,
    gate: Arc<Gate>,
}

impl MockBackend {
    pub fn new(info: BackendInfo) -> Self {
        Self {
            info,
            latency: 0,
            fail_on_write: None,
            recorded: Arc::new(Mutex::new(Recorded::default())),
            gate: Arc::new(Gate {
                open: Mutex::new(true),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn with_latency(mut self, latency: u32) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_on(mut self, write: usize) -> Self {
        self.fail_on_write = Some(write);
        self
    }

    /// Writes block until [`release`](Self::release) is called
    pub fn stalled(self) -> Self {
        *self.gate.open.lock() = false;
        self
    }

    pub fn release(&self) {
        *self.gate.open.lock() = true;
        self.gate.cond.notify_all();
    }

    pub fn recorded(&self) -> Arc<Mutex<Recorded>> {
        self.recorded.clone()
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn shutdown(&self) {
        self.recorded.lock().shutdowns += 1;
    }

    fn open(&self, desc: &StreamDescriptor) -> Result<Box<dyn BackendStream>, BackendError> {
        self.recorded.lock().opened.push(*desc);
        Ok(Box::new(MockStream {
            info: self.info,
            latency: self.latency,
            fail_on_write: self.fail_on_write,
            recorded: self.recorded.clone(),
            gate: self.gate.clone(),
            writes: 0,
        }))
    }
}

struct MockStream {
    info: BackendInfo,
    latency: u32,
    fail_on_write: Option<usize>,
    recorded: Arc<Mutex<Recorded>>,
    gate: Arc<Gate>,
    writes: usize,
}

impl BackendStream for MockStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, BackendError> {
        {
            let mut open = self.gate.open.lock();
            while !*open {
                self.gate.cond.wait(&mut open);
            }
        }

        self.writes += 1;
        if self.fail_on_write == Some(self.writes) {
            return Err(BackendError::Write("device unplugged".to_string()));
        }
        self.recorded.lock().writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn backend_info(&self) -> BackendInfo {
        self.info
    }

    fn latency(&self) -> u32 {
        self.latency
    }

    fn close(&mut self) {
        self.recorded.lock().closes += 1;
    }
}

pub fn test_server_config() -> ServerConfig {
    ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        control_grace_ms: 200,
        poll_interval_ms: 10,
        header_timeout_ms: 2000,
        ..Default::default()
    }
}

pub fn start_server(backend: Arc<dyn Backend>) -> ServerHandle {
    start_server_with(&test_server_config(), backend)
}

pub fn start_server_with(config: &ServerConfig, backend: Arc<dyn Backend>) -> ServerHandle {
    Server::bind(config, backend)
        .expect("bind test server")
        .spawn()
        .expect("spawn test server")
}

pub fn cd_quality() -> StreamDescriptor {
    StreamDescriptor::new(2, 44100, SampleFormat::S16Le)
}

pub fn client_params(addr: SocketAddr) -> StreamParams {
    StreamParams {
        host: addr.ip().to_string(),
        port: addr.port(),
        channels: 2,
        rate: 44100,
        format: SampleFormat::S16Le,
        ..Default::default()
    }
}

pub fn client(addr: SocketAddr) -> RsdStream {
    RsdStream::with_params(client_params(addr))
}

/// Deterministic test signal
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Hand-driven client: data and control sockets plus a completed handshake
pub struct RawClient {
    pub data: TcpStream,
    pub control: TcpStream,
    pub info: BackendInfo,
}

impl RawClient {
    pub fn connect(addr: SocketAddr, desc: &StreamDescriptor) -> Self {
        let mut data = TcpStream::connect(addr).unwrap();
        let control = TcpStream::connect(addr).unwrap();
        data.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        control.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        std::io::Write::write_all(&mut data, &encode_stream_header(desc)).unwrap();
        let mut reply = [0u8; 8];
        data.read_exact(&mut reply).unwrap();

        Self {
            data,
            control,
            info: decode_backend_info(&reply),
        }
    }
}

/// True once `socket` reports end of stream or a reset
pub fn is_closed_by_peer(socket: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match socket.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) => {
                return !matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                )
            }
        }
    }
}
