//! The client stream handle

use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::state::Shared;
use super::worker::{self, send_frame};
use super::StreamParams;
use crate::audio::RingBuffer;
use crate::config::ClientConfig;
use crate::constants::{BUFFER_CHUNKS, HANDSHAKE_TIMEOUT, MAX_CHUNK_SIZE, MAX_IDENTITY_LEN};
use crate::error::{NegotiationError, Result, StreamError};
use crate::network;
use crate::protocol::{
    decode_backend_info, encode_stream_header, BackendInfo, ControlMessage, SampleFormat,
    StreamDescriptor,
};

/// How long `stop()` waits to deliver the STOP frame
const STOP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Sockets and thread of a started stream
struct Session {
    data: TcpStream,
    worker: JoinHandle<()>,
}

/// Audio stream to an `rsd` server.
///
/// Configuration setters take `&mut self`; everything that runs while the
/// stream is live takes `&self`, so the handle can be shared through an
/// `Arc` and stopped from any thread.
pub struct RsdStream {
    params: StreamParams,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl RsdStream {
    /// New unconnected stream using the default endpoint, or `RSD_SERVER` /
    /// `RSD_PORT` when set.
    pub fn new() -> Self {
        let mut config = ClientConfig::default();
        config.apply_env();
        Self::with_config(&config)
    }

    /// New unconnected stream taking defaults from `config` as is
    pub fn with_config(config: &ClientConfig) -> Self {
        Self::with_params(StreamParams::from_config(config))
    }

    pub fn with_params(params: StreamParams) -> Self {
        Self {
            params,
            shared: Arc::new(Shared::new()),
            session: Mutex::new(None),
        }
    }

    /// Open a stream in one call.
    ///
    /// `None` for host or port keeps the default endpoint.
    pub fn simple_start(
        host: Option<&str>,
        port: Option<u16>,
        identity: Option<&str>,
        rate: u32,
        channels: u16,
        format: SampleFormat,
    ) -> Result<Self> {
        let mut stream = Self::new();
        if let Some(host) = host {
            stream.set_host(host);
        }
        if let Some(port) = port {
            stream.set_port(port);
        }
        if let Some(identity) = identity {
            stream.set_identity(identity);
        }
        stream.set_rate(rate);
        stream.set_channels(channels);
        stream.set_format(format);
        stream.start()?;
        Ok(stream)
    }

    /// Replace all settings at once. Takes effect on the next `start()`.
    pub fn configure(&mut self, params: StreamParams) {
        self.params = params;
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn set_host(&mut self, host: &str) {
        self.params.host = host.to_string();
    }

    pub fn set_port(&mut self, port: u16) {
        self.params.port = port;
    }

    pub fn set_channels(&mut self, channels: u16) {
        self.params.channels = channels;
    }

    pub fn set_rate(&mut self, rate: u32) {
        self.params.rate = rate;
    }

    pub fn set_format(&mut self, format: SampleFormat) {
        self.params.format = format;
    }

    pub fn set_buffer_size(&mut self, bytes: usize) {
        self.params.buffer_size = bytes;
    }

    pub fn set_max_latency_ms(&mut self, ms: u32) {
        self.params.max_latency_ms = ms;
    }

    /// Name reported to the server, truncated to a sane length
    pub fn set_identity(&mut self, identity: &str) {
        let mut end = identity.len().min(MAX_IDENTITY_LEN);
        while !identity.is_char_boundary(end) {
            end -= 1;
        }
        self.params.identity = Some(identity[..end].to_string());
    }

    /// Connect, negotiate and start the transmit thread.
    ///
    /// Calling it on a started stream is a no-op. On failure nothing is left
    /// behind and the call can simply be retried.
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            if self.shared.state.lock().active {
                return Ok(());
            }
            // The connection died since the last write; clear it out first.
            if let Some(stale) = session.take() {
                let generation = self.shared.state.lock().generation;
                self.teardown(stale, generation);
            }
        }

        let desc = self.params.descriptor()?;
        let (data, control, info) = self.handshake(&desc)?;

        let chunk_size = info.chunk_size.min(MAX_CHUNK_SIZE) as usize;
        let capacity = self.params.buffer_size.max(BUFFER_CHUNKS * chunk_size);
        network::tune_client_socket(&data, capacity);

        let worker_socket = data.try_clone()?;

        let generation = {
            let mut state = self.shared.state.lock();
            state.reset();
            if state.buffer.capacity() != capacity {
                state.buffer = RingBuffer::new(capacity);
            }
            state.chunk_size = chunk_size;
            state.backend = info;
            state.byte_rate = desc.byte_rate();
            state.active = true;
            state.ready = true;
            state.generation += 1;
            *self.shared.control.lock() = control;
            state.generation
        };

        let handle = match worker::spawn(self.shared.clone(), worker_socket, generation) {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.state.lock().reset();
                self.shared.control.lock().take();
                let _ = data.shutdown(Shutdown::Both);
                return Err(StreamError::ThreadSpawn(e.to_string()).into());
            }
        };

        tracing::info!(
            "Streaming {} to {}:{} (chunk {} bytes, buffer {} bytes, backend latency {} bytes)",
            desc,
            self.params.host,
            self.params.port,
            chunk_size,
            capacity,
            info.latency
        );

        *session = Some(Session { data, worker: handle });
        Ok(())
    }

    /// Open both sockets, send the header and read the backend info
    fn handshake(
        &self,
        desc: &StreamDescriptor,
    ) -> Result<(TcpStream, Option<TcpStream>, BackendInfo)> {
        let host = &self.params.host;
        let port = self.params.port;

        let mut data = network::connect(host, port, HANDSHAKE_TIMEOUT)?;
        let mut control = network::connect(host, port, HANDSHAKE_TIMEOUT)?;
        network::tune_client_socket(&control, 0);

        network::write_all_timeout(&mut data, &encode_stream_header(desc), HANDSHAKE_TIMEOUT)?;

        let mut reply = [0u8; crate::constants::BACKEND_INFO_SIZE];
        network::read_exact_timeout(&mut data, &mut reply, HANDSHAKE_TIMEOUT)?;
        let info = decode_backend_info(&reply);
        if info.chunk_size == 0 {
            return Err(NegotiationError::InvalidBackendInfo {
                latency: info.latency,
                chunk_size: info.chunk_size,
            }
            .into());
        }

        if let Some(identity) = &self.params.identity {
            let frame = ControlMessage::Identity(identity.clone()).encode();
            if let Err(e) = network::write_all_timeout(&mut control, &frame, HANDSHAKE_TIMEOUT) {
                tracing::warn!("Failed to send identity: {}", e);
            }
        }

        control.set_nonblocking(true)?;
        Ok((data, Some(control), info))
    }

    /// Queue `bytes` for transmission, blocking until all of it fits.
    ///
    /// Returns `bytes.len()` on success. If the connection drops while
    /// waiting, the stream is stopped and an error is returned.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut state = self.shared.state.lock();
        if !state.ready {
            drop(state);
            let reason = if self.session.lock().is_some() {
                StreamError::Disconnected
            } else {
                StreamError::NotReady
            };
            return Err(self.fail_write(reason));
        }

        // Leave room for a chunk so the transmit thread can always progress.
        let piece_size = state.buffer.capacity() - state.chunk_size;

        for piece in bytes.chunks(piece_size.max(1)) {
            loop {
                if !state.active {
                    drop(state);
                    return Err(self.fail_write(StreamError::Disconnected));
                }
                if state.buffer.free() >= piece.len() {
                    state.buffer.push(piece);
                    break;
                }
                self.shared.cond.wait(&mut state);
            }
            self.shared.cond.notify_all();
        }

        Ok(bytes.len())
    }

    fn fail_write(&self, reason: StreamError) -> crate::Error {
        self.stop();
        reason.into()
    }

    /// End the stream.
    ///
    /// Safe to call repeatedly and from any thread; a `write` blocked in
    /// another thread returns an error.
    pub fn stop(&self) {
        let (session, generation) = {
            let mut session = self.session.lock();
            let mut state = self.shared.state.lock();
            state.active = false;
            (session.take(), state.generation)
        };
        self.shared.cond.notify_all();

        if let Some(session) = session {
            self.teardown(session, generation);
            tracing::info!("Stream stopped");
        }

        {
            // A concurrent start may already own the shared state.
            let mut state = self.shared.state.lock();
            if state.generation == generation {
                state.reset();
                self.shared.control.lock().take();
            }
        }
        self.shared.cond.notify_all();
    }

    fn teardown(&self, session: Session, generation: u64) {
        let control = {
            let state = self.shared.state.lock();
            if state.generation == generation {
                self.shared.control.lock().take()
            } else {
                None
            }
        };
        if let Some(mut control) = control {
            let frame = ControlMessage::Stop.encode();
            let _ = control.set_nonblocking(false);
            if let Err(e) = network::write_all_timeout(&mut control, &frame, STOP_SEND_TIMEOUT) {
                tracing::debug!("Could not send STOP: {}", e);
            }
            let _ = control.shutdown(Shutdown::Both);
        }

        // Unblocks a send stuck on a stalled server.
        let _ = session.data.shutdown(Shutdown::Both);
        if session.worker.join().is_err() {
            tracing::error!("Transmit thread panicked");
        }
    }

    /// `enable = true` stops the stream, `false` starts it again
    pub fn pause(&self, enable: bool) -> Result<()> {
        if enable {
            self.stop();
            Ok(())
        } else {
            self.start()
        }
    }

    /// Ask to retire the control channel while audio keeps flowing
    pub fn close_control(&self) {
        let active = {
            let mut state = self.shared.state.lock();
            state.close_control = true;
            state.active
        };
        if active {
            self.shared.cond.notify_all();
            return;
        }

        if let Some(mut control) = self.shared.control.lock().take() {
            let _ = send_frame(&mut control, &ControlMessage::CloseCtl);
        }
    }

    /// Bytes waiting in the local buffer
    pub fn pointer(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Bytes `write` can take without blocking
    pub fn available_space(&self) -> usize {
        self.shared.state.lock().buffer.free()
    }

    /// Estimated bytes between the caller and the speaker
    pub fn delay(&self) -> usize {
        self.shared.state.lock().delay_estimate()
    }

    /// [`delay`](Self::delay) in milliseconds
    pub fn delay_ms(&self) -> u64 {
        let byte_rate = match self.params.descriptor() {
            Ok(desc) => desc.byte_rate(),
            Err(_) => return 0,
        };
        self.delay() as u64 * 1000 / byte_rate
    }

    /// Sleep until the delay is back under the configured bound
    pub fn delay_wait(&self) {
        let max_latency = self.params.max_latency_ms as u64;
        if max_latency == 0 {
            return;
        }
        let latency = self.delay_ms();
        if latency > max_latency {
            thread::sleep(Duration::from_millis(latency - max_latency));
        }
    }

    /// Bytes per sample of the configured format
    pub fn sample_size(&self) -> usize {
        self.params.format.bytes_per_sample()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().ready
    }

    /// What the server reported for the current session
    pub fn backend_info(&self) -> Option<BackendInfo> {
        let state = self.shared.state.lock();
        state.ready.then_some(state.backend)
    }

    /// Stop and release the stream
    pub fn free(self) {
        self.stop();
    }
}

impl Default for RsdStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RsdStream {
    fn drop(&mut self) {
        self.stop();
    }
}
