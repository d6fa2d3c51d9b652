//! Background transmit thread
//!
//! Drains the ring buffer one chunk at a time onto the data socket. Once a
//! second of audio has gone out it also trades `INFO` frames with the server
//! on the control socket to refine the delay estimate.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::state::{EngineState, Shared};
use crate::constants::{INFO_AFTER, SEND_TIMEOUT};
use crate::network::{self, is_timeout};
use crate::protocol::{ControlDecoder, ControlMessage};

/// Start the transmit thread for a freshly negotiated session
pub(crate) fn spawn(
    shared: Arc<Shared>,
    data: TcpStream,
    generation: u64,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rsd-transmit".to_string())
        .spawn(move || Transmitter::new(shared, data, generation).run())
}

struct Transmitter {
    shared: Arc<Shared>,
    data: TcpStream,
    /// Session this thread was started for
    generation: u64,
    chunk: Vec<u8>,
    decoder: ControlDecoder,
    /// `CLOSECTL` sent, waiting for the acknowledgement
    closing_control: bool,
}

impl Transmitter {
    fn new(shared: Arc<Shared>, data: TcpStream, generation: u64) -> Self {
        let chunk_size = shared.state.lock().chunk_size;
        Self {
            shared,
            data,
            generation,
            chunk: vec![0u8; chunk_size],
            decoder: ControlDecoder::new(),
            closing_control: false,
        }
    }

    fn run(mut self) {
        tracing::debug!("Transmit thread started, chunk {} bytes", self.chunk.len());

        while self.wait_for_chunk() {
            if let Err(e) = network::write_all_timeout(&mut self.data, &self.chunk, SEND_TIMEOUT) {
                tracing::warn!("Lost connection to server: {}", e);
                break;
            }

            let (total_written, byte_rate, close_requested) = {
                let mut state = self.shared.state.lock();
                if !self.owns(&state) {
                    break;
                }
                state.buffer.consume(self.chunk.len());
                state.total_written += self.chunk.len() as u64;
                state.started_at.get_or_insert_with(Instant::now);
                (state.total_written, state.byte_rate, state.close_control)
            };
            self.shared.cond.notify_all();

            if close_requested && !self.closing_control {
                self.begin_close_control();
            }

            let threshold = (byte_rate as f64 * INFO_AFTER.as_secs_f64()) as u64;
            if total_written > threshold {
                self.exchange_position(total_written);
            }
        }

        self.terminate();
    }

    /// Block until a full chunk is buffered and copy it out.
    ///
    /// Returns false once the session is no longer active.
    fn wait_for_chunk(&mut self) -> bool {
        let mut state = self.shared.state.lock();
        loop {
            if !state.active || !self.owns(&state) {
                return false;
            }
            if state.buffer.len() >= self.chunk.len() {
                state.buffer.peek(&mut self.chunk);
                return true;
            }
            self.shared.cond.wait(&mut state);
        }
    }

    fn owns(&self, state: &EngineState) -> bool {
        state.generation == self.generation
    }

    fn begin_close_control(&mut self) {
        let mut control = self.shared.control.lock();
        if let Some(socket) = control.as_mut() {
            if send_frame(socket, &ControlMessage::CloseCtl).is_ok() {
                tracing::debug!("Requested control channel close");
                self.closing_control = true;
            } else {
                *control = None;
            }
        }
    }

    /// Ask the server where playback is and fold the answer into the delay
    /// offset. Never blocks.
    fn exchange_position(&mut self, total_written: u64) {
        let shared = Arc::clone(&self.shared);
        let latest = {
            let mut control = shared.control.lock();
            let Some(socket) = control.as_mut() else {
                return;
            };

            if !self.closing_control {
                // Non-critical; a full socket just skips this round.
                let _ = send_frame(socket, &ControlMessage::info_query(total_written));
            }

            let (latest, keep) = self.read_replies(socket);
            if !keep {
                tracing::debug!("Control channel closed");
                *control = None;
            }
            latest
        };

        if let Some((client_ptr, serv_ptr)) = latest {
            let mut state = self.shared.state.lock();
            if self.owns(&state) {
                state.apply_position(client_ptr, serv_ptr);
            }
        }
    }

    /// Drain pending control frames, returning the newest position report
    /// and whether the control socket is still usable.
    fn read_replies(&mut self, socket: &mut TcpStream) -> (Option<(u64, u64)>, bool) {
        let mut buf = [0u8; 256];
        let mut open = true;
        loop {
            match socket.read(&mut buf) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    open = false;
                    break;
                }
            }
        }

        let mut latest = None;
        while let Some(frame) = self.decoder.next_frame() {
            match frame {
                Ok(ControlMessage::Info {
                    client_ptr,
                    serv_ptr: Some(serv_ptr),
                }) => latest = Some((client_ptr, serv_ptr)),
                Ok(ControlMessage::CloseCtlAck) | Ok(ControlMessage::CloseCtl) => open = false,
                Ok(other) => tracing::trace!("Ignoring control frame {}", other),
                Err(e) => tracing::debug!("Bad control frame from server: {}", e),
            }
        }
        (latest, open)
    }

    /// Tear the session down after a send failure or a stop request.
    fn terminate(self) {
        let _ = self.data.shutdown(Shutdown::Both);

        {
            let mut state = self.shared.state.lock();
            if self.owns(&state) {
                if state.active {
                    // Connection lost on our side; nobody will send STOP.
                    self.shared.control.lock().take();
                }
                state.reset();
            } else {
                tracing::debug!("Session {} already replaced", self.generation);
            }
        }
        self.shared.cond.notify_all();

        tracing::debug!("Transmit thread exiting");
    }
}

/// Write a control frame on a non-blocking socket
pub(crate) fn send_frame(socket: &mut TcpStream, message: &ControlMessage) -> io::Result<()> {
    let frame = message.encode();
    let sent = socket.write(&frame)?;
    if sent < frame.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "short control write"));
    }
    Ok(())
}
