//! State shared between caller threads and the transmit thread
//!
//! Everything lives behind one mutex; the condition variable only signals
//! "buffer level changed" or "session ended".

use std::net::TcpStream;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::audio::RingBuffer;
use crate::constants::{INFO_WINDOW_CHUNKS, MAX_DELAY_CORRECTION};
use crate::protocol::BackendInfo;

pub(crate) struct Shared {
    pub state: Mutex<EngineState>,
    pub cond: Condvar,
    /// Control socket, non-blocking. `None` when absent or closed.
    pub control: Mutex<Option<TcpStream>>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            cond: Condvar::new(),
            control: Mutex::new(None),
        }
    }
}

#[derive(Default)]
pub(crate) struct EngineState {
    pub buffer: RingBuffer,
    /// Transmit unit, already clamped
    pub chunk_size: usize,
    /// Transmit thread is running and the connection is healthy
    pub active: bool,
    /// Handshake finished; `write` accepts data
    pub ready: bool,
    /// Bytes handed to the data socket since start
    pub total_written: u64,
    /// When the first chunk went out
    pub started_at: Option<Instant>,
    pub backend: BackendInfo,
    /// Nominal stream rate in bytes per second
    pub byte_rate: u64,
    /// Correction learned from server position reports
    pub delay_offset: i64,
    /// Caller asked to retire the control channel
    pub close_control: bool,
    /// Bumped by every `start`; survives `reset` so a finished session
    /// cannot clear its successor.
    pub generation: u64,
}

impl EngineState {
    /// Bytes not yet played: local buffer plus the estimated in-flight
    /// amount, backend latency and learned offset. May be negative before
    /// clamping.
    pub fn delay_bytes(&self) -> i64 {
        let buffered = self.buffer.len() as i64;
        let in_flight = match self.started_at {
            Some(started) => {
                let consumed = (started.elapsed().as_secs_f64() * self.byte_rate as f64) as i64;
                // Nothing plays before it is sent.
                (self.total_written as i64 - consumed).max(0)
            }
            None => 0,
        };
        buffered + in_flight + self.backend.latency as i64 + self.delay_offset
    }

    /// Delay as reported to callers, never below what is still buffered
    pub fn delay_estimate(&self) -> usize {
        self.delay_bytes().max(self.buffer.len() as i64) as usize
    }

    /// Fold a server position report into the delay offset.
    ///
    /// Reports for data older than the correction window, or newer than
    /// anything sent, are ignored. Returns the applied correction.
    pub fn apply_position(&mut self, client_ptr: u64, serv_ptr: u64) -> Option<i64> {
        let window = INFO_WINDOW_CHUNKS * self.chunk_size as u64;
        if self.total_written <= client_ptr || self.total_written - client_ptr >= window {
            return None;
        }

        let estimate = self.delay_bytes();
        let reported = client_ptr as i64 - serv_ptr as i64 + self.buffer.len() as i64;
        let correction = (reported - estimate).clamp(-MAX_DELAY_CORRECTION, MAX_DELAY_CORRECTION);
        self.delay_offset += correction;

        tracing::trace!(
            estimate,
            reported,
            correction,
            offset = self.delay_offset,
            "Delay correction"
        );
        Some(correction)
    }

    /// Return to the pre-start state, keeping the allocated buffer
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.active = false;
        self.ready = false;
        self.total_written = 0;
        self.started_at = None;
        self.delay_offset = 0;
        self.close_control = false;
        self.backend = BackendInfo::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_delay_before_first_send() {
        let mut state = EngineState {
            buffer: RingBuffer::new(64),
            backend: BackendInfo::new(10, 8),
            byte_rate: 1000,
            ..Default::default()
        };
        state.buffer.push(&[0u8; 20]);
        assert_eq!(state.delay_bytes(), 30);

        state.delay_offset = -50;
        assert_eq!(state.delay_bytes(), -20);
        assert_eq!(state.delay_estimate(), 20);
    }

    #[test]
    fn test_delay_covers_buffer_when_sending_lags() {
        let mut state = EngineState {
            buffer: RingBuffer::new(4096),
            total_written: 100,
            started_at: Some(Instant::now() - Duration::from_secs(2)),
            byte_rate: 1000,
            ..Default::default()
        };
        state.buffer.push(&[0u8; 3000]);
        // Two seconds of playback against 100 bytes sent: nothing in flight.
        assert_eq!(state.delay_bytes(), 3000);
        assert!(state.delay_estimate() >= state.buffer.len());
    }

    fn streaming_state() -> EngineState {
        EngineState {
            buffer: RingBuffer::new(8192),
            chunk_size: 1024,
            total_written: 20_000,
            byte_rate: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_position_correction_is_bounded() {
        let mut state = streaming_state();
        // Estimate is 0 before the first send timestamp; the server says
        // 1000 bytes are still queued.
        assert_eq!(state.apply_position(19_000, 18_000), Some(MAX_DELAY_CORRECTION));
        assert_eq!(state.delay_offset, MAX_DELAY_CORRECTION);

        state.delay_offset = 0;
        state.backend = BackendInfo::new(5000, 1024);
        assert_eq!(state.apply_position(19_000, 18_990), Some(-MAX_DELAY_CORRECTION));
        assert_eq!(state.delay_offset, -MAX_DELAY_CORRECTION);
    }

    #[test]
    fn test_position_small_error_applied_exactly() {
        let mut state = streaming_state();
        state.buffer.push(&[0u8; 100]);
        // Estimate 100 (buffer), reported 20 + 100.
        assert_eq!(state.apply_position(19_500, 19_480), Some(20));
        assert_eq!(state.delay_bytes(), 120);
    }

    #[test]
    fn test_position_outside_window_ignored() {
        let mut state = streaming_state();
        let window = INFO_WINDOW_CHUNKS * 1024;

        assert_eq!(state.apply_position(20_000 - window, 0), None);
        assert_eq!(state.apply_position(20_000, 0), None);
        assert_eq!(state.apply_position(25_000, 0), None);
        assert_eq!(state.delay_offset, 0);
    }

    #[test]
    fn test_delay_drains_with_time() {
        let state = EngineState {
            buffer: RingBuffer::new(64),
            total_written: 1000,
            started_at: Some(Instant::now() - Duration::from_millis(500)),
            byte_rate: 1000,
            ..Default::default()
        };
        // Half a second at 1000 B/s consumed roughly 500 of the 1000 sent.
        let delay = state.delay_bytes();
        assert!(delay <= 500 && delay > 400, "delay = {}", delay);
    }

    #[test]
    fn test_reset() {
        let mut state = EngineState {
            buffer: RingBuffer::new(16),
            active: true,
            ready: true,
            total_written: 99,
            started_at: Some(Instant::now()),
            delay_offset: 7,
            generation: 3,
            ..Default::default()
        };
        state.buffer.push(&[1, 2, 3]);
        state.reset();
        assert_eq!(state.generation, 3);

        assert!(state.buffer.is_empty());
        assert_eq!(state.buffer.capacity(), 16);
        assert!(!state.active && !state.ready);
        assert_eq!(state.total_written, 0);
        assert!(state.started_at.is_none());
        assert_eq!(state.delay_offset, 0);
    }
}
