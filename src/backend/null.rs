//! Backend that discards audio
//!
//! Writes are paced at the stream's nominal byte rate so a client sees the
//! same back-pressure it would get from a real device.

use std::thread;
use std::time::{Duration, Instant};

use super::{Backend, BackendStream};
use crate::error::BackendError;
use crate::protocol::{BackendInfo, StreamDescriptor};

/// Target transfer unit, rounded down to whole frames
const NULL_CHUNK_BYTES: usize = 1024;

/// Discarding backend
#[derive(Debug, Clone)]
pub struct NullBackend {
    paced: bool,
}

impl NullBackend {
    pub fn new() -> Self {
        Self { paced: true }
    }

    /// Accept data as fast as it arrives
    pub fn unpaced() -> Self {
        Self { paced: false }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn open(&self, desc: &StreamDescriptor) -> Result<Box<dyn BackendStream>, BackendError> {
        let frame = desc.frame_size();
        if frame == 0 {
            return Err(BackendError::Open(format!("unusable stream: {}", desc)));
        }
        let chunk_size = (NULL_CHUNK_BYTES / frame).max(1) * frame;

        tracing::debug!("Null output opened: {}, chunk {} bytes", desc, chunk_size);

        Ok(Box::new(NullStream {
            byte_rate: desc.byte_rate(),
            chunk_size: chunk_size as u32,
            paced: self.paced,
            started: None,
            written: 0,
        }))
    }
}

struct NullStream {
    byte_rate: u64,
    chunk_size: u32,
    paced: bool,
    started: Option<Instant>,
    written: u64,
}

impl NullStream {
    /// Time at which everything written so far would have been played
    fn play_time(&self) -> Duration {
        Duration::from_secs_f64(self.written as f64 / self.byte_rate.max(1) as f64)
    }
}

impl BackendStream for NullStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, BackendError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        self.written += buf.len() as u64;

        if self.paced {
            // Keep one chunk of slack, like a device with a single period queued.
            let slack = Duration::from_secs_f64(self.chunk_size as f64 / self.byte_rate.max(1) as f64);
            let due = self.play_time().saturating_sub(slack);
            let elapsed = started.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }

        Ok(buf.len())
    }

    fn backend_info(&self) -> BackendInfo {
        BackendInfo::new(self.chunk_size, self.chunk_size)
    }

    fn latency(&self) -> u32 {
        match self.started {
            Some(started) if self.paced => {
                let played = (started.elapsed().as_secs_f64() * self.byte_rate as f64) as u64;
                self.written.saturating_sub(played).min(u32::MAX as u64) as u32
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SampleFormat;

    #[test]
    fn test_chunk_is_frame_aligned() {
        let desc = StreamDescriptor::new(6, 48000, SampleFormat::S32Le);
        let stream = NullBackend::unpaced().open(&desc).unwrap();
        let info = stream.backend_info();
        assert_eq!(info.chunk_size % 24, 0);
        assert!(info.is_usable());
    }

    #[test]
    fn test_unpaced_accepts_everything() {
        let desc = StreamDescriptor::new(2, 44100, SampleFormat::S16Le);
        let mut stream = NullBackend::unpaced().open(&desc).unwrap();
        assert_eq!(stream.write(&[0u8; 4096]).unwrap(), 4096);
        assert_eq!(stream.latency(), 0);
    }

    #[test]
    fn test_paced_write_takes_real_time() {
        // 8000 bytes per second; 2000 bytes is 250 ms minus one chunk of slack.
        let desc = StreamDescriptor::new(1, 8000, SampleFormat::U8);
        let mut stream = NullBackend::new().open(&desc).unwrap();

        let begin = Instant::now();
        stream.write(&[0x80; 2000]).unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(100));
    }
}
