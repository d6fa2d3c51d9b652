//! Output through the platform audio API via cpal
//!
//! cpal streams are not `Send`, so each opened stream lives on a dedicated
//! thread that only keeps it alive. Samples are handed over through a
//! bounded queue guarded by a mutex and condition variable; the device
//! callback drains it and writers block while it is full.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};

use super::{Backend, BackendStream};
use crate::audio::convert::decode_to_i16;
use crate::error::BackendError;
use crate::protocol::{BackendInfo, StreamDescriptor};

/// Target transfer unit in source bytes
const CPAL_CHUNK_BYTES: usize = 1024;

/// Queue depth, in chunks
const QUEUE_CHUNKS: usize = 8;

/// How long a blocked writer sleeps before re-checking the device
const WRITE_POLL: Duration = Duration::from_millis(100);

/// Backend playing through the default (or a named) output device
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

/// Look up an output device by name, falling back to the host default
fn find_output_device(name: Option<&str>) -> Result<cpal::Device, BackendError> {
    let host = cpal::default_host();

    if let Some(name) = name {
        let devices = host
            .output_devices()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }
        return Err(BackendError::Unavailable(format!("no output device named {:?}", name)));
    }

    host.default_output_device()
        .ok_or_else(|| BackendError::Unavailable("no default output device".to_string()))
}

impl Backend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn initialize(&self) -> Result<(), BackendError> {
        let device = find_output_device(self.device_name.as_deref())?;
        tracing::info!(
            "Using output device {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(())
    }

    fn open(&self, desc: &StreamDescriptor) -> Result<Box<dyn BackendStream>, BackendError> {
        let frame = desc.frame_size();
        let chunk_size = (CPAL_CHUNK_BYTES / frame).max(1) * frame;
        let sample_bytes = desc.format.bytes_per_sample();
        let capacity = chunk_size / sample_bytes * QUEUE_CHUNKS;

        let shared = Arc::new(Shared {
            queue: Mutex::new(PlaybackQueue {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                running: true,
                failed: None,
            }),
            cond: Condvar::new(),
        });

        let config = cpal::StreamConfig {
            channels: desc.channels,
            sample_rate: cpal::SampleRate(desc.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let device_name = self.device_name.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), BackendError>>(1);
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), &config, thread_shared.clone()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Hold the stream until the connection closes it.
                let mut queue = thread_shared.queue.lock();
                while queue.running {
                    thread_shared.cond.wait(&mut queue);
                }
                drop(queue);
                drop(stream);
            })
            .map_err(|e| BackendError::Open(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(BackendError::Open("output thread exited".to_string()));
            }
        }

        tracing::debug!("cpal output opened: {}, chunk {} bytes", desc, chunk_size);

        Ok(Box::new(CpalStream {
            desc: *desc,
            chunk_size: chunk_size as u32,
            shared,
            pending: Vec::new(),
            thread: Some(handle),
        }))
    }
}

fn build_stream(
    device_name: Option<&str>,
    config: &cpal::StreamConfig,
    shared: Arc<Shared>,
) -> Result<cpal::Stream, BackendError> {
    let device = find_output_device(device_name)?;
    let error_shared = shared.clone();

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = shared.queue.lock();
                for sample in data.iter_mut() {
                    *sample = queue.samples.pop_front().unwrap_or(0.0);
                }
                drop(queue);
                shared.cond.notify_all();
            },
            move |err| {
                tracing::error!("Playback error: {}", err);
                error_shared.queue.lock().failed = Some(err.to_string());
                error_shared.cond.notify_all();
            },
            None,
        )
        .map_err(|e| BackendError::Open(e.to_string()))?;

    stream.play().map_err(|e| BackendError::Open(e.to_string()))?;
    Ok(stream)
}

struct PlaybackQueue {
    samples: VecDeque<f32>,
    capacity: usize,
    running: bool,
    failed: Option<String>,
}

struct Shared {
    queue: Mutex<PlaybackQueue>,
    cond: Condvar,
}

struct CpalStream {
    desc: StreamDescriptor,
    chunk_size: u32,
    shared: Arc<Shared>,
    /// Trailing bytes of an incomplete sample
    pending: Vec<u8>,
    thread: Option<JoinHandle<()>>,
}

impl BackendStream for CpalStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, BackendError> {
        let sample_bytes = self.desc.format.bytes_per_sample();
        self.pending.extend_from_slice(buf);
        let whole = self.pending.len() / sample_bytes * sample_bytes;
        let samples: Vec<f32> = decode_to_i16(&self.pending[..whole], self.desc.format)
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect();
        self.pending.drain(..whole);

        let mut queue = self.shared.queue.lock();
        let mut offset = 0;
        while offset < samples.len() {
            if let Some(reason) = &queue.failed {
                return Err(BackendError::Write(reason.clone()));
            }
            let room = queue.capacity.saturating_sub(queue.samples.len());
            if room == 0 {
                self.shared.cond.wait_for(&mut queue, WRITE_POLL);
                continue;
            }
            let take = room.min(samples.len() - offset);
            queue.samples.extend(&samples[offset..offset + take]);
            offset += take;
        }

        Ok(buf.len())
    }

    fn backend_info(&self) -> BackendInfo {
        // Latency is the full playback queue.
        BackendInfo::new(self.chunk_size * QUEUE_CHUNKS as u32, self.chunk_size)
    }

    fn latency(&self) -> u32 {
        let queued = self.shared.queue.lock().samples.len() * self.desc.format.bytes_per_sample();
        queued.min(u32::MAX as usize) as u32
    }

    fn close(&mut self) {
        self.shared.queue.lock().running = false;
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}
