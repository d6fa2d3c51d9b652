//! Audio output backends
//!
//! The server never talks to an audio device directly. It is handed one
//! [`Backend`] at construction and opens a [`BackendStream`] per connection.

pub mod null;

#[cfg(feature = "cpal-backend")]
pub mod cpal;

use std::sync::Arc;

use crate::error::BackendError;
use crate::protocol::{BackendInfo, StreamDescriptor};

pub use null::NullBackend;

#[cfg(feature = "cpal-backend")]
pub use self::cpal::CpalBackend;

/// Factory for per-connection output streams.
///
/// Shared by every connection thread of a server.
pub trait Backend: Send + Sync {
    /// Short name used in logs and configuration
    fn name(&self) -> &'static str;

    /// Process-wide setup, called once before the first connection
    fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Process-wide teardown, called once when the server stops
    fn shutdown(&self) {}

    /// Open an output for one stream
    fn open(&self, desc: &StreamDescriptor) -> Result<Box<dyn BackendStream>, BackendError>;
}

/// One open output, owned by a single connection thread.
pub trait BackendStream {
    /// Write PCM, returning how many bytes were accepted.
    ///
    /// Partial writes are allowed. `Ok(0)` or an error ends the session.
    fn write(&mut self, buf: &[u8]) -> Result<usize, BackendError>;

    /// Latency and preferred chunk size, fixed once the stream is open
    fn backend_info(&self) -> BackendInfo;

    /// Bytes currently queued in the output stage
    fn latency(&self) -> u32 {
        0
    }

    /// Release the device. Called exactly once when the session closes.
    fn close(&mut self) {}
}

/// Names accepted by [`create_backend`]
pub fn available_backends() -> Vec<&'static str> {
    let mut names = Vec::new();
    #[cfg(feature = "cpal-backend")]
    names.push("cpal");
    names.push("null");
    names
}

/// Backend used when the configuration does not name one
pub fn default_backend_name() -> &'static str {
    available_backends()[0]
}

/// Build a backend by name.
///
/// `device` selects an output device for backends that have a choice.
pub fn create_backend(name: &str, device: Option<&str>) -> Result<Arc<dyn Backend>, BackendError> {
    match name {
        "null" => Ok(Arc::new(NullBackend::new())),
        #[cfg(feature = "cpal-backend")]
        "cpal" => Ok(Arc::new(CpalBackend::new(device.map(str::to_string)))),
        other => {
            let _ = device;
            Err(BackendError::Unavailable(format!(
                "{} (compiled in: {})",
                other,
                available_backends().join(", ")
            )))
        }
    }
}
