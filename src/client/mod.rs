//! Client streaming engine
//!
//! [`RsdStream`] buffers audio written by the caller and ships it to an
//! `rsd` server from a background thread.
//!
//! ```no_run
//! use rsound::client::RsdStream;
//! use rsound::protocol::SampleFormat;
//!
//! let mut stream = RsdStream::new();
//! stream.set_rate(44100);
//! stream.set_channels(2);
//! stream.set_format(SampleFormat::S16Le);
//! stream.start()?;
//! stream.write(&[0u8; 4096])?;
//! stream.stop();
//! # Ok::<(), rsound::Error>(())
//! ```

mod state;
mod stream;
mod worker;

pub use stream::RsdStream;

use crate::config::ClientConfig;
use crate::error::StreamError;
use crate::protocol::{SampleFormat, StreamDescriptor};

/// Connection and format settings applied by the next `start()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub host: String,
    pub port: u16,
    pub channels: u16,
    pub rate: u32,
    pub format: SampleFormat,
    /// Requested ring capacity in bytes; 0 lets the server's chunk size decide
    pub buffer_size: usize,
    /// Bound enforced by `delay_wait`; 0 disables it
    pub max_latency_ms: u32,
    pub identity: Option<String>,
}

impl StreamParams {
    /// Defaults from a client configuration; format fields stay unset.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            channels: 0,
            rate: 0,
            format: SampleFormat::S16Le,
            buffer_size: config.buffer_size,
            max_latency_ms: config.max_latency_ms,
            identity: config.identity.clone(),
        }
    }

    /// Stream header for these settings
    pub fn descriptor(&self) -> Result<StreamDescriptor, StreamError> {
        if self.channels == 0 {
            return Err(StreamError::NotConfigured("channels"));
        }
        if self.rate == 0 {
            return Err(StreamError::NotConfigured("rate"));
        }
        Ok(StreamDescriptor::new(self.channels, self.rate, self.format))
    }
}

impl Default for StreamParams {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}
