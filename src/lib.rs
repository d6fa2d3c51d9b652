//! # rsound
//!
//! Network-transparent PCM audio relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── CLIENT ────────────────────────────────┐
//! │                                                                        │
//! │  caller ──write()──▶ ┌──────────────┐     ┌─────────────────────────┐  │
//! │   thread   (blocks   │  RingBuffer  │────▶│ transmit thread         │  │
//! │            when full)│ Mutex+Condvar│     │ one chunk per send      │  │
//! │                      └──────────────┘     └────────────┬────────────┘  │
//! │                                                        │               │
//! └────────────────────────────────────────────────────────┼───────────────┘
//!                    data socket: header ▶ ◀ backend info  │  PCM ▶
//!                    control socket: RSD frames ◀──────────┤
//!                                                          ▼
//! ┌──────────────────────────────── SERVER ────────────────────────────────┐
//! │  Listener (accept loop) ──spawn──▶ Session (one thread per client)     │
//! │                                                                        │
//! │   AwaitingHeader ─▶ NegotiatingBackend ─▶ Relaying ─▶ Closed           │
//! │                                              │                         │
//! │                                  drain control frames, read chunk,     │
//! │                                  write chunk to BackendStream          │
//! │                                              ▼                         │
//! │                                    Backend (cpal / null)               │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Size of the stream description header
    pub const HEADER_SIZE: usize = 44;

    /// Size of the backend info reply
    pub const BACKEND_INFO_SIZE: usize = 8;

    /// Highest sample rate accepted in a header
    pub const MAX_SAMPLE_RATE: u32 = 192_000;

    /// Fixed prefix of a control frame: marker plus length field
    pub const CONTROL_HEADER_SIZE: usize = 8;

    /// Control frames announcing a longer payload are discarded
    pub const CONTROL_MAX_FRAME: usize = 256;

    /// Longest identity string a client sends
    pub const MAX_IDENTITY_LEN: usize = 128;

    /// Default TCP port
    pub const DEFAULT_PORT: u16 = 12345;

    /// Default server host for clients
    pub const DEFAULT_HOST: &str = "localhost";

    /// Largest transmit unit the client uses, whatever the server asks for
    pub const MAX_CHUNK_SIZE: u32 = 1024;

    /// Minimum ring capacity, in chunks
    pub const BUFFER_CHUNKS: usize = 32;

    /// Upper bound for the header / backend info exchange
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound for a single chunk send
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long the server waits for the control connection
    pub const CONTROL_GRACE: Duration = Duration::from_millis(200);

    /// Granularity of the server's data-socket poll
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Largest delay correction applied per INFO reply, in bytes
    pub const MAX_DELAY_CORRECTION: i64 = 50;

    /// Client starts asking for server position after this much audio
    pub const INFO_AFTER: Duration = Duration::from_secs(1);

    /// INFO replies older than this many chunks are ignored
    pub const INFO_WINDOW_CHUNKS: u64 = 16;
}
