//! Error types for the audio relay

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Thread panicked: {0}")]
    ThreadPanic(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream header errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid bits per sample: {0}")]
    InvalidBitsPerSample(u16),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Unknown sample format tag: {0}")]
    UnknownFormat(u16),

    #[error("Header truncated: {0} bytes")]
    Truncated(usize),
}

/// Control channel framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame too large: {0} bytes")]
    Oversized(usize),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

impl ProtocolError {
    /// Whether the error must end the session.
    ///
    /// Malformed and oversized frames are skipped; a well-framed message
    /// carrying a command nobody understands is a protocol violation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::UnknownCommand(_))
    }
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout")]
    Timeout,

    #[error("Remote side hung up")]
    PeerHangup,

    #[error("Control connection from {control} does not match data peer {data}")]
    ControlPeerMismatch { data: String, control: String },
}

/// Handshake errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Bad stream header: {0}")]
    Header(#[from] FormatError),

    #[error("Backend refused stream: {0}")]
    BackendOpen(String),

    #[error("Invalid backend info: latency {latency}, chunk size {chunk_size}")]
    InvalidBackendInfo { latency: u32, chunk_size: u32 },
}

/// Audio backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to open output: {0}")]
    Open(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Backend accepted no data")]
    ZeroWrite,

    #[error("Backend not available: {0}")]
    Unavailable(String),
}

/// Client streaming engine errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream parameter missing: {0}")]
    NotConfigured(&'static str),

    #[error("Stream is not started")]
    NotReady,

    #[error("Connection to server lost")]
    Disconnected,

    #[error("Failed to spawn transmit thread: {0}")]
    ThreadSpawn(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
