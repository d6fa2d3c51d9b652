//! Wire formats shared by client and server
//!
//! A session on the data socket is:
//!
//! 1. client → server: 44-byte stream header ([`header`])
//! 2. server → client: 8-byte backend info ([`backend_info`])
//! 3. client → server: raw PCM until either side hangs up
//!
//! The optional second socket carries [`control`] frames.

pub mod backend_info;
pub mod control;
pub mod header;

pub use backend_info::{decode_backend_info, encode_backend_info, BackendInfo};
pub use control::{ControlDecoder, ControlMessage};
pub use header::{
    decode_stream_header, decode_stream_header_slice, encode_stream_header, SampleFormat,
    StreamDescriptor,
};
