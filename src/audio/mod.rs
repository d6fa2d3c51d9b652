//! Audio subsystem module

pub mod buffer;
pub mod convert;

pub use buffer::RingBuffer;
pub use convert::{convert, decode_to_i16, ConversionFlags};
