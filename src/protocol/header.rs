//! Stream description header
//!
//! The header is a canonical 44-byte WAV header so that a client can simply
//! pipe a real `.wav` file into the connection. Only a handful of fields are
//! meaningful to the server:
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 22     | 2    | channel count                          |
//! | 24     | 4    | sample rate                            |
//! | 34     | 2    | bits per sample                        |
//! | 42     | 2    | sample format tag (0 = infer from bits) |
//!
//! All fields are little-endian regardless of host byte order.

use std::fmt;

use crate::constants::{HEADER_SIZE, MAX_SAMPLE_RATE};
use crate::error::FormatError;

const CHANNELS_OFFSET: usize = 22;
const RATE_OFFSET: usize = 24;
const BYTE_RATE_OFFSET: usize = 28;
const BLOCK_ALIGN_OFFSET: usize = 32;
const BITS_OFFSET: usize = 34;
const FORMAT_OFFSET: usize = 42;

/// Sample encodings understood on the wire.
///
/// Discriminants are the tags carried at offset 42 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SampleFormat {
    S16Le = 0x0001,
    S16Be = 0x0002,
    U16Le = 0x0004,
    U16Be = 0x0008,
    U8 = 0x0010,
    S8 = 0x0020,
    Alaw = 0x0100,
    Mulaw = 0x0200,
    S32Le = 0x0400,
    S32Be = 0x0800,
    U32Le = 0x2000,
    U32Be = 0x4000,
}

impl SampleFormat {
    pub const ALL: [SampleFormat; 12] = [
        SampleFormat::S16Le,
        SampleFormat::S16Be,
        SampleFormat::U16Le,
        SampleFormat::U16Be,
        SampleFormat::U8,
        SampleFormat::S8,
        SampleFormat::Alaw,
        SampleFormat::Mulaw,
        SampleFormat::S32Le,
        SampleFormat::S32Be,
        SampleFormat::U32Le,
        SampleFormat::U32Be,
    ];

    /// Wire tag for this format
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Look up a format by its wire tag
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.tag() == tag)
    }

    /// Signed 16-bit in host byte order
    pub fn s16_native() -> Self {
        if cfg!(target_endian = "little") {
            SampleFormat::S16Le
        } else {
            SampleFormat::S16Be
        }
    }

    /// Bytes per single-channel sample
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::S8 | SampleFormat::Alaw | SampleFormat::Mulaw => 1,
            SampleFormat::S16Le | SampleFormat::S16Be | SampleFormat::U16Le | SampleFormat::U16Be => 2,
            SampleFormat::S32Le | SampleFormat::S32Be | SampleFormat::U32Le | SampleFormat::U32Be => 4,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        (self.bytes_per_sample() * 8) as u16
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            SampleFormat::S8
                | SampleFormat::S16Le
                | SampleFormat::S16Be
                | SampleFormat::S32Le
                | SampleFormat::S32Be
        )
    }

    pub fn is_big_endian(self) -> bool {
        matches!(
            self,
            SampleFormat::S16Be | SampleFormat::U16Be | SampleFormat::S32Be | SampleFormat::U32Be
        )
    }

    /// WAV `audioFormat` code written at offset 20
    fn wav_audio_format(self) -> u16 {
        match self {
            SampleFormat::S16Le | SampleFormat::U8 => 1,
            SampleFormat::Alaw => 6,
            SampleFormat::Mulaw => 7,
            _ => 0,
        }
    }

    /// Format assumed by old clients that leave the tag at zero
    fn infer_from_bits(bits: u16) -> Option<Self> {
        match bits {
            16 => Some(SampleFormat::S16Le),
            8 => Some(SampleFormat::U8),
            _ => None,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::S16Le => "S16LE",
            SampleFormat::S16Be => "S16BE",
            SampleFormat::U16Le => "U16LE",
            SampleFormat::U16Be => "U16BE",
            SampleFormat::U8 => "U8",
            SampleFormat::S8 => "S8",
            SampleFormat::Alaw => "A-law",
            SampleFormat::Mulaw => "mu-law",
            SampleFormat::S32Le => "S32LE",
            SampleFormat::S32Be => "S32BE",
            SampleFormat::U32Le => "U32LE",
            SampleFormat::U32Be => "U32BE",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for SampleFormat {
    type Err = FormatError;

    /// Accepts the display names case-insensitively, plus `alaw` and `mulaw`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        if wanted == "alaw" {
            return Ok(SampleFormat::Alaw);
        }
        if wanted == "mulaw" {
            return Ok(SampleFormat::Mulaw);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.to_string().to_ascii_lowercase() == wanted)
            .ok_or(FormatError::UnknownFormat(0))
    }
}

/// Parameters of one audio stream, fixed for the life of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub channels: u16,
    pub sample_rate: u32,
    pub format: SampleFormat,
}

impl StreamDescriptor {
    pub fn new(channels: u16, sample_rate: u32, format: SampleFormat) -> Self {
        Self {
            channels,
            sample_rate,
            format,
        }
    }

    /// Bytes per sample frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Nominal stream rate in bytes per second
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.frame_size() as u64
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        if self.channels == 0 {
            return Err(FormatError::InvalidChannels(self.channels));
        }
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(FormatError::InvalidSampleRate(self.sample_rate));
        }
        Ok(())
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.channels {
            1 => "mono".to_string(),
            2 => "stereo".to_string(),
            n => format!("{} channels", n),
        };
        write!(f, "{} Hz, {}, {}", self.sample_rate, layout, self.format)
    }
}

fn put_u16(buf: &mut [u8; HEADER_SIZE], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8; HEADER_SIZE], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8; HEADER_SIZE], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8; HEADER_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Build the 44-byte header announcing `desc`.
pub fn encode_stream_header(desc: &StreamDescriptor) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    let bytes_per_sample = desc.format.bytes_per_sample() as u32;

    header[0..4].copy_from_slice(b"RIFF");
    // Total chunk size is unknown for a live stream.
    put_u32(&mut header, 4, 0);
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    put_u32(&mut header, 16, 16);
    put_u16(&mut header, 20, desc.format.wav_audio_format());
    put_u16(&mut header, CHANNELS_OFFSET, desc.channels);
    put_u32(&mut header, RATE_OFFSET, desc.sample_rate);
    put_u32(
        &mut header,
        BYTE_RATE_OFFSET,
        desc.sample_rate
            .wrapping_mul(desc.channels as u32)
            .wrapping_mul(bytes_per_sample),
    );
    put_u16(
        &mut header,
        BLOCK_ALIGN_OFFSET,
        (desc.channels as u32 * bytes_per_sample) as u16,
    );
    put_u16(&mut header, BITS_OFFSET, desc.format.bits_per_sample());
    header[36..40].copy_from_slice(b"data");
    // The upper half of the data chunk size carries the format tag.
    put_u16(&mut header, FORMAT_OFFSET, desc.format.tag());

    header
}

/// Parse and sanity-check a 44-byte header.
pub fn decode_stream_header(header: &[u8; HEADER_SIZE]) -> Result<StreamDescriptor, FormatError> {
    let channels = get_u16(header, CHANNELS_OFFSET);
    let sample_rate = get_u32(header, RATE_OFFSET);
    let bits = get_u16(header, BITS_OFFSET);
    let tag = get_u16(header, FORMAT_OFFSET);

    if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
        return Err(FormatError::InvalidSampleRate(sample_rate));
    }
    if bits == 0 || bits % 8 != 0 {
        return Err(FormatError::InvalidBitsPerSample(bits));
    }
    if channels == 0 {
        return Err(FormatError::InvalidChannels(channels));
    }

    let format = if tag == 0 {
        SampleFormat::infer_from_bits(bits).ok_or(FormatError::UnknownFormat(tag))?
    } else {
        SampleFormat::from_tag(tag).ok_or(FormatError::UnknownFormat(tag))?
    };

    Ok(StreamDescriptor {
        channels,
        sample_rate,
        format,
    })
}

/// Decode a header from an arbitrary slice, e.g. the start of a file.
pub fn decode_stream_header_slice(bytes: &[u8]) -> Result<StreamDescriptor, FormatError> {
    let header: &[u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(FormatError::Truncated(bytes.len()))?;
    decode_stream_header(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cd_quality() -> StreamDescriptor {
        StreamDescriptor::new(2, 44100, SampleFormat::S16Le)
    }

    #[test]
    fn test_header_layout() {
        let header = encode_stream_header(&cd_quality());

        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..16], b"WAVEfmt ");
        assert_eq!(&header[36..40], b"data");
        assert_eq!(&header[22..24], &[2, 0]);
        assert_eq!(&header[24..28], &44100u32.to_le_bytes());
        assert_eq!(&header[28..32], &176_400u32.to_le_bytes());
        assert_eq!(&header[32..34], &[4, 0]);
        assert_eq!(&header[34..36], &[16, 0]);
        assert_eq!(&header[42..44], &[1, 0]);
    }

    #[test]
    fn test_legacy_header_infers_format() {
        let mut header = encode_stream_header(&StreamDescriptor::new(1, 8000, SampleFormat::U8));
        header[42] = 0;
        header[43] = 0;

        let desc = decode_stream_header(&header).unwrap();
        assert_eq!(desc.format, SampleFormat::U8);

        let mut header = encode_stream_header(&cd_quality());
        header[42] = 0;
        assert_eq!(decode_stream_header(&header).unwrap().format, SampleFormat::S16Le);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut header = encode_stream_header(&cd_quality());
        header[24..28].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            decode_stream_header(&header),
            Err(FormatError::InvalidSampleRate(0))
        );

        let mut header = encode_stream_header(&cd_quality());
        header[24..28].copy_from_slice(&192_001u32.to_le_bytes());
        assert!(decode_stream_header(&header).is_err());

        let mut header = encode_stream_header(&cd_quality());
        header[34] = 12;
        assert_eq!(
            decode_stream_header(&header),
            Err(FormatError::InvalidBitsPerSample(12))
        );

        let mut header = encode_stream_header(&cd_quality());
        header[34] = 0;
        assert!(decode_stream_header(&header).is_err());
    }

    #[test]
    fn test_truncated_slice() {
        let header = encode_stream_header(&cd_quality());
        assert_eq!(
            decode_stream_header_slice(&header[..20]),
            Err(FormatError::Truncated(20))
        );
        assert_eq!(decode_stream_header_slice(&header).unwrap(), cd_quality());
    }

    #[test]
    fn test_parse_format_names() {
        assert_eq!("s16le".parse::<SampleFormat>(), Ok(SampleFormat::S16Le));
        assert_eq!("U32BE".parse::<SampleFormat>(), Ok(SampleFormat::U32Be));
        assert_eq!("mu-law".parse::<SampleFormat>(), Ok(SampleFormat::Mulaw));
        assert_eq!("alaw".parse::<SampleFormat>(), Ok(SampleFormat::Alaw));
        assert!("f32le".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_descriptor_sizes() {
        let desc = StreamDescriptor::new(2, 48000, SampleFormat::S32Be);
        assert_eq!(desc.frame_size(), 8);
        assert_eq!(desc.byte_rate(), 384_000);
        assert_eq!(desc.to_string(), "48000 Hz, stereo, S32BE");
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            channels in 1u16..=32,
            rate in 1u32..=MAX_SAMPLE_RATE,
            idx in 0usize..SampleFormat::ALL.len(),
        ) {
            let desc = StreamDescriptor::new(channels, rate, SampleFormat::ALL[idx]);
            prop_assert_eq!(decode_stream_header(&encode_stream_header(&desc)), Ok(desc));
        }
    }
}
