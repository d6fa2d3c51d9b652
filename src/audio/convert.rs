//! Sample format conversion
//!
//! Stateless transforms applied to raw PCM before it reaches an output
//! device. Flags combine: byte-order and sign operations are applied first,
//! then any 8-bit expansion to signed 16-bit in host byte order.

use std::ops::{BitOr, BitOrAssign};

use crate::protocol::SampleFormat;

/// Set of conversions to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConversionFlags(u8);

impl ConversionFlags {
    pub const NONE: Self = Self(0);
    /// Reverse the byte order of every 16/32-bit sample
    pub const SWAP_ENDIAN: Self = Self(1 << 0);
    /// Toggle between signed and unsigned encoding
    pub const SIGN_FLIP: Self = Self(1 << 1);
    pub const ALAW_TO_S16: Self = Self(1 << 2);
    pub const MULAW_TO_S16: Self = Self(1 << 3);
    pub const S8_TO_S16: Self = Self(1 << 4);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ConversionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConversionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Transform `buf`, which holds samples in `source` format.
///
/// Expansions to 16-bit grow the buffer; all other operations work in place.
pub fn convert(buf: &mut Vec<u8>, source: SampleFormat, flags: ConversionFlags) {
    if flags.is_empty() {
        return;
    }

    let width = source.bytes_per_sample();

    if flags.contains(ConversionFlags::SIGN_FLIP) {
        // The sign bit lives in the most significant byte of each sample.
        let msb = if source.is_big_endian() { 0 } else { width - 1 };
        for sample in buf.chunks_exact_mut(width) {
            sample[msb] ^= 0x80;
        }
    }

    if flags.contains(ConversionFlags::SWAP_ENDIAN) && width > 1 {
        for sample in buf.chunks_exact_mut(width) {
            sample.reverse();
        }
    }

    let expand: Option<fn(u8) -> i16> = if flags.contains(ConversionFlags::ALAW_TO_S16) {
        Some(alaw_to_linear)
    } else if flags.contains(ConversionFlags::MULAW_TO_S16) {
        Some(mulaw_to_linear)
    } else if flags.contains(ConversionFlags::S8_TO_S16) {
        Some(s8_to_linear)
    } else {
        None
    };

    if let Some(expand) = expand {
        *buf = buf
            .iter()
            .flat_map(|&b| expand(b).to_ne_bytes())
            .collect();
    }
}

/// Flags that turn `source` into signed samples in host byte order.
///
/// 8-bit formats are widened to 16 bits; wider formats keep their width.
pub fn flags_to_signed_native(source: SampleFormat) -> ConversionFlags {
    let mut flags = ConversionFlags::NONE;
    match source {
        SampleFormat::Alaw => return ConversionFlags::ALAW_TO_S16,
        SampleFormat::Mulaw => return ConversionFlags::MULAW_TO_S16,
        SampleFormat::U8 => return ConversionFlags::SIGN_FLIP | ConversionFlags::S8_TO_S16,
        SampleFormat::S8 => return ConversionFlags::S8_TO_S16,
        _ => {}
    }
    if !source.is_signed() {
        flags |= ConversionFlags::SIGN_FLIP;
    }
    if source.is_big_endian() != cfg!(target_endian = "big") {
        flags |= ConversionFlags::SWAP_ENDIAN;
    }
    flags
}

/// Decode any supported format to interleaved signed 16-bit samples.
pub fn decode_to_i16(bytes: &[u8], source: SampleFormat) -> Vec<i16> {
    let mut buf = bytes.to_vec();
    convert(&mut buf, source, flags_to_signed_native(source));

    if source.bytes_per_sample() == 4 {
        buf.chunks_exact(4)
            .map(|s| (i32::from_ne_bytes([s[0], s[1], s[2], s[3]]) >> 16) as i16)
            .collect()
    } else {
        buf.chunks_exact(2)
            .map(|s| i16::from_ne_bytes([s[0], s[1]]))
            .collect()
    }
}

fn s8_to_linear(value: u8) -> i16 {
    ((value as i8) as i16) << 8
}

/// G.711 A-law to linear
pub fn alaw_to_linear(value: u8) -> i16 {
    let a = value ^ 0x55;
    let segment = (a & 0x70) >> 4;
    let mut t = ((a & 0x0f) as i16) << 4;
    match segment {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= segment - 1;
        }
    }
    if a & 0x80 != 0 {
        t
    } else {
        -t
    }
}

/// G.711 mu-law to linear
pub fn mulaw_to_linear(value: u8) -> i16 {
    let u = !value;
    let mut t = (((u & 0x0f) as i16) << 3) + 0x84;
    t <<= (u & 0x70) >> 4;
    if u & 0x80 != 0 {
        0x84 - t
    } else {
        t - 0x84
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_companding_tables() {
        assert_eq!(mulaw_to_linear(0xFF), 0);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xAA), 32256);
    }

    #[test]
    fn test_sign_flip_and_swap() {
        let mut buf = vec![0x00, 0x80, 0xFF, 0xFF];
        convert(&mut buf, SampleFormat::U16Le, ConversionFlags::SIGN_FLIP);
        assert_eq!(buf, vec![0x00, 0x00, 0xFF, 0x7F]);

        convert(&mut buf, SampleFormat::S16Le, ConversionFlags::SWAP_ENDIAN);
        assert_eq!(buf, vec![0x00, 0x00, 0x7F, 0xFF]);
    }

    #[test]
    fn test_decode_unsigned_8bit() {
        assert_eq!(decode_to_i16(&[0x80, 0x00, 0xFF], SampleFormat::U8), vec![0, -32768, 32512]);
        assert_eq!(decode_to_i16(&[0x7F], SampleFormat::S8), vec![32512]);
    }

    #[test]
    fn test_decode_wide_formats() {
        let be = 1000i16.to_be_bytes();
        assert_eq!(decode_to_i16(&be, SampleFormat::S16Be), vec![1000]);

        let le = (-1000i16).to_le_bytes();
        assert_eq!(decode_to_i16(&le, SampleFormat::S16Le), vec![-1000]);

        assert_eq!(decode_to_i16(&[0x00, 0x80], SampleFormat::U16Le), vec![0]);

        let wide = (0x1234_0000i32).to_be_bytes();
        assert_eq!(decode_to_i16(&wide, SampleFormat::S32Be), vec![0x1234]);

        let unsigned = 0x8000_0000u32.to_le_bytes();
        assert_eq!(decode_to_i16(&unsigned, SampleFormat::U32Le), vec![0]);
    }

    #[test]
    fn test_flags_for_native_source() {
        assert!(flags_to_signed_native(SampleFormat::s16_native()).is_empty());
        assert!(flags_to_signed_native(SampleFormat::U16Be).contains(ConversionFlags::SIGN_FLIP));
    }
}
