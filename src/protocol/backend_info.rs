//! Backend info reply sent by the server after a successful open

use crate::constants::BACKEND_INFO_SIZE;

/// What the server's output stage tells the client about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendInfo {
    /// Extra delay, in bytes, added by the output device
    pub latency: u32,
    /// Preferred transfer unit in bytes
    pub chunk_size: u32,
}

impl BackendInfo {
    pub fn new(latency: u32, chunk_size: u32) -> Self {
        Self {
            latency,
            chunk_size,
        }
    }

    /// A zero in either field means the backend could not describe itself.
    pub fn is_usable(&self) -> bool {
        self.latency > 0 && self.chunk_size > 0
    }
}

/// Two big-endian u32: latency, then chunk size.
pub fn encode_backend_info(info: &BackendInfo) -> [u8; BACKEND_INFO_SIZE] {
    let mut out = [0u8; BACKEND_INFO_SIZE];
    out[..4].copy_from_slice(&info.latency.to_be_bytes());
    out[4..].copy_from_slice(&info.chunk_size.to_be_bytes());
    out
}

pub fn decode_backend_info(bytes: &[u8; BACKEND_INFO_SIZE]) -> BackendInfo {
    BackendInfo {
        latency: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        chunk_size: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_network_byte_order() {
        let bytes = encode_backend_info(&BackendInfo::new(512, 1024));
        assert_eq!(bytes, [0, 0, 2, 0, 0, 0, 4, 0]);
    }

    #[test]
    fn test_usable() {
        assert!(BackendInfo::new(512, 1024).is_usable());
        assert!(!BackendInfo::new(0, 1024).is_usable());
        assert!(!BackendInfo::new(512, 0).is_usable());
    }

    proptest! {
        #[test]
        fn prop_backend_info_round_trip(latency: u32, chunk_size: u32) {
            let info = BackendInfo::new(latency, chunk_size);
            prop_assert_eq!(decode_backend_info(&encode_backend_info(&info)), info);
        }
    }
}
