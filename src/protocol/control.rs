//! Control channel mini-protocol
//!
//! Frames are plain text: `RSD`, a right-aligned decimal payload length, a
//! space, then the payload.
//!
//! ```text
//! RSD  08 INFO 100
//! └┬┘└┬┘ └──┬───┘
//!  │  │     └ payload (8 bytes)
//!  │  └ length field, at least two digits, padded to fill an 8-byte header
//!  └ marker
//! ```
//!
//! A receiver always reads the fixed 8-byte header first and then exactly
//! `length` bytes. Older peers count the separating space as part of the
//! payload, so payloads are trimmed before the keyword is matched.

use std::fmt;

use crate::constants::{CONTROL_HEADER_SIZE, CONTROL_MAX_FRAME};
use crate::error::ProtocolError;

const MARKER: &[u8] = b"RSD";

/// Messages exchanged on the control socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Keepalive
    Null,
    /// Ask the server to end the session
    Stop,
    /// Position query (`serv_ptr` absent) or reply (`serv_ptr` present)
    Info { client_ptr: u64, serv_ptr: Option<u64> },
    /// Free-text client name
    Identity(String),
    /// Ask the peer to close the control channel only
    CloseCtl,
    /// Acknowledgement of `CloseCtl`
    CloseCtlAck,
}

impl ControlMessage {
    pub fn info_query(client_ptr: u64) -> Self {
        ControlMessage::Info {
            client_ptr,
            serv_ptr: None,
        }
    }

    pub fn info_reply(client_ptr: u64, serv_ptr: u64) -> Self {
        ControlMessage::Info {
            client_ptr,
            serv_ptr: Some(serv_ptr),
        }
    }

    /// Payload text, without framing
    pub fn payload(&self) -> String {
        match self {
            ControlMessage::Null => "NULL".to_string(),
            ControlMessage::Stop => "STOP".to_string(),
            ControlMessage::Info {
                client_ptr,
                serv_ptr: None,
            } => format!("INFO {}", client_ptr),
            ControlMessage::Info {
                client_ptr,
                serv_ptr: Some(serv_ptr),
            } => format!("INFO {} {}", client_ptr, serv_ptr),
            ControlMessage::Identity(name) => format!("IDENTITY {}", name),
            ControlMessage::CloseCtl => "CLOSECTL".to_string(),
            ControlMessage::CloseCtlAck => "CLOSECTL OK".to_string(),
        }
    }

    /// Full wire frame
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let length = format!("{:02}", payload.len());
        format!("RSD{:>4} {}", length, payload).into_bytes()
    }

    /// Parse a frame payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| ProtocolError::Malformed("payload is not UTF-8".to_string()))?
            .trim_matches(|c: char| c.is_whitespace() || c == '\0');

        let (keyword, rest) = match text.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (text, ""),
        };

        match keyword {
            "" => Err(ProtocolError::Malformed("empty payload".to_string())),
            "NULL" => Ok(ControlMessage::Null),
            "STOP" => Ok(ControlMessage::Stop),
            "INFO" => {
                let mut numbers = rest.split_whitespace();
                let client_ptr = parse_counter(numbers.next())?
                    .ok_or_else(|| ProtocolError::Malformed("INFO without position".to_string()))?;
                let serv_ptr = parse_counter(numbers.next())?;
                Ok(ControlMessage::Info {
                    client_ptr,
                    serv_ptr,
                })
            }
            "IDENTITY" => Ok(ControlMessage::Identity(rest.to_string())),
            "CLOSECTL" if rest == "OK" => Ok(ControlMessage::CloseCtlAck),
            "CLOSECTL" => Ok(ControlMessage::CloseCtl),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload())
    }
}

fn parse_counter(token: Option<&str>) -> Result<Option<u64>, ProtocolError> {
    match token {
        None => Ok(None),
        Some(token) => token
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProtocolError::Malformed(format!("bad counter {:?}", token))),
    }
}

/// Incremental frame decoder.
///
/// Bytes are fed as they arrive from a non-blocking socket; complete frames
/// are pulled out with [`ControlDecoder::next_frame`]. Garbage before a
/// marker is skipped, and malformed or oversized headers are dropped so the
/// decoder resynchronizes on the next `RSD`.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    buf: Vec<u8>,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next decoded frame.
    ///
    /// Returns `None` when more input is needed. Non-fatal errors are
    /// returned once and the offending header is discarded, so calling again
    /// continues with the following data.
    pub fn next_frame(&mut self) -> Option<Result<ControlMessage, ProtocolError>> {
        match find_marker(&self.buf) {
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => {
                // Keep a tail that could be the start of a split marker.
                let keep = self.buf.len().min(MARKER.len() - 1);
                self.buf.drain(..self.buf.len() - keep);
                return None;
            }
        }

        if self.buf.len() < CONTROL_HEADER_SIZE {
            return None;
        }

        let field = String::from_utf8_lossy(&self.buf[MARKER.len()..CONTROL_HEADER_SIZE]).into_owned();
        let length = match field.trim().parse::<usize>() {
            Ok(length) => length,
            Err(_) => {
                self.buf.drain(..MARKER.len());
                return Some(Err(ProtocolError::Malformed(format!(
                    "bad length field {:?}",
                    field
                ))));
            }
        };

        if length > CONTROL_MAX_FRAME {
            self.buf.drain(..CONTROL_HEADER_SIZE);
            return Some(Err(ProtocolError::Oversized(length)));
        }

        let end = CONTROL_HEADER_SIZE + length;
        if self.buf.len() < end {
            return None;
        }

        let frame: Vec<u8> = self.buf.drain(..end).collect();
        Some(ControlMessage::parse(&frame[CONTROL_HEADER_SIZE..]))
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(MARKER.len()).position(|w| w == MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Result<ControlMessage, ProtocolError>> {
        let mut decoder = ControlDecoder::new();
        decoder.feed(bytes);
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn test_frame_format() {
        assert_eq!(ControlMessage::info_query(100).encode(), b"RSD  08 INFO 100");
        assert_eq!(ControlMessage::Stop.encode(), b"RSD  04 STOP");
        assert_eq!(
            ControlMessage::info_reply(100, 4800).encode(),
            b"RSD  13 INFO 100 4800"
        );
    }

    #[test]
    fn test_decode_sequence() {
        let mut bytes = ControlMessage::Null.encode();
        bytes.extend(ControlMessage::Identity("living room".into()).encode());
        bytes.extend(ControlMessage::CloseCtl.encode());
        bytes.extend(ControlMessage::CloseCtlAck.encode());

        let frames: Vec<_> = decode_all(&bytes).into_iter().map(Result::unwrap).collect();
        assert_eq!(
            frames,
            vec![
                ControlMessage::Null,
                ControlMessage::Identity("living room".into()),
                ControlMessage::CloseCtl,
                ControlMessage::CloseCtlAck,
            ]
        );
    }

    #[test]
    fn test_legacy_length_counts_space() {
        // Older clients write "RSD%5d" with the separator inside the payload.
        let frames = decode_all(b"RSD    5 STOPRSD    9 INFO 100");
        assert_eq!(frames[0], Ok(ControlMessage::Stop));
        assert_eq!(frames[1], Ok(ControlMessage::info_query(100)));
    }

    #[test]
    fn test_partial_input() {
        let frame = ControlMessage::info_reply(7, 3).encode();
        let mut decoder = ControlDecoder::new();

        decoder.feed(&frame[..5]);
        assert!(decoder.next_frame().is_none());
        decoder.feed(&frame[5..10]);
        assert!(decoder.next_frame().is_none());
        decoder.feed(&frame[10..]);
        assert_eq!(decoder.next_frame(), Some(Ok(ControlMessage::info_reply(7, 3))));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_resync_after_oversized() {
        let mut bytes = b"RSD 999 ".to_vec();
        bytes.extend(std::iter::repeat(b'x').take(40));
        bytes.extend(ControlMessage::Stop.encode());

        let frames = decode_all(&bytes);
        assert_eq!(frames[0], Err(ProtocolError::Oversized(999)));
        assert_eq!(frames[1], Ok(ControlMessage::Stop));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut bytes = b"noise RSDabcdefg".to_vec();
        bytes.extend(ControlMessage::Null.encode());

        let frames = decode_all(&bytes);
        assert!(matches!(frames[0], Err(ProtocolError::Malformed(_))));
        assert_eq!(frames[1], Ok(ControlMessage::Null));
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let frames = decode_all(b"RSD  04 PLAY");
        let err = frames[0].clone().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("PLAY".into()));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_bad_info() {
        assert!(matches!(
            ControlMessage::parse(b"INFO"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::parse(b"INFO -5"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
