//! Wire format encoding and decoding.
//!
//! Implements the 10-byte header format:
//! ```text
//! ┌────────┬───────┬──────────┬──────────┐
//! │ Kind   │ Flags │ Id       │ Length   │
//! │ 1 byte │ 1 byte│ uint32 BE│ uint32 BE│
//! └────────┴───────┴──────────┴──────────┘
//! ```
//!
//! `Id` is a request ID for `Request`/`Response` frames and an exported
//! object ID for the streaming commands. All multi-byte integers are Big
//! Endian.

use crate::error::{ChannelError, Result};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Absolute maximum payload size (~2 GB, max i32).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: u32 = 2_147_483_647;

/// Command kind carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Invoke a unit of work.
    Request = 1,
    /// Result of a request.
    Response = 2,
    /// Bytes for an exported sink.
    Chunk = 3,
    /// Flush an exported sink.
    Flush = 4,
    /// End of stream for an exported sink.
    Eof = 5,
    /// Retarget an exported proxy stream.
    Connect = 6,
}

impl CommandKind {
    /// Parse the kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Chunk),
            4 => Some(Self::Flush),
            5 => Some(Self::Eof),
            6 => Some(Self::Connect),
            _ => None,
        }
    }

    /// Whether this kind addresses an exported object rather than a request.
    #[inline]
    pub fn is_stream(self) -> bool {
        matches!(self, Self::Chunk | Self::Flush | Self::Eof | Self::Connect)
    }
}

/// Flag constants for the protocol.
pub mod flags {
    /// Response carries a failure rather than a value.
    pub const IS_ERROR: u8 = 0b0000_0001;

    /// Reserved bits mask (bits 1-7).
    pub const RESERVED_MASK: u8 = 0b1111_1110;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw command kind byte.
    pub kind: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Request ID or object ID, depending on the kind.
    pub id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: CommandKind, flags: u8, id: u32, payload_length: u32) -> Self {
        Self {
            kind: kind as u8,
            flags,
            id,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use remoting::protocol::{CommandKind, Header, HEADER_SIZE};
    ///
    /// let header = Header::new(CommandKind::Chunk, 0, 7, 100);
    /// assert_eq!(header.encode().len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.kind;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: buf[0],
            flags: buf[1],
            id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            payload_length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Kind byte is a known command
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if CommandKind::from_u8(self.kind).is_none() {
            return Err(ChannelError::Protocol(format!(
                "Unknown command kind {}",
                self.kind
            )));
        }

        if self.payload_length > max_payload_size {
            return Err(ChannelError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(ChannelError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Typed command kind, if known.
    #[inline]
    pub fn command_kind(&self) -> Option<CommandKind> {
        CommandKind::from_u8(self.kind)
    }

    /// Check if this is an error response.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(CommandKind::Response, flags::IS_ERROR, 0x01020304, 0x05060708);
        let bytes = header.encode();

        assert_eq!(bytes, [2, 1, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(Header::decode(&bytes), Some(header));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(Header::decode(&[1, 0, 0]).is_none());
    }

    #[test]
    fn test_validate_unknown_kind() {
        let header = Header {
            kind: 42,
            flags: 0,
            id: 1,
            payload_length: 0,
        };
        assert!(matches!(
            header.validate(DEFAULT_MAX_PAYLOAD_SIZE),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(CommandKind::Chunk, 0, 1, 1000);
        assert!(header.validate(999).is_err());
        assert!(header.validate(1000).is_ok());
    }

    #[test]
    fn test_validate_reserved_flags() {
        let header = Header::new(CommandKind::Request, 0b1000_0000, 1, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_stream_kinds() {
        assert!(CommandKind::Chunk.is_stream());
        assert!(CommandKind::Connect.is_stream());
        assert!(!CommandKind::Request.is_stream());
        assert!(!CommandKind::Response.is_stream());
    }

    #[test]
    fn test_kind_from_u8() {
        for kind in [
            CommandKind::Request,
            CommandKind::Response,
            CommandKind::Chunk,
            CommandKind::Flush,
            CommandKind::Eof,
            CommandKind::Connect,
        ] {
            assert_eq!(CommandKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(CommandKind::from_u8(0), None);
    }
}
