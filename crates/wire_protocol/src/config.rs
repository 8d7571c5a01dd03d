//! Framing configuration.

use crate::error::FrameError;
use crate::header::HEADER_SIZE;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Byte order used for every integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub(crate) fn put_u32(self, buf: &mut impl BufMut, value: u32) {
        match self {
            Endianness::Little => buf.put_u32_le(value),
            Endianness::Big => buf.put_u32(value),
        }
    }

    pub(crate) fn get_u32(self, buf: &mut impl Buf) -> u32 {
        match self {
            Endianness::Little => buf.get_u32_le(),
            Endianness::Big => buf.get_u32(),
        }
    }

    /// Writes `value` as an unsigned integer of `size` bytes (1, 2 or 4).
    pub(crate) fn put_uint(self, buf: &mut impl BufMut, value: u64, size: usize) {
        match self {
            Endianness::Little => buf.put_uint_le(value, size),
            Endianness::Big => buf.put_uint(value, size),
        }
    }

    pub(crate) fn get_uint(self, buf: &mut impl Buf, size: usize) -> u64 {
        match self {
            Endianness::Little => buf.get_uint_le(size),
            Endianness::Big => buf.get_uint(size),
        }
    }
}

/// Deployment-wide framing parameters. Not negotiated per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Width of the header-length prefix: 1, 2 or 4 bytes.
    pub header_len_size: usize,
    pub endianness: Endianness,
    /// Header lengths at or below this are rejected; body lengths below it are
    /// rejected. With the default of zero, empty bodies are legal.
    pub min_msg_len: usize,
    pub max_header_len: usize,
    pub max_body_len: usize,
    /// Bodies at least this large are compressed when that makes them smaller.
    /// Zero disables compression.
    pub min_compress_size: usize,
    /// Encrypt every non-empty body with the connection key.
    pub encrypt: bool,
    /// Upper bound on packets dispatched per read event.
    pub max_packets_per_read: usize,
    /// Upper bound on a decompressed body.
    pub max_decompressed_len: usize,
    /// Bytes reserved in the frame buffer before each socket read.
    pub read_buffer_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            header_len_size: 1,
            endianness: Endianness::Little,
            min_msg_len: 0,
            max_header_len: 255,
            max_body_len: 64 * 1024,
            min_compress_size: 0,
            encrypt: false,
            max_packets_per_read: 16,
            max_decompressed_len: 1024 * 1024,
            read_buffer_size: 4096,
        }
    }
}

impl FrameConfig {
    /// Largest header length the configured prefix can carry.
    pub fn max_encodable_header_len(&self) -> u64 {
        match self.header_len_size {
            1 => u8::MAX as u64,
            2 => u16::MAX as u64,
            _ => u32::MAX as u64,
        }
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        if !matches!(self.header_len_size, 1 | 2 | 4) {
            return Err(FrameError::InvalidConfig(format!(
                "header_len_size must be 1, 2 or 4, got {}",
                self.header_len_size
            )));
        }
        if self.max_header_len < HEADER_SIZE {
            return Err(FrameError::InvalidConfig(format!(
                "max_header_len {} cannot hold a {HEADER_SIZE}-byte header",
                self.max_header_len
            )));
        }
        if self.min_msg_len >= HEADER_SIZE {
            return Err(FrameError::InvalidConfig(format!(
                "min_msg_len {} rejects every {HEADER_SIZE}-byte header",
                self.min_msg_len
            )));
        }
        if self.max_body_len > u32::MAX as usize {
            return Err(FrameError::InvalidConfig("max_body_len exceeds u32".to_string()));
        }
        if self.max_packets_per_read == 0 {
            return Err(FrameError::InvalidConfig(
                "max_packets_per_read must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FrameConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unusable_configs() {
        let bad_prefix = FrameConfig {
            header_len_size: 3,
            ..FrameConfig::default()
        };
        assert!(matches!(bad_prefix.validate(), Err(FrameError::InvalidConfig(_))));

        let tiny_header = FrameConfig {
            max_header_len: 4,
            ..FrameConfig::default()
        };
        assert!(tiny_header.validate().is_err());

        let no_packets = FrameConfig {
            max_packets_per_read: 0,
            ..FrameConfig::default()
        };
        assert!(no_packets.validate().is_err());
    }

    #[test]
    fn uint_helpers_respect_endianness() {
        let mut little = Vec::new();
        Endianness::Little.put_uint(&mut little, 0x0102, 2);
        assert_eq!(little, [0x02, 0x01]);

        let mut big = Vec::new();
        Endianness::Big.put_uint(&mut big, 0x0102, 2);
        assert_eq!(big, [0x01, 0x02]);
        assert_eq!(Endianness::Big.get_uint(&mut &big[..], 2), 0x0102);
    }
}
