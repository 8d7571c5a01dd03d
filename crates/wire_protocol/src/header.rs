//! The per-packet header.

use crate::config::Endianness;
use crate::error::FrameError;
use bytes::{Buf, BufMut};

/// Encoded size of [`PacketHeader`]: message id, body length, compressed flag.
pub const HEADER_SIZE: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub msg_id: u32,
    pub body_len: u32,
    pub compressed: bool,
}

impl PacketHeader {
    pub fn new(msg_id: u32, body_len: u32, compressed: bool) -> Self {
        Self {
            msg_id,
            body_len,
            compressed,
        }
    }

    pub fn encode(&self, endianness: Endianness, buf: &mut impl BufMut) {
        endianness.put_u32(buf, self.msg_id);
        endianness.put_u32(buf, self.body_len);
        buf.put_u8(u8::from(self.compressed));
    }

    /// Decodes a header. Bytes beyond [`HEADER_SIZE`] are ignored so newer
    /// peers can append fields.
    pub fn decode(mut bytes: &[u8], endianness: Endianness) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::HeaderDecode { len: bytes.len() });
        }
        let msg_id = endianness.get_u32(&mut bytes);
        let body_len = endianness.get_u32(&mut bytes);
        let compressed = bytes.get_u8() != 0;
        Ok(Self {
            msg_id,
            body_len,
            compressed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_layout() {
        let mut buf = Vec::new();
        PacketHeader::new(0x0A0B_0C0D, 3, true).encode(Endianness::Big, &mut buf);
        assert_eq!(buf, [0x0A, 0x0B, 0x0C, 0x0D, 0, 0, 0, 3, 1]);
    }

    #[test]
    fn trailing_extension_bytes_are_ignored() {
        let mut buf = Vec::new();
        let header = PacketHeader::new(42, 7, false);
        header.encode(Endianness::Little, &mut buf);
        buf.extend_from_slice(&[0xFF; 20]);
        assert_eq!(PacketHeader::decode(&buf, Endianness::Little).unwrap(), header);
    }

    #[test]
    fn short_header_fails() {
        assert!(matches!(
            PacketHeader::decode(&[1, 2, 3], Endianness::Little),
            Err(FrameError::HeaderDecode { len: 3 })
        ));
    }
}
