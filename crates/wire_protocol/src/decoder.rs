//! Stream re-assembly.
//!
//! A connection's read path appends raw bytes to its [`FrameDecoder`]; complete
//! packets are peeled off the front. Bytes are only consumed once a whole
//! packet is buffered, so a packet split across any number of reads decodes
//! exactly as if it had arrived in one.

use crate::config::FrameConfig;
use crate::error::FrameError;
use crate::header::PacketHeader;
use bytes::{Buf, Bytes, BytesMut};

/// One framed packet with its body still sealed (possibly encrypted and
/// compressed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub header: PacketHeader,
    pub body: Bytes,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pops the next complete packet, or returns `Ok(None)` when more bytes
    /// are needed. Any error leaves the stream unusable.
    pub fn next_packet(&mut self, config: &FrameConfig) -> Result<Option<RawPacket>, FrameError> {
        let prefix = config.header_len_size;
        if self.buf.len() < prefix {
            return Ok(None);
        }

        let header_len = config.endianness.get_uint(&mut &self.buf[..prefix], prefix) as usize;
        if header_len > config.max_header_len {
            return Err(FrameError::HeaderTooLong {
                len: header_len,
                max: config.max_header_len,
            });
        }
        if header_len <= config.min_msg_len {
            return Err(FrameError::HeaderTooShort {
                len: header_len,
                min: config.min_msg_len,
            });
        }
        if self.buf.len() < prefix + header_len {
            return Ok(None);
        }

        let header_bytes = &self.buf[prefix..prefix + header_len];
        let header = PacketHeader::decode(header_bytes, config.endianness)?;
        let body_len = header.body_len as usize;
        if body_len > config.max_body_len {
            return Err(FrameError::BodyTooLong {
                len: body_len,
                max: config.max_body_len,
            });
        }
        if body_len < config.min_msg_len {
            return Err(FrameError::BodyTooShort {
                len: body_len,
                min: config.min_msg_len,
            });
        }
        if self.buf.len() < prefix + header_len + body_len {
            return Ok(None);
        }

        self.buf.advance(prefix + header_len);
        let body = self.buf.split_to(body_len).freeze();
        Ok(Some(RawPacket { header, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endianness;

    fn frame(
        config: &FrameConfig,
        header_len: usize,
        header: PacketHeader,
        body: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        config
            .endianness
            .put_uint(&mut out, header_len as u64, config.header_len_size);
        let mut encoded = Vec::new();
        header.encode(config.endianness, &mut encoded);
        encoded.resize(header_len, 0);
        out.extend_from_slice(&encoded);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn zero_header_length_is_too_short() {
        let config = FrameConfig::default();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0]);
        assert!(matches!(
            decoder.next_packet(&config),
            Err(FrameError::HeaderTooShort { len: 0, .. })
        ));
    }

    #[test]
    fn header_length_bound_comes_from_config() {
        let config = FrameConfig {
            max_header_len: 1000,
            ..FrameConfig::default()
        };
        let bytes = frame(&config, 255, PacketHeader::new(5, 3, false), b"abc");
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let packet = decoder.next_packet(&config).unwrap().unwrap();
        assert_eq!(packet.header.msg_id, 5);
        assert_eq!(&packet.body[..], b"abc");
        assert_eq!(decoder.buffered(), 0);

        let strict = FrameConfig {
            max_header_len: 100,
            ..FrameConfig::default()
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert!(matches!(
            decoder.next_packet(&strict),
            Err(FrameError::HeaderTooLong { len: 255, max: 100 })
        ));
    }

    #[test]
    fn body_bounds_are_enforced_and_empty_body_is_legal() {
        let config = FrameConfig {
            max_body_len: 4,
            ..FrameConfig::default()
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame(&config, 9, PacketHeader::new(1, 0, false), b""));
        let packet = decoder.next_packet(&config).unwrap().unwrap();
        assert!(packet.body.is_empty());

        decoder.extend(&frame(&config, 9, PacketHeader::new(2, 5, false), b"12345"));
        assert!(matches!(
            decoder.next_packet(&config),
            Err(FrameError::BodyTooLong { len: 5, max: 4 })
        ));
    }

    #[test]
    fn partial_packets_stay_buffered() {
        let config = FrameConfig {
            header_len_size: 2,
            endianness: Endianness::Big,
            ..FrameConfig::default()
        };
        let bytes = frame(&config, 9, PacketHeader::new(9, 4, false), b"wxyz");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&bytes[..1]);
        assert!(decoder.next_packet(&config).unwrap().is_none());
        decoder.extend(&bytes[1..8]);
        assert!(decoder.next_packet(&config).unwrap().is_none());
        decoder.extend(&bytes[8..bytes.len() - 1]);
        assert!(decoder.next_packet(&config).unwrap().is_none());
        assert_eq!(decoder.buffered(), bytes.len() - 1);

        decoder.extend(&bytes[bytes.len() - 1..]);
        let packet = decoder.next_packet(&config).unwrap().unwrap();
        assert_eq!(&packet.body[..], b"wxyz");
    }

    #[test]
    fn header_shorter_than_fixed_fields_fails_decode() {
        let config = FrameConfig::default();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[4, 1, 0, 0, 0]);
        assert!(matches!(
            decoder.next_packet(&config),
            Err(FrameError::HeaderDecode { len: 4 })
        ));
    }
}
