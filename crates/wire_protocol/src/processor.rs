//! The message processor: turns framed bytes into messages and back.

use crate::compress;
use crate::config::FrameConfig;
use crate::conn::MessageSink;
use crate::crypto::CipherKey;
use crate::decoder::{FrameDecoder, RawPacket};
use crate::error::FrameError;
use crate::header::{PacketHeader, HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

const SLOW_CODEC: Duration = Duration::from_millis(5);

fn note_slow(op: &'static str, msg_id: u32, len: usize, started: Instant) {
    let elapsed = started.elapsed();
    if elapsed > SLOW_CODEC {
        warn!(op, msg_id, len, elapsed_us = elapsed.as_micros() as u64, "slow codec operation");
    }
}

/// Stateless framing logic shared by every connection of a listener.
#[derive(Debug, Clone)]
pub struct MessageProcessor {
    config: FrameConfig,
}

impl MessageProcessor {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Undoes the send path on one packet: decrypt first, then inflate.
    pub fn open(
        &self,
        packet: RawPacket,
        key: Option<&CipherKey>,
    ) -> Result<(u32, Bytes), FrameError> {
        let RawPacket { header, body } = packet;
        let mut body = body;

        if self.config.encrypt && !body.is_empty() {
            let key = key.ok_or(FrameError::MissingKey)?;
            let started = Instant::now();
            body = Bytes::from(key.decrypt(&body)?);
            note_slow("decrypt", header.msg_id, body.len(), started);
        }
        if header.compressed {
            let started = Instant::now();
            body = Bytes::from(compress::decompress(&body, self.config.max_decompressed_len)?);
            note_slow("decompress", header.msg_id, body.len(), started);
        }
        Ok((header.msg_id, body))
    }

    /// Decodes and dispatches up to `max_packets_per_read` buffered packets.
    ///
    /// `handler` returning `false` aborts with [`FrameError::HandlerRejected`].
    /// Packets beyond the cap stay buffered for the next call.
    pub fn decode_batch<F>(
        &self,
        decoder: &mut FrameDecoder,
        key: Option<&CipherKey>,
        mut handler: F,
    ) -> Result<usize, FrameError>
    where
        F: FnMut(u32, Bytes) -> bool,
    {
        let mut dispatched = 0;
        while dispatched < self.config.max_packets_per_read {
            let Some(packet) = decoder.next_packet(&self.config)? else {
                break;
            };
            let (msg_id, body) = self.open(packet, key)?;
            dispatched += 1;
            if !handler(msg_id, body) {
                return Err(FrameError::HandlerRejected { msg_id });
            }
        }
        Ok(dispatched)
    }

    /// Decodes a batch of packets, reading from `reader` only when no whole
    /// packet is buffered.
    ///
    /// Packets left over by an earlier capped batch are served first, so a
    /// burst larger than `max_packets_per_read` never waits for more input.
    /// Returns [`FrameError::ConnectionClosed`] on EOF.
    pub async fn read_from<R, F>(
        &self,
        reader: &mut R,
        decoder: &mut FrameDecoder,
        key: Option<&CipherKey>,
        mut handler: F,
    ) -> Result<usize, FrameError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(u32, Bytes) -> bool,
    {
        if decoder.buffered() > 0 {
            let dispatched = self.decode_batch(decoder, key, &mut handler)?;
            if dispatched > 0 {
                // Let other connections run between back-to-back batches.
                tokio::task::yield_now().await;
                return Ok(dispatched);
            }
        }
        let buf = decoder.buffer_mut();
        buf.reserve(self.config.read_buffer_size);
        if reader.read_buf(buf).await? == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        self.decode_batch(decoder, key, handler)
    }

    /// Compresses `body` when it is at least `min_compress_size` bytes and
    /// compression actually shrinks it. Returns the body to send and whether
    /// it is compressed.
    pub fn compress_body(&self, msg_id: u32, body: &[u8]) -> Result<(Vec<u8>, bool), FrameError> {
        let threshold = self.config.min_compress_size;
        if threshold == 0 || body.len() < threshold {
            return Ok((body.to_vec(), false));
        }
        let started = Instant::now();
        let packed = compress::compress(body)?;
        note_slow("compress", msg_id, body.len(), started);
        if packed.len() < body.len() {
            Ok((packed, true))
        } else {
            Ok((body.to_vec(), false))
        }
    }

    /// Serializes `msg` and compresses it once, for sending to many
    /// connections with [`MessageProcessor::write_precompressed`].
    pub fn compress_message<M: Serialize>(
        &self,
        msg_id: u32,
        msg: &M,
    ) -> Result<(Vec<u8>, bool), FrameError> {
        let body = serde_json::to_vec(msg)?;
        self.compress_body(msg_id, &body)
    }

    /// Encrypts (when configured) and frames an already compressed body.
    pub fn seal(
        &self,
        msg_id: u32,
        body: &[u8],
        compressed: bool,
        key: Option<&CipherKey>,
    ) -> Result<Bytes, FrameError> {
        let encrypted;
        let body = if self.config.encrypt && !body.is_empty() {
            let key = key.ok_or(FrameError::MissingKey)?;
            let started = Instant::now();
            encrypted = key.encrypt(body);
            note_slow("encrypt", msg_id, body.len(), started);
            &encrypted[..]
        } else {
            body
        };

        if body.len() > self.config.max_body_len {
            return Err(FrameError::BodyTooLong {
                len: body.len(),
                max: self.config.max_body_len,
            });
        }

        let prefix = self.config.header_len_size;
        let mut frame = BytesMut::with_capacity(prefix + HEADER_SIZE + body.len());
        self.config
            .endianness
            .put_uint(&mut frame, HEADER_SIZE as u64, prefix);
        PacketHeader::new(msg_id, body.len() as u32, compressed)
            .encode(self.config.endianness, &mut frame);
        frame.put_slice(body);
        Ok(frame.freeze())
    }

    /// Full send path for a raw body: compress, encrypt, frame.
    pub fn encode(
        &self,
        msg_id: u32,
        body: &[u8],
        key: Option<&CipherKey>,
    ) -> Result<Bytes, FrameError> {
        let (body, compressed) = self.compress_body(msg_id, body)?;
        self.seal(msg_id, &body, compressed, key)
    }

    /// Serializes `msg` and queues it on `conn` as one frame.
    pub fn write_message<C, M>(
        &self,
        conn: &C,
        msg_id: u32,
        msg: &M,
        key: Option<&CipherKey>,
    ) -> Result<(), FrameError>
    where
        C: MessageSink + ?Sized,
        M: Serialize,
    {
        let body = serde_json::to_vec(msg)?;
        self.write_body(conn, msg_id, &body, key)
    }

    pub fn write_body<C>(
        &self,
        conn: &C,
        msg_id: u32,
        body: &[u8],
        key: Option<&CipherKey>,
    ) -> Result<(), FrameError>
    where
        C: MessageSink + ?Sized,
    {
        let frame = self.encode(msg_id, body, key)?;
        conn.write(frame)?;
        Ok(())
    }

    /// Queues a body produced by [`MessageProcessor::compress_message`].
    pub fn write_precompressed<C>(
        &self,
        conn: &C,
        msg_id: u32,
        body: &[u8],
        compressed: bool,
        key: Option<&CipherKey>,
    ) -> Result<(), FrameError>
    where
        C: MessageSink + ?Sized,
    {
        let frame = self.seal(msg_id, body, compressed, key)?;
        conn.write(frame)?;
        Ok(())
    }
}
