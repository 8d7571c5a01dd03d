//! Framing and connection error types.

use thiserror::Error;

/// Errors raised while framing, sealing or opening packets.
///
/// Every variant except [`FrameError::InvalidConfig`] is fatal for the
/// connection it occurred on: once a stream is desynchronized there is no way
/// to find the next packet boundary, so the caller must close the connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("message header too long: {len} > {max}")]
    HeaderTooLong { len: usize, max: usize },

    #[error("message header too short: {len} <= {min}")]
    HeaderTooShort { len: usize, min: usize },

    #[error("message body too long: {len} > {max}")]
    BodyTooLong { len: usize, max: usize },

    #[error("message body too short: {len} < {min}")]
    BodyTooShort { len: usize, min: usize },

    #[error("cannot decode packet header from {len} bytes")]
    HeaderDecode { len: usize },

    #[error("connection requires encryption but no key is set")]
    MissingKey,

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("message body encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("handler rejected message {msg_id}")]
    HandlerRejected { msg_id: u32 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid frame configuration: {0}")]
    InvalidConfig(String),

    #[error("send failed: {0}")]
    Send(#[from] ConnError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the non-blocking connection write path.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    #[error("full write channel")]
    Full,

    #[error("closed write channel")]
    Closed,
}
