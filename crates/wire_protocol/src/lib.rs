//! # Wire Protocol
//!
//! Length-prefixed packet framing for stream transports, with optional zlib
//! compression and optional per-connection AES-128-CBC encryption.
//!
//! ## Packet Layout
//!
//! ```text
//! [ header length: N bytes ][ header: header-length bytes ][ body: body-length bytes ]
//! ```
//!
//! `N` is 1, 2 or 4 bytes and every integer uses the configured endianness.
//! The header carries the message id, the body length and a compressed flag;
//! see [`PacketHeader`].
//!
//! ## Receive Path
//!
//! Bytes read from a connection accumulate in a [`FrameDecoder`]. The
//! [`MessageProcessor`] peels complete packets off the front, at most
//! [`FrameConfig::max_packets_per_read`] per read event, decrypts and then
//! inflates each body, and hands `(msg_id, body)` to the caller.
//!
//! ## Send Path
//!
//! Bodies are compressed when they reach [`FrameConfig::min_compress_size`] and
//! compression helps, encrypted when the deployment requires it, framed, and
//! queued as one unit on a [`MessageSink`] such as [`SendQueue`].
//!
//! Any [`FrameError`] on a connection is fatal for that connection.

pub mod compress;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod decoder;
pub mod error;
pub mod header;
pub mod processor;

pub use config::{Endianness, FrameConfig};
pub use conn::{MessageSink, SendQueue};
pub use crypto::CipherKey;
pub use decoder::{FrameDecoder, RawPacket};
pub use error::{ConnError, FrameError};
pub use header::{PacketHeader, HEADER_SIZE};
pub use processor::MessageProcessor;
