//! rrlink Wire Layer
//!
//! This module provides the frame codec used by both channels to a device.
//!
//! # Architecture
//!
//! - **Framing**: fixed header, encrypted payload, CRC32 trailer
//! - **Cipher**: selected by the frame version tag (see [`PayloadCipher`])
//! - **Local socket**: frames are additionally length-prefixed
//!
//! # Components
//!
//! - **[`FrameCodec`]**: Encode messages and decode byte buffers
//! - **[`FrameDecoder`]**: Incremental decoder owning the carried-over tail
//! - **[`V1Cipher`]**: AES-128-ECB payload cipher for version `1.0`
//!
//! # Example
//!
//! ```
//! use rrlink_common::protocol::{Message, Request};
//! use rrlink_common::transport::{FrameCodec, FrameDecoder};
//! use serde_json::json;
//!
//! let codec = FrameCodec::new("0123456789abcdef");
//! let message = Message::request(1, Request::new(1, "get_status", json!([])));
//! let bytes = codec.encode(&message).unwrap();
//!
//! let mut decoder = FrameDecoder::new(codec);
//! let decoded = decoder.decode_stream(&bytes);
//! assert_eq!(decoded[0].as_ref().unwrap(), &message);
//! ```

pub mod cipher;
pub mod codec;

pub use cipher::{PayloadCipher, V1Cipher};
pub use codec::{DecodeOutput, FrameCodec, FrameDecoder, Framing, MAX_FRAME_SIZE};

#[cfg(test)]
mod tests;
