//! Frame codec shared by the local socket and the broker.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! ┌─────────┬─────┬────────┬───────────┬──────────┬─────────────┬─────────┬───────┐
//! │ version │ seq │ random │ timestamp │ protocol │ payload_len │ payload │ crc32 │
//! │   3B    │ 4B  │   4B   │    4B     │    2B    │     2B      │    N    │  4B   │
//! └─────────┴─────┴────────┴───────────┴──────────┴─────────────┴─────────┴───────┘
//! ```
//!
//! The checksum covers every byte before it. On the local socket each frame
//! is additionally preceded by a 4-byte length ([`Framing::LengthPrefixed`]).
//!
//! Decoding is incremental: [`FrameCodec::decode_stream`] consumes every
//! complete frame in a buffer and hands back the unconsumed tail, and
//! [`FrameDecoder`] owns that tail between reads.

use std::fmt;
use std::sync::Arc;

use crate::protocol::error::{Result, RrError};
use crate::protocol::{Message, Protocol};
use crate::transport::cipher::{PayloadCipher, V1Cipher};

/// Fixed header size (version through payload length).
pub const HEADER_LEN: usize = 19;

/// Trailing CRC32 size.
pub const CHECKSUM_LEN: usize = 4;

/// Local socket length prefix size.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame the header can describe.
pub const MAX_FRAME_SIZE: usize = HEADER_LEN + u16::MAX as usize + CHECKSUM_LEN;

/// How frames are delimited on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Frames follow each other directly (broker payloads).
    #[default]
    Bare,
    /// Each frame is preceded by its length as a `u32` (local socket).
    LengthPrefixed,
}

/// Result of one [`FrameCodec::decode_stream`] pass.
#[derive(Debug)]
pub struct DecodeOutput<'a> {
    /// One entry per complete frame, in stream order. Corrupt frames are
    /// reported as [`RrError::FrameCorrupt`] in their position.
    pub messages: Vec<Result<Message>>,
    /// Bytes of a trailing partial frame.
    pub remaining: &'a [u8],
}

enum Step {
    NeedMore,
    Frame {
        consumed: usize,
        result: Result<Message>,
    },
}

/// Encodes and decodes frames for one device key.
#[derive(Clone)]
pub struct FrameCodec {
    local_key: Arc<str>,
    cipher: Arc<dyn PayloadCipher>,
    framing: Framing,
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("local_key", &"*****")
            .field("version", &String::from_utf8_lossy(self.cipher.version()))
            .field("framing", &self.framing)
            .finish()
    }
}

impl FrameCodec {
    /// Creates a codec for the given device key using the `1.0` payload
    /// cipher and bare framing.
    pub fn new(local_key: impl Into<String>) -> Self {
        let local_key: String = local_key.into();
        Self {
            local_key: Arc::from(local_key),
            cipher: Arc::new(V1Cipher),
            framing: Framing::Bare,
        }
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encodes a message into wire bytes.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        let plaintext = message.encode_payload()?;
        let payload = self
            .cipher
            .encrypt(&plaintext, &self.local_key, message.timestamp)?;
        let payload_len = u16::try_from(payload.len()).map_err(|_| {
            RrError::InvalidRequest(format!("payload too large: {} bytes", payload.len()))
        })?;

        let mut out =
            Vec::with_capacity(LENGTH_PREFIX_LEN + HEADER_LEN + payload.len() + CHECKSUM_LEN);
        if self.framing == Framing::LengthPrefixed {
            out.extend_from_slice(&[0u8; LENGTH_PREFIX_LEN]);
        }
        let start = out.len();

        out.extend_from_slice(self.cipher.version());
        out.extend_from_slice(&message.seq.to_be_bytes());
        out.extend_from_slice(&message.random.to_be_bytes());
        out.extend_from_slice(&message.timestamp.to_be_bytes());
        out.extend_from_slice(&message.protocol.code().to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&payload);

        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_be_bytes());

        if self.framing == Framing::LengthPrefixed {
            let frame_len = (out.len() - LENGTH_PREFIX_LEN) as u32;
            out[..LENGTH_PREFIX_LEN].copy_from_slice(&frame_len.to_be_bytes());
        }

        Ok(out)
    }

    /// Decodes every complete frame in `buffer`.
    ///
    /// Never fails as a whole: corrupt frames are skipped and reported in
    /// place, and an incomplete trailing frame is returned in
    /// [`DecodeOutput::remaining`].
    pub fn decode_stream<'a>(&self, buffer: &'a [u8]) -> DecodeOutput<'a> {
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            match self.next_frame(&buffer[offset..]) {
                Step::NeedMore => break,
                Step::Frame { consumed, result } => {
                    if let Err(e) = &result {
                        tracing::warn!("discarding frame: {}", e);
                    }
                    offset += consumed;
                    messages.push(result);
                }
            }
        }

        DecodeOutput {
            messages,
            remaining: &buffer[offset..],
        }
    }

    fn next_frame(&self, buf: &[u8]) -> Step {
        match self.framing {
            Framing::Bare => self.next_bare(buf),
            Framing::LengthPrefixed => self.next_prefixed(buf),
        }
    }

    fn next_bare(&self, buf: &[u8]) -> Step {
        let version = self.cipher.version();
        let n = buf.len().min(version.len());
        if buf[..n] != version[..n] {
            let consumed = resync_offset(buf, version);
            return Step::Frame {
                consumed,
                result: Err(RrError::FrameCorrupt(format!(
                    "unknown frame version, skipped {} bytes",
                    consumed
                ))),
            };
        }

        if buf.len() < HEADER_LEN {
            return Step::NeedMore;
        }

        let total = HEADER_LEN + read_u16(buf, 17) as usize + CHECKSUM_LEN;
        if buf.len() < total {
            return Step::NeedMore;
        }

        Step::Frame {
            consumed: total,
            result: self.parse_frame(&buf[..total]),
        }
    }

    fn next_prefixed(&self, buf: &[u8]) -> Step {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Step::NeedMore;
        }

        let frame_len = read_u32(buf, 0) as usize;
        if frame_len > MAX_FRAME_SIZE {
            // The stream position can no longer be trusted; drop what we have
            return Step::Frame {
                consumed: buf.len(),
                result: Err(RrError::FrameCorrupt(format!(
                    "frame length {} exceeds maximum {}",
                    frame_len, MAX_FRAME_SIZE
                ))),
            };
        }

        let total = LENGTH_PREFIX_LEN + frame_len;
        if frame_len < HEADER_LEN + CHECKSUM_LEN {
            return Step::Frame {
                consumed: total.min(buf.len()),
                result: Err(RrError::FrameCorrupt(format!(
                    "frame length {} is shorter than the header",
                    frame_len
                ))),
            };
        }

        if buf.len() < total {
            return Step::NeedMore;
        }

        Step::Frame {
            consumed: total,
            result: self.parse_frame(&buf[LENGTH_PREFIX_LEN..total]),
        }
    }

    /// Parses exactly one frame. The checksum is verified before the
    /// payload is decrypted.
    fn parse_frame(&self, frame: &[u8]) -> Result<Message> {
        if frame.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(RrError::FrameCorrupt(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }

        if &frame[..3] != self.cipher.version() {
            return Err(RrError::FrameCorrupt(format!(
                "unsupported frame version {:?}",
                String::from_utf8_lossy(&frame[..3])
            )));
        }

        let payload_len = read_u16(frame, 17) as usize;
        if HEADER_LEN + payload_len + CHECKSUM_LEN != frame.len() {
            return Err(RrError::FrameCorrupt(format!(
                "declared payload length {} does not match frame size {}",
                payload_len,
                frame.len()
            )));
        }

        let (body, checksum) = frame.split_at(frame.len() - CHECKSUM_LEN);
        let expected = read_u32(checksum, 0);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(RrError::FrameCorrupt(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }

        let seq = read_u32(frame, 3);
        let random = read_u32(frame, 7);
        let timestamp = read_u32(frame, 11);
        let protocol = Protocol::from_code(read_u16(frame, 15));

        let plaintext =
            self.cipher
                .decrypt(&body[HEADER_LEN..], &self.local_key, timestamp)?;
        let body = Message::decode_payload(protocol, &plaintext)?;

        Ok(Message {
            seq,
            random,
            timestamp,
            protocol,
            body,
        })
    }
}

/// Stateful decoder that carries a partial frame between reads.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    /// Appends `data` to the carried tail and decodes every complete frame.
    pub fn decode_stream(&mut self, data: &[u8]) -> Vec<Result<Message>> {
        self.buffer.extend_from_slice(data);
        let (messages, consumed) = {
            let output = self.codec.decode_stream(&self.buffer);
            let consumed = self.buffer.len() - output.remaining.len();
            (output.messages, consumed)
        };
        self.buffer.drain(..consumed);
        messages
    }

    /// Bytes of an incomplete frame waiting for more data.
    pub fn remaining(&self) -> &[u8] {
        &self.buffer
    }

    /// Ends the stream. A leftover partial frame is reported as corrupt.
    pub fn finish(&mut self) -> Option<RrError> {
        if self.buffer.is_empty() {
            return None;
        }
        let len = self.buffer.len();
        self.buffer.clear();
        Some(RrError::FrameCorrupt(format!(
            "stream ended inside a frame ({} bytes pending)",
            len
        )))
    }
}

/// Finds the next position where `marker` could start, so decoding can
/// resume after garbage.
fn resync_offset(buf: &[u8], marker: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| {
            let rest = &buf[i..];
            let n = rest.len().min(marker.len());
            rest[..n] == marker[..n]
        })
        .unwrap_or(buf.len())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};
    use serde_json::json;

    const KEY: &str = "qWeRtYuIoP123456";

    fn request(id: u32) -> Message {
        Message::request(id, Request::new(id, "get_status", json!([])))
            .with_timestamp(1_700_000_000 + id)
            .with_random(0xdead_0000 + id)
    }

    #[test]
    fn test_round_trip_bare() {
        let codec = FrameCodec::new(KEY);
        let msg = request(1);
        let encoded = codec.encode(&msg).unwrap();

        let output = codec.decode_stream(&encoded);
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.messages[0].as_ref().unwrap(), &msg);
        assert!(output.remaining.is_empty());
    }

    #[test]
    fn test_round_trip_length_prefixed() {
        let codec = FrameCodec::new(KEY).with_framing(Framing::LengthPrefixed);
        let msg = Message::response(9, Response::success(9, json!(["ok"])))
            .with_timestamp(42)
            .with_random(7);
        let encoded = codec.encode(&msg).unwrap();
        assert_eq!(
            read_u32(&encoded, 0) as usize,
            encoded.len() - LENGTH_PREFIX_LEN
        );

        let output = codec.decode_stream(&encoded);
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.messages[0].as_ref().unwrap(), &msg);
        assert!(output.remaining.is_empty());
    }

    #[test]
    fn test_raw_protocol_round_trip() {
        let codec = FrameCodec::new(KEY);
        let msg = Message::raw(3, Protocol::Other(301), vec![0, 1, 2, 250])
            .with_timestamp(5)
            .with_random(6);
        let encoded = codec.encode(&msg).unwrap();
        let output = codec.decode_stream(&encoded);
        assert_eq!(output.messages[0].as_ref().unwrap(), &msg);
    }

    #[test]
    fn test_header_layout() {
        let codec = FrameCodec::new(KEY);
        let msg = request(0x0102_0304);
        let encoded = codec.encode(&msg).unwrap();

        assert_eq!(&encoded[..3], b"1.0");
        assert_eq!(read_u32(&encoded, 3), 0x0102_0304);
        assert_eq!(read_u32(&encoded, 11), msg.timestamp);
        assert_eq!(read_u16(&encoded, 15), 101);
        assert_eq!(
            read_u16(&encoded, 17) as usize,
            encoded.len() - HEADER_LEN - CHECKSUM_LEN
        );
    }

    #[test]
    fn test_partial_frame_is_kept() {
        let codec = FrameCodec::new(KEY);
        let encoded = codec.encode(&request(1)).unwrap();

        let output = codec.decode_stream(&encoded[..encoded.len() - 1]);
        assert!(output.messages.is_empty());
        assert_eq!(output.remaining.len(), encoded.len() - 1);
    }

    #[test]
    fn test_several_frames_and_tail() {
        let codec = FrameCodec::new(KEY);
        let mut stream = Vec::new();
        for id in 1..=3 {
            stream.extend(codec.encode(&request(id)).unwrap());
        }
        let fourth = codec.encode(&request(4)).unwrap();
        stream.extend_from_slice(&fourth[..10]);

        let output = codec.decode_stream(&stream);
        let ids: Vec<_> = output
            .messages
            .iter()
            .map(|m| m.as_ref().unwrap().id())
            .collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(output.remaining, &fourth[..10]);
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let sender = FrameCodec::new(KEY);
        let receiver = FrameCodec::new("another-device-k");
        let encoded = sender.encode(&request(1)).unwrap();

        let output = receiver.decode_stream(&encoded);
        assert_eq!(output.messages.len(), 1);
        assert!(matches!(
            output.messages[0],
            Err(RrError::FrameCorrupt(_))
        ));
        assert!(output.remaining.is_empty());
    }

    #[test]
    fn test_corrupt_frame_does_not_stop_stream() {
        let codec = FrameCodec::new(KEY);
        let mut first = codec.encode(&request(1)).unwrap();
        let last = first.len() - 1;
        first[last] ^= 0xff;
        let second = codec.encode(&request(2)).unwrap();

        let mut stream = first;
        stream.extend(second);
        let output = codec.decode_stream(&stream);

        assert_eq!(output.messages.len(), 2);
        assert!(matches!(output.messages[0], Err(RrError::FrameCorrupt(_))));
        assert_eq!(output.messages[1].as_ref().unwrap().id(), Some(2));
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let codec = FrameCodec::new(KEY);
        let mut stream = b"zzzz".to_vec();
        stream.extend(codec.encode(&request(8)).unwrap());

        let output = codec.decode_stream(&stream);
        assert_eq!(output.messages.len(), 2);
        assert!(output.messages[0].is_err());
        assert_eq!(output.messages[1].as_ref().unwrap().id(), Some(8));
    }

    #[test]
    fn test_oversized_prefix_is_corrupt() {
        let codec = FrameCodec::new(KEY).with_framing(Framing::LengthPrefixed);
        let mut stream = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes().to_vec();
        stream.extend_from_slice(&[0u8; 32]);

        let output = codec.decode_stream(&stream);
        assert_eq!(output.messages.len(), 1);
        assert!(output.messages[0].is_err());
        assert!(output.remaining.is_empty());
    }

    #[test]
    fn test_decoder_carries_tail() {
        let codec = FrameCodec::new(KEY).with_framing(Framing::LengthPrefixed);
        let encoded = codec.encode(&request(5)).unwrap();
        let mut decoder = FrameDecoder::new(codec);

        assert!(decoder.decode_stream(&encoded[..7]).is_empty());
        assert_eq!(decoder.remaining().len(), 7);

        let messages = decoder.decode_stream(&encoded[7..]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_ref().unwrap().id(), Some(5));
        assert!(decoder.remaining().is_empty());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_finish_reports_truncation() {
        let codec = FrameCodec::new(KEY);
        let encoded = codec.encode(&request(5)).unwrap();
        let mut decoder = FrameDecoder::new(codec);
        decoder.decode_stream(&encoded[..20]);

        assert!(matches!(decoder.finish(), Some(RrError::FrameCorrupt(_))));
        assert!(decoder.remaining().is_empty());
    }
}
