//! Stream-level tests for the frame codec
//!
//! These tests feed encoded streams through the decoder in arbitrary
//! chunks and with every single bit flipped.

#[cfg(test)]
mod tests {
    use crate::protocol::{Message, Request, Response, RrError};
    use crate::transport::{FrameCodec, FrameDecoder, Framing};
    use serde_json::json;

    const KEY: &str = "0123456789abcdef";

    fn messages() -> Vec<Message> {
        vec![
            Message::request(1, Request::new(1, "get_status", json!([])))
                .with_timestamp(1_700_000_001)
                .with_random(11),
            Message::response(2, Response::success(2, json!([{"battery": 87}])))
                .with_timestamp(1_700_000_002)
                .with_random(22),
            Message::request(3, Request::new(3, "app_start", json!({"clean_mop": 0})))
                .with_timestamp(1_700_000_003)
                .with_random(33),
        ]
    }

    fn encode_all(codec: &FrameCodec, messages: &[Message]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| codec.encode(m).unwrap())
            .collect()
    }

    fn assert_split_decoding(framing: Framing) {
        let codec = FrameCodec::new(KEY).with_framing(framing);
        let expected = messages();
        let stream = encode_all(&codec, &expected);

        for first in 0..=stream.len() {
            let second = (first + 17).min(stream.len());
            let mut decoder = FrameDecoder::new(codec.clone());
            let mut decoded = Vec::new();
            for chunk in [&stream[..first], &stream[first..second], &stream[second..]] {
                decoded.extend(decoder.decode_stream(chunk));
            }

            let decoded: Vec<Message> = decoded.into_iter().map(|m| m.unwrap()).collect();
            assert_eq!(decoded, expected, "split at {} / {}", first, second);
            assert!(decoder.remaining().is_empty());
        }
    }

    #[test]
    fn test_split_decoding_bare() {
        assert_split_decoding(Framing::Bare);
    }

    #[test]
    fn test_split_decoding_length_prefixed() {
        assert_split_decoding(Framing::LengthPrefixed);
    }

    #[test]
    fn test_byte_at_a_time() {
        let codec = FrameCodec::new(KEY).with_framing(Framing::LengthPrefixed);
        let expected = messages();
        let stream = encode_all(&codec, &expected);

        let mut decoder = FrameDecoder::new(codec);
        let mut decoded = Vec::new();
        for byte in &stream {
            decoded.extend(decoder.decode_stream(std::slice::from_ref(byte)));
        }
        let decoded: Vec<Message> = decoded.into_iter().map(|m| m.unwrap()).collect();
        assert_eq!(decoded, expected);
    }

    fn assert_bit_flips_detected(framing: Framing) {
        let codec = FrameCodec::new(KEY).with_framing(framing);
        let original = messages().remove(0);
        let frame = codec.encode(&original).unwrap();

        for bit in 0..frame.len() * 8 {
            let mut flipped = frame.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);

            let mut decoder = FrameDecoder::new(codec.clone());
            let mut results = decoder.decode_stream(&flipped);
            if let Some(err) = decoder.finish() {
                results.push(Err(err));
            }

            assert!(
                results.iter().all(|r| r.is_err()),
                "bit {} produced a valid message",
                bit
            );
            assert!(
                results
                    .iter()
                    .any(|r| matches!(r, Err(RrError::FrameCorrupt(_)))),
                "bit {} was not reported as corrupt",
                bit
            );
        }
    }

    #[test]
    fn test_every_bit_flip_is_corrupt_bare() {
        assert_bit_flips_detected(Framing::Bare);
    }

    #[test]
    fn test_every_bit_flip_is_corrupt_length_prefixed() {
        assert_bit_flips_detected(Framing::LengthPrefixed);
    }
}
