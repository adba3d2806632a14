//! Length-prefixed frames with optional LZ4 compression.
//!
//! ```text
//! ┌────────┬──────────────┬───────┬─────────────────────┐
//! │ "NTIO" │ len (BE u32) │ flags │ payload (len-1)     │
//! └────────┴──────────────┴───────┴─────────────────────┘
//! ```
//!
//! `len` counts the flags byte plus the payload. Bit 0 of `flags` marks an
//! LZ4 payload (size-prepended block). Frames are read and written through
//! [`crate::io::read_frame`] and [`crate::io::write_frame`].

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a netio frame.
pub const FRAME_MAGIC: [u8; 4] = *b"NTIO";

/// Payloads larger than this are compressed when the codec allows it.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum frame size (16 MB), prefix included.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Magic plus length.
pub const FRAME_PREFIX_SIZE: usize = 8;

/// Prefix plus flags byte.
pub const FRAME_HEADER_SIZE: usize = FRAME_PREFIX_SIZE + 1;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// One decoded frame. The payload is always held uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// Validates the magic and length prefix, returning the content length
/// (flags byte plus payload).
pub(crate) fn parse_prefix(prefix: &[u8; FRAME_PREFIX_SIZE]) -> Result<usize> {
    if prefix[..4] != FRAME_MAGIC {
        return Err(ProtocolError::InvalidFrameMagic {
            expected: u32::from_be_bytes(FRAME_MAGIC),
            got: u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]),
        });
    }

    let content_len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if FRAME_PREFIX_SIZE + content_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: FRAME_PREFIX_SIZE + content_len,
            max: MAX_FRAME_SIZE,
        });
    }
    if content_len == 0 {
        return Err(ProtocolError::Deserialization(
            "invalid frame: content length must be at least 1 for flags byte".to_string(),
        ));
    }

    Ok(content_len)
}

/// Frame encoder and decoder.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl FrameCodec {
    /// Codec that compresses payloads above [`COMPRESSION_THRESHOLD`].
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Codec that never compresses. It still decodes compressed frames.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let compressed = (self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD)
            .then(|| lz4_flex::compress_prepend_size(payload))
            // Only worth it if it shrinks
            .filter(|compressed| compressed.len() < payload.len());

        let (body, flags) = match &compressed {
            Some(bytes) => (bytes.as_slice(), FLAG_COMPRESSED),
            None => (payload.as_slice(), 0),
        };

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(FRAME_PREFIX_SIZE + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags);
        output.extend_from_slice(body);

        Ok(output)
    }

    /// Decode the flags byte and payload that follow a validated prefix.
    pub(crate) fn decode_content(&self, content: &[u8]) -> Result<Frame> {
        let Some((&flags, body)) = content.split_first() else {
            return Err(ProtocolError::Deserialization(
                "invalid frame: missing flags byte".to_string(),
            ));
        };

        let payload = if flags & FLAG_COMPRESSED != 0 {
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })?
        } else {
            body.to_vec()
        };

        Ok(Frame::new(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{read_frame, write_frame};

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_frame_header_format() {
        let payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = FrameCodec::new().encode(&Frame::new(payload.clone())).unwrap();

        assert_eq!(&encoded[0..4], b"NTIO");
        assert_eq!(&encoded[4..8], &5u32.to_be_bytes());
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..], &payload[..]);
    }

    #[test]
    fn test_compression_threshold() {
        let codec = FrameCodec::new();

        let encoded = codec.encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD])).unwrap();
        assert_eq!(encoded[8] & FLAG_COMPRESSED, 0);

        let encoded = codec.encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD + 1])).unwrap();
        assert_eq!(encoded[8] & FLAG_COMPRESSED, FLAG_COMPRESSED);

        let encoded = FrameCodec::without_compression()
            .encode(&Frame::new(vec![0u8; COMPRESSION_THRESHOLD + 1]))
            .unwrap();
        assert_eq!(encoded[8] & FLAG_COMPRESSED, 0);
    }

    #[test]
    fn test_incompressible_payload_sent_plain() {
        // xorshift noise does not shrink under LZ4
        let mut state = 0x2545_F491u32;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();

        let encoded = FrameCodec::new().encode(&Frame::new(noise)).unwrap();
        assert_eq!(encoded[8] & FLAG_COMPRESSED, 0);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let err = FrameCodec::without_compression()
            .encode(&Frame::new(vec![0u8; MAX_FRAME_SIZE]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_frames_cross_a_stream_in_order() {
        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        let codec = FrameCodec::new();
        let payloads = [vec![], vec![1, 2, 3], patterned(2048)];

        for payload in &payloads {
            write_frame(&mut writer, &codec, &Frame::new(payload.clone()))
                .await
                .unwrap();
        }
        drop(writer);

        for payload in &payloads {
            let frame = read_frame(&mut reader, &codec).await.unwrap().unwrap();
            assert_eq!(&frame.payload, payload);
        }
        assert!(read_frame(&mut reader, &codec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plain_codec_reads_compressed_frames() {
        let payload = patterned(4096);
        let bytes = FrameCodec::new().encode(&Frame::new(payload.clone())).unwrap();
        assert_eq!(bytes[8] & FLAG_COMPRESSED, FLAG_COMPRESSED);

        let mut reader: &[u8] = &bytes;
        let frame = read_frame(&mut reader, &FrameCodec::without_compression())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_body() {
        let mut bytes = FRAME_MAGIC.to_vec();
        bytes.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());

        let mut reader: &[u8] = &bytes;
        let err = read_frame(&mut reader, &FrameCodec::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_zero_content_length_rejected() {
        let mut bytes = FRAME_MAGIC.to_vec();
        bytes.extend_from_slice(&0u32.to_be_bytes());

        let mut reader: &[u8] = &bytes;
        let err = read_frame(&mut reader, &FrameCodec::new()).await.unwrap_err();
        assert!(err.to_string().contains("flags byte"));
    }

    #[tokio::test]
    async fn test_corrupted_compressed_body_rejected() {
        let mut bytes = FRAME_MAGIC.to_vec();
        bytes.extend_from_slice(&10u32.to_be_bytes());
        bytes.push(FLAG_COMPRESSED);
        bytes.extend_from_slice(&[0xFF; 9]);

        let mut reader: &[u8] = &bytes;
        let err = read_frame(&mut reader, &FrameCodec::new()).await.unwrap_err();
        assert!(err.to_string().contains("decompress"));
    }
}
