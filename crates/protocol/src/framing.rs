//! Length-prefixed framing for envelopes on a byte stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "TBRK"
//! - 4 bytes: content length (big-endian, includes flags byte)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: MessagePack envelope (possibly LZ4 compressed)
//!
//! Payloads larger than [`COMPRESSION_THRESHOLD`] are compressed with LZ4
//! when that actually makes them smaller. Session lists are the usual case.

use crate::error::{ProtocolError, Result};
use crate::messages::Envelope;

/// Magic bytes identifying a broker frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TBRK";

/// Compression threshold in bytes. Payloads larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum frame size (1 MB). Envelopes are small control messages.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size: 4 (magic) + 4 (length) + 1 (flags) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Flags carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    #[inline]
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        if compressed {
            self.0 |= Self::COMPRESSED;
        } else {
            self.0 &= !Self::COMPRESSED;
        }
        self
    }
}

/// Encoder and decoder for envelope frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with compression enabled.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Create a codec that never compresses.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Serialize an envelope and wrap it in a frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payload = envelope.to_msgpack()?;
        self.encode_bytes(&payload)
    }

    /// Wrap raw bytes in a frame.
    pub fn encode_bytes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut flags = FrameFlags::new();
        let compressed;
        let body: &[u8] = if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            compressed = lz4_flex::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                flags = flags.with_compressed(true);
                &compressed
            } else {
                payload
            }
        } else {
            payload
        };

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(8 + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);
        Ok(output)
    }

    /// Try to decode one envelope from the front of `data`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, otherwise the
    /// envelope and the number of bytes consumed.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Envelope, usize)>> {
        match self.try_decode_bytes(data)? {
            Some((payload, consumed)) => Ok(Some((Envelope::from_msgpack(&payload)?, consumed))),
            None => Ok(None),
        }
    }

    /// Frame-level decode without interpreting the payload.
    pub fn try_decode_bytes(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        if data[0..4] != FRAME_MAGIC {
            let expected = u32::from_be_bytes(FRAME_MAGIC);
            let got = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            return Err(ProtocolError::Deserialization(format!(
                "invalid frame magic: expected 0x{:08x} (TBRK), got 0x{:08x}",
                expected, got
            )));
        }

        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        let total = 8 + content_len;
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must be at least 1 for flags byte".to_string(),
            ));
        }
        if data.len() < total {
            return Ok(None);
        }

        let flags = FrameFlags::from_byte(data[8]);
        let body = &data[9..total];
        let payload = if flags.is_compressed() {
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })?
        } else {
            body.to_vec()
        };

        Ok(Some((payload, total)))
    }
}

/// Accumulates stream bytes and yields complete envelopes.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete envelope, if any.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        match self.codec.try_decode(&self.buf)? {
            Some((envelope, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Payload, SessionKindTag, SessionSummary};
    use crate::opcode::Opcode;

    fn big_session_list() -> Envelope {
        let sessions = (0..64)
            .map(|i| SessionSummary {
                id: i,
                kind: SessionKindTag::Shell,
                name: format!("SHELL [LOCAL: pid={}]", 1000 + i),
                pid: 1000 + i as u32,
                running: true,
                exit_status: 0,
                tracked_identity: None,
            })
            .collect();
        Envelope::new(Opcode::SESSION_LIST).with_payload(Payload::Sessions(sessions))
    }

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new();
        assert!(!flags.is_compressed());
        let flags = flags.with_compressed(true);
        assert!(flags.is_compressed());
        assert_eq!(flags.as_byte(), 0b0000_0001);
        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
    }

    #[test]
    fn test_small_envelope_is_not_compressed() {
        let codec = FrameCodec::new();
        let env = Envelope::new(Opcode::REGISTER_CLIENT);
        let encoded = codec.encode(&env).unwrap();

        assert_eq!(&encoded[0..4], b"TBRK");
        assert_eq!(encoded[8], 0);

        let (decoded, consumed) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_large_session_list_is_compressed() {
        let codec = FrameCodec::new();
        let env = big_session_list();
        let encoded = codec.encode(&env).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x01, "compression flag should be set");

        let (decoded, _) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_without_compression() {
        let codec = FrameCodec::without_compression();
        let encoded = codec.encode(&big_session_list()).unwrap();
        assert_eq!(encoded[8] & 0x01, 0x00);
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Envelope::new(Opcode::IS_SERVER_ALIVE)).unwrap();
        for i in 0..encoded.len() {
            assert!(codec.try_decode(&encoded[..i]).unwrap().is_none(), "len={}", i);
        }
    }

    #[test]
    fn test_invalid_magic() {
        let codec = FrameCodec::new();
        let mut bad = b"BAD!".to_vec();
        bad.extend_from_slice(&5u32.to_be_bytes());
        bad.push(0);
        bad.extend_from_slice(&[1, 2, 3, 4]);

        let err = codec.try_decode(&bad).unwrap_err();
        assert!(err.to_string().contains("invalid frame magic"));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let codec = FrameCodec::new();
        let mut bad = FRAME_MAGIC.to_vec();
        bad.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        bad.push(0);

        let err = codec.try_decode(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_corrupted_compressed_body() {
        let codec = FrameCodec::new();
        let mut bad = FRAME_MAGIC.to_vec();
        bad.extend_from_slice(&10u32.to_be_bytes());
        bad.push(0x01);
        bad.extend_from_slice(&[0xFF; 9]);

        let err = codec.try_decode(&bad).unwrap_err();
        assert!(err.to_string().contains("decompress"));
    }

    #[test]
    fn test_frame_buffer_splits_stream() {
        let codec = FrameCodec::new();
        let first = Envelope::new(Opcode::REGISTER_CLIENT);
        let second = Envelope::new(Opcode::START_TERMINAL).with_args(1, 2);

        let mut stream = codec.encode(&first).unwrap();
        stream.extend(codec.encode(&second).unwrap());

        let mut buffer = FrameBuffer::new();
        let (head, tail) = stream.split_at(5);
        buffer.extend(head);
        assert!(buffer.next_envelope().unwrap().is_none());

        buffer.extend(tail);
        assert_eq!(buffer.next_envelope().unwrap(), Some(first));
        assert_eq!(buffer.next_envelope().unwrap(), Some(second));
        assert!(buffer.next_envelope().unwrap().is_none());
        assert_eq!(buffer.pending(), 0);
    }
}
