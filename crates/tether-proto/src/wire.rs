// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Binary frame codec.
//!
//! Layout: `[tag u8][seq u32 BE][tick u64 BE][origin_len u16 BE][origin]
//! [body_len u16 BE][body]`. The high bit of the tag marks an lz4-compressed
//! body; the remaining bits are the [`MsgKind`] tag. Bytes are opaque to the
//! transport.

use bytes::Bytes;

use crate::body::MsgKind;

/// Tag bit set on frames whose body is lz4-compressed.
pub const COMPRESSED_BIT: u8 = 0x80;

/// Fixed header length before the origin bytes.
const FIXED_HEADER: usize = 1 + 4 + 8 + 2;

/// Failures encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Input ended before the frame was complete.
    #[error("truncated frame")]
    Truncated,
    /// The tag (compression bit cleared) names no message kind.
    #[error("unknown message kind tag {0:#04x}")]
    UnknownKind(u8),
    /// The origin field was empty.
    #[error("empty origin")]
    EmptyOrigin,
    /// The origin id did not fit a u16 length.
    #[error("origin id longer than {max} bytes", max = u16::MAX)]
    OriginTooLong,
    /// The origin bytes were not UTF-8.
    #[error("origin is not valid utf-8")]
    OriginNotUtf8,
    /// The body (after optional compression) did not fit a u16 length.
    #[error("body longer than {max} bytes", max = u16::MAX)]
    BodyTooLong,
    /// Compression or decompression failed.
    #[error("lz4: {0}")]
    Compression(String),
}

/// A decoded frame: message kind plus transport metadata and body bytes.
///
/// The body here is always the uncompressed canonical body encoding;
/// compression is applied and stripped at the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message kind.
    pub kind: MsgKind,
    /// Per-origin monotonic sequence number.
    pub seq: u32,
    /// Tick the frame was produced at.
    pub tick: u64,
    /// Originating peer id.
    pub origin: String,
    /// Canonical body bytes (uncompressed).
    pub body: Bytes,
}

impl Frame {
    /// Encodes the frame, compressing the body when it exceeds
    /// `compression_threshold` bytes (`None` disables compression).
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the origin is empty or a length field
    /// overflows.
    pub fn encode(&self, compression_threshold: Option<usize>) -> Result<Vec<u8>, WireError> {
        if self.origin.is_empty() {
            return Err(WireError::EmptyOrigin);
        }
        let origin = self.origin.as_bytes();
        let origin_len = u16::try_from(origin.len()).map_err(|_| WireError::OriginTooLong)?;

        let mut tag = self.kind.tag();
        let compress = compression_threshold.is_some_and(|t| self.body.len() > t);
        let body: Vec<u8> = if compress {
            tag |= COMPRESSED_BIT;
            lz4::block::compress(&self.body, None, true)
                .map_err(|e| WireError::Compression(e.to_string()))?
        } else {
            self.body.to_vec()
        };
        let body_len = u16::try_from(body.len()).map_err(|_| WireError::BodyTooLong)?;

        let mut out = Vec::with_capacity(FIXED_HEADER + origin.len() + 2 + body.len());
        out.push(tag);
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.tick.to_be_bytes());
        out.extend_from_slice(&origin_len.to_be_bytes());
        out.extend_from_slice(origin);
        out.extend_from_slice(&body_len.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes one frame from the front of `bytes`, returning it and the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] for truncated input, unknown kinds, empty or
    /// non-UTF-8 origins, and failed decompression.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        if bytes.len() < FIXED_HEADER {
            return Err(WireError::Truncated);
        }
        let tag = bytes[0];
        let compressed = tag & COMPRESSED_BIT != 0;
        let kind_tag = tag & !COMPRESSED_BIT;
        let kind = MsgKind::from_tag(kind_tag).ok_or(WireError::UnknownKind(kind_tag))?;

        let seq = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let tick = u64::from_be_bytes([
            bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11], bytes[12],
        ]);
        let origin_len = usize::from(u16::from_be_bytes([bytes[13], bytes[14]]));
        if origin_len == 0 {
            return Err(WireError::EmptyOrigin);
        }
        let origin_end = FIXED_HEADER + origin_len;
        if bytes.len() < origin_end + 2 {
            return Err(WireError::Truncated);
        }
        let origin = std::str::from_utf8(&bytes[FIXED_HEADER..origin_end])
            .map_err(|_| WireError::OriginNotUtf8)?
            .to_owned();

        let body_len =
            usize::from(u16::from_be_bytes([bytes[origin_end], bytes[origin_end + 1]]));
        let body_start = origin_end + 2;
        let body_end = body_start + body_len;
        if bytes.len() < body_end {
            return Err(WireError::Truncated);
        }
        let raw = &bytes[body_start..body_end];
        let body = if compressed {
            Bytes::from(
                lz4::block::decompress(raw, None)
                    .map_err(|e| WireError::Compression(e.to_string()))?,
            )
        } else {
            Bytes::copy_from_slice(raw)
        };

        Ok((
            Self {
                kind,
                seq,
                tick,
                origin,
                body,
            },
            body_end,
        ))
    }
}
