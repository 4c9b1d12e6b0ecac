// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Optional on-disk frame journal.
//!
//! Layout: a 16-byte header (8-byte magic, u16 format version, u16 tick
//! rate, 4 reserved bytes) followed by end-of-tick frames. Each frame is
//! `[tick u64 BE][count u32 BE]` then per entity `[id_len u16 BE][id]
//! [payload_len u32 BE][canonical payload]`, closed by a blake3 digest of
//! the frame bytes. Replay feeds frames back into a [`HistoryBuffer`].

use std::collections::BTreeMap;
use std::io::{Read, Write};

use tether_proto::{decode_payload, encode_payload, CanonError};

use crate::history::{HistoryBuffer, HistoryFrame};
use crate::ident::EntityId;

/// File magic for journal files.
pub const JOURNAL_MAGIC: [u8; 8] = *b"TETHRLOG";

/// Supported journal format version.
pub const JOURNAL_VERSION: u16 = 1;

const DIGEST_LEN: usize = 32;

/// Failures reading a journal.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file does not start with the journal magic.
    #[error("not a journal file")]
    BadMagic,
    /// The file's format version is newer than this build understands.
    #[error("unsupported journal version {0}")]
    UnsupportedVersion(u16),
    /// The file ended mid-frame.
    #[error("truncated journal")]
    Truncated,
    /// A payload was not canonical.
    #[error(transparent)]
    Canon(#[from] CanonError),
    /// A frame's digest did not match its bytes.
    #[error("frame digest mismatch at tick {tick}")]
    DigestMismatch {
        /// Tick of the corrupt frame.
        tick: u64,
    },
}

/// Parsed journal header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// Format version.
    pub version: u16,
    /// Tick rate the session ran at, in Hz.
    pub tick_rate: u16,
}

/// Streaming journal writer.
#[derive(Debug)]
pub struct JournalWriter<W: Write> {
    out: W,
}

impl<W: Write> JournalWriter<W> {
    /// Writes the header and returns the writer.
    ///
    /// # Errors
    ///
    /// Propagates io failures.
    pub fn create(mut out: W, tick_rate: u16) -> std::io::Result<Self> {
        out.write_all(&JOURNAL_MAGIC)?;
        out.write_all(&JOURNAL_VERSION.to_be_bytes())?;
        out.write_all(&tick_rate.to_be_bytes())?;
        out.write_all(&[0u8; 4])?;
        Ok(Self { out })
    }

    /// Appends one end-of-tick frame.
    ///
    /// # Errors
    ///
    /// Propagates io failures.
    pub fn append_frame(&mut self, frame: &HistoryFrame) -> std::io::Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&frame.tick.to_be_bytes());
        buf.extend_from_slice(&u32::try_from(frame.changed.len()).unwrap_or(u32::MAX).to_be_bytes());
        for (id, payload) in &frame.changed {
            let id_bytes = id.as_str().as_bytes();
            buf.extend_from_slice(&u16::try_from(id_bytes.len()).unwrap_or(u16::MAX).to_be_bytes());
            buf.extend_from_slice(id_bytes);
            let encoded = encode_payload(payload);
            buf.extend_from_slice(&u32::try_from(encoded.len()).unwrap_or(u32::MAX).to_be_bytes());
            buf.extend_from_slice(&encoded);
        }
        let digest: [u8; DIGEST_LEN] = blake3::hash(&buf).into();
        self.out.write_all(&buf)?;
        self.out.write_all(&digest)?;
        Ok(())
    }

    /// Unwraps the underlying writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads and verifies an entire journal.
///
/// # Errors
///
/// Returns a [`JournalError`] for io failures, bad magic or version,
/// truncation, non-canonical payloads, or digest mismatches.
pub fn read_journal<R: Read>(mut input: R) -> Result<(JournalHeader, Vec<HistoryFrame>), JournalError> {
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    decode_journal(&bytes)
}

/// Parses journal bytes.
///
/// # Errors
///
/// Same failure modes as [`read_journal`], minus io.
pub fn decode_journal(bytes: &[u8]) -> Result<(JournalHeader, Vec<HistoryFrame>), JournalError> {
    if bytes.len() < 16 {
        return Err(JournalError::Truncated);
    }
    if bytes[..8] != JOURNAL_MAGIC {
        return Err(JournalError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[8], bytes[9]]);
    if version != JOURNAL_VERSION {
        return Err(JournalError::UnsupportedVersion(version));
    }
    let tick_rate = u16::from_be_bytes([bytes[10], bytes[11]]);

    let mut frames = Vec::new();
    let mut idx = 16usize;
    while idx < bytes.len() {
        let frame_start = idx;
        let tick = u64::from_be_bytes(take(bytes, &mut idx, 8)?.try_into().map_err(|_| JournalError::Truncated)?);
        let count = u32::from_be_bytes(take(bytes, &mut idx, 4)?.try_into().map_err(|_| JournalError::Truncated)?);
        let mut changed = BTreeMap::new();
        for _ in 0..count {
            let id_len = u16::from_be_bytes(
                take(bytes, &mut idx, 2)?.try_into().map_err(|_| JournalError::Truncated)?,
            );
            let id_raw = take(bytes, &mut idx, usize::from(id_len))?;
            let id = std::str::from_utf8(id_raw)
                .map_err(|_| JournalError::Canon(CanonError::InvalidUtf8))?;
            let payload_len = u32::from_be_bytes(
                take(bytes, &mut idx, 4)?.try_into().map_err(|_| JournalError::Truncated)?,
            );
            let payload_raw = take(bytes, &mut idx, payload_len as usize)?;
            let payload = decode_payload(payload_raw)?;
            changed.insert(EntityId::from(id), payload);
        }
        let body = &bytes[frame_start..idx];
        let expected: [u8; DIGEST_LEN] = blake3::hash(body).into();
        let digest = take(bytes, &mut idx, DIGEST_LEN)?;
        if digest != expected.as_slice() {
            return Err(JournalError::DigestMismatch { tick });
        }
        frames.push(HistoryFrame { tick, changed });
    }
    Ok((JournalHeader { version, tick_rate }, frames))
}

fn take<'a>(bytes: &'a [u8], idx: &mut usize, len: usize) -> Result<&'a [u8], JournalError> {
    let end = idx.checked_add(len).ok_or(JournalError::Truncated)?;
    if end > bytes.len() {
        return Err(JournalError::Truncated);
    }
    let out = &bytes[*idx..end];
    *idx = end;
    Ok(out)
}

/// Feeds recorded frames back into a history buffer, oldest first.
pub fn replay_into(history: &mut HistoryBuffer, frames: Vec<HistoryFrame>) {
    for frame in frames {
        history.push_frame(frame);
    }
}
