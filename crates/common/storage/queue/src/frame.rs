// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! On-disk frame format.
//!
//! Records are stored contiguously in data files, one frame per record:
//!
//! ```text
//! ┌──────────────────┬───────────────┬───────────────┬─────────────┬─────────┐
//! │ SequencingId (8B)│ Length (4B)   │ Digest (32B)  │ CRC32 (4B)  │ Payload │
//! │ i64 LE           │ u32 LE        │ SHA-256       │ u32 LE      │         │
//! └──────────────────┴───────────────┴───────────────┴─────────────┴─────────┘
//! ```
//!
//! - **SequencingId**: id assigned when the record was appended
//! - **Length**: size of the payload that follows the header
//! - **Digest**: link of the record digest chain for this record
//! - **CRC32**: checksum over the three fields above and the payload
//!
//! The length prefix allows skipping a damaged payload and resuming at the
//! next frame; the checksum makes sure a damaged frame is never accepted.

use snafu::ensure;

use crate::{
    crc::{calculate_frame_crc, verify_frame_crc},
    error::{CorruptFrameSnafu, Result},
    record::{DIGEST_SIZE, RecordDigest},
};

const SEQUENCING_ID_SIZE: usize = 8;
const LENGTH_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// Size of the fixed frame header in bytes.
pub(crate) const FRAME_HEADER_SIZE: usize =
    SEQUENCING_ID_SIZE + LENGTH_SIZE + DIGEST_SIZE + CRC_SIZE;

/// Total on-disk size of a frame carrying `payload_len` bytes.
#[inline]
pub(crate) const fn frame_disk_size(payload_len: usize) -> usize {
    FRAME_HEADER_SIZE + payload_len
}

/// Parsed frame header.
///
/// Nothing in a header is trusted until [`FrameHeader::verify`] accepts the
/// payload that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub sequencing_id: i64,
    pub payload_len:   u32,
    pub digest:        RecordDigest,
    pub crc:           u32,
}

impl FrameHeader {
    /// Parses the first [`FRAME_HEADER_SIZE`] bytes of `buf`.
    pub(crate) fn parse(buf: &[u8], offset: u64) -> Result<Self> {
        ensure!(
            buf.len() >= FRAME_HEADER_SIZE,
            CorruptFrameSnafu {
                offset,
                reason: format!("header needs {FRAME_HEADER_SIZE} bytes, got {}", buf.len()),
            }
        );

        let (id, rest) = buf.split_at(SEQUENCING_ID_SIZE);
        let (len, rest) = rest.split_at(LENGTH_SIZE);
        let (digest, rest) = rest.split_at(DIGEST_SIZE);
        let crc = &rest[..CRC_SIZE];

        let mut id_bytes = [0u8; SEQUENCING_ID_SIZE];
        id_bytes.copy_from_slice(id);
        let mut len_bytes = [0u8; LENGTH_SIZE];
        len_bytes.copy_from_slice(len);
        let mut digest_bytes = [0u8; DIGEST_SIZE];
        digest_bytes.copy_from_slice(digest);
        let mut crc_bytes = [0u8; CRC_SIZE];
        crc_bytes.copy_from_slice(crc);

        Ok(Self {
            sequencing_id: i64::from_le_bytes(id_bytes),
            payload_len:   u32::from_le_bytes(len_bytes),
            digest:        digest_bytes,
            crc:           u32::from_le_bytes(crc_bytes),
        })
    }

    /// Checks the stored CRC against `payload`.
    pub(crate) fn verify(&self, payload: &[u8]) -> bool {
        payload.len() == self.payload_len as usize
            && verify_frame_crc(
                self.sequencing_id,
                self.payload_len,
                &self.digest,
                payload,
                self.crc,
            )
    }

    /// Bytes covered by this frame, header included.
    pub(crate) const fn frame_size(&self) -> usize { frame_disk_size(self.payload_len as usize) }
}

/// Outcome of [`decode`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded<'a> {
    /// A complete frame whose checksum matched.
    Frame {
        header:   FrameHeader,
        payload:  &'a [u8],
        /// Bytes of `buf` taken by the frame.
        consumed: usize,
    },
    /// `buf` ends before the frame does. Empty input decodes to this too.
    Incomplete,
}

/// Encodes one frame.
pub(crate) fn encode(sequencing_id: i64, digest: &RecordDigest, payload: &[u8]) -> Vec<u8> {
    let payload_len = payload.len() as u32;
    let crc = calculate_frame_crc(sequencing_id, payload_len, digest, payload);

    let mut buf = Vec::with_capacity(frame_disk_size(payload.len()));
    buf.extend_from_slice(&sequencing_id.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(digest);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decodes the frame at the start of `buf`.
///
/// `offset` is the file position of `buf[0]` and only feeds error reports.
/// A payload length above `max_payload` or a checksum mismatch is
/// [`CorruptFrame`](crate::QueueError::CorruptFrame).
pub(crate) fn decode(buf: &[u8], offset: u64, max_payload: u64) -> Result<Decoded<'_>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(Decoded::Incomplete);
    }
    let header = FrameHeader::parse(buf, offset)?;
    ensure!(
        u64::from(header.payload_len) <= max_payload,
        CorruptFrameSnafu {
            offset,
            reason: format!(
                "payload length {} exceeds limit {max_payload}",
                header.payload_len
            ),
        }
    );

    let consumed = header.frame_size();
    if buf.len() < consumed {
        return Ok(Decoded::Incomplete);
    }
    let payload = &buf[FRAME_HEADER_SIZE..consumed];
    ensure!(
        header.verify(payload),
        CorruptFrameSnafu {
            offset,
            reason: format!("checksum mismatch for sequencing id {}", header.sequencing_id),
        }
    );

    Ok(Decoded::Frame {
        header,
        payload,
        consumed,
    })
}
