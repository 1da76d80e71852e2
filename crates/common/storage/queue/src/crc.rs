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

//! CRC32 checksums for frames and metadata snapshots.
//!
//! Uses CRC-32 (IEEE polynomial) via crc32fast. A frame checksum covers every
//! header field in front of it as well as the payload, so a flipped length
//! or sequencing id is caught the same way as a damaged payload.

use crc32fast::Hasher;

use crate::record::RecordDigest;

/// Calculates the checksum stored in a frame header.
#[inline]
pub(crate) fn calculate_frame_crc(
    sequencing_id: i64,
    length: u32,
    digest: &RecordDigest,
    payload: &[u8],
) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&sequencing_id.to_le_bytes());
    hasher.update(&length.to_le_bytes());
    hasher.update(digest);
    hasher.update(payload);
    hasher.finalize()
}

/// Verifies a frame checksum.
#[inline]
pub(crate) fn verify_frame_crc(
    sequencing_id: i64,
    length: u32,
    digest: &RecordDigest,
    payload: &[u8],
    expected: u32,
) -> bool {
    calculate_frame_crc(sequencing_id, length, digest, payload) == expected
}

/// Plain checksum over a byte slice, used by metadata snapshots.
#[inline]
pub(crate) fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
