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

//! Metadata snapshots.
//!
//! After every append the queue writes `META.<sequencing_id>`, recording the
//! generation and the digest of that record. On restart the snapshot is the
//! anchor the stored frames are replayed against.
//!
//! ## Binary Format
//!
//! ```text
//! ┌──────────────────┬────────────────────────────────────┐
//! │ magic: [u8; 4]   │ "QMET"                             │
//! │ version: u32     │ Format version, currently 1        │
//! │ generation: i64  │ Generation id of the data files    │
//! │ digest: [u8; 32] │ Digest of the record at that id    │
//! │ checksum: u32    │ CRC32 of everything above          │
//! └──────────────────┴────────────────────────────────────┘
//! ```

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    crc::checksum,
    error::{IoSnafu, MetadataCorruptedSnafu, Result},
    path::{FileKind, metadata_file_path, scan_directory},
    record::{DIGEST_SIZE, RecordDigest},
};

/// Magic bytes identifying a metadata snapshot: "QMET"
pub(crate) const METADATA_MAGIC: [u8; 4] = *b"QMET";

/// Current snapshot format version.
pub(crate) const METADATA_VERSION: u32 = 1;

/// Size of a snapshot file in bytes.
pub(crate) const METADATA_SIZE: usize = 4 + 4 + 8 + DIGEST_SIZE + 4;

const CHECKSUM_OFFSET: usize = METADATA_SIZE - 4;

/// Contents of one `META.<sequencing_id>` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetadataSnapshot {
    /// Taken from the file name.
    pub sequencing_id: i64,
    pub generation_id: i64,
    pub digest:        RecordDigest,
}

impl MetadataSnapshot {
    pub(crate) fn serialize(&self) -> [u8; METADATA_SIZE] {
        let mut data = [0u8; METADATA_SIZE];
        data[0..4].copy_from_slice(&METADATA_MAGIC);
        data[4..8].copy_from_slice(&METADATA_VERSION.to_le_bytes());
        data[8..16].copy_from_slice(&self.generation_id.to_le_bytes());
        data[16..16 + DIGEST_SIZE].copy_from_slice(&self.digest);
        let crc = checksum(&data[..CHECKSUM_OFFSET]);
        data[CHECKSUM_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        data
    }

    /// Validates magic, version and checksum of a snapshot read from `path`.
    pub(crate) fn deserialize(sequencing_id: i64, data: &[u8], path: &Path) -> Result<Self> {
        ensure!(
            data.len() == METADATA_SIZE,
            MetadataCorruptedSnafu {
                path,
                reason: format!("size {} bytes, expected {METADATA_SIZE}", data.len()),
            }
        );
        ensure!(
            data[0..4] == METADATA_MAGIC,
            MetadataCorruptedSnafu {
                path,
                reason: format!("invalid magic: {:?}", &data[0..4]),
            }
        );

        let mut word = [0u8; 4];
        word.copy_from_slice(&data[4..8]);
        let version = u32::from_le_bytes(word);
        ensure!(
            version == METADATA_VERSION,
            MetadataCorruptedSnafu {
                path,
                reason: format!("unsupported version {version}"),
            }
        );

        word.copy_from_slice(&data[CHECKSUM_OFFSET..]);
        let stored = u32::from_le_bytes(word);
        let computed = checksum(&data[..CHECKSUM_OFFSET]);
        ensure!(
            stored == computed,
            MetadataCorruptedSnafu {
                path,
                reason: format!("checksum mismatch: stored={stored:#x}, computed={computed:#x}"),
            }
        );

        let mut generation = [0u8; 8];
        generation.copy_from_slice(&data[8..16]);
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(&data[16..16 + DIGEST_SIZE]);

        Ok(Self {
            sequencing_id,
            generation_id: i64::from_le_bytes(generation),
            digest,
        })
    }
}

/// Writes `META.<sequencing_id>` into `dir`.
pub(crate) fn write_metadata(dir: &Path, snapshot: &MetadataSnapshot) -> Result<PathBuf> {
    let path = metadata_file_path(dir, snapshot.sequencing_id);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .context(IoSnafu { path: &path })?;
    file.write_all(&snapshot.serialize())
        .and_then(|()| file.sync_data())
        .context(IoSnafu { path: &path })?;

    debug!(sequencing_id = snapshot.sequencing_id, path = ?path, "Metadata written");
    Ok(path)
}

/// Reads and validates the snapshot at `path`.
pub(crate) fn read_metadata(path: &Path, sequencing_id: i64) -> Result<MetadataSnapshot> {
    let data = std::fs::read(path).context(IoSnafu { path })?;
    MetadataSnapshot::deserialize(sequencing_id, &data, path)
}

/// Deletes every snapshot older than `sequencing_id`.
///
/// Best-effort: failures are logged and skipped.
pub(crate) fn delete_metadata_below(dir: &Path, sequencing_id: i64) {
    let files = match scan_directory(dir, "") {
        Ok(files) => files,
        Err(e) => {
            warn!(dir = ?dir, error = %e, "Failed to list metadata files");
            return;
        }
    };
    for file in files {
        if let FileKind::Metadata { sequencing_id: id } = file.kind
            && id < sequencing_id
            && let Err(e) = std::fs::remove_file(&file.path)
        {
            warn!(path = ?file.path, error = %e, "Failed to delete metadata file");
        }
    }
}
