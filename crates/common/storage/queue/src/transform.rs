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

//! Record serialization, compression and encryption.
//!
//! A stored blob is `encrypt([tag][body])`, where `tag` tells whether `body`
//! went through the compression module or was kept as serialized.

use std::{fmt, sync::Arc};

use snafu::{OptionExt, ensure};

use crate::{
    error::{InvalidRecordSnafu, Result, TransformSnafu},
    record::Record,
};

const TAG_STORED: u8 = 0;
const TAG_COMPRESSED: u8 = 1;

/// Compresses serialized records.
pub trait CompressionModule: Send + Sync + fmt::Debug {
    /// Returns the compressed form of `data`, or `None` to store it as-is.
    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Inverts [`compress`](Self::compress).
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Encrypts blobs before they reach the disk.
pub trait EncryptionModule: Send + Sync + fmt::Debug {
    fn encrypt(&self, data: Vec<u8>) -> Result<Vec<u8>>;

    fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// Never compresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl CompressionModule for NoCompression {
    fn compress(&self, _data: &[u8]) -> Result<Option<Vec<u8>>> { Ok(None) }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> { Ok(data.to_vec()) }
}

/// Stores blobs in clear text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEncryption;

impl EncryptionModule for PassthroughEncryption {
    fn encrypt(&self, data: Vec<u8>) -> Result<Vec<u8>> { Ok(data) }

    fn decrypt(&self, data: Vec<u8>) -> Result<Vec<u8>> { Ok(data) }
}

/// zstd compression of records above a size threshold.
///
/// The compressed form is kept only when it is smaller than the input.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompression {
    pub threshold: usize,
    pub level:     i32,
}

impl Default for ZstdCompression {
    fn default() -> Self {
        Self {
            threshold: 512,
            level:     zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl CompressionModule for ZstdCompression {
    fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if data.len() <= self.threshold {
            return Ok(None);
        }
        let compressed = zstd::encode_all(data, self.level).map_err(|e| {
            TransformSnafu {
                stage:   "compression",
                message: e.to_string(),
            }
            .build()
        })?;
        Ok((compressed.len() < data.len()).then_some(compressed))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| {
            TransformSnafu {
                stage:   "decompression",
                message: e.to_string(),
            }
            .build()
        })
    }
}

/// Turns records into stored blobs and back.
#[derive(Debug, Clone)]
pub struct RecordTransform {
    compression: Arc<dyn CompressionModule>,
    encryption:  Arc<dyn EncryptionModule>,
}

impl Default for RecordTransform {
    fn default() -> Self { Self::new(Arc::new(NoCompression), Arc::new(PassthroughEncryption)) }
}

impl RecordTransform {
    pub fn new(
        compression: Arc<dyn CompressionModule>,
        encryption: Arc<dyn EncryptionModule>,
    ) -> Self {
        Self {
            compression,
            encryption,
        }
    }

    pub fn compression(&self) -> Arc<dyn CompressionModule> { Arc::clone(&self.compression) }

    pub fn encryption(&self) -> Arc<dyn EncryptionModule> { Arc::clone(&self.encryption) }

    /// Serializes `record`; records without data are rejected.
    pub fn serialize(record: &Record) -> Result<Vec<u8>> {
        ensure!(
            !record.data.is_empty(),
            InvalidRecordSnafu {
                reason: "record data is empty",
            }
        );
        bincode::serde::encode_to_vec(record, bincode::config::standard()).map_err(|e| {
            InvalidRecordSnafu {
                reason: e.to_string(),
            }
            .build()
        })
    }

    /// Compresses then encrypts a serialized record.
    pub fn seal(&self, serialized: &[u8]) -> Result<Vec<u8>> {
        let mut tagged = Vec::with_capacity(serialized.len() + 1);
        match self.compression.compress(serialized)? {
            Some(compressed) => {
                tagged.push(TAG_COMPRESSED);
                tagged.extend_from_slice(&compressed);
            }
            None => {
                tagged.push(TAG_STORED);
                tagged.extend_from_slice(serialized);
            }
        }
        self.encryption.encrypt(tagged)
    }

    /// Recovers the record stored in `blob`.
    pub fn open(&self, blob: &[u8]) -> Result<Record> {
        let tagged = self.encryption.decrypt(blob.to_vec())?;
        let (tag, body) = tagged.split_first().context(TransformSnafu {
            stage:   "decryption",
            message: "empty blob",
        })?;
        let serialized = match *tag {
            TAG_STORED => body.to_vec(),
            TAG_COMPRESSED => self.compression.decompress(body)?,
            other => {
                return TransformSnafu {
                    stage:   "decompression",
                    message: format!("unknown compression tag {other}"),
                }
                .fail();
            }
        };
        let (record, _) =
            bincode::serde::decode_from_slice::<Record, _>(&serialized, bincode::config::standard())
                .map_err(|e| {
                    InvalidRecordSnafu {
                        reason: e.to_string(),
                    }
                    .build()
                })?;
        Ok(record)
    }
}
