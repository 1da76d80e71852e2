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

//! Records, sequencing information and the record digest chain.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Priority;

/// Size of a [`RecordDigest`] in bytes.
pub const DIGEST_SIZE: usize = 32;

/// SHA-256 link of the record digest chain.
pub type RecordDigest = [u8; DIGEST_SIZE];

/// A logical unit of data handed to [`StorageQueue::write`].
///
/// [`StorageQueue::write`]: crate::StorageQueue::write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Logical destination the uploader routes the record to.
    pub destination:  String,
    /// Opaque payload.
    pub data:         Bytes,
    /// Creation time in microseconds since the Unix epoch.
    pub timestamp_us: i64,
}

impl Record {
    /// Creates a record stamped with the current time.
    pub fn new(destination: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            destination:  destination.into(),
            data:         data.into(),
            timestamp_us: Utc::now().timestamp_micros(),
        }
    }
}

/// Position of a record within a queue's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceInformation {
    pub sequencing_id: i64,
    pub generation_id: i64,
    pub priority:      Priority,
}

/// Next link of the digest chain: `SHA-256(previous || blob)`.
///
/// An absent previous digest (first record of a generation) contributes no
/// bytes.
pub fn chain_digest(previous: Option<&RecordDigest>, blob: &[u8]) -> RecordDigest {
    let mut hasher = Sha256::new();
    if let Some(previous) = previous {
        hasher.update(previous);
    }
    hasher.update(blob);
    hasher.finalize().into()
}
