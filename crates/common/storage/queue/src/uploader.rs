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

//! Upload collaborators.

use std::sync::Arc;

use crate::{
    config::Priority,
    error::Result,
    record::{Record, RecordDigest, SequenceInformation},
    transform::RecordTransform,
};

/// Why an upload pass was started.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadReason {
    /// Startup pass over records left by a previous run.
    InitialUpload,
    /// Explicit `flush`.
    Manual,
    /// Upload period elapsed.
    Periodic,
    /// Written with a zero upload period.
    Immediate,
    /// Records were still unconfirmed after the retry delay.
    IncompleteRetry,
    /// Draining a disabled queue before it is deleted.
    Inactivity,
}

/// One stored record handed to an [`Uploader`].
#[derive(Debug)]
pub struct UploadRecord<'a> {
    pub sequence_information: SequenceInformation,
    pub digest:               RecordDigest,
    /// Compressed and encrypted record, as stored.
    pub blob:                 &'a [u8],
    transform:                &'a RecordTransform,
}

impl<'a> UploadRecord<'a> {
    pub(crate) const fn new(
        sequence_information: SequenceInformation,
        digest: RecordDigest,
        blob: &'a [u8],
        transform: &'a RecordTransform,
    ) -> Self {
        Self {
            sequence_information,
            digest,
            blob,
            transform,
        }
    }

    /// Decrypts and decompresses the blob.
    pub fn open(&self) -> Result<Record> { self.transform.open(self.blob) }
}

/// Receives the records of one upload pass, in sequencing order.
///
/// Runs on the queue's sequence: implementations must not block on the
/// queue they upload from.
pub trait Uploader: Send {
    /// Returns `false` to end the pass early.
    fn process_record(&mut self, record: UploadRecord<'_>) -> bool;

    /// `count` records starting at `start` are missing or unreadable.
    /// Returns `false` to end the pass early.
    fn process_gap(&mut self, start: SequenceInformation, count: u64) -> bool;

    /// Called exactly once when the pass ends.
    fn completed(self: Box<Self>, status: Result<()>);
}

/// Creates an uploader for a pass, or declines with `None`.
pub type UploaderFactory =
    Arc<dyn Fn(UploadReason, Priority) -> Option<Box<dyn Uploader>> + Send + Sync>;

/// Factory that declines every upload.
pub fn no_uploads() -> UploaderFactory { Arc::new(|_, _| None) }
