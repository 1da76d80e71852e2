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

use std::{io, path::PathBuf, sync::Arc};

use snafu::Snafu;

/// Coarse classification of a [`QueueError`].
///
/// Callers branch on the kind rather than on individual variants: it is what
/// decides between retrying, reporting a gap, or giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    ResourceExhausted,
    IoError,
    CorruptFrame,
    InvalidRecord,
    InitializationFailed,
    InternalInvariantViolation,
    FailedPrecondition,
    Unavailable,
}

/// Queue operation errors.
///
/// Errors are `Clone` because one status may be delivered to several
/// callbacks (e.g. every caller waiting in `on_init`).
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error on {}: {source}", path.display()))]
    Io {
        path:   PathBuf,
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// Memory or disk budget could not be reserved.
    #[snafu(display("Not enough {resource} to reserve {requested} bytes"))]
    ResourceExhausted {
        resource:  &'static str,
        requested: u64,
    },

    /// Frame header or payload failed validation.
    #[snafu(display("Corrupt frame at offset {offset}: {reason}"))]
    CorruptFrame { offset: u64, reason: String },

    /// Record rejected before it reached the disk.
    #[snafu(display("Invalid record: {reason}"))]
    InvalidRecord { reason: String },

    /// Metadata snapshot failed validation.
    #[snafu(display("Metadata corrupted in {}: {reason}", path.display()))]
    MetadataCorrupted { path: PathBuf, reason: String },

    /// Replayed frames do not reproduce the recorded digest chain.
    #[snafu(display("Digest chain broken at sequencing id {sequencing_id}"))]
    DigestChainBroken { sequencing_id: i64 },

    /// Data files disagree about their generation.
    #[snafu(display("Generation id mismatch: expected {expected}, found {found} in {}", path.display()))]
    GenerationMismatch {
        expected: i64,
        found:    i64,
        path:     PathBuf,
    },

    /// File name does not follow the `<prefix>.<generation>.<seq>` layout.
    #[snafu(display("Invalid file path: {}", path.display()))]
    InvalidPath { path: PathBuf },

    /// Initialization gave up.
    #[snafu(display("Queue initialization failed: {source}"))]
    InitializationFailed {
        #[snafu(source(from(QueueError, Box::new)))]
        source: Box<QueueError>,
    },

    /// Encryption or compression module failure.
    #[snafu(display("{stage} failed: {message}"))]
    Transform { stage: &'static str, message: String },

    /// Sequencing order broken or another "cannot happen" state was reached.
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },

    /// Operation issued in a state that does not allow it.
    #[snafu(display("Queue is {state}, cannot {operation}"))]
    NotReady {
        state:     &'static str,
        operation: &'static str,
    },

    /// The uploader factory declined to start an upload.
    #[snafu(display("Uploader declined {reason} upload"))]
    UploadDeclined { reason: &'static str },

    /// Error injected through the test hook.
    #[snafu(display("Injected failure: {message}"))]
    Injected { message: String },

    /// The queue's sequence is gone; the operation never ran.
    #[snafu(display("Queue has been shut down"))]
    Shutdown,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::IoError,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::CorruptFrame { .. }
            | Self::MetadataCorrupted { .. }
            | Self::DigestChainBroken { .. } => ErrorKind::CorruptFrame,
            Self::InvalidRecord { .. } | Self::Transform { .. } => ErrorKind::InvalidRecord,
            Self::InitializationFailed { .. }
            | Self::GenerationMismatch { .. }
            | Self::InvalidPath { .. } => ErrorKind::InitializationFailed,
            Self::Internal { .. } => ErrorKind::InternalInvariantViolation,
            Self::NotReady { .. } => ErrorKind::FailedPrecondition,
            Self::UploadDeclined { .. } | Self::Shutdown => ErrorKind::Unavailable,
            Self::Injected { .. } => ErrorKind::IoError,
        }
    }

    /// Whether repeating the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InitializationFailed { source } => source.is_transient(),
            other => matches!(
                other.kind(),
                ErrorKind::IoError | ErrorKind::ResourceExhausted
            ),
        }
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
