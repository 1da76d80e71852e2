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

//! Durable, append-only record queue.
//!
//! Records are framed into size-bounded data files, chained by SHA-256
//! digests, uploaded in sequencing order and deleted once confirmed. Under
//! disk pressure the oldest files of lower-priority queues are shed.

pub mod builder;
mod completion;
pub mod config;
mod crc;
pub mod degradation;
pub mod error;
mod file;
mod file_set;
mod frame;
pub mod injection;
mod metadata;
pub mod path;
pub mod queue;
mod read;
pub mod record;
mod recovery;
pub mod resources;
mod sequence;
pub mod transform;
pub mod uploader;
mod write;

pub use builder::QueueBuilder;
pub use completion::Callback;
pub use config::{Priority, QueueOptions};
pub use degradation::{CandidatesReady, DegradationCandidatesCb, candidates_by_age};
pub use error::{ErrorKind, QueueError, Result};
pub use injection::{InjectionHandler, OperationKind};
pub use path::sequencing_id_from_path;
pub use queue::{
    DisableQueueCb, DisconnectQueueCb, Done, InitRetryCb, QueueState, StorageQueue,
    maybe_backoff_and_reinit,
};
pub use record::{Record, RecordDigest, SequenceInformation};
pub use resources::{ResourceManager, ScopedReservation};
pub use transform::{
    CompressionModule, EncryptionModule, NoCompression, PassthroughEncryption, RecordTransform,
    ZstdCompression,
};
pub use uploader::{UploadReason, UploadRecord, Uploader, UploaderFactory};
