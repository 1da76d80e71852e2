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

//! Write path.
//!
//! ```text
//! record ─► serialize ─► seal ─► reserve disk ─► digest ─► assign id ─► append frame ─► META.<id>
//!                                     │
//!                                     └─ no space: shed files of other queues, retry once
//! ```
//!
//! Writes are completed strictly in arrival order. A write waiting for shed
//! space holds back every later write.

use snafu::{OptionExt, ensure};
use tracing::{debug, warn};

use crate::{
    completion::Completion,
    degradation::Shedding,
    error::{InternalSnafu, InvalidRecordSnafu, ResourceExhaustedSnafu, Result},
    frame::{self, frame_disk_size},
    injection::OperationKind,
    metadata::{MetadataSnapshot, delete_metadata_below, write_metadata},
    queue::{QueueCore, QueueState},
    record::{Record, chain_digest},
    resources::ScopedReservation,
    transform::RecordTransform,
    uploader::UploadReason,
};

/// A write accepted by the queue but not yet completed.
pub(crate) struct PendingWrite {
    record:         Record,
    completion:     Completion<()>,
    prepared:       Option<PreparedWrite>,
    /// Degradation already ran for this write.
    shed_attempted: bool,
    awaiting_space: bool,
}

/// A sealed record with the memory it holds.
struct PreparedWrite {
    blob:       Vec<u8>,
    frame_size: u64,
    _memory:    ScopedReservation,
}

impl QueueCore {
    pub(crate) fn write(&mut self, record: Record, completion: Completion<()>) {
        if let Err(e) = self.ensure_state(&[QueueState::Ready], "write") {
            completion.complete(Err(e));
            return;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending_writes.insert(ticket, PendingWrite {
            record,
            completion,
            prepared: None,
            shed_attempted: false,
            awaiting_space: false,
        });
        self.process_writes();
    }

    /// Runs pending writes in ticket order until one has to wait for space.
    pub(crate) fn process_writes(&mut self) {
        while let Some((&ticket, pending)) = self.pending_writes.first_key_value() {
            if pending.awaiting_space {
                break;
            }
            let Some(pending) = self.pending_writes.remove(&ticket) else {
                break;
            };
            if let Some(waiting) = self.attempt_write(ticket, pending) {
                self.pending_writes.insert(ticket, waiting);
                break;
            }
        }
    }

    /// Completes `pending`, or hands it back when it waits for shed space.
    fn attempt_write(&mut self, ticket: u64, mut pending: PendingWrite) -> Option<PendingWrite> {
        let prepared = match pending.prepared.take() {
            Some(prepared) => prepared,
            None => match self.prepare(&pending.record) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!(error = %e, "Record rejected");
                    pending.completion.complete(Err(e));
                    return None;
                }
            },
        };

        let frame_size = prepared.frame_size;
        let Some(reservation) = self.reserve_disk(frame_size) else {
            if self.options.can_shed_records && !pending.shed_attempted {
                pending.shed_attempted = true;
                pending.awaiting_space = true;
                pending.prepared = Some(prepared);
                self.start_degradation(ticket, frame_size);
                return Some(pending);
            }
            warn!(
                requested = frame_size,
                available = self.files.disk().available(),
                "Not enough disk space for record"
            );
            pending.completion.complete(
                ResourceExhaustedSnafu {
                    resource:  "disk",
                    requested: frame_size,
                }
                .fail(),
            );
            return None;
        };

        match self.commit(&prepared.blob, reservation) {
            Ok(sequencing_id) => {
                debug!(sequencing_id, size = frame_size, "Record stored");
                pending.completion.complete(Ok(()));
                self.restart_inactivity_timer();
                if self.options.uploads_immediately() {
                    self.start_upload(UploadReason::Immediate, None);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to store record");
                pending.completion.complete(Err(e));
            }
        }
        None
    }

    /// Serializes and seals `record`, holding memory for the result.
    fn prepare(&self, record: &Record) -> Result<PreparedWrite> {
        let sequencing_id = self.files.next_sequencing_id();
        let serialized = RecordTransform::serialize(record)?;
        let serialized_size = serialized.len() as u64;
        ensure!(
            serialized_size <= self.options.max_single_record_size,
            InvalidRecordSnafu {
                reason: format!(
                    "record of {serialized_size} bytes exceeds the limit of {}",
                    self.options.max_single_record_size
                ),
            }
        );

        let mut memory = ScopedReservation::empty(self.files.memory());
        self.reserve_memory(
            &mut memory,
            serialized_size,
            OperationKind::WrappedRecordLowMemory,
            sequencing_id,
        )?;

        let blob = self.transform.seal(&serialized)?;
        let frame_size = frame_disk_size(blob.len()) as u64;
        ensure!(
            frame_size <= self.options.max_read_buffer_size,
            InvalidRecordSnafu {
                reason: format!("sealed record of {frame_size} bytes exceeds the read buffer"),
            }
        );
        self.reserve_memory(
            &mut memory,
            blob.len() as u64,
            OperationKind::EncryptedRecordLowMemory,
            sequencing_id,
        )?;
        drop(serialized);
        memory.reduce(blob.len() as u64);

        Ok(PreparedWrite {
            blob,
            frame_size,
            _memory: memory,
        })
    }

    fn reserve_memory(
        &self,
        reservation: &mut ScopedReservation,
        size: u64,
        operation: OperationKind,
        sequencing_id: i64,
    ) -> Result<()> {
        let injected = self.inject(operation, sequencing_id).is_err();
        ensure!(
            !injected && reservation.grow(reservation.size() + size),
            ResourceExhaustedSnafu {
                resource:  "memory",
                requested: size,
            }
        );
        Ok(())
    }

    fn reserve_disk(&self, size: u64) -> Option<ScopedReservation> {
        if self
            .inject(OperationKind::WriteLowDiskSpace, self.files.next_sequencing_id())
            .is_err()
        {
            return None;
        }
        ScopedReservation::reserve(self.files.disk(), size)
    }

    /// Assigns the next sequencing id and appends the frame. The id stays
    /// consumed when the append fails.
    fn commit(&mut self, blob: &[u8], reservation: ScopedReservation) -> Result<i64> {
        let digest = chain_digest(self.last_record_digest.as_ref(), blob);
        let (sequencing_id, key) = self.files.assign_last_file(reservation.size())?;
        self.inject(OperationKind::WriteBlock, sequencing_id)?;

        let frame = frame::encode(sequencing_id, &digest, blob);
        self.files
            .get_mut(key)
            .context(InternalSnafu {
                message: format!("no data file for key {key}"),
            })?
            .append(&frame, reservation)?;

        self.last_record_digest = Some(digest);
        self.store_metadata(MetadataSnapshot {
            sequencing_id,
            generation_id: self.files.generation_id(),
            digest,
        });
        Ok(sequencing_id)
    }

    /// Best-effort: a lost snapshot is rebuilt from the data files on the
    /// next start.
    fn store_metadata(&mut self, snapshot: MetadataSnapshot) {
        let sequencing_id = snapshot.sequencing_id;
        let written = self
            .inject(OperationKind::WriteMetadata, sequencing_id)
            .and_then(|()| write_metadata(self.files.dir(), &snapshot));
        if let Err(e) = written {
            warn!(sequencing_id, error = %e, "Failed to write metadata");
            return;
        }

        let dir = self.files.dir().to_path_buf();
        self.housekeeping
            .post(move |()| delete_metadata_below(&dir, sequencing_id));
    }

    /// Asks the container for queues to shed and runs the shedding; the
    /// write at `ticket` resumes on this sequence when it ends.
    fn start_degradation(&mut self, ticket: u64, space: u64) {
        debug!(ticket, space, "Not enough disk space, starting degradation");
        let sequence = self.sequence.clone();
        let on_done = Box::new(move |recovered: bool| {
            sequence.post(move |core: &mut Self| core.resume_write(ticket, recovered));
        });

        let writer = self.this.clone();
        match (self.hooks.degradation_candidates.clone(), self.this.upgrade()) {
            (Some(candidates_cb), Some(queue)) => candidates_cb(
                queue,
                Box::new(move |candidates| Shedding::new(candidates, writer, space, on_done).advance()),
            ),
            _ => Shedding::new(Default::default(), writer, space, on_done).advance(),
        }
    }

    fn resume_write(&mut self, ticket: u64, recovered: bool) {
        let Some(pending) = self.pending_writes.get_mut(&ticket) else {
            return;
        };
        pending.awaiting_space = false;
        if !recovered {
            debug!(ticket, "Degradation could not free enough space");
        }
        self.process_writes();
    }
}

