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

//! Disk-pressure degradation.
//!
//! When a write cannot reserve disk space, the writing queue asks its
//! container for candidate queues and sheds their oldest closed files, one
//! candidate at a time and each on the candidate's own sequence, until the
//! shared disk resource can fit the write. The writing queue itself is
//! tried last.
//!
//! ```text
//! writer ──candidates_cb──► [A, B, ...] ──post──► A.shed ──post──► B.shed ──► ... ──► writer.shed
//!                                                    │                                      │
//!                                                    └──────── fits: resume write ◄─────────┘
//! ```

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
};

use tracing::debug;

use crate::queue::StorageQueue;

/// Receives the candidate queues, oldest first.
pub type CandidatesReady = Box<dyn FnOnce(VecDeque<Arc<StorageQueue>>) + Send + 'static>;

/// Supplies the queues that may be shed for a write to the given queue.
pub type DegradationCandidatesCb =
    Arc<dyn Fn(Arc<StorageQueue>, CandidatesReady) + Send + Sync + 'static>;

/// Called once with whether enough space was recovered.
pub(crate) type ShedDone = Box<dyn FnOnce(bool) + Send + 'static>;

/// Orders `queues` for shedding on behalf of `writer`: oldest first, never
/// the writer itself, never a queue of higher priority than the writer.
pub fn candidates_by_age(
    queues: &[Arc<StorageQueue>],
    writer: &Arc<StorageQueue>,
) -> VecDeque<Arc<StorageQueue>> {
    let priority = writer.options().priority;
    let mut candidates: Vec<_> = queues
        .iter()
        .filter(|queue| !Arc::ptr_eq(queue, writer) && queue.options().priority <= priority)
        .cloned()
        .collect();
    candidates.sort_by_key(|queue| queue.time_stamp());
    candidates.into()
}

/// One shedding run, moved from sequence to sequence.
///
/// Dropping an unfinished run (its sequence stopped before the task ran)
/// moves on to the next candidate.
pub(crate) struct Shedding {
    candidates:   VecDeque<Arc<StorageQueue>>,
    writer:       Weak<StorageQueue>,
    space:        u64,
    writer_tried: bool,
    done:         Option<ShedDone>,
}

impl Shedding {
    pub(crate) fn new(
        candidates: VecDeque<Arc<StorageQueue>>,
        writer: Weak<StorageQueue>,
        space: u64,
        done: ShedDone,
    ) -> Self {
        Self {
            candidates,
            writer,
            space,
            writer_tried: false,
            done: Some(done),
        }
    }

    /// Sheds from the next candidate, then from the writer, then gives up.
    pub(crate) fn advance(mut self) {
        let writer = self.writer.upgrade();
        while let Some(candidate) = self.candidates.pop_front() {
            if writer
                .as_ref()
                .is_some_and(|writer| Arc::ptr_eq(writer, &candidate))
            {
                continue;
            }
            debug!(
                candidate = candidate.generation_guid(),
                space = self.space,
                "Shedding files of candidate queue"
            );
            let space = self.space;
            candidate.post(move |core| {
                if core.shed_files(space) {
                    self.finish(true);
                } else {
                    self.advance();
                }
            });
            return;
        }

        if !self.writer_tried
            && let Some(writer) = writer
        {
            self.writer_tried = true;
            let space = self.space;
            writer.post(move |core| {
                let recovered = core.shed_files(space);
                self.finish(recovered);
            });
            return;
        }
        self.finish(false);
    }

    fn finish(mut self, recovered: bool) {
        if let Some(done) = self.done.take() {
            debug!(recovered, space = self.space, "Shedding finished");
            done(recovered);
        }
    }
}

impl Drop for Shedding {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        Self {
            candidates:   std::mem::take(&mut self.candidates),
            writer:       self.writer.clone(),
            space:        self.space,
            writer_tried: self.writer_tried,
            done:         Some(done),
        }
        .advance();
    }
}
