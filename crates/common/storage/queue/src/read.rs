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

//! Upload passes.
//!
//! A pass walks the closed data files in sequencing order and hands every
//! record to an [`Uploader`]. Each step reads one frame and then re-posts
//! itself, so writes and confirmations interleave with a long pass.
//!
//! Ids that are missing or whose frame cannot be decoded are reported as
//! gaps once the next readable frame (or the end of the pass) shows where
//! the hole ends.

use tracing::{debug, warn};

use crate::{
    completion::Completion,
    error::{InternalSnafu, QueueError, Result, UploadDeclinedSnafu},
    file::FrameRead,
    injection::OperationKind,
    queue::{QueueCore, QueueState, complete},
    recovery::max_frame_payload,
    uploader::{UploadReason, UploadRecord, Uploader},
};

/// State of one upload pass between steps.
pub(crate) struct ReadPass {
    id:         u64,
    reason:     UploadReason,
    uploader:   Option<Box<dyn Uploader>>,
    completion: Option<Completion<()>>,
    /// Keys of the files to read, in order.
    files:      Vec<i64>,
    file_index: usize,
    pos:        u64,
    /// Next id the uploader has not heard about.
    expected:   i64,
    last_seen:  Option<i64>,
    /// Ids at or past `end` were written after the pass started.
    end:        i64,
}

impl ReadPass {
    fn next_file(&mut self) {
        self.file_index += 1;
        self.pos = 0;
    }
}

impl Drop for ReadPass {
    fn drop(&mut self) {
        if let Some(uploader) = self.uploader.take() {
            uploader.completed(Err(QueueError::Shutdown));
        }
    }
}

enum Step {
    Continue,
    Done,
}

impl QueueCore {
    /// Starts an upload pass over every unconfirmed record.
    pub(crate) fn start_upload(&mut self, reason: UploadReason, completion: Option<Completion<()>>) {
        if let Err(e) =
            self.ensure_state(&[QueueState::Ready, QueueState::SelfDestructing], "upload")
        {
            complete(completion, Err(e));
            return;
        }
        if let Err(e) = self.files.switch_last_file_if_not_empty() {
            warn!(error = %e, "Failed to close the writable file for upload");
            complete(completion, Err(e));
            return;
        }

        let Some(uploader) = (self.uploader_factory)(reason, self.options.priority) else {
            debug!(%reason, "Uploader declined");
            if self.status.state() == QueueState::SelfDestructing {
                self.schedule_check_back();
            }
            complete(
                completion,
                UploadDeclinedSnafu {
                    reason: <&'static str>::from(reason),
                }
                .fail(),
            );
            return;
        };

        let start = self
            .first_unconfirmed
            .unwrap_or_else(|| self.files.first_sequencing_id());
        let end = self.files.next_sequencing_id();
        let id = self.next_read_id;
        self.next_read_id += 1;
        self.active_reads += 1;

        let pass = ReadPass {
            id,
            reason,
            uploader: Some(uploader),
            completion,
            files: self.files.collect_files_for_upload(start),
            file_index: 0,
            pos: 0,
            expected: start,
            last_seen: None,
            end,
        };
        debug!(
            read_id = id,
            %reason,
            start,
            end,
            files = pass.files.len(),
            "Upload pass started"
        );
        self.reads.insert(id, pass);
        self.post_read_step(id);
    }

    fn post_read_step(&self, id: u64) {
        self.sequence.post(move |core: &mut Self| core.read_step(id));
    }

    fn read_step(&mut self, id: u64) {
        let Some(mut pass) = self.reads.remove(&id) else {
            return;
        };
        match self.advance_read(&mut pass) {
            Ok(Step::Continue) => {
                self.reads.insert(id, pass);
                self.post_read_step(id);
            }
            Ok(Step::Done) => self.finish_read(pass, Ok(())),
            Err(e) => self.finish_read(pass, Err(e)),
        }
    }

    /// Reads one frame of the pass.
    fn advance_read(&mut self, pass: &mut ReadPass) -> Result<Step> {
        let Some(&key) = pass.files.get(pass.file_index) else {
            if pass.expected < pass.end {
                let count = pass.end - pass.expected;
                self.report_gap(pass, pass.expected, count)?;
            }
            return Ok(Step::Done);
        };

        let max_payload = max_frame_payload(&self.options);
        let max_buffer_size = self.options.max_read_buffer_size;
        let read = match self.files.get_mut(key) {
            Some(file) => file.read_frame(pass.pos, max_payload, max_buffer_size)?,
            None => FrameRead::End,
        };

        match read {
            FrameRead::End => {
                self.close_file(key);
                pass.next_file();
            }
            FrameRead::Truncated => {
                warn!(file = key, pos = pass.pos, "Data file ends in a partial frame");
                self.close_file(key);
                pass.next_file();
            }
            FrameRead::Unreadable { error } => {
                warn!(file = key, pos = pass.pos, error = %error, "Skipping rest of unreadable data file");
                self.close_file(key);
                pass.next_file();
            }
            FrameRead::Damaged { header, error } => {
                warn!(file = key, pos = pass.pos, error = %error, "Skipping damaged frame");
                pass.pos += header.frame_size() as u64;
            }
            FrameRead::Frame { header, payload } => {
                pass.pos += header.frame_size() as u64;
                let sequencing_id = header.sequencing_id;
                if let Some(last_seen) = pass.last_seen
                    && sequencing_id <= last_seen
                {
                    return InternalSnafu {
                        message: format!(
                            "sequencing id {sequencing_id} read after {last_seen} in file {key}"
                        ),
                    }
                    .fail();
                }
                pass.last_seen = Some(sequencing_id);

                if sequencing_id < pass.expected || sequencing_id >= pass.end {
                    return Ok(Step::Continue);
                }
                if sequencing_id > pass.expected {
                    let count = sequencing_id - pass.expected;
                    if !self.report_gap(pass, pass.expected, count)? {
                        return Ok(Step::Done);
                    }
                }
                pass.expected = sequencing_id + 1;

                if let Err(e) = self.inject(OperationKind::ReadBlock, sequencing_id) {
                    debug!(sequencing_id, error = %e, "Record read failed, reporting gap");
                    let proceed = self.report_gap(pass, sequencing_id, 1)?;
                    return Ok(if proceed { Step::Continue } else { Step::Done });
                }

                let record = UploadRecord::new(
                    self.sequence_information(sequencing_id),
                    header.digest,
                    &payload,
                    &self.transform,
                );
                let uploader = pass.uploader.as_mut().ok_or(QueueError::Shutdown)?;
                if !uploader.process_record(record) {
                    debug!(read_id = pass.id, sequencing_id, "Uploader ended the pass");
                    return Ok(Step::Done);
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Reports `count` missing ids from `start`; returns whether the pass
    /// goes on.
    fn report_gap(&self, pass: &mut ReadPass, start: i64, count: i64) -> Result<bool> {
        debug!(read_id = pass.id, start, count, "Reporting gap");
        pass.expected = start + count;
        let uploader = pass.uploader.as_mut().ok_or(QueueError::Shutdown)?;
        Ok(uploader.process_gap(self.sequence_information(start), count as u64))
    }

    fn close_file(&mut self, key: i64) {
        if let Some(file) = self.files.get_mut(key) {
            file.close();
        }
    }

    fn finish_read(&mut self, mut pass: ReadPass, result: Result<()>) {
        if let Some(&key) = pass.files.get(pass.file_index) {
            self.close_file(key);
        }
        self.active_reads -= 1;
        match &result {
            Ok(()) => debug!(read_id = pass.id, reason = %pass.reason, "Upload pass finished"),
            Err(e) => warn!(read_id = pass.id, reason = %pass.reason, error = %e, "Upload pass failed"),
        }

        if let Some(uploader) = pass.uploader.take() {
            uploader.completed(result.clone());
        }
        let failed = result.is_err();
        complete(pass.completion.take(), result);

        if self.active_reads == 0 {
            self.remove_confirmed_files();
        }
        if failed || self.has_unconfirmed() {
            self.schedule_check_back();
        }
        if self.status.state() == QueueState::SelfDestructing {
            self.maybe_self_destruct();
        }
    }
}
