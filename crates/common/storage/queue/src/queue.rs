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

//! The storage queue and its lifecycle.
//!
//! A [`StorageQueue`] is a cheap front end: every operation is posted to the
//! queue's sequence, where a [`QueueCore`] owns the files, the counters and
//! the timers. A second, low-priority sequence deletes superseded metadata
//! snapshots so housekeeping never delays writes.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new(QueueOptions { directory: dir.into(), ..Default::default() })
//!     .uploader_factory(factory)
//!     .build()?;
//!
//! queue.init(|status| info!(?status, "Queue initialized"));
//! queue.write(Record::new("telemetry", payload), |status| { /* ... */ });
//! queue.flush(|status| { /* records handed to the uploader */ });
//! queue.confirm(last_uploaded_id, false, |_| {});
//! ```
//!
//! Lifecycle: `Uninitialized → Initializing → Ready → (SelfDestructing →
//! Destroyed)`.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::Path,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicI64, AtomicU8, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    completion::Completion,
    config::QueueOptions,
    degradation::DegradationCandidatesCb,
    error::{
        InitializationFailedSnafu, InternalSnafu, InvalidRecordSnafu, IoSnafu, NotReadySnafu,
        QueueError, Result,
    },
    file_set::FileSet,
    injection::{InjectionHandler, OperationKind},
    read::ReadPass,
    record::{Record, RecordDigest, SequenceInformation},
    recovery,
    resources::ResourceManager,
    sequence::{SequenceHandle, sequence},
    transform::RecordTransform,
    uploader::{UploadReason, UploaderFactory},
    write::PendingWrite,
};

/// Number of distinct delays [`maybe_backoff_and_reinit`] hands out.
pub const INIT_BACKOFF_STEPS: usize = 5;

const INIT_BACKOFF_MIN_DELAY: Duration = Duration::from_secs(1);
const INIT_BACKOFF_MAX_DELAY: Duration = Duration::from_secs(60);

/// Signals that a container finished its part of a lifecycle step.
pub type Done = Box<dyn FnOnce() + Send + 'static>;

/// Called with the queue's `generation_guid` when the inactivity timer fires;
/// the container stops routing writes to the queue, then calls `Done`.
pub type DisableQueueCb = Arc<dyn Fn(&str, Done) + Send + Sync>;

/// Called with the queue's `generation_guid` once a self-destructing queue is
/// empty; the container forgets the queue, then calls `Done` and the files
/// are deleted.
pub type DisconnectQueueCb = Arc<dyn Fn(&str, Done) + Send + Sync>;

/// Decides whether a failed initialization is retried: `Ok(delay)` retries
/// after `delay`, `Err` gives up with that error. Receives the number of
/// retries left.
pub type InitRetryCb = Arc<dyn Fn(&QueueError, usize) -> Result<Duration> + Send + Sync>;

/// Lifecycle state of a [`StorageQueue`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum QueueState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    SelfDestructing = 3,
    Destroyed = 4,
}

impl QueueState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::SelfDestructing,
            4 => Self::Destroyed,
            _ => Self::Uninitialized,
        }
    }
}

/// State readable from any thread without going through the sequence.
#[derive(Debug, Default)]
pub(crate) struct QueueStatus {
    state:         AtomicU8,
    generation_id: AtomicI64,
}

impl QueueStatus {
    pub(crate) fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn generation_id(&self) -> i64 { self.generation_id.load(Ordering::Acquire) }

    fn set_generation_id(&self, generation_id: i64) {
        self.generation_id.store(generation_id, Ordering::Release);
    }
}

/// Container callbacks of one queue.
#[derive(Clone, Default)]
pub(crate) struct QueueHooks {
    pub degradation_candidates: Option<DegradationCandidatesCb>,
    pub disable_queue:          Option<DisableQueueCb>,
    pub disconnect_queue:       Option<DisconnectQueueCb>,
    pub init_retry:             Option<InitRetryCb>,
}

impl fmt::Debug for QueueHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHooks")
            .field("degradation_candidates", &self.degradation_candidates.is_some())
            .field("disable_queue", &self.disable_queue.is_some())
            .field("disconnect_queue", &self.disconnect_queue.is_some())
            .field("init_retry", &self.init_retry.is_some())
            .finish()
    }
}

type CompletionCallbacks = Arc<Mutex<Option<Vec<Done>>>>;

/// Durable, append-only record queue backed by one directory.
///
/// All operations are asynchronous: they are posted to the queue's sequence
/// and report through their callback, which runs on that sequence.
/// Callbacks must not block waiting on the same queue.
pub struct StorageQueue {
    options:              Arc<QueueOptions>,
    generation_guid:      String,
    time_stamp:           DateTime<Utc>,
    status:               Arc<QueueStatus>,
    completion_callbacks: CompletionCallbacks,
    sequence:             SequenceHandle<QueueCore>,
}

impl fmt::Debug for StorageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageQueue")
            .field("directory", &self.options.directory)
            .field("generation_guid", &self.generation_guid)
            .field("state", &self.state())
            .finish()
    }
}

impl StorageQueue {
    /// Spawns the queue's sequences. The queue stays `Uninitialized` until
    /// [`init`](Self::init).
    pub(crate) fn start(
        options: QueueOptions,
        transform: RecordTransform,
        uploader_factory: UploaderFactory,
        hooks: QueueHooks,
        disk: Arc<ResourceManager>,
        memory: Arc<ResourceManager>,
    ) -> Result<Arc<Self>> {
        let options = Arc::new(options);
        let (handle, runner) = sequence::<QueueCore>();
        let (housekeeping, housekeeping_runner) = sequence::<()>();
        let housekeeping_thread = housekeeping_runner
            .spawn("reportq-housekeeping", (), |()| {})
            .context(IoSnafu {
                path: &options.directory,
            })?;

        let status = Arc::new(QueueStatus::default());
        let completion_callbacks: CompletionCallbacks = Arc::new(Mutex::new(Some(Vec::new())));
        let generation_guid = Uuid::new_v4().to_string();
        let files = FileSet::new(&options, disk, memory);

        let mut core = None;
        let queue = Arc::new_cyclic(|this| {
            core = Some(QueueCore {
                options: Arc::clone(&options),
                status: Arc::clone(&status),
                generation_guid: generation_guid.clone(),
                this: this.clone(),
                sequence: handle.clone(),
                housekeeping,
                housekeeping_thread: Some(housekeeping_thread),
                files,
                transform: Arc::new(transform),
                uploader_factory,
                hooks,
                injection: None,
                last_record_digest: None,
                first_unconfirmed: None,
                active_reads: 0,
                reads: HashMap::new(),
                next_read_id: 0,
                pending_writes: BTreeMap::new(),
                next_ticket: 0,
                init_waiters: Vec::new(),
                init_retries_left: options.init_retries,
                timers: TimerGenerations::default(),
                inactivity: InactivityTimer::default(),
            });
            Self {
                options: Arc::clone(&options),
                generation_guid,
                time_stamp: Utc::now(),
                status,
                completion_callbacks: Arc::clone(&completion_callbacks),
                sequence: handle,
            }
        });
        let core = core.context(InternalSnafu {
            message: "queue core was not constructed",
        })?;

        runner
            .spawn("reportq-queue", core, move |mut core| {
                core.shutdown();
                drop(core);
                let callbacks = completion_callbacks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_default();
                for callback in callbacks {
                    callback();
                }
            })
            .context(IoSnafu {
                path: &options.directory,
            })?;

        debug!(
            path = ?options.directory,
            generation_guid = %queue.generation_guid,
            priority = %options.priority,
            "Storage queue created"
        );
        Ok(queue)
    }

    /// Recovers the queue from its directory.
    ///
    /// Concurrent calls while initialization is in flight all receive its
    /// outcome; calls on an initialized queue succeed immediately.
    pub fn init(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(callback);
        self.post(move |core| core.init(completion));
    }

    /// Runs `callback` once the queue is initialized, without starting
    /// initialization itself.
    pub fn on_init(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(callback);
        self.post(move |core| core.on_init(completion));
    }

    /// Stores `record`. Writes complete in the order they were issued.
    pub fn write(&self, record: Record, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(callback);
        self.post(move |core| core.write(record, completion));
    }

    /// Marks every record up to `sequencing_id` as uploaded.
    ///
    /// Without `force`, an id below the last confirmed one is ignored. `-1`
    /// confirms nothing, so with `force` the next upload starts over from
    /// the oldest stored record. Ids that were never assigned are rejected.
    pub fn confirm(
        &self,
        sequencing_id: i64,
        force: bool,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let completion = Completion::new(callback);
        self.post(move |core| completion.complete(core.confirm(None, sequencing_id, force)));
    }

    /// Like [`confirm`](Self::confirm), for a record handed to an uploader.
    /// Fails if the queue has moved to another generation since.
    pub fn confirm_sequence(
        &self,
        sequence_information: SequenceInformation,
        force: bool,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let completion = Completion::new(callback);
        self.post(move |core| {
            completion.complete(core.confirm(
                Some(sequence_information.generation_id),
                sequence_information.sequencing_id,
                force,
            ));
        });
    }

    /// Hands every unconfirmed record to a new uploader. Completes when the
    /// upload pass ends.
    pub fn flush(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(callback);
        self.post(move |core| core.start_upload(UploadReason::Manual, Some(completion)));
    }

    /// Runs `callback` once the queue's sequence has stopped and its files
    /// are closed. Runs it right away if that already happened.
    pub fn register_completion_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self
            .completion_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match callbacks.as_mut() {
            Some(callbacks) => callbacks.push(Box::new(callback)),
            None => {
                drop(callbacks);
                callback();
            }
        }
    }

    /// Installs (or with `None` removes) the error injection handler. Applies
    /// to operations posted after this call.
    pub fn inject_errors_for_operation(&self, handler: Option<InjectionHandler>) {
        self.post(move |core| core.injection = handler);
    }

    /// Deletes every file of the queue and its directory. The queue is
    /// `Destroyed` afterwards.
    pub fn delete_all_files_and_directory(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let completion = Completion::new(callback);
        self.post(move |core| completion.complete(core.delete_all_files_and_directory()));
    }

    pub fn options(&self) -> &QueueOptions { &self.options }

    /// Generation of the stored records; `0` until initialized.
    pub fn generation_id(&self) -> i64 { self.status.generation_id() }

    /// Identity of this queue instance.
    pub fn generation_guid(&self) -> &str { &self.generation_guid }

    /// Creation time of this queue instance.
    pub const fn time_stamp(&self) -> DateTime<Utc> { self.time_stamp }

    pub fn state(&self) -> QueueState { self.status.state() }

    /// Posts `task` to the queue's sequence. A task posted after shutdown is
    /// dropped, which completes its callback with [`QueueError::Shutdown`].
    pub(crate) fn post(&self, task: impl FnOnce(&mut QueueCore) + Send + 'static) -> bool {
        let posted = self.sequence.post(task);
        if !posted {
            debug!(generation_guid = %self.generation_guid, "Queue sequence stopped, task dropped");
        }
        posted
    }
}

impl Drop for StorageQueue {
    fn drop(&mut self) { self.sequence.stop(); }
}

/// Completes an operation whose caller may not be waiting.
pub(crate) fn complete<T>(completion: Option<Completion<T>>, result: Result<T>) {
    if let Some(completion) = completion {
        completion.complete(result);
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerGenerations {
    upload:     u64,
    check_back: u64,
}

/// Inactivity deadline backed by at most one pending delayed task.
///
/// Activity only moves `last_activity`; when the task fires early it re-arms
/// itself for the remaining time.
#[derive(Debug, Default)]
pub(crate) struct InactivityTimer {
    last_activity: Option<Instant>,
    armed:         bool,
}

impl InactivityTimer {
    /// Records activity at `now`. Returns whether a task must be posted.
    fn touch(&mut self, now: Instant) -> bool {
        self.last_activity = Some(now);
        !std::mem::replace(&mut self.armed, true)
    }

    /// Called when the pending task fires at `now`. Returns the delay to
    /// re-arm for, or `None` once `period` passed without activity.
    fn fire(&mut self, now: Instant, period: Duration) -> Option<Duration> {
        let idle = self
            .last_activity
            .map_or(period, |at| now.saturating_duration_since(at));
        if idle >= period {
            self.armed = false;
            None
        } else {
            Some(period - idle)
        }
    }
}

/// Queue state owned by the queue's sequence.
pub(crate) struct QueueCore {
    pub(crate) options:            Arc<QueueOptions>,
    pub(crate) status:             Arc<QueueStatus>,
    pub(crate) generation_guid:    String,
    pub(crate) this:               Weak<StorageQueue>,
    pub(crate) sequence:           SequenceHandle<QueueCore>,
    pub(crate) housekeeping:       SequenceHandle<()>,
    housekeeping_thread:           Option<JoinHandle<()>>,
    pub(crate) files:              FileSet,
    pub(crate) transform:          Arc<RecordTransform>,
    pub(crate) uploader_factory:   UploaderFactory,
    pub(crate) hooks:              QueueHooks,
    pub(crate) injection:          Option<InjectionHandler>,
    /// Digest of the last stored record; `None` at the start of a generation.
    pub(crate) last_record_digest: Option<RecordDigest>,
    /// Oldest id not yet confirmed; `None` until the first confirmation.
    pub(crate) first_unconfirmed:  Option<i64>,
    /// Upload passes in flight. Files are not deleted while non-zero.
    pub(crate) active_reads:       usize,
    pub(crate) reads:              HashMap<u64, ReadPass>,
    pub(crate) next_read_id:       u64,
    pub(crate) pending_writes:     BTreeMap<u64, PendingWrite>,
    pub(crate) next_ticket:        u64,
    init_waiters:                  Vec<Completion<()>>,
    init_retries_left:             usize,
    timers:                        TimerGenerations,
    inactivity:                    InactivityTimer,
}

impl QueueCore {
    pub(crate) fn init(&mut self, completion: Completion<()>) {
        match self.status.state() {
            QueueState::Uninitialized => {
                self.init_waiters.push(completion);
                self.init_retries_left = self.options.init_retries;
                self.attempt_init();
            }
            _ => self.on_init(completion),
        }
    }

    pub(crate) fn on_init(&mut self, completion: Completion<()>) {
        match self.status.state() {
            QueueState::Uninitialized | QueueState::Initializing => {
                self.init_waiters.push(completion);
            }
            QueueState::Ready | QueueState::SelfDestructing => completion.complete(Ok(())),
            QueueState::Destroyed => completion.complete(
                NotReadySnafu {
                    state:     "destroyed",
                    operation: "initialize",
                }
                .fail(),
            ),
        }
    }

    fn attempt_init(&mut self) {
        self.status.set_state(QueueState::Initializing);
        self.files.release_all();

        match recovery::recover(&mut self.files, &self.options).context(InitializationFailedSnafu) {
            Ok(digest) => self.on_recovered(digest),
            Err(e) => self.on_init_failed(e),
        }
    }

    fn on_recovered(&mut self, digest: Option<RecordDigest>) {
        self.last_record_digest = digest;
        self.first_unconfirmed = None;
        self.status.set_generation_id(self.files.generation_id());
        self.status.set_state(QueueState::Ready);
        info!(
            path = ?self.options.directory,
            generation_id = self.files.generation_id(),
            next_sequencing_id = self.files.next_sequencing_id(),
            "Queue initialized"
        );

        for waiter in std::mem::take(&mut self.init_waiters) {
            waiter.complete(Ok(()));
        }

        self.schedule_periodic_upload();
        self.restart_inactivity_timer();
        if self.options.upload_period != Duration::MAX && self.has_unconfirmed() {
            self.start_upload(UploadReason::InitialUpload, None);
        }
    }

    fn on_init_failed(&mut self, mut error: QueueError) {
        self.files.release_all();

        if self.init_retries_left > 0
            && let Some(retry) = self.hooks.init_retry.clone()
        {
            match retry(&error, self.init_retries_left) {
                Ok(delay) => {
                    self.init_retries_left -= 1;
                    warn!(
                        path = ?self.options.directory,
                        error = %error,
                        ?delay,
                        retries_left = self.init_retries_left,
                        "Queue initialization failed, retrying"
                    );
                    self.sequence
                        .post_delayed(delay, |core: &mut Self| core.attempt_init());
                    return;
                }
                Err(final_error) => error = final_error,
            }
        }

        error!(path = ?self.options.directory, error = %error, "Queue initialization failed");
        self.status.set_state(QueueState::Uninitialized);
        for waiter in std::mem::take(&mut self.init_waiters) {
            waiter.complete(Err(error.clone()));
        }
    }

    pub(crate) fn confirm(
        &mut self,
        generation_id: Option<i64>,
        sequencing_id: i64,
        force: bool,
    ) -> Result<()> {
        self.ensure_state(&[QueueState::Ready, QueueState::SelfDestructing], "confirm")?;
        if let Some(generation_id) = generation_id {
            let current = self.files.generation_id();
            ensure!(
                generation_id == current,
                InvalidRecordSnafu {
                    reason: format!(
                        "confirmation for generation {generation_id}, queue is at {current}"
                    ),
                }
            );
        }
        let next_sequencing_id = self.files.next_sequencing_id();
        ensure!(
            (-1..next_sequencing_id).contains(&sequencing_id),
            InvalidRecordSnafu {
                reason: format!(
                    "cannot confirm sequencing id {sequencing_id}, next is {next_sequencing_id}"
                ),
            }
        );

        if !force
            && let Some(first_unconfirmed) = self.first_unconfirmed
            && sequencing_id < first_unconfirmed - 1
        {
            debug!(sequencing_id, first_unconfirmed, "Ignoring stale confirmation");
            return Ok(());
        }

        self.first_unconfirmed = Some(sequencing_id + 1);
        debug!(sequencing_id, force, "Records confirmed");
        self.remove_confirmed_files();

        if self.status.state() == QueueState::SelfDestructing {
            self.maybe_self_destruct();
        }
        Ok(())
    }

    /// Deletes fully confirmed files unless an upload pass is reading.
    pub(crate) fn remove_confirmed_files(&mut self) {
        if self.active_reads > 0 {
            return;
        }
        if let Some(first_unconfirmed) = self.first_unconfirmed {
            let removed = self.files.remove_confirmed(first_unconfirmed - 1);
            if removed > 0 {
                debug!(
                    removed,
                    first_sequencing_id = self.files.first_sequencing_id(),
                    "Deleted confirmed data files"
                );
            }
        }
    }

    /// Whether stored records still wait for confirmation.
    pub(crate) fn has_unconfirmed(&self) -> bool {
        self.first_unconfirmed
            .unwrap_or_else(|| self.files.first_sequencing_id())
            < self.files.next_sequencing_id()
    }

    pub(crate) fn ensure_state(&self, allowed: &[QueueState], operation: &'static str) -> Result<()> {
        let state = self.status.state();
        ensure!(
            allowed.contains(&state),
            NotReadySnafu {
                state: <&'static str>::from(state),
                operation,
            }
        );
        Ok(())
    }

    pub(crate) fn inject(&self, operation: OperationKind, sequencing_id: i64) -> Result<()> {
        match &self.injection {
            Some(handler) => handler(operation, sequencing_id),
            None => Ok(()),
        }
    }

    pub(crate) fn sequence_information(&self, sequencing_id: i64) -> SequenceInformation {
        SequenceInformation {
            sequencing_id,
            generation_id: self.files.generation_id(),
            priority: self.options.priority,
        }
    }

    /// Sheds this queue's oldest closed files until `space` more disk bytes
    /// fit. Declines while an upload pass is reading.
    pub(crate) fn shed_files(&mut self, space: u64) -> bool {
        if self.active_reads > 0 {
            debug!(generation_guid = %self.generation_guid, "Upload in progress, not shedding");
            return self.files.disk().fits(space);
        }
        self.files.shed_files(space)
    }

    fn schedule_periodic_upload(&mut self) {
        let Some(period) = self.options.periodic_upload() else {
            return;
        };
        self.timers.upload += 1;
        let generation = self.timers.upload;
        self.sequence.post_delayed(period, move |core: &mut Self| {
            if core.timers.upload != generation {
                return;
            }
            if core.status.state() == QueueState::Ready && core.has_unconfirmed() {
                core.start_upload(UploadReason::Periodic, None);
            }
            core.schedule_periodic_upload();
        });
    }

    /// Re-uploads after `upload_retry_delay` if records are still
    /// unconfirmed by then.
    pub(crate) fn schedule_check_back(&mut self) {
        let delay = self.options.upload_retry_delay;
        if delay.is_zero() {
            return;
        }
        self.timers.check_back += 1;
        let generation = self.timers.check_back;
        self.sequence.post_delayed(delay, move |core: &mut Self| {
            if core.timers.check_back != generation || !core.has_unconfirmed() {
                return;
            }
            match core.status.state() {
                QueueState::Ready => core.start_upload(UploadReason::IncompleteRetry, None),
                QueueState::SelfDestructing => core.start_upload(UploadReason::Inactivity, None),
                _ => {}
            }
        });
    }

    pub(crate) fn restart_inactivity_timer(&mut self) {
        let period = self.options.inactivity_period;
        if period.is_zero() {
            return;
        }
        if self.inactivity.touch(Instant::now()) {
            self.arm_inactivity_timer(period);
        }
    }

    fn arm_inactivity_timer(&self, delay: Duration) {
        self.sequence.post_delayed(delay, |core: &mut Self| {
            let period = core.options.inactivity_period;
            match core.inactivity.fire(Instant::now(), period) {
                Some(remaining) => core.arm_inactivity_timer(remaining),
                None => core.on_inactive(),
            }
        });
    }

    fn on_inactive(&mut self) {
        if self.status.state() != QueueState::Ready {
            return;
        }
        self.status.set_state(QueueState::SelfDestructing);
        info!(
            generation_guid = %self.generation_guid,
            path = ?self.options.directory,
            "Queue inactive, disabling"
        );

        let sequence = self.sequence.clone();
        let drain: Done = Box::new(move || {
            sequence.post(|core: &mut Self| core.drain_for_destruction());
        });
        match self.hooks.disable_queue.clone() {
            Some(disable) => disable(&self.generation_guid, drain),
            None => drain(),
        }
    }

    fn drain_for_destruction(&mut self) {
        if self.has_unconfirmed() {
            self.start_upload(UploadReason::Inactivity, None);
        } else {
            self.maybe_self_destruct();
        }
    }

    /// Destroys a self-destructing queue once nothing is left to upload.
    pub(crate) fn maybe_self_destruct(&mut self) {
        if self.status.state() != QueueState::SelfDestructing
            || self.active_reads > 0
            || self.has_unconfirmed()
        {
            return;
        }
        self.status.set_state(QueueState::Destroyed);
        info!(generation_guid = %self.generation_guid, "Queue drained, self-destructing");

        let sequence = self.sequence.clone();
        let destroy: Done = Box::new(move || {
            sequence.post(|core: &mut Self| {
                if let Err(e) = core.delete_all_files_and_directory() {
                    warn!(error = %e, "Failed to delete queue directory");
                }
            });
        });
        match self.hooks.disconnect_queue.clone() {
            Some(disconnect) => disconnect(&self.generation_guid, destroy),
            None => destroy(),
        }
    }

    pub(crate) fn delete_all_files_and_directory(&mut self) -> Result<()> {
        self.status.set_state(QueueState::Destroyed);
        self.files.delete_all();
        let dir = self.files.dir().to_path_buf();
        remove_dir_all(&dir)?;
        info!(path = ?dir, "Deleted queue files and directory");
        Ok(())
    }

    /// Releases everything the core holds; runs on the sequence thread
    /// after it stopped.
    fn shutdown(&mut self) {
        self.reads.clear();
        self.pending_writes.clear();
        self.init_waiters.clear();
        self.files.release_all();

        self.housekeeping.stop();
        if let Some(thread) = self.housekeeping_thread.take()
            && thread.join().is_err()
        {
            warn!(generation_guid = %self.generation_guid, "Housekeeping thread panicked");
        }
        debug!(generation_guid = %self.generation_guid, "Queue core shut down");
    }
}

fn remove_dir_all(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).context(IoSnafu { path: dir })
        }
        _ => Ok(()),
    }
}

/// Retry policy for initialization, usable as an [`InitRetryCb`].
///
/// Transient errors are retried with exponential backoff while
/// `retry_count` (retries left) is positive; the delay grows as the
/// retries run out. Anything else is returned as the final error.
pub fn maybe_backoff_and_reinit(status: &QueueError, retry_count: usize) -> Result<Duration> {
    if retry_count == 0 || !status.is_transient() {
        return Err(status.clone());
    }
    let step = INIT_BACKOFF_STEPS.saturating_sub(retry_count);
    let delay = ExponentialBuilder::default()
        .with_min_delay(INIT_BACKOFF_MIN_DELAY)
        .with_max_delay(INIT_BACKOFF_MAX_DELAY)
        .with_max_times(INIT_BACKOFF_STEPS)
        .build()
        .nth(step)
        .unwrap_or(INIT_BACKOFF_MAX_DELAY);
    Ok(delay)
}
