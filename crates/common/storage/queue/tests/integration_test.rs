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

use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use reportq_storage_queue::{
    CandidatesReady, Done, ErrorKind, Priority, QueueBuilder, QueueError, QueueState, Record,
    RecordDigest, ResourceManager, Result, SequenceInformation, StorageQueue, UploadReason,
    UploadRecord, Uploader, UploaderFactory, candidates_by_age,
    injection::{OperationKind, fail_operation_for},
    path::data_file_path,
    record::chain_digest,
};
use tempfile::TempDir;
use test_case::test_case;

const TIMEOUT: Duration = Duration::from_secs(10);
const PREFIX: &str = "P_RECORDS";

#[derive(Debug)]
enum Event {
    Record {
        reason: UploadReason,
        info:   SequenceInformation,
        digest: RecordDigest,
        blob:   Vec<u8>,
        data:   Bytes,
    },
    Gap {
        start: i64,
        count: u64,
    },
    Completed {
        ok: bool,
    },
}

/// Compact view of an upload pass.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Record(i64),
    Gap(i64, u64),
    Completed(bool),
}

impl Event {
    fn seen(&self) -> Seen {
        match self {
            Self::Record { info, .. } => Seen::Record(info.sequencing_id),
            Self::Gap { start, count } => Seen::Gap(*start, *count),
            Self::Completed { ok } => Seen::Completed(*ok),
        }
    }
}

struct ChannelUploader {
    reason:    UploadReason,
    events:    Sender<Event>,
    remaining: Option<usize>,
}

impl Uploader for ChannelUploader {
    fn process_record(&mut self, record: UploadRecord<'_>) -> bool {
        let opened = record.open().unwrap();
        self.events
            .send(Event::Record {
                reason: self.reason,
                info:   record.sequence_information,
                digest: record.digest,
                blob:   record.blob.to_vec(),
                data:   opened.data,
            })
            .unwrap();
        match self.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining > 0
            }
            None => true,
        }
    }

    fn process_gap(&mut self, start: SequenceInformation, count: u64) -> bool {
        self.events
            .send(Event::Gap {
                start: start.sequencing_id,
                count,
            })
            .unwrap();
        true
    }

    fn completed(self: Box<Self>, status: Result<()>) {
        let _ = self.events.send(Event::Completed { ok: status.is_ok() });
    }
}

/// Collects what every uploader created by [`Uploads::factory`] sees.
struct Uploads {
    tx:    Sender<Event>,
    rx:    Receiver<Event>,
    /// Records per pass before the uploader ends it; zero is unlimited.
    limit: Arc<AtomicUsize>,
}

impl Uploads {
    fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            limit: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn factory(&self) -> UploaderFactory {
        let events = self.tx.clone();
        let limit = Arc::clone(&self.limit);
        Arc::new(move |reason: UploadReason, _: Priority| {
            let remaining = match limit.load(Ordering::SeqCst) {
                0 => None,
                n => Some(n),
            };
            Some(Box::new(ChannelUploader {
                reason,
                events: events.clone(),
                remaining,
            }) as Box<dyn Uploader>)
        })
    }

    fn set_limit(&self, limit: usize) { self.limit.store(limit, Ordering::SeqCst); }

    fn recv(&self) -> Event { self.rx.recv_timeout(TIMEOUT).unwrap() }

    fn drain(&self) -> Vec<Event> { self.rx.try_iter().collect() }

    fn drain_seen(&self) -> Vec<Seen> { self.drain().iter().map(Event::seen).collect() }
}

fn setup() { reportq_common_telemetry::init_default_ut_logging(); }

/// Records of equal size, so frame sizes are predictable.
fn record(i: usize) -> Record {
    Record {
        destination:  "telemetry".to_string(),
        data:         Bytes::from(format!("record-{i:04}")),
        timestamp_us: 1_700_000_000_000_000,
    }
}

fn big_record() -> Record {
    Record {
        destination:  "telemetry".to_string(),
        data:         Bytes::from(vec![b'x'; 1024]),
        timestamp_us: 1_700_000_000_000_000,
    }
}

fn builder(dir: &Path, uploads: &Uploads) -> QueueBuilder {
    QueueBuilder::with_directory(dir)
        .upload_period(Duration::MAX)
        .upload_retry_delay(Duration::ZERO)
        .uploader_factory(uploads.factory())
}

fn wait(op: impl FnOnce(Box<dyn FnOnce(Result<()>) + Send>)) -> Result<()> {
    let (tx, rx) = channel::bounded(1);
    op(Box::new(move |status| {
        let _ = tx.send(status);
    }));
    rx.recv_timeout(TIMEOUT).unwrap()
}

fn start(builder: QueueBuilder) -> Arc<StorageQueue> {
    let queue = builder.build().unwrap();
    wait(|cb| queue.init(cb)).unwrap();
    queue
}

fn write_all(queue: &StorageQueue, ids: impl IntoIterator<Item = usize>) {
    for i in ids {
        wait(|cb| queue.write(record(i), cb)).unwrap();
    }
}

/// Drops the last handle and waits until the files are closed.
fn shut_down(queue: Arc<StorageQueue>) {
    let (tx, rx) = channel::bounded(1);
    queue.register_completion_callback(move || {
        let _ = tx.send(());
    });
    drop(queue);
    rx.recv_timeout(TIMEOUT).unwrap();
}

/// On-disk size of one frame holding `record`.
fn frame_size(record: Record) -> u64 {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(ResourceManager::new("disk", 1 << 20));
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads).disk_resource(Arc::clone(&disk)));
    wait(|cb| queue.write(record, cb)).unwrap();
    let size = disk.used();
    shut_down(queue);
    size
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xff]).unwrap();
    file.sync_all().unwrap();
}

#[test]
fn test_write_flush_confirm_deletes_whole_files_only() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let frame = frame_size(record(0));
    let queue = start(builder(dir.path(), &uploads).max_single_file_size(3 * frame));

    write_all(&queue, 0..10);
    let generation_id = queue.generation_id();
    let data_file = |start: i64| data_file_path(dir.path(), PREFIX, generation_id, start);
    for start in [0, 3, 6, 9] {
        assert!(data_file(start).exists(), "missing data file {start}");
    }

    wait(|cb| queue.confirm(4, false, cb)).unwrap();
    assert!(!data_file(0).exists());
    assert!(data_file(3).exists());

    wait(|cb| queue.flush(cb)).unwrap();
    let events = uploads.drain();
    let seen: Vec<_> = events.iter().map(Event::seen).collect();
    assert_eq!(seen, vec![
        Seen::Record(5),
        Seen::Record(6),
        Seen::Record(7),
        Seen::Record(8),
        Seen::Record(9),
        Seen::Completed(true),
    ]);
    match &events[0] {
        Event::Record {
            reason, info, data, ..
        } => {
            assert_eq!(*reason, UploadReason::Manual);
            assert_eq!(info.generation_id, generation_id);
            assert_eq!(info.priority, Priority::SlowBatch);
            assert_eq!(data, &Bytes::from("record-0005"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_sequencing_and_digest_chain_survive_restart() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);
    let generation_id = queue.generation_id();
    assert_ne!(generation_id, 0);
    shut_down(queue);

    let queue = start(builder(dir.path(), &uploads));
    assert_eq!(queue.generation_id(), generation_id);
    write_all(&queue, 3..5);
    wait(|cb| queue.flush(cb)).unwrap();

    let mut previous: Option<RecordDigest> = None;
    let mut ids = Vec::new();
    for event in uploads.drain() {
        if let Event::Record {
            info, digest, blob, ..
        } = event
        {
            assert_eq!(info.generation_id, generation_id);
            assert_eq!(digest, chain_digest(previous.as_ref(), &blob));
            previous = Some(digest);
            ids.push(info.sequencing_id);
        }
    }
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_ids_stay_monotonic_after_everything_is_confirmed() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);
    wait(|cb| queue.flush(cb)).unwrap();
    uploads.drain();
    wait(|cb| queue.confirm(2, false, cb)).unwrap();
    let generation_id = queue.generation_id();
    shut_down(queue);

    let queue = start(builder(dir.path(), &uploads));
    assert_eq!(queue.generation_id(), generation_id);
    write_all(&queue, 3..4);
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(3),
        Seen::Completed(true)
    ]);
}

#[test]
fn test_lost_metadata_is_replayed_from_older_snapshot() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();

    let queue = start(builder(dir.path(), &uploads));
    queue.inject_errors_for_operation(Some(fail_operation_for(
        OperationKind::WriteMetadata,
        vec![1],
    )));
    write_all(&queue, 0..2);
    shut_down(queue);

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 2..3);
    wait(|cb| queue.flush(cb)).unwrap();

    let mut previous: Option<RecordDigest> = None;
    let mut ids = Vec::new();
    for event in uploads.drain() {
        if let Event::Record {
            info, digest, blob, ..
        } = event
        {
            assert_eq!(digest, chain_digest(previous.as_ref(), &blob));
            previous = Some(digest);
            ids.push(info.sequencing_id);
        }
    }
    assert_eq!(ids, vec![0, 1, 2]);
}

#[test]
fn test_corrupted_frame_is_reported_as_gap() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let frame = frame_size(record(0));

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..5);
    let generation_id = queue.generation_id();
    shut_down(queue);

    let path = data_file_path(dir.path(), PREFIX, generation_id, 0);
    flip_byte(&path, 2 * frame + 60);

    let queue = start(builder(dir.path(), &uploads));
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Gap(2, 1),
        Seen::Record(3),
        Seen::Record(4),
        Seen::Completed(true),
    ]);
}

#[test]
fn test_damaged_frame_after_last_snapshot_does_not_block_init() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let frame = frame_size(record(0));

    let queue = start(builder(dir.path(), &uploads));
    queue.inject_errors_for_operation(Some(fail_operation_for(
        OperationKind::WriteMetadata,
        vec![2, 3, 4],
    )));
    write_all(&queue, 0..5);
    let generation_id = queue.generation_id();
    shut_down(queue);

    flip_byte(
        &data_file_path(dir.path(), PREFIX, generation_id, 0),
        2 * frame + 60,
    );

    let queue = start(builder(dir.path(), &uploads));
    assert_eq!(queue.generation_id(), generation_id);
    write_all(&queue, 5..6);
    wait(|cb| queue.flush(cb)).unwrap();

    let events = uploads.drain();
    assert_eq!(events.iter().map(Event::seen).collect::<Vec<_>>(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Gap(2, 1),
        Seen::Record(3),
        Seen::Record(4),
        Seen::Record(5),
        Seen::Completed(true),
    ]);
    let chained: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Record {
                info, digest, blob, ..
            } if info.sequencing_id >= 3 => Some((*digest, blob.clone())),
            _ => None,
        })
        .collect();
    for pair in chained.windows(2) {
        assert_eq!(pair[1].0, chain_digest(Some(&pair[0].0), &pair[1].1));
    }
}

#[test]
fn test_torn_first_frame_of_new_file_is_discarded() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);
    let generation_id = queue.generation_id();
    shut_down(queue);

    let torn = data_file_path(dir.path(), PREFIX, generation_id, 3);
    std::fs::write(&torn, [0xa5u8; 20]).unwrap();

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 3..5);
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Record(2),
        Seen::Record(3),
        Seen::Record(4),
        Seen::Completed(true),
    ]);
}

#[test]
fn test_repeated_sequencing_id_fails_upload() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let frame = frame_size(record(0)) as usize;

    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);
    let generation_id = queue.generation_id();
    shut_down(queue);

    let path = data_file_path(dir.path(), PREFIX, generation_id, 0);
    let mut data = std::fs::read(&path).unwrap();
    data.copy_within(0..frame, frame);
    std::fs::write(&path, data).unwrap();

    let queue = start(builder(dir.path(), &uploads));
    let err = wait(|cb| queue.flush(cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InternalInvariantViolation);
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Completed(false)
    ]);
}

#[test]
fn test_upload_resumes_from_first_unconfirmed() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..5);

    uploads.set_limit(2);
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Completed(true)
    ]);

    uploads.set_limit(0);
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen().first(), Some(&Seen::Record(0)));

    wait(|cb| queue.confirm(1, false, cb)).unwrap();
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(2),
        Seen::Record(3),
        Seen::Record(4),
        Seen::Completed(true),
    ]);
}

#[test]
fn test_confirm_is_idempotent_and_force_rewinds() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);

    wait(|cb| queue.confirm(1, false, cb)).unwrap();
    wait(|cb| queue.confirm(1, false, cb)).unwrap();
    wait(|cb| queue.confirm(0, false, cb)).unwrap();
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(2),
        Seen::Completed(true)
    ]);

    let err = wait(|cb| queue.confirm(-2, false, cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRecord);

    wait(|cb| queue.confirm(-1, true, cb)).unwrap();
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Record(2),
        Seen::Completed(true),
    ]);
}

#[test]
fn test_confirm_rejects_unassigned_ids_and_other_generations() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);

    for sequencing_id in [3, 100] {
        let err = wait(|cb| queue.confirm(sequencing_id, false, cb)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRecord);
    }

    let info = |generation_id, sequencing_id| SequenceInformation {
        sequencing_id,
        generation_id,
        priority: Priority::SlowBatch,
    };
    let stale = info(queue.generation_id() + 1, 1);
    let err = wait(|cb| queue.confirm_sequence(stale, false, cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRecord);

    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Record(2),
        Seen::Completed(true),
    ]);

    let current = info(queue.generation_id(), 1);
    wait(|cb| queue.confirm_sequence(current, false, cb)).unwrap();
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(2),
        Seen::Completed(true)
    ]);
}

/// Confirms through the queue while its first record is being uploaded and
/// reports whether the first data file still exists at that point.
struct ConfirmingUploader {
    queue:       Weak<StorageQueue>,
    dir:         PathBuf,
    up_to:       i64,
    file_exists: Sender<bool>,
    confirmed:   bool,
}

impl Uploader for ConfirmingUploader {
    fn process_record(&mut self, _record: UploadRecord<'_>) -> bool {
        if !self.confirmed
            && let Some(queue) = self.queue.upgrade()
        {
            self.confirmed = true;
            let file = data_file_path(&self.dir, PREFIX, queue.generation_id(), 0);
            let file_exists = self.file_exists.clone();
            queue.confirm(self.up_to, false, move |status| {
                status.unwrap();
                let _ = file_exists.send(file.exists());
            });
        }
        true
    }

    fn process_gap(&mut self, _start: SequenceInformation, _count: u64) -> bool { true }

    fn completed(self: Box<Self>, _status: Result<()>) {}
}

#[test]
fn test_confirm_during_upload_defers_file_deletion() {
    setup();
    let dir = TempDir::new().unwrap();
    let frame = frame_size(record(0));
    let slot: Arc<Mutex<Weak<StorageQueue>>> = Arc::default();
    let (exists_tx, exists_rx) = channel::unbounded();

    let factory: UploaderFactory = {
        let slot = Arc::clone(&slot);
        let dir = dir.path().to_path_buf();
        Arc::new(move |_: UploadReason, _: Priority| {
            Some(Box::new(ConfirmingUploader {
                queue:       slot.lock().unwrap().clone(),
                dir:         dir.clone(),
                up_to:       2,
                file_exists: exists_tx.clone(),
                confirmed:   false,
            }) as Box<dyn Uploader>)
        })
    };
    let queue = start(
        QueueBuilder::with_directory(dir.path())
            .upload_period(Duration::MAX)
            .upload_retry_delay(Duration::ZERO)
            .max_single_file_size(3 * frame)
            .uploader_factory(factory),
    );
    *slot.lock().unwrap() = Arc::downgrade(&queue);

    write_all(&queue, 0..6);
    let first_file = data_file_path(dir.path(), PREFIX, queue.generation_id(), 0);

    wait(|cb| queue.flush(cb)).unwrap();
    assert!(exists_rx.recv_timeout(TIMEOUT).unwrap());

    // Runs after the pass has finished on the queue's sequence.
    wait(|cb| queue.on_init(cb)).unwrap();
    assert!(!first_file.exists());
    assert!(data_file_path(dir.path(), PREFIX, queue.generation_id(), 3).exists());
}

#[test]
fn test_operations_before_init_fail() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = builder(dir.path(), &uploads).build().unwrap();
    assert_eq!(queue.state(), QueueState::Uninitialized);

    let err = wait(|cb| queue.write(record(0), cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    let (tx, rx) = channel::bounded(1);
    queue.on_init(move |status| {
        let _ = tx.send(status);
    });
    wait(|cb| queue.init(cb)).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(queue.state(), QueueState::Ready);

    wait(|cb| queue.init(cb)).unwrap();
}

#[test]
fn test_declined_upload_reports_error() {
    setup();
    let dir = TempDir::new().unwrap();
    let queue = start(
        QueueBuilder::with_directory(dir.path())
            .upload_period(Duration::MAX)
            .upload_retry_delay(Duration::ZERO),
    );
    write_all(&queue, 0..1);

    let err = wait(|cb| queue.flush(cb)).unwrap_err();
    assert!(matches!(err, QueueError::UploadDeclined { reason: "MANUAL" }));
}

#[test]
fn test_zero_upload_period_uploads_every_write() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads).upload_period(Duration::ZERO));

    write_all(&queue, 0..1);
    match uploads.recv() {
        Event::Record { reason, info, .. } => {
            assert_eq!(reason, UploadReason::Immediate);
            assert_eq!(info.sequencing_id, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_failed_append_leaves_gap() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads));
    queue.inject_errors_for_operation(Some(fail_operation_for(OperationKind::WriteBlock, vec![2])));

    for i in 0..5 {
        let status = wait(|cb| queue.write(record(i), cb));
        assert_eq!(status.is_ok(), i != 2, "write {i}");
    }

    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Gap(2, 1),
        Seen::Record(3),
        Seen::Record(4),
        Seen::Completed(true),
    ]);
}

#[test]
fn test_unreadable_record_is_reported_as_gap() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads));
    write_all(&queue, 0..3);

    queue.inject_errors_for_operation(Some(fail_operation_for(OperationKind::ReadBlock, vec![1])));
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Gap(1, 1),
        Seen::Record(2),
        Seen::Completed(true),
    ]);
}

#[test_case(OperationKind::WrappedRecordLowMemory ; "serialized record")]
#[test_case(OperationKind::EncryptedRecordLowMemory ; "sealed record")]
fn test_low_memory_rejects_write_without_consuming_id(operation: OperationKind) {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads));

    queue.inject_errors_for_operation(Some(fail_operation_for(operation, vec![0])));
    let err = wait(|cb| queue.write(record(0), cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    queue.inject_errors_for_operation(None);
    write_all(&queue, 1..2);
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Completed(true)
    ]);
}

#[test]
fn test_oversized_record_is_rejected_without_consuming_id() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads).max_single_record_size(256));

    let err = wait(|cb| queue.write(big_record(), cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRecord);

    write_all(&queue, 0..1);
    wait(|cb| queue.flush(cb)).unwrap();
    assert_eq!(uploads.drain_seen(), vec![
        Seen::Record(0),
        Seen::Completed(true)
    ]);
}

fn record_of_len(len: usize) -> Record {
    Record {
        destination:  "telemetry".to_string(),
        data:         Bytes::from(vec![b'x'; len]),
        timestamp_us: 1_700_000_000_000_000,
    }
}

#[test]
fn test_record_filling_the_read_buffer_round_trips() {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let max_read_buffer_size = 4096;

    // Payload length prefixes stay 3 bytes wide between 300 and 4096 bytes.
    let base = frame_size(record_of_len(300));
    let len = 300 + (max_read_buffer_size - base) as usize;
    let queue = start(builder(dir.path(), &uploads).max_read_buffer_size(max_read_buffer_size));

    let err = wait(|cb| queue.write(record_of_len(len + 1), cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRecord);
    wait(|cb| queue.write(record_of_len(len), cb)).unwrap();

    wait(|cb| queue.flush(cb)).unwrap();
    let events = uploads.drain();
    assert_eq!(events.len(), 2);
    match &events[0] {
        Event::Record { info, data, blob, .. } => {
            assert_eq!(info.sequencing_id, 0);
            assert_eq!(data.len(), len);
            assert_eq!(blob.len() as u64, max_read_buffer_size - 48);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(events[1].seen(), Seen::Completed(true));
}

#[test_case(false ; "shedding disabled")]
#[test_case(true ; "nothing to shed")]
fn test_low_disk_space_rejects_write(can_shed: bool) {
    setup();
    let dir = TempDir::new().unwrap();
    let uploads = Uploads::new();
    let queue = start(builder(dir.path(), &uploads).can_shed_records(can_shed));

    queue.inject_errors_for_operation(Some(fail_operation_for(
        OperationKind::WriteLowDiskSpace,
        vec![0],
    )));
    let err = wait(|cb| queue.write(record(0), cb)).unwrap_err();
    assert!(matches!(err, QueueError::ResourceExhausted {
        resource: "disk",
        ..
    }));
}

type Registry = Arc<Mutex<Vec<Weak<StorageQueue>>>>;

fn shedding_builder(
    dir: &Path,
    uploads: &Uploads,
    disk: &Arc<ResourceManager>,
    registry: &Registry,
) -> QueueBuilder {
    let registry = Arc::clone(registry);
    builder(dir, uploads)
        .max_single_file_size(1)
        .disk_resource(Arc::clone(disk))
        .degradation_candidates(Arc::new(
            move |writer: Arc<StorageQueue>, ready: CandidatesReady| {
                let queues: Vec<_> = registry
                    .lock()
                    .unwrap()
                    .iter()
                    .filter_map(Weak::upgrade)
                    .collect();
                ready(candidates_by_age(&queues, &writer));
            },
        ))
}

#[test_case(Priority::BackgroundBatch ; "lower priority")]
#[test_case(Priority::FastBatch ; "same priority older queue")]
fn test_disk_pressure_sheds_oldest_files_of_other_queue(priority_a: Priority) {
    setup();
    let root = TempDir::new().unwrap();
    let small = frame_size(record(0));
    let big = frame_size(big_record());
    assert!(big > 3 * small);

    let disk = Arc::new(ResourceManager::new("disk", 12 * small + big - 3 * small));
    let registry: Registry = Arc::default();
    let uploads_a = Uploads::new();
    let uploads_b = Uploads::new();
    let dir_a = root.path().join("a");
    let dir_b = root.path().join("b");

    let queue_a = start(shedding_builder(&dir_a, &uploads_a, &disk, &registry).priority(priority_a));
    let queue_b =
        start(shedding_builder(&dir_b, &uploads_b, &disk, &registry).priority(Priority::FastBatch));
    registry
        .lock()
        .unwrap()
        .extend([Arc::downgrade(&queue_a), Arc::downgrade(&queue_b)]);

    write_all(&queue_a, 0..10);
    write_all(&queue_b, 0..2);
    assert_eq!(disk.available(), big - 3 * small);

    wait(|cb| queue_b.write(big_record(), cb)).unwrap();

    let generation_a = queue_a.generation_id();
    for start in 0..3 {
        assert!(!data_file_path(&dir_a, PREFIX, generation_a, start).exists());
    }
    assert!(data_file_path(&dir_a, PREFIX, generation_a, 3).exists());

    wait(|cb| queue_a.flush(cb)).unwrap();
    let seen = uploads_a.drain_seen();
    assert_eq!(seen.first(), Some(&Seen::Record(3)));
    assert_eq!(seen.len(), 8);

    wait(|cb| queue_b.flush(cb)).unwrap();
    assert_eq!(uploads_b.drain_seen(), vec![
        Seen::Record(0),
        Seen::Record(1),
        Seen::Record(2),
        Seen::Completed(true),
    ]);
}

#[test]
fn test_disk_pressure_fails_when_nothing_can_be_shed() {
    setup();
    let root = TempDir::new().unwrap();
    let small = frame_size(record(0));
    let big = frame_size(big_record());

    let disk = Arc::new(ResourceManager::new("disk", small + big - 1));
    let registry: Registry = Arc::default();
    let uploads_a = Uploads::new();
    let uploads_b = Uploads::new();

    let queue_a = start(
        shedding_builder(&root.path().join("a"), &uploads_a, &disk, &registry)
            .priority(Priority::BackgroundBatch),
    );
    let queue_b = start(
        shedding_builder(&root.path().join("b"), &uploads_b, &disk, &registry)
            .priority(Priority::FastBatch),
    );
    registry
        .lock()
        .unwrap()
        .extend([Arc::downgrade(&queue_a), Arc::downgrade(&queue_b)]);

    write_all(&queue_a, 0..1);
    let err = wait(|cb| queue_b.write(big_record(), cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    wait(|cb| queue_a.flush(cb)).unwrap();
    assert_eq!(uploads_a.drain_seen(), vec![
        Seen::Record(0),
        Seen::Completed(true)
    ]);
}

#[test]
fn test_init_retries_with_backoff_then_fails() {
    setup();
    let root = TempDir::new().unwrap();
    let path = root.path().join("queue");
    std::fs::write(&path, b"not a directory").unwrap();

    let retries = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&retries);
    let uploads = Uploads::new();
    let queue = builder(&path, &uploads)
        .init_retries(3)
        .init_retry(Some(Arc::new(move |error: &QueueError, retry_count: usize| {
            assert!(error.is_transient());
            seen.lock().unwrap().push(retry_count);
            Ok(Duration::from_millis(10))
        })))
        .build()
        .unwrap();

    let err = wait(|cb| queue.init(cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InitializationFailed);
    assert_eq!(*retries.lock().unwrap(), vec![3, 2, 1]);
    assert_eq!(queue.state(), QueueState::Uninitialized);
}

#[test]
fn test_init_succeeds_after_transient_failure() {
    setup();
    let root = TempDir::new().unwrap();
    let path = root.path().join("queue");
    std::fs::write(&path, b"not a directory").unwrap();

    let retries = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&retries);
    let blocker = path.clone();
    let uploads = Uploads::new();
    let queue = builder(&path, &uploads)
        .init_retry(Some(Arc::new(move |_: &QueueError, _: usize| {
            seen.fetch_add(1, Ordering::SeqCst);
            std::fs::remove_file(&blocker).unwrap();
            Ok(Duration::from_millis(10))
        })))
        .build()
        .unwrap();

    wait(|cb| queue.init(cb)).unwrap();
    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert_eq!(queue.state(), QueueState::Ready);
    assert!(path.is_dir());
}

#[test]
fn test_inactive_queue_drains_and_self_destructs() {
    setup();
    let root = TempDir::new().unwrap();
    let dir = root.path().join("queue");
    let uploads = Uploads::new();
    let (disabled_tx, disabled_rx) = channel::unbounded();
    let (disconnected_tx, disconnected_rx) = channel::unbounded();

    let queue = start(
        builder(&dir, &uploads)
            .inactivity_period(Duration::from_millis(200))
            .disable_queue(Arc::new(move |guid: &str, done: Done| {
                disabled_tx.send(guid.to_string()).unwrap();
                done();
            }))
            .disconnect_queue(Arc::new(move |guid: &str, done: Done| {
                done();
                disconnected_tx.send(guid.to_string()).unwrap();
            })),
    );
    write_all(&queue, 0..1);

    assert_eq!(disabled_rx.recv_timeout(TIMEOUT).unwrap(), queue.generation_guid());
    match uploads.recv() {
        Event::Record { reason, info, .. } => {
            assert_eq!(reason, UploadReason::Inactivity);
            assert_eq!(info.sequencing_id, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let err = wait(|cb| queue.write(record(1), cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    wait(|cb| queue.confirm(0, false, cb)).unwrap();
    assert_eq!(disconnected_rx.recv_timeout(TIMEOUT).unwrap(), queue.generation_guid());

    let err = wait(|cb| queue.flush(cb)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert_eq!(queue.state(), QueueState::Destroyed);
    assert!(!dir.exists());
}

#[test]
fn test_delete_all_files_and_directory() {
    setup();
    let root = TempDir::new().unwrap();
    let dir = root.path().join("queue");
    let uploads = Uploads::new();
    let queue = start(builder(&dir, &uploads));
    write_all(&queue, 0..3);
    assert!(dir.is_dir());

    wait(|cb| queue.delete_all_files_and_directory(cb)).unwrap();
    assert!(!dir.exists());
    assert_eq!(queue.state(), QueueState::Destroyed);
}
