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

//! Crash recovery for the persistent queue.
//!
//! Recovery rebuilds the queue state from its directory:
//! 1. Enumerate data files; all of them must agree on one generation
//! 2. Scan the last data file to learn the next sequencing id
//! 3. Restore the newest metadata snapshot not past the last record and
//!    replay the frames after it, verifying the digest chain
//! 4. Delete every file that is not part of the recovered state
//!
//! Recovered files are read-only; the first write opens a new file.

use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
};

use rand::Rng;
use snafu::{ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    config::QueueOptions,
    error::{DigestChainBrokenSnafu, GenerationMismatchSnafu, IoSnafu, Result},
    file::{FrameRead, SingleFile},
    file_set::FileSet,
    frame::FRAME_HEADER_SIZE,
    metadata::{MetadataSnapshot, read_metadata},
    path::{FileKind, ScannedFile, scan_directory},
    record::{RecordDigest, chain_digest},
};

/// Largest payload a stored frame may declare.
pub(crate) const fn max_frame_payload(options: &QueueOptions) -> u64 {
    options
        .max_read_buffer_size
        .saturating_sub(FRAME_HEADER_SIZE as u64)
}

/// Rebuilds `files` from the queue directory and returns the digest of the
/// last stored record (`None` at the start of a generation).
pub(crate) fn recover(files: &mut FileSet, options: &QueueOptions) -> Result<Option<RecordDigest>> {
    let dir = options.directory.clone();
    info!(path = ?dir, "Starting queue recovery");

    std::fs::create_dir_all(&dir).context(IoSnafu { path: &dir })?;
    let scanned = scan_directory(&dir, &options.file_prefix)?;

    let mut used = HashSet::new();
    let mut generation = None;
    let mut snapshots = BTreeMap::new();
    for entry in &scanned {
        match entry.kind {
            FileKind::Data {
                generation_id,
                start_sequencing_id,
            } if entry.size > 0 => {
                if let Some(found) = generation_id {
                    let expected = *generation.get_or_insert(found);
                    ensure!(
                        expected == found,
                        GenerationMismatchSnafu {
                            expected,
                            found,
                            path: &entry.path,
                        }
                    );
                }
                if files.get_mut(start_sequencing_id).is_some() {
                    warn!(path = ?entry.path, "Duplicate data file start, ignoring");
                    continue;
                }
                let mut file =
                    SingleFile::create(&entry.path, entry.size, files.disk(), files.memory())?;
                file.make_read_only();
                files.insert(start_sequencing_id, file);
                used.insert(entry.path.clone());
            }
            FileKind::Metadata { sequencing_id } => {
                snapshots.insert(sequencing_id, entry.path.clone());
            }
            FileKind::Data { .. } | FileKind::Unexpected => {}
        }
    }

    let next = scan_last_file(files, options)?;
    let digest = match (files.keys().first().copied(), next) {
        (Some(first), Some(next)) => {
            match restore_metadata(files, generation, &snapshots, next - 1, options)? {
                Some((snapshot, path)) => {
                    used.insert(path);
                    files.set_generation_id(snapshot.generation_id);
                    files.reset_sequencing(first, next.max(snapshot.sequencing_id + 1));
                    Some(snapshot.digest)
                }
                None => {
                    warn!(path = ?dir, "No usable metadata for data files, starting fresh");
                    files.release_all();
                    used.clear();
                    start_fresh(files);
                    None
                }
            }
        }
        _ => restore_without_data(files, &snapshots, &mut used, next),
    };

    delete_unused_files(&scanned, &used);

    info!(
        path = ?dir,
        generation_id = files.generation_id(),
        first_sequencing_id = files.first_sequencing_id(),
        next_sequencing_id = files.next_sequencing_id(),
        data_files = files.keys().len(),
        "Queue recovery complete"
    );
    Ok(digest)
}

fn start_fresh(files: &mut FileSet) {
    files.set_generation_id(rand::rng().random_range(1..i64::MAX));
    files.reset_sequencing(0, 0);
}

/// No data files: the newest readable snapshot keeps ids monotonic, never
/// below `floor` (the start of a discarded file).
fn restore_without_data(
    files: &mut FileSet,
    snapshots: &BTreeMap<i64, PathBuf>,
    used: &mut HashSet<PathBuf>,
    floor: Option<i64>,
) -> Option<RecordDigest> {
    for (sequencing_id, path) in snapshots.iter().rev() {
        match read_metadata(path, *sequencing_id) {
            Ok(snapshot) => {
                used.insert(path.clone());
                files.set_generation_id(snapshot.generation_id);
                let next = floor.map_or(sequencing_id + 1, |floor| floor.max(sequencing_id + 1));
                files.reset_sequencing(next, next);
                return Some(snapshot.digest);
            }
            Err(e) => warn!(path = ?path, error = %e, "Skipping unreadable metadata"),
        }
    }
    start_fresh(files);
    None
}

/// Returns the id after the last valid frame of the last data file.
///
/// Trailing files without a single valid frame (a crash during the first
/// append to a fresh file) are deleted; their start ids stay a lower bound
/// for the next id. `None` when no data file is left.
fn scan_last_file(files: &mut FileSet, options: &QueueOptions) -> Result<Option<i64>> {
    let max_payload = max_frame_payload(options);
    let mut floor = None;

    while let Some(key) = files.last_key() {
        let Some(file) = files.get_mut(key) else {
            break;
        };
        let mut pos = 0;
        let mut last = None;
        loop {
            match file.read_frame(pos, max_payload, options.max_read_buffer_size)? {
                FrameRead::Frame { header, .. } => {
                    last = Some(header.sequencing_id);
                    pos += header.frame_size() as u64;
                }
                FrameRead::Damaged { header, error } => {
                    debug!(path = ?file.path(), error = %error, "Skipping damaged frame in last file");
                    pos += header.frame_size() as u64;
                }
                FrameRead::End | FrameRead::Truncated | FrameRead::Unreadable { .. } => break,
            }
        }
        file.close();

        if let Some(last) = last {
            let next = (last + 1).max(key);
            return Ok(Some(floor.map_or(next, |floor: i64| floor.max(next))));
        }
        warn!(path = ?file.path(), "Last data file holds no valid record, deleting");
        files.remove_file(key);
        floor = Some(floor.map_or(key, |floor: i64| floor.max(key)));
    }
    Ok(floor)
}

/// Picks the snapshot to resume from and verifies the chain up to
/// `last_sequencing_id`.
fn restore_metadata(
    files: &mut FileSet,
    generation: Option<i64>,
    snapshots: &BTreeMap<i64, PathBuf>,
    last_sequencing_id: i64,
    options: &QueueOptions,
) -> Result<Option<(MetadataSnapshot, PathBuf)>> {
    for (sequencing_id, path) in snapshots.iter().rev() {
        let snapshot = match read_metadata(path, *sequencing_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = ?path, error = %e, "Skipping unreadable metadata");
                continue;
            }
        };
        if let Some(generation) = generation
            && generation != snapshot.generation_id
        {
            warn!(path = ?path, generation, found = snapshot.generation_id, "Skipping metadata of another generation");
            continue;
        }

        let digest = if snapshot.sequencing_id <= last_sequencing_id {
            replay_chain(files, &snapshot, last_sequencing_id, options)?
        } else {
            snapshot.digest
        };
        return Ok(Some((
            MetadataSnapshot { digest, ..snapshot },
            path.clone(),
        )));
    }
    Ok(None)
}

/// Recomputes the digest chain from `snapshot` through the stored frames up
/// to `last_sequencing_id`.
fn replay_chain(
    files: &mut FileSet,
    snapshot: &MetadataSnapshot,
    last_sequencing_id: i64,
    options: &QueueOptions,
) -> Result<RecordDigest> {
    let max_payload = max_frame_payload(options);
    let mut digest = snapshot.digest;
    let mut after_damage = false;

    for key in files.keys() {
        if files.file_end(key) <= snapshot.sequencing_id {
            continue;
        }
        let Some(file) = files.get_mut(key) else {
            continue;
        };
        let mut pos = 0;
        loop {
            match file.read_frame(pos, max_payload, options.max_read_buffer_size)? {
                FrameRead::Frame { header, payload } => {
                    pos += header.frame_size() as u64;
                    let sequencing_id = header.sequencing_id;
                    if sequencing_id == snapshot.sequencing_id {
                        ensure!(
                            header.digest == snapshot.digest,
                            DigestChainBrokenSnafu { sequencing_id }
                        );
                    }
                    if sequencing_id <= snapshot.sequencing_id {
                        after_damage = false;
                        continue;
                    }
                    if sequencing_id > last_sequencing_id {
                        break;
                    }
                    if after_damage {
                        // The damaged record is a gap; the chain resumes at
                        // the first intact frame after it.
                        warn!(path = ?file.path(), sequencing_id, "Resuming digest chain after damaged frame");
                        after_damage = false;
                        digest = header.digest;
                        continue;
                    }
                    let computed = chain_digest(Some(&digest), &payload);
                    ensure!(
                        computed == header.digest,
                        DigestChainBrokenSnafu { sequencing_id }
                    );
                    digest = computed;
                }
                FrameRead::Damaged { header, .. } => {
                    pos += header.frame_size() as u64;
                    after_damage = true;
                }
                FrameRead::End | FrameRead::Truncated | FrameRead::Unreadable { .. } => break,
            }
        }
        file.close();
    }

    debug!(
        from = snapshot.sequencing_id,
        to = last_sequencing_id,
        "Digest chain verified"
    );
    Ok(digest)
}

fn delete_unused_files(scanned: &[ScannedFile], used: &HashSet<PathBuf>) {
    for file in scanned.iter().filter(|file| !used.contains(&file.path)) {
        match std::fs::remove_file(&file.path) {
            Ok(()) => debug!(path = ?file.path, "Deleted unused file"),
            Err(e) => warn!(path = ?file.path, error = %e, "Failed to delete unused file"),
        }
    }
}
