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

//! The ordered set of data files of one queue.
//!
//! Files are keyed by the first sequencing id they hold; file `k` covers
//! `[k, next key)`, and the last file covers `[k, next_sequencing_id)`. Only
//! the last file is ever writable.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::ensure;
use tracing::{debug, info};

use crate::{
    config::QueueOptions,
    error::{InternalSnafu, Result},
    file::SingleFile,
    path::data_file_path,
    resources::ResourceManager,
};

#[derive(Debug)]
pub(crate) struct FileSet {
    dir:                 PathBuf,
    prefix:              String,
    max_file_size:       u64,
    disk:                Arc<ResourceManager>,
    memory:              Arc<ResourceManager>,
    files:               BTreeMap<i64, SingleFile>,
    generation_id:       i64,
    first_sequencing_id: i64,
    next_sequencing_id:  i64,
}

impl FileSet {
    pub(crate) fn new(
        options: &QueueOptions,
        disk: Arc<ResourceManager>,
        memory: Arc<ResourceManager>,
    ) -> Self {
        Self {
            dir: options.directory.clone(),
            prefix: options.file_prefix.clone(),
            max_file_size: options.max_single_file_size,
            disk,
            memory,
            files: BTreeMap::new(),
            generation_id: 0,
            first_sequencing_id: 0,
            next_sequencing_id: 0,
        }
    }

    pub(crate) fn dir(&self) -> &Path { &self.dir }

    pub(crate) const fn disk(&self) -> &Arc<ResourceManager> { &self.disk }

    pub(crate) const fn memory(&self) -> &Arc<ResourceManager> { &self.memory }

    pub(crate) const fn generation_id(&self) -> i64 { self.generation_id }

    pub(crate) const fn set_generation_id(&mut self, generation_id: i64) {
        self.generation_id = generation_id;
    }

    pub(crate) const fn first_sequencing_id(&self) -> i64 { self.first_sequencing_id }

    pub(crate) const fn next_sequencing_id(&self) -> i64 { self.next_sequencing_id }

    /// Sets the id range after recovery.
    pub(crate) const fn reset_sequencing(&mut self, first: i64, next: i64) {
        self.first_sequencing_id = first;
        self.next_sequencing_id = next;
    }

    pub(crate) fn insert(&mut self, start_sequencing_id: i64, file: SingleFile) {
        self.files.insert(start_sequencing_id, file);
    }

    pub(crate) fn get_mut(&mut self, key: i64) -> Option<&mut SingleFile> { self.files.get_mut(&key) }

    pub(crate) fn is_empty(&self) -> bool { self.files.is_empty() }

    pub(crate) fn keys(&self) -> Vec<i64> { self.files.keys().copied().collect() }

    pub(crate) fn last_key(&self) -> Option<i64> { self.files.keys().next_back().copied() }

    /// Exclusive end of the id range covered by the file at `key`.
    pub(crate) fn file_end(&self, key: i64) -> i64 {
        self.files
            .range(key + 1..)
            .next()
            .map_or(self.next_sequencing_id, |(next, _)| *next)
    }

    /// Creates an empty writable file starting at `next_sequencing_id` and
    /// makes it the last one.
    pub(crate) fn open_new_writable_file(&mut self) -> Result<i64> {
        let key = self.next_sequencing_id;
        ensure!(
            !self.files.contains_key(&key),
            InternalSnafu {
                message: format!("data file for sequencing id {key} already exists"),
            }
        );
        if let Some(last) = self.files.values_mut().next_back() {
            last.make_read_only();
        }

        let path = data_file_path(&self.dir, &self.prefix, self.generation_id, key);
        let mut file = SingleFile::create(&path, 0, &self.disk, &self.memory)?;
        file.open(false)?;
        self.files.insert(key, file);

        debug!(path = ?path, start_sequencing_id = key, "Opened new writable data file");
        Ok(key)
    }

    /// Assigns the next sequencing id and returns it with the key of the file
    /// the record of `size` bytes must be appended to.
    ///
    /// Rotates to a new file first when the record would push a non-empty
    /// last file past the size limit.
    pub(crate) fn assign_last_file(&mut self, size: u64) -> Result<(i64, i64)> {
        let rotate = match self.files.values().next_back() {
            None => true,
            Some(last) if last.is_read_only() => true,
            Some(last) => !last.is_empty() && last.size() + size > self.max_file_size,
        };
        let key = if rotate {
            self.open_new_writable_file()?
        } else {
            self.last_key().unwrap_or(self.next_sequencing_id)
        };

        let sequencing_id = self.next_sequencing_id;
        self.next_sequencing_id += 1;
        Ok((sequencing_id, key))
    }

    /// Closes a non-empty writable last file so its records become visible
    /// to readers.
    pub(crate) fn switch_last_file_if_not_empty(&mut self) -> Result<()> {
        match self.files.values().next_back() {
            Some(last) if !last.is_read_only() && !last.is_empty() => {
                self.open_new_writable_file()?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Keys of the closed files holding records with ids `>= from`.
    pub(crate) fn collect_files_for_upload(&self, from: i64) -> Vec<i64> {
        self.files
            .iter()
            .filter(|(key, file)| file.is_read_only() && self.file_end(**key) > from)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Deletes every file whose whole range is `<= up_to`, never the last
    /// file. Returns the number of deleted files.
    pub(crate) fn remove_confirmed(&mut self, up_to: i64) -> usize {
        let mut removed = 0;
        while let Some(first) = self.files.keys().next().copied() {
            if Some(first) == self.last_key() || self.file_end(first) - 1 > up_to {
                break;
            }
            self.remove_file(first);
            removed += 1;
        }
        self.update_first_sequencing_id();
        removed
    }

    /// Deletes files oldest first until the disk resource can fit `space`
    /// more bytes, never the last file. Returns whether it can.
    pub(crate) fn shed_files(&mut self, space: u64) -> bool {
        while !self.disk.fits(space) {
            let Some(first) = self.files.keys().next().copied() else {
                break;
            };
            if Some(first) == self.last_key() {
                break;
            }
            info!(
                dir = ?self.dir,
                start_sequencing_id = first,
                end_sequencing_id = self.file_end(first),
                "Shedding data file"
            );
            self.remove_file(first);
        }
        self.update_first_sequencing_id();
        self.disk.fits(space)
    }

    /// Drops every file instance; the files stay on disk.
    pub(crate) fn release_all(&mut self) {
        for file in self.files.values_mut() {
            file.close();
        }
        self.files.clear();
    }

    /// Deletes every data file.
    pub(crate) fn delete_all(&mut self) {
        for (_, file) in std::mem::take(&mut self.files) {
            file.delete();
        }
        self.update_first_sequencing_id();
    }

    /// Deletes the file at `key`.
    pub(crate) fn remove_file(&mut self, key: i64) {
        if let Some(file) = self.files.remove(&key) {
            file.delete();
        }
    }

    fn update_first_sequencing_id(&mut self) {
        self.first_sequencing_id = self
            .files
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_sequencing_id);
    }
}
