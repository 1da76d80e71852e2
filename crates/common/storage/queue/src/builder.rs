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

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    Priority, QueueOptions, Result, StorageQueue,
    degradation::DegradationCandidatesCb,
    queue::{DisableQueueCb, DisconnectQueueCb, InitRetryCb, QueueHooks, maybe_backoff_and_reinit},
    resources::ResourceManager,
    transform::{CompressionModule, EncryptionModule, RecordTransform},
    uploader::{UploaderFactory, no_uploads},
};

/// Disk budget used when the builder is given none.
pub const DEFAULT_DISK_LIMIT: u64 = 64 * 1024 * 1024 * 1024;

/// Memory budget used when the builder is given none.
pub const DEFAULT_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

pub struct QueueBuilder {
    options:          QueueOptions,
    transform:        RecordTransform,
    uploader_factory: UploaderFactory,
    hooks:            QueueHooks,
    disk:             Option<Arc<ResourceManager>>,
    memory:           Option<Arc<ResourceManager>>,
}

impl QueueBuilder {
    pub fn new(options: QueueOptions) -> Self {
        let init_retry: InitRetryCb = Arc::new(maybe_backoff_and_reinit);
        Self {
            options,
            transform: RecordTransform::default(),
            uploader_factory: no_uploads(),
            hooks: QueueHooks {
                init_retry: Some(init_retry),
                ..QueueHooks::default()
            },
            disk: None,
            memory: None,
        }
    }

    /// Builder over default options for the queue in `directory`.
    pub fn with_directory<P: Into<PathBuf>>(directory: P) -> Self {
        Self::new(QueueOptions {
            directory: directory.into(),
            ..QueueOptions::default()
        })
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.file_prefix = prefix.into();
        self
    }

    pub fn max_single_file_size(mut self, size: u64) -> Self {
        self.options.max_single_file_size = size;
        self
    }

    pub fn max_single_record_size(mut self, size: u64) -> Self {
        self.options.max_single_record_size = size;
        self
    }

    pub fn max_read_buffer_size(mut self, size: u64) -> Self {
        self.options.max_read_buffer_size = size;
        self
    }

    pub fn upload_period(mut self, period: Duration) -> Self {
        self.options.upload_period = period;
        self
    }

    pub fn upload_retry_delay(mut self, delay: Duration) -> Self {
        self.options.upload_retry_delay = delay;
        self
    }

    pub fn inactivity_period(mut self, period: Duration) -> Self {
        self.options.inactivity_period = period;
        self
    }

    pub fn can_shed_records(mut self, can_shed: bool) -> Self {
        self.options.can_shed_records = can_shed;
        self
    }

    pub fn init_retries(mut self, retries: usize) -> Self {
        self.options.init_retries = retries;
        self
    }

    pub fn compression(mut self, compression: Arc<dyn CompressionModule>) -> Self {
        self.transform = RecordTransform::new(compression, self.transform.encryption());
        self
    }

    pub fn encryption(mut self, encryption: Arc<dyn EncryptionModule>) -> Self {
        self.transform = RecordTransform::new(self.transform.compression(), encryption);
        self
    }

    pub fn uploader_factory(mut self, factory: UploaderFactory) -> Self {
        self.uploader_factory = factory;
        self
    }

    /// Shares `disk` with the other queues built with it.
    pub fn disk_resource(mut self, disk: Arc<ResourceManager>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Shares `memory` with the other queues built with it.
    pub fn memory_resource(mut self, memory: Arc<ResourceManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn degradation_candidates(mut self, callback: DegradationCandidatesCb) -> Self {
        self.hooks.degradation_candidates = Some(callback);
        self
    }

    pub fn disable_queue(mut self, callback: DisableQueueCb) -> Self {
        self.hooks.disable_queue = Some(callback);
        self
    }

    pub fn disconnect_queue(mut self, callback: DisconnectQueueCb) -> Self {
        self.hooks.disconnect_queue = Some(callback);
        self
    }

    /// Replaces [`maybe_backoff_and_reinit`]; `None` never retries.
    pub fn init_retry(mut self, callback: Option<InitRetryCb>) -> Self {
        self.hooks.init_retry = callback;
        self
    }

    /// Starts the queue's sequences. The queue must still be initialized
    /// with [`StorageQueue::init`].
    pub fn build(self) -> Result<Arc<StorageQueue>> {
        let disk = self
            .disk
            .unwrap_or_else(|| Arc::new(ResourceManager::new("disk", DEFAULT_DISK_LIMIT)));
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(ResourceManager::new("memory", DEFAULT_MEMORY_LIMIT)));
        StorageQueue::start(
            self.options,
            self.transform,
            self.uploader_factory,
            self.hooks,
            disk,
            memory,
        )
    }
}
