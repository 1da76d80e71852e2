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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Upload priority of the records kept in a queue.
///
/// Ordered from the least to the most important; degradation sheds the less
/// important queues first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    BackgroundBatch,
    #[default]
    SlowBatch,
    FastBatch,
    ManualBatch,
    Immediate,
    Security,
}

/// Immutable queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Directory owned by the queue; created on initialization.
    pub directory:              PathBuf,
    /// Data files are named `<file_prefix>.<generation>.<sequencing_id>`.
    pub file_prefix:            String,
    pub priority:               Priority,
    /// A non-empty file is rotated before it would grow past this size.
    pub max_single_file_size:   u64,
    /// Largest serialized record accepted by `write`.
    pub max_single_record_size: u64,
    /// Upper bound of a file's read buffer window.
    pub max_read_buffer_size:   u64,
    /// Period of the upload timer. Zero uploads right after every write;
    /// `Duration::MAX` disables the timer.
    pub upload_period:          Duration,
    /// Delay of the check-back upload after an incomplete pass. Zero
    /// disables it.
    pub upload_retry_delay:     Duration,
    /// Idle time after which the queue disables itself and, once empty,
    /// self-destructs. Zero disables the timer.
    pub inactivity_period:      Duration,
    /// Shed other queues' files when a write cannot reserve disk space.
    pub can_shed_records:       bool,
    /// Number of times a failed initialization may be retried.
    pub init_retries:           usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            directory:              PathBuf::from("./queue_data"),
            file_prefix:            String::from("P_RECORDS"),
            priority:               Priority::default(),
            max_single_file_size:   2 * 1024 * 1024,
            max_single_record_size: 1024 * 1024,
            max_read_buffer_size:   2 * 1024 * 1024,
            upload_period:          Duration::from_secs(60),
            upload_retry_delay:     Duration::from_secs(60),
            inactivity_period:      Duration::ZERO,
            can_shed_records:       true,
            init_retries:           5,
        }
    }
}

impl QueueOptions {
    pub(crate) fn periodic_upload(&self) -> Option<Duration> {
        (!self.upload_period.is_zero() && self.upload_period != Duration::MAX)
            .then_some(self.upload_period)
    }

    pub(crate) const fn uploads_immediately(&self) -> bool { self.upload_period.is_zero() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::BackgroundBatch < Priority::SlowBatch);
        assert!(Priority::Immediate < Priority::Security);
        assert_eq!(Priority::FastBatch.to_string(), "FAST_BATCH");
    }

    #[test]
    fn test_upload_period_modes() {
        let mut options = QueueOptions::default();
        assert_eq!(options.periodic_upload(), Some(Duration::from_secs(60)));
        assert!(!options.uploads_immediately());

        options.upload_period = Duration::ZERO;
        assert_eq!(options.periodic_upload(), None);
        assert!(options.uploads_immediately());

        options.upload_period = Duration::MAX;
        assert_eq!(options.periodic_upload(), None);
        assert!(!options.uploads_immediately());
    }

    #[test]
    fn test_options_from_partial_config() {
        let options: QueueOptions = serde_json::from_str(
            r#"{"directory": "/var/lib/reportq/fast", "priority": "fast_batch", "max_single_file_size": 4096}"#,
        )
        .unwrap();

        assert_eq!(options.directory, PathBuf::from("/var/lib/reportq/fast"));
        assert_eq!(options.priority, Priority::FastBatch);
        assert_eq!(options.max_single_file_size, 4096);
        assert_eq!(options.file_prefix, "P_RECORDS");
        assert!(options.can_shed_records);
    }
}
