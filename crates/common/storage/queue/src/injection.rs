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

//! Error injection for tests of failure paths.

use std::sync::Arc;

use crate::error::{InjectedSnafu, Result};

/// Queue step an injected error can target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    /// Reading one stored record during an upload; the record becomes a gap.
    ReadBlock,
    /// Appending a frame to its data file.
    WriteBlock,
    /// Writing the metadata snapshot after an append.
    WriteMetadata,
    /// Memory reservation for the serialized record.
    WrappedRecordLowMemory,
    /// Memory reservation for the sealed record.
    EncryptedRecordLowMemory,
    /// Disk reservation for the frame.
    WriteLowDiskSpace,
}

/// Decides whether `operation` on the record with the given sequencing id
/// fails. Returning an error makes the queue behave as if the step failed.
pub type InjectionHandler = Arc<dyn Fn(OperationKind, i64) -> Result<()> + Send + Sync>;

/// Handler failing `operation` for every sequencing id in `ids`.
pub fn fail_operation_for(operation: OperationKind, ids: Vec<i64>) -> InjectionHandler {
    Arc::new(move |kind, sequencing_id| {
        if kind == operation && ids.contains(&sequencing_id) {
            return InjectedSnafu {
                message: format!("{kind} for sequencing id {sequencing_id}"),
            }
            .fail();
        }
        Ok(())
    })
}
