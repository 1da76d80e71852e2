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

use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt};

use crate::error::{InvalidPathSnafu, IoSnafu, Result};

/// Prefix of metadata snapshot files: `META.<sequencing_id>`.
pub const METADATA_PREFIX: &str = "META";

/// Generates a data file name: `<prefix>.<generation_id>.<start_sequencing_id>`.
pub fn data_file_name(prefix: &str, generation_id: i64, start_sequencing_id: i64) -> String {
    format!("{prefix}.{generation_id}.{start_sequencing_id}")
}

/// Returns full path to a data file.
pub fn data_file_path<P: AsRef<Path>>(
    dir: P,
    prefix: &str,
    generation_id: i64,
    start_sequencing_id: i64,
) -> PathBuf {
    dir.as_ref()
        .join(data_file_name(prefix, generation_id, start_sequencing_id))
}

/// Returns full path to a metadata snapshot: `dir/META.<sequencing_id>`.
pub fn metadata_file_path<P: AsRef<Path>>(dir: P, sequencing_id: i64) -> PathBuf {
    dir.as_ref()
        .join(format!("{METADATA_PREFIX}.{sequencing_id}"))
}

/// Parses the sequencing id stored in the last extension of `path`.
///
/// Works for data files (`P_RECORDS.7.120` -> 120) and metadata snapshots
/// (`META.119` -> 119).
pub fn sequencing_id_from_path(path: impl AsRef<Path>) -> Result<i64> {
    let path = path.as_ref();
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse::<i64>().ok())
        .filter(|id| *id >= 0)
        .context(InvalidPathSnafu { path })
}

/// What a file found in a queue directory is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    /// Data file; legacy names carry no generation.
    Data {
        generation_id:       Option<i64>,
        start_sequencing_id: i64,
    },
    Metadata {
        sequencing_id: i64,
    },
    /// Anything else; deleted during initialization.
    Unexpected,
}

/// Classifies a file name of a queue directory.
pub(crate) fn classify(file_name: &str, prefix: &str) -> FileKind {
    if let Some(rest) = file_name
        .strip_prefix(METADATA_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
    {
        return match parse_non_negative(rest) {
            Some(sequencing_id) => FileKind::Metadata { sequencing_id },
            None => FileKind::Unexpected,
        };
    }

    let Some(rest) = file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
    else {
        return FileKind::Unexpected;
    };
    match rest.split_once('.') {
        Some((generation, start)) => match (parse_non_negative(generation), parse_non_negative(start)) {
            (Some(generation_id), Some(start_sequencing_id)) => FileKind::Data {
                generation_id: Some(generation_id),
                start_sequencing_id,
            },
            _ => FileKind::Unexpected,
        },
        None => parse_non_negative(rest).map_or(FileKind::Unexpected, |start_sequencing_id| {
            FileKind::Data {
                generation_id: None,
                start_sequencing_id,
            }
        }),
    }
}

fn parse_non_negative(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().filter(|v| *v >= 0)
}

/// A regular file found in a queue directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
    pub kind: FileKind,
}

/// Lists the regular files directly under `dir`, sorted by path.
///
/// A missing directory has no files.
pub(crate) fn scan_directory(dir: &Path, prefix: &str) -> Result<Vec<ScannedFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let entry = entry.context(IoSnafu { path: dir })?;
        let path = entry.path();
        let metadata = entry.metadata().context(IoSnafu { path: &path })?;
        if !metadata.is_file() {
            continue;
        }
        let kind = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(FileKind::Unexpected, |name| classify(name, prefix));
        files.push(ScannedFile {
            path,
            size: metadata.len(),
            kind,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
