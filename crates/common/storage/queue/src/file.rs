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

//! Data file operations.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    error::{CorruptFrameSnafu, InternalSnafu, IoSnafu, QueueError, ResourceExhaustedSnafu, Result},
    frame::{self, Decoded, FRAME_HEADER_SIZE, FrameHeader},
    resources::{ResourceManager, ScopedReservation},
};

/// Outcome of [`SingleFile::read_frame`].
#[derive(Debug)]
pub(crate) enum FrameRead {
    Frame {
        header:  FrameHeader,
        payload: Vec<u8>,
    },
    /// No bytes left at the position.
    End,
    /// The file ends inside the frame.
    Truncated,
    /// Checksum mismatch. The header length still tells where the next
    /// frame would start, but none of its fields are trusted.
    Damaged {
        header: FrameHeader,
        error:  QueueError,
    },
    /// The header cannot describe a frame; nothing after it can be located.
    Unreadable { error: QueueError },
}

/// One data file of a queue.
///
/// The size is tracked in memory from the moment the file is created or
/// recovered and is never re-derived from the filesystem. Every byte of it
/// is charged to the disk resource; the read buffer window is charged to the
/// memory resource.
#[derive(Debug)]
pub(crate) struct SingleFile {
    path:          PathBuf,
    handle:        Option<File>,
    read_only:     bool,
    size:          u64,
    disk:          ScopedReservation,
    buffer:        Vec<u8>,
    buffer_start:  u64,
    buffer_memory: ScopedReservation,
}

impl SingleFile {
    /// Tracks a data file of `size` bytes. The file is opened lazily.
    pub(crate) fn create(
        path: impl AsRef<Path>,
        size: u64,
        disk: &Arc<ResourceManager>,
        memory: &Arc<ResourceManager>,
    ) -> Result<Self> {
        let disk = ScopedReservation::reserve(disk, size).context(ResourceExhaustedSnafu {
            resource:  "disk",
            requested: size,
        })?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            handle: None,
            read_only: false,
            size,
            disk,
            buffer: Vec::new(),
            buffer_start: 0,
            buffer_memory: ScopedReservation::empty(memory),
        })
    }

    /// Opens the backing file; no-op if it is already open.
    pub(crate) fn open(&mut self, read_only: bool) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true).create(true);
        }
        let handle = options.open(&self.path).context(IoSnafu { path: &self.path })?;
        self.handle = Some(handle);
        self.read_only = read_only;
        Ok(())
    }

    /// Closes the backing file and drops the read buffer; no-op if closed.
    pub(crate) fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!(path = %self.path.display(), "Closed data file");
        }
        self.buffer = Vec::new();
        self.buffer_start = 0;
        self.buffer_memory.reduce(0);
    }

    /// Closes the file for good; it is only read from afterwards.
    pub(crate) fn make_read_only(&mut self) {
        self.close();
        self.read_only = true;
    }

    /// Appends `data` at the tracked end of the file.
    ///
    /// `reservation` must cover `data.len()` disk bytes; it becomes part of
    /// the file's reservation once the bytes are written. Returns the new
    /// file size.
    pub(crate) fn append(&mut self, data: &[u8], reservation: ScopedReservation) -> Result<u64> {
        ensure!(
            !self.read_only,
            InternalSnafu {
                message: format!("append to read-only file {}", self.path.display()),
            }
        );
        self.open(false)?;
        let size = self.size;
        let handle = self.handle.as_mut().context(InternalSnafu {
            message: "data file is not open",
        })?;
        handle
            .seek(SeekFrom::Start(size))
            .and_then(|_| handle.write_all(data))
            .context(IoSnafu { path: &self.path })?;

        self.size += data.len() as u64;
        self.disk.hand_over(reservation);
        Ok(self.size)
    }

    /// Returns up to `size` bytes starting at `pos`.
    ///
    /// The result is shorter than `size` near the end of the file and empty
    /// at or past it. Sequential reads are served from the buffer window; a
    /// position outside the window refills it.
    pub(crate) fn read(
        &mut self,
        pos: u64,
        size: usize,
        max_buffer_size: u64,
        expect_readonly: bool,
    ) -> Result<&[u8]> {
        ensure!(
            !expect_readonly || self.read_only,
            InternalSnafu {
                message: format!("read from writable file {}", self.path.display()),
            }
        );
        ensure!(
            size as u64 <= max_buffer_size,
            ResourceExhaustedSnafu {
                resource:  "read buffer",
                requested: size as u64,
            }
        );
        if pos >= self.size {
            return Ok(&[]);
        }
        let end = self.size.min(pos + size as u64);

        let buffer_end = self.buffer_start + self.buffer.len() as u64;
        if pos < self.buffer_start || end > buffer_end {
            self.fill_buffer(pos, end, max_buffer_size)?;
        }
        let from = (pos - self.buffer_start) as usize;
        let to = (end - self.buffer_start) as usize;
        Ok(&self.buffer[from..to])
    }

    fn fill_buffer(&mut self, pos: u64, end: u64, max_buffer_size: u64) -> Result<()> {
        let window = max_buffer_size.min(self.size - pos).max(end - pos);
        ensure!(
            self.buffer_memory.grow(window),
            ResourceExhaustedSnafu {
                resource:  "memory",
                requested: window,
            }
        );
        self.buffer_memory.reduce(window);

        self.open(self.read_only)?;
        let handle = self.handle.as_mut().context(InternalSnafu {
            message: "data file is not open",
        })?;
        self.buffer.resize(window as usize, 0);
        let filled = handle
            .seek(SeekFrom::Start(pos))
            .and_then(|_| read_up_to(handle, &mut self.buffer))
            .context(IoSnafu { path: &self.path })?;
        self.buffer.truncate(filled);
        self.buffer_start = pos;
        Ok(())
    }

    /// Reads the frame starting at `pos`.
    ///
    /// Frames with a payload above `max_payload` or larger than the read
    /// buffer are [`FrameRead::Unreadable`].
    pub(crate) fn read_frame(
        &mut self,
        pos: u64,
        max_payload: u64,
        max_buffer_size: u64,
    ) -> Result<FrameRead> {
        let header_bytes = self.read(pos, FRAME_HEADER_SIZE, max_buffer_size, true)?;
        if header_bytes.is_empty() {
            return Ok(FrameRead::End);
        }
        if header_bytes.len() < FRAME_HEADER_SIZE {
            return Ok(FrameRead::Truncated);
        }
        let header = FrameHeader::parse(header_bytes, pos)?;
        let frame_size = header.frame_size();
        if u64::from(header.payload_len) > max_payload || frame_size as u64 > max_buffer_size {
            return Ok(FrameRead::Unreadable {
                error: CorruptFrameSnafu {
                    offset: pos,
                    reason: format!("payload length {} is out of bounds", header.payload_len),
                }
                .build(),
            });
        }

        let bytes = self.read(pos, frame_size, max_buffer_size, true)?;
        Ok(match frame::decode(bytes, pos, max_payload) {
            Ok(Decoded::Frame { header, payload, .. }) => FrameRead::Frame {
                header,
                payload: payload.to_vec(),
            },
            Ok(Decoded::Incomplete) => FrameRead::Truncated,
            Err(error) => FrameRead::Damaged { header, error },
        })
    }

    /// Closes and removes the backing file, releasing its disk reservation.
    pub(crate) fn delete(mut self) {
        self.close();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), size = self.size, "Deleted data file"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to delete data file"),
        }
    }

    pub(crate) const fn size(&self) -> u64 { self.size }

    pub(crate) const fn is_empty(&self) -> bool { self.size == 0 }

    pub(crate) fn path(&self) -> &Path { &self.path }

    pub(crate) const fn is_read_only(&self) -> bool { self.read_only }
}

/// Reads until `buf` is full or the file ends; returns the bytes read.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
