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

//! Memory-mapped file arena using mmap-io.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use mmap_io::MemoryMappedFile;
use snafu::{ResultExt, ensure};
use tracing::{debug, info, warn};

use super::{Arena, ArenaKind, check_range};
use crate::{
    Result,
    error::{CapacityMismatchSnafu, MmapFailedSnafu, OpenFileSnafu},
    offset::{Capacity, Offset},
};

/// Persistent arena over a memory-mapped file of exactly `capacity` bytes.
///
/// Writes land in the page cache and reach the disk through OS write-back
/// or an explicit [`Arena::sync`].
pub struct FileArena {
    mmap:          MemoryMappedFile,
    path:          PathBuf,
    capacity:      Capacity,
    persisted_len: u64,
}

impl FileArena {
    /// Opens the arena file at `path`, creating it if needed.
    ///
    /// A zero-length file is initialised by writing zeros in `init_chunk`
    /// sized chunks up to `capacity`. A shorter file (e.g. truncated by a
    /// crash or by hand) is extended with zeros; its original length stays
    /// available through [`Arena::persisted_len`] so recovery never reads
    /// the padding as data. A longer file is rejected.
    pub fn open<P: AsRef<Path>>(path: P, capacity: u64, init_chunk: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context(OpenFileSnafu { path: path.clone() })?;

        let persisted_len = file.metadata()?.len();
        ensure!(
            persisted_len <= capacity,
            CapacityMismatchSnafu {
                expected: capacity,
                actual:   persisted_len,
            }
        );

        if persisted_len == 0 {
            zero_fill(&file, capacity, init_chunk)?;
            info!(path = ?path, capacity, "Initialised fresh arena file");
        } else if persisted_len < capacity {
            warn!(
                path = ?path,
                persisted_len,
                capacity,
                "Arena file shorter than capacity, padding with zeros"
            );
            file.set_len(capacity)?;
            file.sync_all()?;
        }
        drop(file);

        let mmap = MemoryMappedFile::open_rw(&path).map_err(|e| {
            MmapFailedSnafu {
                message: e.to_string(),
            }
            .build()
        })?;

        debug!(path = ?path, capacity, persisted_len, "Arena file mapped");

        Ok(Self {
            mmap,
            path,
            capacity: Capacity::new(capacity),
            persisted_len,
        })
    }

    /// Get file path.
    pub fn path(&self) -> &Path { &self.path }
}

fn zero_fill(mut file: &File, capacity: u64, init_chunk: usize) -> Result<()> {
    let zeros = vec![0u8; init_chunk];
    let chunk = init_chunk as u64;

    for _ in 0..capacity / chunk {
        file.write_all(&zeros)?;
    }
    #[allow(clippy::cast_possible_truncation)]
    let remainder = (capacity % chunk) as usize;
    file.write_all(&zeros[..remainder])?;
    file.sync_all()?;
    Ok(())
}

impl fmt::Debug for FileArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileArena")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("persisted_len", &self.persisted_len)
            .finish_non_exhaustive()
    }
}

impl Arena for FileArena {
    fn kind(&self) -> ArenaKind { ArenaKind::File }

    fn capacity(&self) -> Capacity { self.capacity }

    #[inline]
    fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()> {
        check_range(self.capacity, offset, buf.len() as u64)?;
        self.mmap.read_into(offset.get(), buf).map_err(|e| {
            MmapFailedSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }

    #[inline]
    fn write_at(&mut self, offset: Offset, data: &[u8]) -> Result<()> {
        check_range(self.capacity, offset, data.len() as u64)?;
        self.mmap.update_region(offset.get(), data).map_err(|e| {
            MmapFailedSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush().map_err(|e| {
            MmapFailedSnafu {
                message: e.to_string(),
            }
            .build()
        })
    }

    fn persisted_len(&self) -> Option<u64> { Some(self.persisted_len) }
}
