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

//! Fixed-capacity byte arenas a queue is laid out in.
//!
//! The queue only sees the [`Arena`] capability. Which implementation sits
//! behind it decides how the queue is recovered on open:
//! [`ArenaKind::File`] arenas are scanned, [`ArenaKind::Memory`] arenas are
//! restored from a snapshot.

mod file;
mod memory;

use std::fmt;

pub use file::FileArena;
pub use memory::MemoryArena;
use snafu::ensure;

use crate::{
    Result,
    error::OutOfBoundsSnafu,
    offset::{Capacity, Offset},
};

/// Chunk size used when moving bytes through a bounce buffer.
pub(crate) const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    Memory,
    File,
}

/// A linearly addressable byte region of fixed capacity.
pub trait Arena: Send + fmt::Debug {
    fn kind(&self) -> ArenaKind;

    fn capacity(&self) -> Capacity;

    /// Fills `buf` with the bytes starting at `offset`.
    fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `offset`.
    fn write_at(&mut self, offset: Offset, data: &[u8]) -> Result<()>;

    /// Moves `len` bytes from `src` to `dst`. Ranges may overlap.
    fn copy_within(&mut self, src: Offset, len: u64, dst: Offset) -> Result<()> {
        let capacity = self.capacity();
        check_range(capacity, src, len)?;
        check_range(capacity, dst, len)?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let chunks = chunk_plan(src.get(), dst.get(), len);
        for (from, to, n) in chunks {
            let chunk = &mut buf[..n];
            self.read_at(offset_at(capacity, from)?, chunk)?;
            self.write_at(offset_at(capacity, to)?, chunk)?;
        }
        Ok(())
    }

    /// Pushes written bytes to stable storage.
    fn sync(&self) -> Result<()> { Ok(()) }

    /// Length of the backing file observed when the arena was opened.
    fn persisted_len(&self) -> Option<u64> { None }
}

/// Converts a raw position into a bounded offset.
pub(crate) fn offset_at(capacity: Capacity, value: u64) -> Result<Offset> {
    capacity.offset(value).ok_or_else(|| {
        OutOfBoundsSnafu {
            offset:   value,
            len:      0u64,
            capacity: capacity.get(),
        }
        .build()
    })
}

/// Fails unless `len` bytes at `offset` lie inside the arena.
pub(crate) fn check_range(capacity: Capacity, offset: Offset, len: u64) -> Result<()> {
    ensure!(
        capacity.contains(offset, len),
        OutOfBoundsSnafu {
            offset: offset.get(),
            len,
            capacity: capacity.get(),
        }
    );
    Ok(())
}

/// Splits an overlapping move into bounce-buffer sized steps.
///
/// Moving down copies front to back, moving up copies back to front, so no
/// step reads bytes an earlier step already overwrote.
fn chunk_plan(src: u64, dst: u64, len: u64) -> Vec<(u64, u64, usize)> {
    let mut steps = Vec::new();
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(COPY_CHUNK as u64);
        let at = if dst <= src { done } else { len - done - n };
        #[allow(clippy::cast_possible_truncation)]
        steps.push((src + at, dst + at, n as usize));
        done += n;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_plan_down_is_front_to_back() {
        let len = COPY_CHUNK as u64 * 2 + 10;
        let steps = chunk_plan(100, 0, len);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], (100, 0, COPY_CHUNK));
        assert_eq!(steps[2].2, 10);
    }

    #[test]
    fn test_chunk_plan_up_is_back_to_front() {
        let len = COPY_CHUNK as u64 + 1;
        let steps = chunk_plan(0, 10, len);
        assert_eq!(steps[0], (1, 11, COPY_CHUNK));
        assert_eq!(steps[1], (0, 10, 1));
    }

    #[test]
    fn test_chunk_plan_empty() {
        assert!(chunk_plan(0, 0, 0).is_empty());
    }
}
