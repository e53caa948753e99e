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

use std::fmt;

use super::{Arena, ArenaKind, check_range};
use crate::{
    Result,
    error::InvalidConfigSnafu,
    offset::{Capacity, Offset},
};

/// Volatile arena backed by a heap buffer.
pub struct MemoryArena {
    buf:      Vec<u8>,
    capacity: Capacity,
}

impl MemoryArena {
    /// Allocates a zeroed arena of `capacity` bytes.
    pub fn new(capacity: u64) -> Result<Self> {
        let len = usize::try_from(capacity).map_err(|_| {
            InvalidConfigSnafu {
                reason: format!("capacity {capacity} is not addressable on this platform"),
            }
            .build()
        })?;
        Ok(Self {
            buf:      vec![0u8; len],
            capacity: Capacity::new(capacity),
        })
    }

    /// Range of the buffer covered by `len` bytes at `offset`.
    #[allow(clippy::cast_possible_truncation)]
    fn span(&self, offset: Offset, len: usize) -> Result<std::ops::Range<usize>> {
        check_range(self.capacity, offset, len as u64)?;
        // capacity fits in usize, checked in `new`
        let start = offset.get() as usize;
        Ok(start..start + len)
    }
}

impl fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArena")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Arena for MemoryArena {
    fn kind(&self) -> ArenaKind { ArenaKind::Memory }

    fn capacity(&self) -> Capacity { self.capacity }

    fn read_at(&self, offset: Offset, buf: &mut [u8]) -> Result<()> {
        let span = self.span(offset, buf.len())?;
        buf.copy_from_slice(&self.buf[span]);
        Ok(())
    }

    fn write_at(&mut self, offset: Offset, data: &[u8]) -> Result<()> {
        let span = self.span(offset, data.len())?;
        self.buf[span].copy_from_slice(data);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn copy_within(&mut self, src: Offset, len: u64, dst: Offset) -> Result<()> {
        let from = self.span(src, len as usize)?;
        check_range(self.capacity, dst, len)?;
        self.buf.copy_within(from, dst.get() as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let mut arena = MemoryArena::new(64).unwrap();
        let at = arena.capacity().offset(10).unwrap();

        arena.write_at(at, b"Hello").unwrap();

        let mut buf = [0u8; 5];
        arena.read_at(at, &mut buf).unwrap();
        assert_eq!(&buf, b"Hello");
        assert_eq!(arena.kind(), ArenaKind::Memory);
        assert_eq!(arena.persisted_len(), None);
    }

    #[test]
    fn test_access_past_capacity_fails() {
        let mut arena = MemoryArena::new(16).unwrap();
        let at = arena.capacity().offset(12).unwrap();

        assert!(arena.write_at(at, b"12345").is_err());
        let mut buf = [0u8; 5];
        assert!(arena.read_at(at, &mut buf).is_err());
        // Exactly up to the end is fine
        assert!(arena.write_at(at, b"1234").is_ok());
    }

    #[test]
    fn test_copy_within_overlapping_down() {
        let mut arena = MemoryArena::new(16).unwrap();
        let capacity = arena.capacity();
        arena.write_at(capacity.offset(4).unwrap(), b"abcdefgh").unwrap();

        arena
            .copy_within(capacity.offset(4).unwrap(), 8, Offset::ZERO)
            .unwrap();

        let mut buf = [0u8; 8];
        arena.read_at(Offset::ZERO, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }
}
