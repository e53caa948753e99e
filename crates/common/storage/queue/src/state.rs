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

//! Queue control block.

use crate::{
    offset::{Capacity, Offset},
    record::HEADER_SIZE,
};

/// Mutable cursor state of a queue.
///
/// `item_count` is authoritative for emptiness: `read_offset ==
/// write_offset` holds both for an empty and for a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub(crate) capacity:      Capacity,
    pub(crate) write_offset:  Offset,
    pub(crate) read_offset:   Offset,
    pub(crate) item_count:    u64,
    /// End of valid data before the most recent wrap; `capacity` when the
    /// ring has not wrapped.
    pub(crate) wrap_boundary: Offset,
}

impl QueueState {
    pub const fn empty(capacity: Capacity) -> Self {
        Self {
            capacity,
            write_offset: Offset::ZERO,
            read_offset: Offset::ZERO,
            item_count: 0,
            wrap_boundary: capacity.end(),
        }
    }

    /// Rebuilds a state from raw fields, checking every cursor invariant.
    ///
    /// An empty state is normalised to zero offsets regardless of the values
    /// passed in.
    pub(crate) fn from_raw(
        capacity: Capacity,
        write_offset: u64,
        read_offset: u64,
        item_count: u64,
        wrap_boundary: u64,
    ) -> Result<Self, String> {
        if item_count == 0 {
            return Ok(Self::empty(capacity));
        }

        let offset = |name: &str, value: u64| {
            capacity
                .offset(value)
                .ok_or_else(|| format!("{name} {value} exceeds capacity {capacity}"))
        };
        let write = offset("write_offset", write_offset)?;
        let read = offset("read_offset", read_offset)?;
        let boundary = offset("wrap_boundary", wrap_boundary)?;

        if boundary == Offset::ZERO {
            return Err("wrap_boundary must be non-zero".to_string());
        }
        if write > read && boundary != capacity.end() {
            return Err(format!(
                "unwrapped state carries wrap_boundary {boundary} below capacity {capacity}"
            ));
        }
        if write <= read && read >= boundary {
            return Err(format!("read_offset {read} is not below wrap_boundary {boundary}"));
        }

        let state = Self {
            capacity,
            write_offset: write,
            read_offset: read,
            item_count,
            wrap_boundary: boundary,
        };
        let min_used = item_count.saturating_mul(HEADER_SIZE as u64 + 1);
        if state.used_space() < min_used {
            return Err(format!(
                "{item_count} records cannot fit in {} used bytes",
                state.used_space()
            ));
        }
        Ok(state)
    }

    pub const fn capacity(&self) -> u64 { self.capacity.get() }

    pub const fn write_offset(&self) -> u64 { self.write_offset.get() }

    pub const fn read_offset(&self) -> u64 { self.read_offset.get() }

    pub const fn item_count(&self) -> u64 { self.item_count }

    pub const fn wrap_boundary(&self) -> u64 { self.wrap_boundary.get() }

    pub const fn is_empty(&self) -> bool { self.item_count == 0 }

    /// Live data is split: `[read, wrap_boundary)` then `[0, write)`.
    ///
    /// A ring with `read == write` and records in it counts as wrapped.
    pub fn is_wrapped(&self) -> bool { self.item_count > 0 && self.write_offset <= self.read_offset }

    /// Sum of header and payload bytes of all live records.
    pub fn used_space(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        if self.is_wrapped() {
            self.wrap_boundary.get() - self.read_offset.get() + self.write_offset.get()
        } else {
            self.write_offset.get() - self.read_offset.get()
        }
    }

    pub(crate) fn reset(&mut self) { *self = Self::empty(self.capacity); }
}
