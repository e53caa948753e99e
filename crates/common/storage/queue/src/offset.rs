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

//! Bounded arena offsets.
//!
//! An [`Offset`] can only be obtained from a [`Capacity`], which guarantees
//! its value lies in `[0, capacity]`. All cursor movement goes through
//! [`Capacity::advance`], so an out-of-range cursor cannot be constructed.

use std::fmt;

/// Size of an arena in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Capacity(u64);

impl Capacity {
    pub const fn new(bytes: u64) -> Self { Self(bytes) }

    pub const fn get(self) -> u64 { self.0 }

    /// The offset one past the last byte.
    pub const fn end(self) -> Offset { Offset(self.0) }

    /// Returns the offset for `value`, or `None` if it lies past the end.
    pub const fn offset(self, value: u64) -> Option<Offset> {
        if value <= self.0 {
            Some(Offset(value))
        } else {
            None
        }
    }

    /// Moves `from` forward by `len` bytes, staying within the arena.
    pub fn advance(self, from: Offset, len: u64) -> Option<Offset> {
        from.0.checked_add(len).and_then(|value| self.offset(value))
    }

    /// Whether `len` bytes starting at `at` lie inside the arena.
    pub fn contains(self, at: Offset, len: u64) -> bool { self.advance(at, len).is_some() }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// A byte position inside an arena, bounded by the arena's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    pub const ZERO: Self = Self(0);

    pub const fn get(self) -> u64 { self.0 }

    /// Bytes from `self` up to `later`, or `None` if `later` precedes `self`.
    pub const fn distance_to(self, later: Self) -> Option<u64> { later.0.checked_sub(self.0) }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}
