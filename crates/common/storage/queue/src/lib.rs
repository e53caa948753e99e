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

//! Fixed-capacity persistent FIFO queue.
//!
//! Records live in a byte [`arena`] (memory or memory-mapped file) framed by
//! a self-describing checksummed header, so a file-backed queue can be
//! rebuilt after a crash by replaying its record stream. Memory-backed
//! queues persist through explicit snapshots, optionally taken on process
//! termination by a [`ShutdownHook`].

mod allocator;
pub mod arena;
pub mod builder;
pub mod config;
mod crc;
pub mod error;
pub mod offset;
mod queue;
pub mod record;
mod recovery;
pub mod shutdown;
pub mod snapshot;
pub mod state;

pub use arena::{Arena, ArenaKind, FileArena, MemoryArena};
pub use builder::QueueBuilder;
pub use config::{Backing, CompactionThreshold, FlushMode, QueueConfig, ReclaimPolicy};
pub use error::{QueueError, Result};
pub use queue::Queue;
pub use record::HEADER_SIZE;
pub use shutdown::{ProducerGuard, ShutdownHook, SnapshotRegistry};
pub use snapshot::snapshot_path;
pub use state::QueueState;
