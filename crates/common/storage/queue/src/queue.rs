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

//! Main queue struct and lifecycle management.
//!
//! A [`Queue`] owns one arena and the cursor state laid over it, both behind
//! a single lock. Every operation, snapshotting included, takes that lock,
//! so a snapshot always sees a state between two operations.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("orders")
//!     .capacity(64 * 1024 * 1024)
//!     .file("/var/lib/spool/orders.arena")
//!     .policy(ReclaimPolicy::compaction())
//!     .build()?;
//!
//! queue.push(b"hello")?;
//! while let Some(payload) = queue.pop()? {
//!     println!("{payload:?}");
//! }
//!
//! queue.close()?;
//! ```

use std::{
    fmt,
    io::{BufReader, Read, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{debug, error, info, trace, warn};

use crate::{
    QueueConfig, Result,
    allocator::{Allocator, write_sentinel},
    arena::{Arena, FileArena, MemoryArena},
    config::{Backing, FlushMode, ReclaimPolicy},
    error::{PoisonedSnafu, QueueError},
    recovery, snapshot,
    state::QueueState,
};

/// A fixed-capacity FIFO of byte payloads.
///
/// `Queue` is `Send + Sync`; share it through an `Arc`.
pub struct Queue {
    name:         String,
    flush_mode:   FlushMode,
    snapshot_dir: Option<PathBuf>,
    inner:        Mutex<Inner>,
}

struct Inner {
    state:     QueueState,
    arena:     Box<dyn Arena>,
    allocator: Allocator,
    /// Set once a corrupt record was found in the live region.
    poisoned:  bool,
}

impl Inner {
    fn sync_if(&self, flush_mode: FlushMode) -> Result<()> {
        match flush_mode {
            FlushMode::Sync => self.arena.sync(),
            FlushMode::Async => Ok(()),
        }
    }
}

impl Queue {
    /// Opens the arena described by `config` and recovers its contents.
    pub(crate) fn open(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let mut arena: Box<dyn Arena> = match &config.backing {
            Backing::Memory => Box::new(MemoryArena::new(config.capacity)?),
            Backing::File(path) => {
                let arena = FileArena::open(path, config.capacity, config.init_chunk)?;
                debug!(queue = %config.name, path = ?arena.path(), "Using file arena");
                Box::new(arena)
            }
        };

        let state = recovery::recover(
            &config.name,
            config.policy,
            arena.as_mut(),
            config.snapshot_dir.as_deref(),
        )?;

        info!(
            queue = %config.name,
            capacity = config.capacity,
            policy = config.policy.name(),
            arena = ?arena.kind(),
            "Queue opened"
        );

        Ok(Self {
            name:         config.name,
            flush_mode:   config.flush_mode,
            snapshot_dir: config.snapshot_dir,
            inner:        Mutex::new(Inner {
                state,
                arena,
                allocator: Allocator::new(config.policy),
                poisoned: false,
            }),
        })
    }

    fn check_usable(&self, inner: &Inner) -> Result<()> {
        ensure!(
            !inner.poisoned,
            PoisonedSnafu {
                name: self.name.clone(),
            }
        );
        Ok(())
    }

    /// Appends `payload` at the back of the queue.
    ///
    /// Returns `Ok(false)` without side effects when there is no room.
    ///
    /// # Errors
    ///
    /// Empty payloads, payloads that could never fit, arena I/O failures and
    /// use of a poisoned queue are errors.
    pub fn push(&self, payload: &[u8]) -> Result<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.check_usable(inner)?;

        let pushed = inner
            .allocator
            .push(&mut inner.state, inner.arena.as_mut(), payload)?;
        if pushed {
            inner.sync_if(self.flush_mode)?;
        }

        trace!(
            queue = %self.name,
            len = payload.len(),
            pushed,
            item_count = inner.state.item_count(),
            "push"
        );
        Ok(pushed)
    }

    /// Removes and returns the front payload, or `None` when empty.
    ///
    /// # Errors
    ///
    /// A corrupt record in the live region poisons the queue and is returned
    /// as [`QueueError::CorruptedRecord`].
    pub fn pop(&self) -> Result<Option<Bytes>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.check_usable(inner)?;

        let popped = match inner.allocator.pop(&mut inner.state, inner.arena.as_mut()) {
            Ok(popped) => popped,
            Err(e @ QueueError::CorruptedRecord { .. }) => {
                inner.poisoned = true;
                error!(queue = %self.name, error = %e, "Live region corrupted, queue poisoned");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if popped.is_some() {
            inner.sync_if(self.flush_mode)?;
        }

        trace!(
            queue = %self.name,
            popped = popped.as_ref().map(Bytes::len),
            item_count = inner.state.item_count(),
            "pop"
        );
        Ok(popped)
    }

    /// Whether a payload of `payload_len` bytes could be pushed right now.
    pub fn will_fit(&self, payload_len: u64) -> bool {
        let inner = self.inner.lock();
        inner.allocator.will_fit(&inner.state, payload_len)
    }

    pub fn is_empty(&self) -> bool { self.inner.lock().state.is_empty() }

    /// Whether not even a one-byte payload fits.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.allocator.is_full(&inner.state)
    }

    /// Number of records in the queue.
    pub fn len(&self) -> u64 { self.inner.lock().state.item_count() }

    /// Header and payload bytes of all records in the queue.
    pub fn used_space(&self) -> u64 { self.inner.lock().state.used_space() }

    /// Bytes available to `push` without further reclamation.
    pub fn free_space(&self) -> u64 {
        let inner = self.inner.lock();
        inner.allocator.free_space(&inner.state)
    }

    pub fn capacity(&self) -> u64 { self.inner.lock().state.capacity() }

    pub fn name(&self) -> &str { &self.name }

    pub fn policy(&self) -> ReclaimPolicy { self.inner.lock().allocator.policy() }

    /// Snapshot directory configured at build time.
    pub fn snapshot_dir(&self) -> Option<&Path> { self.snapshot_dir.as_deref() }

    /// A copy of the current cursor state.
    pub fn state(&self) -> QueueState { self.inner.lock().state }

    /// Drops every record and clears a poisoned queue.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let dropped = inner.state.item_count();
        inner.state.reset();
        write_sentinel(&inner.state, inner.arena.as_mut())?;
        inner.poisoned = false;
        inner.sync_if(self.flush_mode)?;

        info!(queue = %self.name, dropped, "Queue flushed");
        Ok(())
    }

    /// Moves the live region to offset 0 regardless of the compaction
    /// threshold. Returns whether anything moved; always `false` for the
    /// wraparound policy.
    pub fn compact(&self) -> Result<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.check_usable(inner)?;

        let compacted = inner
            .allocator
            .compact(&mut inner.state, inner.arena.as_mut())?;
        if compacted {
            inner.sync_if(self.flush_mode)?;
        }
        Ok(compacted)
    }

    /// Flushes the arena to stable storage. A no-op for memory arenas.
    pub fn sync(&self) -> Result<()> { self.inner.lock().arena.sync() }

    /// Writes a snapshot of the queue into `sink`.
    pub fn serialize<W: Write>(&self, sink: W) -> Result<()> {
        let inner = self.inner.lock();
        self.check_usable(&inner)?;
        snapshot::write_snapshot(
            sink,
            &self.name,
            inner.allocator.policy(),
            &inner.state,
            inner.arena.as_ref(),
        )
    }

    /// Replaces the queue contents with the snapshot read from `source`.
    ///
    /// On error the queue is left as it was.
    pub fn deserialize<R: Read>(&self, source: R) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let state = snapshot::read_snapshot(
            source,
            &self.name,
            inner.allocator.policy(),
            inner.arena.as_mut(),
        )?;
        inner.state = state;
        inner.poisoned = false;
        inner.sync_if(self.flush_mode)?;

        info!(
            queue = %self.name,
            item_count = state.item_count(),
            "Queue restored from snapshot"
        );
        Ok(())
    }

    /// Atomically writes `<dir>/<name>.snapshot` and returns its path.
    pub fn save_snapshot(&self, dir: &Path) -> Result<PathBuf> {
        let path = snapshot::snapshot_path(dir, &self.name);
        let inner = self.inner.lock();
        self.check_usable(&inner)?;

        snapshot::save_file(&path, |writer| {
            snapshot::write_snapshot(
                writer,
                &self.name,
                inner.allocator.policy(),
                &inner.state,
                inner.arena.as_ref(),
            )
        })?;

        info!(
            queue = %self.name,
            path = ?path,
            item_count = inner.state.item_count(),
            "Snapshot saved"
        );
        Ok(path)
    }

    /// Restores from `<dir>/<name>.snapshot`. Returns `false` if there is no
    /// such file.
    pub fn load_snapshot(&self, dir: &Path) -> Result<bool> {
        let path = snapshot::snapshot_path(dir, &self.name);
        match snapshot::open_file(&path)? {
            Some(file) => {
                self.deserialize(BufReader::new(file))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Syncs the arena and releases it.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        info!(queue = %self.name, "Queue closed");
        Ok(())
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("arena", &inner.arena)
            .field("poisoned", &inner.poisoned)
            .finish_non_exhaustive()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(e) = self.inner.get_mut().arena.sync() {
            warn!(queue = %self.name, error = %e, "Failed to sync arena on drop");
        }
    }
}
