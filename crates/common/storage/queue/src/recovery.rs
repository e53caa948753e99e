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

//! Crash recovery for a freshly opened arena.
//!
//! The strategy is picked by [`ArenaKind`] alone:
//! - **File** arenas replay their record stream from offset 0. The last
//!   record flagged `epoch_start` is the front; the first sentinel, corrupt
//!   header or torn record is the end.
//! - **Memory** arenas start empty unless a snapshot for the queue exists in
//!   the configured snapshot directory.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
    Result,
    allocator::write_sentinel,
    arena::{Arena, ArenaKind, offset_at},
    config::ReclaimPolicy,
    record::{self, Frame, HEADER_SIZE},
    snapshot,
    state::QueueState,
};

/// Rebuilds the queue state held by `arena`.
pub(crate) fn recover(
    name: &str,
    policy: ReclaimPolicy,
    arena: &mut dyn Arena,
    snapshot_dir: Option<&Path>,
) -> Result<QueueState> {
    let state = match arena.kind() {
        ArenaKind::File => scan(arena)?,
        ArenaKind::Memory => match snapshot_dir {
            Some(dir) => load(name, policy, arena, dir)?,
            None => QueueState::empty(arena.capacity()),
        },
    };

    info!(
        queue = name,
        item_count = state.item_count(),
        read_offset = state.read_offset(),
        write_offset = state.write_offset(),
        "Queue recovered"
    );
    Ok(state)
}

fn load(name: &str, policy: ReclaimPolicy, arena: &mut dyn Arena, dir: &Path) -> Result<QueueState> {
    let path = snapshot::snapshot_path(dir, name);
    match snapshot::open_file(&path)? {
        Some(file) => {
            info!(queue = name, path = ?path, "Restoring from snapshot");
            snapshot::read_snapshot(std::io::BufReader::new(file), name, policy, arena)
        }
        None => {
            info!(queue = name, path = ?path, "No snapshot found, starting fresh");
            Ok(QueueState::empty(arena.capacity()))
        }
    }
}

/// Replays the record stream starting at offset 0.
///
/// The scan never reads past the length the backing file had when it was
/// opened. A corrupt header or a record running past that length is cut off
/// by writing a sentinel in its place.
pub(crate) fn scan(arena: &mut dyn Arena) -> Result<QueueState> {
    let capacity = arena.capacity();
    let bound = arena
        .persisted_len()
        .map_or(capacity.get(), |len| len.min(capacity.get()));
    debug!(bound, capacity = capacity.get(), "Scanning arena");

    let mut position = 0u64;
    let mut read = 0u64;
    let mut count = 0u64;
    let mut truncate = false;

    while position + HEADER_SIZE as u64 <= bound {
        let mut raw = [0u8; HEADER_SIZE];
        arena.read_at(offset_at(capacity, position)?, &mut raw)?;

        let header = match record::decode(&raw) {
            Frame::Record(header) => header,
            Frame::EndOfData => break,
            Frame::Corrupt { stored, computed } => {
                warn!(
                    position,
                    stored, computed, "Corrupted header found, truncating record stream"
                );
                truncate = true;
                break;
            }
        };

        let end = position + header.record_len();
        if end > bound {
            warn!(
                position,
                payload_size = header.payload_size(),
                bound,
                "Torn record found at end of arena, truncating"
            );
            truncate = true;
            break;
        }

        if header.epoch_start() {
            read = position;
            count = 0;
        }
        count += 1;
        position = end;
    }

    if count == 0 {
        let state = QueueState::empty(capacity);
        if truncate {
            write_sentinel(&state, arena)?;
        }
        return Ok(state);
    }

    let state = QueueState {
        capacity,
        write_offset: offset_at(capacity, position)?,
        read_offset: offset_at(capacity, read)?,
        item_count: count,
        wrap_boundary: capacity.end(),
    };
    if truncate {
        write_sentinel(&state, arena)?;
    }

    debug!(
        records = count,
        read_offset = read,
        write_offset = position,
        "Arena scan complete"
    );
    Ok(state)
}
