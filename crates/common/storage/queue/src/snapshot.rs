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

//! Snapshot stream format.
//!
//! ```text
//! ┌───────┬─────────┬────────┬──────────┬───────┬──────┬────────────┬───────────────┐
//! │ magic │ version │ policy │ capacity │ write │ read │ item_count │ wrap_boundary │
//! │ 4B    │ u32     │ u8     │ u64      │ u64   │ u64  │ u64        │ u64           │
//! ├───────┴──┬──────┴────────┼──────────┴──┬────┴──────┴──┬─────────┴──┬────────────┤
//! │ name_len │ name          │ body_start  │ body_len     │ body       │ crc32      │
//! │ u16      │ name_len B    │ u64         │ u64          │ body_len B │ u32        │
//! └──────────┴───────────────┴─────────────┴──────────────┴────────────┴────────────┘
//! ```
//!
//! All integers are little-endian. The trailing CRC-32 covers every
//! preceding byte. The body is policy-defined: a wraparound queue dumps the
//! whole arena since its live data may be split, a compaction queue dumps
//! only `[read, write)` and is restored compacted to offset 0.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, BytesMut};
use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    Result,
    allocator::{mark_front, write_sentinel},
    arena::{Arena, COPY_CHUNK, offset_at},
    config::ReclaimPolicy,
    crc::{CrcReader, CrcWriter},
    error::{CapacityMismatchSnafu, InvalidConfigSnafu, OpenFileSnafu, SnapshotCorruptedSnafu},
    offset::Offset,
    state::QueueState,
};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SPQS";
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

/// magic + version + policy + capacity + 4 cursor fields + name_len
const FIXED_PREFIX_LEN: usize = 4 + 4 + 1 + 8 + 8 * 4 + 2;
const BODY_RANGE_LEN: usize = 8 + 8;

/// Location of the snapshot for queue `name` inside `dir`.
pub fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{SNAPSHOT_EXTENSION}"))
}

/// The arena range a snapshot body covers.
fn body_range(policy: ReclaimPolicy, state: &QueueState) -> (u64, u64) {
    match policy {
        ReclaimPolicy::Wraparound => (0, state.capacity()),
        ReclaimPolicy::Compaction(_) => (state.read_offset(), state.used_space()),
    }
}

/// Streams `state`, `name` and the arena contents into `sink`.
pub(crate) fn write_snapshot<W: Write>(
    sink: W,
    name: &str,
    policy: ReclaimPolicy,
    state: &QueueState,
    arena: &dyn Arena,
) -> Result<()> {
    let name_len = u16::try_from(name.len()).map_err(|_| {
        InvalidConfigSnafu {
            reason: format!("queue name of {} bytes does not fit a snapshot", name.len()),
        }
        .build()
    })?;
    let (body_start, body_len) = body_range(policy, state);

    let mut header = BytesMut::with_capacity(FIXED_PREFIX_LEN + name.len() + BODY_RANGE_LEN);
    header.put_slice(&SNAPSHOT_MAGIC);
    header.put_u32_le(SNAPSHOT_VERSION);
    header.put_u8(policy.tag());
    header.put_u64_le(state.capacity());
    header.put_u64_le(state.write_offset());
    header.put_u64_le(state.read_offset());
    header.put_u64_le(state.item_count());
    header.put_u64_le(state.wrap_boundary());
    header.put_u16_le(name_len);
    header.put_slice(name.as_bytes());
    header.put_u64_le(body_start);
    header.put_u64_le(body_len);

    let mut writer = CrcWriter::new(sink);
    writer.write_all(&header)?;

    let capacity = state.capacity;
    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut done = 0u64;
    while done < body_len {
        #[allow(clippy::cast_possible_truncation)]
        let n = (body_len - done).min(COPY_CHUNK as u64) as usize;
        arena.read_at(offset_at(capacity, body_start + done)?, &mut chunk[..n])?;
        writer.write_all(&chunk[..n])?;
        done += n as u64;
    }

    let crc = writer.checksum();
    let mut sink = writer.into_inner();
    sink.write_all(&crc.to_le_bytes())?;
    sink.flush()?;

    debug!(
        name,
        policy = policy.name(),
        body_len,
        item_count = state.item_count(),
        "Snapshot written"
    );
    Ok(())
}

/// Reads a snapshot from `source` and restores it into `arena`.
///
/// The arena is only written once the whole stream, CRC included, has been
/// validated. A name different from `name` is logged and ignored.
pub(crate) fn read_snapshot<R: Read>(
    source: R,
    name: &str,
    policy: ReclaimPolicy,
    arena: &mut dyn Arena,
) -> Result<QueueState> {
    let capacity = arena.capacity();
    let mut reader = CrcReader::new(source);

    let mut prefix = [0u8; FIXED_PREFIX_LEN];
    read_exact(&mut reader, &mut prefix, "header")?;
    let mut buf = &prefix[..];

    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    ensure!(
        magic == SNAPSHOT_MAGIC,
        SnapshotCorruptedSnafu {
            reason: format!("bad magic {magic:02x?}"),
        }
    );

    let version = buf.get_u32_le();
    ensure!(
        version == SNAPSHOT_VERSION,
        SnapshotCorruptedSnafu {
            reason: format!("unsupported version {version}"),
        }
    );

    let tag = buf.get_u8();
    ensure!(
        tag == policy.tag(),
        SnapshotCorruptedSnafu {
            reason: format!(
                "policy tag {tag} does not match the {} queue",
                policy.name()
            ),
        }
    );

    let stored_capacity = buf.get_u64_le();
    ensure!(
        stored_capacity == capacity.get(),
        CapacityMismatchSnafu {
            expected: capacity.get(),
            actual:   stored_capacity,
        }
    );

    let write_offset = buf.get_u64_le();
    let read_offset = buf.get_u64_le();
    let item_count = buf.get_u64_le();
    let wrap_boundary = buf.get_u64_le();
    let name_len = buf.get_u16_le();

    let state =
        QueueState::from_raw(capacity, write_offset, read_offset, item_count, wrap_boundary)
            .map_err(|reason| SnapshotCorruptedSnafu { reason }.build())?;

    let mut stored_name = vec![0u8; usize::from(name_len)];
    read_exact(&mut reader, &mut stored_name, "queue name")?;

    let mut range = [0u8; BODY_RANGE_LEN];
    read_exact(&mut reader, &mut range, "body range")?;
    let mut buf = &range[..];
    let body_start = buf.get_u64_le();
    let body_len = buf.get_u64_le();

    // An empty state is normalised to zero cursors, so whatever range was
    // stored with it only has to carry no body.
    let expected_range = body_range(policy, &state);
    ensure!(
        (body_start, body_len) == expected_range || (state.is_empty() && body_len == 0),
        SnapshotCorruptedSnafu {
            reason: format!(
                "body range {body_start}+{body_len} does not match the cursors, expected {}+{}",
                expected_range.0, expected_range.1
            ),
        }
    );

    let body_len = usize::try_from(body_len).map_err(|_| {
        SnapshotCorruptedSnafu {
            reason: format!("body of {body_len} bytes is not addressable"),
        }
        .build()
    })?;
    let mut body = vec![0u8; body_len];
    read_exact(&mut reader, &mut body, "body")?;

    let computed = reader.checksum();
    let mut source = reader.into_inner();
    let mut crc = [0u8; 4];
    read_exact(&mut source, &mut crc, "checksum")?;
    let stored = u32::from_le_bytes(crc);
    ensure!(
        stored == computed,
        SnapshotCorruptedSnafu {
            reason: format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
        }
    );

    if stored_name != name.as_bytes() {
        warn!(
            queue = name,
            stored = %String::from_utf8_lossy(&stored_name),
            "Snapshot was taken under a different queue name"
        );
    }

    restore(policy, state, &body, arena)
}

/// Lays `body` into the arena and returns the resulting state.
fn restore(
    policy: ReclaimPolicy,
    mut state: QueueState,
    body: &[u8],
    arena: &mut dyn Arena,
) -> Result<QueueState> {
    arena.write_at(Offset::ZERO, body)?;

    if let ReclaimPolicy::Compaction(_) = policy {
        if !state.is_empty() {
            state.write_offset = offset_at(state.capacity, body.len() as u64)?;
            state.read_offset = Offset::ZERO;
        }
    }

    write_sentinel(&state, arena)?;
    mark_front(&state, arena)?;
    Ok(state)
}

fn read_exact<R: Read>(source: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match source.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => SnapshotCorruptedSnafu {
            reason: format!("stream truncated in {what}"),
        }
        .fail(),
        Err(e) => Err(e.into()),
    }
}

/// Writes a snapshot file through a temporary sibling and renames it into
/// place, so a crash never leaves a half-written snapshot at `path`.
pub(crate) fn save_file<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension(format!("{SNAPSHOT_EXTENSION}.tmp"));
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .context(OpenFileSnafu {
            path: tmp_path.clone(),
        })?;

    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    debug!(path = ?path, "Snapshot file saved");
    Ok(())
}

/// Opens a snapshot file for reading, or `None` if there is none.
pub(crate) fn open_file(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(OpenFileSnafu {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use test_case::test_case;

    use super::*;
    use crate::{QueueError, allocator::Allocator, arena::MemoryArena, offset::Capacity};

    struct Source {
        allocator: Allocator,
        state:     QueueState,
        arena:     MemoryArena,
    }

    impl Source {
        fn new(capacity: u64, policy: ReclaimPolicy) -> Self {
            Self {
                allocator: Allocator::new(policy),
                state:     QueueState::empty(Capacity::new(capacity)),
                arena:     MemoryArena::new(capacity).unwrap(),
            }
        }

        fn push(&mut self, payload: &[u8]) {
            assert!(
                self.allocator
                    .push(&mut self.state, &mut self.arena, payload)
                    .unwrap()
            );
        }

        fn pop(&mut self) -> Option<Bytes> {
            self.allocator.pop(&mut self.state, &mut self.arena).unwrap()
        }

        fn snapshot(&self, name: &str) -> Vec<u8> {
            let mut out = Vec::new();
            write_snapshot(
                &mut out,
                name,
                self.allocator.policy(),
                &self.state,
                &self.arena,
            )
            .unwrap();
            out
        }
    }

    fn drain(allocator: Allocator, mut state: QueueState, arena: &mut MemoryArena) -> Vec<Bytes> {
        std::iter::from_fn(|| allocator.pop(&mut state, &mut *arena).unwrap()).collect()
    }

    fn no_compaction() -> ReclaimPolicy {
        ReclaimPolicy::Compaction(crate::config::CompactionThreshold {
            min_bytes:    u64::MAX,
            min_fraction: 1.0,
        })
    }

    #[test]
    fn test_wrapped_ring_round_trip() {
        let mut source = Source::new(45, ReclaimPolicy::Wraparound);
        for value in [b"1", b"2", b"3", b"4"] {
            source.push(value);
        }
        source.pop();
        source.push(b"5");
        source.push(b"6");
        assert!(source.state.is_wrapped());

        let bytes = source.snapshot("q");

        let mut arena = MemoryArena::new(45).unwrap();
        let state = read_snapshot(bytes.as_slice(), "q", ReclaimPolicy::Wraparound, &mut arena)
            .unwrap();

        assert_eq!(state, source.state);
        let drained = drain(source.allocator, state, &mut arena);
        assert_eq!(drained, vec!["2", "3", "4", "5", "6"]);
    }

    #[test]
    fn test_compaction_body_is_live_region_only() {
        let mut source = Source::new(200, no_compaction());
        for value in [&b"aaaa"[..], &b"bb"[..], &b"c"[..]] {
            source.push(value);
        }
        source.pop();
        assert_eq!(source.state.read_offset(), 12);

        let bytes = source.snapshot("q");
        let live = source.state.used_space() as usize;
        assert_eq!(bytes.len(), FIXED_PREFIX_LEN + 1 + BODY_RANGE_LEN + live + 4);

        let mut arena = MemoryArena::new(200).unwrap();
        let state = read_snapshot(bytes.as_slice(), "q", no_compaction(), &mut arena).unwrap();

        // Restored compacted
        assert_eq!(state.read_offset(), 0);
        assert_eq!(state.write_offset(), live as u64);
        assert_eq!(state.item_count(), 2);
        assert_eq!(drain(source.allocator, state, &mut arena), vec!["bb", "c"]);
    }

    #[test]
    fn test_empty_queue_round_trip() {
        let source = Source::new(64, no_compaction());
        let bytes = source.snapshot("q");

        let mut arena = MemoryArena::new(64).unwrap();
        let state = read_snapshot(bytes.as_slice(), "q", no_compaction(), &mut arena).unwrap();
        assert_eq!(state, QueueState::empty(Capacity::new(64)));
    }

    #[test]
    fn test_empty_compaction_snapshot_with_stale_cursors() {
        let source = Source::new(64, no_compaction());
        let mut bytes = source.snapshot("q");

        // write 40, read 40, body range 40+0, as an older writer may store
        bytes[17..25].copy_from_slice(&40u64.to_le_bytes());
        bytes[25..33].copy_from_slice(&40u64.to_le_bytes());
        let range_at = FIXED_PREFIX_LEN + 1;
        bytes[range_at..range_at + 8].copy_from_slice(&40u64.to_le_bytes());
        let crc_at = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..crc_at]);
        bytes[crc_at..].copy_from_slice(&crc.to_le_bytes());

        let mut arena = MemoryArena::new(64).unwrap();
        let state = read_snapshot(bytes.as_slice(), "q", no_compaction(), &mut arena).unwrap();
        assert_eq!(state, QueueState::empty(Capacity::new(64)));

        // A body is still refused
        let mut source = Source::new(64, no_compaction());
        source.push(b"x");
        let mut bytes = source.snapshot("q");
        bytes[33..41].copy_from_slice(&0u64.to_le_bytes());
        let crc_at = bytes.len() - 4;
        let crc = crc32fast::hash(&bytes[..crc_at]);
        bytes[crc_at..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            read_snapshot(bytes.as_slice(), "q", no_compaction(), &mut arena),
            Err(QueueError::SnapshotCorrupted { .. })
        ));
    }

    #[test]
    fn test_truncated_stream_at_every_length() {
        let mut source = Source::new(64, ReclaimPolicy::Wraparound);
        source.push(b"hello");
        let bytes = source.snapshot("q");

        for len in 0..bytes.len() {
            let mut arena = MemoryArena::new(64).unwrap();
            let result = read_snapshot(&bytes[..len], "q", ReclaimPolicy::Wraparound, &mut arena);
            assert!(
                matches!(result, Err(QueueError::SnapshotCorrupted { .. })),
                "prefix of {len} bytes was accepted"
            );
        }
    }

    #[test]
    fn test_failed_load_leaves_arena_untouched() {
        let mut source = Source::new(64, ReclaimPolicy::Wraparound);
        source.push(b"hello");
        let mut bytes = source.snapshot("q");
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;

        let mut arena = MemoryArena::new(64).unwrap();
        arena.write_at(Offset::ZERO, b"untouched").unwrap();
        assert!(read_snapshot(bytes.as_slice(), "q", ReclaimPolicy::Wraparound, &mut arena).is_err());

        let mut buf = [0u8; 9];
        arena.read_at(Offset::ZERO, &mut buf).unwrap();
        assert_eq!(&buf, b"untouched");
    }

    fn corrupt_magic(bytes: &mut Vec<u8>) { bytes[0] = b'X'; }

    fn corrupt_version(bytes: &mut Vec<u8>) { bytes[4] = 9; }

    fn corrupt_item_count(bytes: &mut Vec<u8>) { bytes[33] = 200; }

    fn corrupt_body(bytes: &mut Vec<u8>) {
        let at = FIXED_PREFIX_LEN + 1 + BODY_RANGE_LEN + 10;
        bytes[at] ^= 0x55;
    }

    #[test_case(corrupt_magic ; "magic")]
    #[test_case(corrupt_version ; "version")]
    #[test_case(corrupt_item_count ; "cursor invariants")]
    #[test_case(corrupt_body ; "body checksum")]
    fn test_corrupted_snapshot_rejected(corrupt_fn: fn(&mut Vec<u8>)) {
        let mut source = Source::new(64, ReclaimPolicy::Wraparound);
        source.push(b"hello");
        let mut bytes = source.snapshot("q");
        corrupt_fn(&mut bytes);

        let mut arena = MemoryArena::new(64).unwrap();
        assert!(matches!(
            read_snapshot(bytes.as_slice(), "q", ReclaimPolicy::Wraparound, &mut arena),
            Err(QueueError::SnapshotCorrupted { .. })
        ));
    }

    #[test]
    fn test_policy_and_capacity_must_match() {
        let source = Source::new(64, ReclaimPolicy::Wraparound);
        let bytes = source.snapshot("q");

        let mut arena = MemoryArena::new(64).unwrap();
        assert!(matches!(
            read_snapshot(bytes.as_slice(), "q", no_compaction(), &mut arena),
            Err(QueueError::SnapshotCorrupted { .. })
        ));

        let mut bigger = MemoryArena::new(128).unwrap();
        assert!(matches!(
            read_snapshot(bytes.as_slice(), "q", ReclaimPolicy::Wraparound, &mut bigger),
            Err(QueueError::CapacityMismatch {
                expected: 128,
                actual:   64,
            })
        ));
    }

    #[test]
    fn test_foreign_name_is_accepted() {
        let mut source = Source::new(64, ReclaimPolicy::Wraparound);
        source.push(b"x");
        let bytes = source.snapshot("other");

        let mut arena = MemoryArena::new(64).unwrap();
        let state = read_snapshot(bytes.as_slice(), "q", ReclaimPolicy::Wraparound, &mut arena)
            .unwrap();
        assert_eq!(state.item_count(), 1);
    }

    #[test]
    fn test_save_file_is_atomic_and_open_reports_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = snapshot_path(temp_dir.path(), "orders");
        assert!(open_file(&path).unwrap().is_none());

        save_file(&path, |w| Ok(w.write_all(b"payload")?)).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"payload");
        assert!(!path.with_extension("snapshot.tmp").exists());
        assert!(open_file(&path).unwrap().is_some());
    }
}
