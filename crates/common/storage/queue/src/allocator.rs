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

//! Space allocation over a [`QueueState`].
//!
//! Both policies share the framing rules:
//! - the first record pushed into an empty queue carries `epoch_start`;
//! - after a pop the new front's header is rewritten with `epoch_start`;
//! - a zero sentinel header follows the last record whenever the free gap
//!   behind it can hold one.
//!
//! A push writes the trailing sentinel first, then the payload, then the
//! header, so a crash at any point leaves a stream that ends before the new
//! record.
//!
//! With [`ReclaimPolicy::Wraparound`] a push that does not fit in the tail
//! starts a new epoch at offset 0 if the region before the read cursor is
//! large enough:
//!
//! ```text
//!  unwrapped:  [ free | live (read..write) | free ]
//!  wrapped:    [ live (0..write) | free | live (read..wrap_boundary) | dead ]
//! ```
//!
//! With [`ReclaimPolicy::Compaction`] the write cursor only moves forward;
//! the live region is moved back to offset 0 once enough space has been
//! popped.

use bytes::Bytes;
use snafu::ensure;
use tracing::{debug, trace};

use crate::{
    Result,
    arena::{Arena, offset_at},
    config::ReclaimPolicy,
    error::{CorruptedRecordSnafu, PayloadTooLargeSnafu},
    offset::Offset,
    record::{self, Frame, HEADER_SIZE, RecordHeader, SENTINEL, record_len},
    state::QueueState,
};

const HEADER_LEN: u64 = HEADER_SIZE as u64;

/// Where the next record goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// At the write cursor.
    At(Offset),
    /// At offset 0, abandoning the tail after the write cursor.
    Wrap,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Allocator {
    policy: ReclaimPolicy,
}

impl Allocator {
    pub(crate) const fn new(policy: ReclaimPolicy) -> Self { Self { policy } }

    pub(crate) const fn policy(&self) -> ReclaimPolicy { self.policy }

    /// Largest payload a queue of this capacity could ever hold.
    pub(crate) fn max_payload(state: &QueueState) -> u64 {
        state
            .capacity
            .get()
            .saturating_sub(HEADER_LEN)
            .min(u64::from(u32::MAX))
    }

    fn placement(&self, state: &QueueState, len: u64) -> Option<Placement> {
        let capacity = state.capacity;
        if state.is_empty() {
            return (len <= capacity.get()).then_some(Placement::At(Offset::ZERO));
        }

        let write = state.write_offset;
        let in_place = capacity.contains(write, len);
        match self.policy {
            ReclaimPolicy::Compaction(_) => in_place.then_some(Placement::At(write)),
            ReclaimPolicy::Wraparound if state.is_wrapped() => {
                // A full ring has read == write and no room at all.
                let room = write.distance_to(state.read_offset).unwrap_or(0);
                (room >= len).then_some(Placement::At(write))
            }
            ReclaimPolicy::Wraparound if in_place => Some(Placement::At(write)),
            ReclaimPolicy::Wraparound => (state.read_offset.get() >= len).then_some(Placement::Wrap),
        }
    }

    /// Whether a payload of `payload_len` bytes can be pushed right now.
    pub(crate) fn will_fit(&self, state: &QueueState, payload_len: u64) -> bool {
        payload_len > 0
            && payload_len <= u64::from(u32::MAX)
            && self.placement(state, record_len(payload_len)).is_some()
    }

    pub(crate) fn is_full(&self, state: &QueueState) -> bool {
        !state.is_empty() && !self.will_fit(state, 1)
    }

    pub(crate) fn free_space(&self, state: &QueueState) -> u64 {
        match self.policy {
            ReclaimPolicy::Wraparound => state.capacity.get() - state.used_space(),
            ReclaimPolicy::Compaction(_) => state.capacity.get() - state.write_offset.get(),
        }
    }

    /// Appends `payload` as one record.
    ///
    /// Returns `Ok(false)` when there is no room. `state` is only updated
    /// once every arena write succeeded.
    pub(crate) fn push(
        &self,
        state: &mut QueueState,
        arena: &mut dyn Arena,
        payload: &[u8],
    ) -> Result<bool> {
        let epoch_start = state.is_empty();
        let encoded = record::encode(payload, epoch_start)?;
        let len = encoded.len() as u64;
        ensure!(
            len <= state.capacity.get(),
            PayloadTooLargeSnafu {
                len: payload.len() as u64,
                max: Self::max_payload(state),
            }
        );

        let Some(placement) = self.placement(state, len) else {
            trace!(
                len,
                write_offset = state.write_offset(),
                read_offset = state.read_offset(),
                "No room for record"
            );
            return Ok(false);
        };

        let capacity = state.capacity;
        let mut next = *state;
        let at = match placement {
            Placement::At(at) => at,
            Placement::Wrap => {
                next.wrap_boundary = state.write_offset;
                Offset::ZERO
            }
        };
        next.write_offset = offset_at(capacity, at.get() + len)?;
        next.item_count += 1;

        write_sentinel(&next, arena)?;
        arena.write_at(offset_at(capacity, at.get() + HEADER_LEN)?, &encoded[HEADER_SIZE..])?;
        arena.write_at(at, &encoded[..HEADER_SIZE])?;

        if placement == Placement::Wrap {
            debug!(
                wrap_boundary = next.wrap_boundary(),
                read_offset = next.read_offset(),
                "Write cursor wrapped to offset 0"
            );
        }
        *state = next;
        Ok(true)
    }

    /// Removes and returns the front record.
    ///
    /// A header in the live region that fails validation is reported as
    /// [`crate::QueueError::CorruptedRecord`] and leaves `state` untouched.
    pub(crate) fn pop(&self, state: &mut QueueState, arena: &mut dyn Arena) -> Result<Option<Bytes>> {
        if state.is_empty() {
            return Ok(None);
        }

        let capacity = state.capacity;
        let front = state.read_offset;
        let header = read_live_header(state, arena, front)?;

        let mut payload = vec![0u8; header.payload_size() as usize];
        arena.read_at(offset_at(capacity, front.get() + HEADER_LEN)?, &mut payload)?;

        let mut next = *state;
        next.item_count -= 1;
        if next.item_count == 0 {
            next.reset();
            arena.write_at(Offset::ZERO, &SENTINEL)?;
        } else {
            let mut read = offset_at(capacity, front.get() + header.record_len())?;
            if read >= state.wrap_boundary {
                read = Offset::ZERO;
                next.wrap_boundary = capacity.end();
            }
            next.read_offset = read;
            mark_front(&next, arena)?;
        }
        *state = next;

        if let ReclaimPolicy::Compaction(threshold) = self.policy {
            if !state.is_empty() && threshold.should_compact(state.read_offset(), capacity.get()) {
                self.compact(state, arena)?;
            }
        }

        Ok(Some(Bytes::from(payload)))
    }

    /// Moves the live region `[read, write)` down to offset 0.
    ///
    /// Returns whether anything moved. Always `false` for the wraparound
    /// policy.
    pub(crate) fn compact(&self, state: &mut QueueState, arena: &mut dyn Arena) -> Result<bool> {
        if !matches!(self.policy, ReclaimPolicy::Compaction(_))
            || state.is_empty()
            || state.read_offset == Offset::ZERO
        {
            return Ok(false);
        }

        let reclaimed = state.read_offset();
        let live = state.used_space();
        arena.copy_within(state.read_offset, live, Offset::ZERO)?;

        let mut next = *state;
        next.read_offset = Offset::ZERO;
        next.write_offset = offset_at(state.capacity, live)?;
        write_sentinel(&next, arena)?;
        mark_front(&next, arena)?;
        *state = next;

        debug!(reclaimed, live, "Compacted live region to offset 0");
        Ok(true)
    }
}

/// Writes an end-of-data header at the write cursor if it fits in the gap.
pub(crate) fn write_sentinel(state: &QueueState, arena: &mut dyn Arena) -> Result<()> {
    let write = state.write_offset;
    let gap = if state.is_wrapped() {
        write.distance_to(state.read_offset)
    } else {
        write.distance_to(state.capacity.end())
    };
    if gap.unwrap_or(0) >= HEADER_LEN {
        arena.write_at(write, &SENTINEL)?;
    }
    Ok(())
}

/// Sets `epoch_start` on the header at the read cursor.
pub(crate) fn mark_front(state: &QueueState, arena: &mut dyn Arena) -> Result<()> {
    if state.is_empty() {
        return Ok(());
    }
    let header = read_live_header(state, arena, state.read_offset)?;
    if !header.epoch_start() {
        arena.write_at(state.read_offset, &header.with_epoch_start(true).to_bytes())?;
    }
    Ok(())
}

/// Reads the header at `at`, which must start a record inside the live region.
fn read_live_header(state: &QueueState, arena: &dyn Arena, at: Offset) -> Result<RecordHeader> {
    let limit = if state.is_wrapped() {
        state.wrap_boundary
    } else {
        state.write_offset
    };
    let fits = |len: u64| state.capacity.advance(at, len).is_some_and(|end| end <= limit);
    let corrupted = |stored: u16, computed: u16| {
        CorruptedRecordSnafu {
            offset: at.get(),
            stored,
            computed,
        }
        .build()
    };

    if !fits(HEADER_LEN) {
        return Err(corrupted(0, 0));
    }
    let mut raw = [0u8; HEADER_SIZE];
    arena.read_at(at, &mut raw)?;

    match record::decode(&raw) {
        Frame::Record(header) if fits(header.record_len()) => Ok(header),
        Frame::Record(header) => Err(corrupted(header.checksum(), header.checksum())),
        Frame::EndOfData => Err(corrupted(0, 0)),
        Frame::Corrupt { stored, computed } => Err(corrupted(stored, computed)),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::{
        QueueError,
        arena::MemoryArena,
        config::CompactionThreshold,
        offset::Capacity,
        record::decode,
    };

    struct Fixture {
        allocator: Allocator,
        state:     QueueState,
        arena:     MemoryArena,
    }

    impl Fixture {
        fn new(capacity: u64, policy: ReclaimPolicy) -> Self {
            Self {
                allocator: Allocator::new(policy),
                state:     QueueState::empty(Capacity::new(capacity)),
                arena:     MemoryArena::new(capacity).unwrap(),
            }
        }

        fn wraparound(capacity: u64) -> Self { Self::new(capacity, ReclaimPolicy::Wraparound) }

        fn compaction(capacity: u64, min_bytes: u64, min_fraction: f64) -> Self {
            Self::new(
                capacity,
                ReclaimPolicy::Compaction(CompactionThreshold {
                    min_bytes,
                    min_fraction,
                }),
            )
        }

        fn push(&mut self, payload: &[u8]) -> bool {
            self.allocator
                .push(&mut self.state, &mut self.arena, payload)
                .unwrap()
        }

        fn pop(&mut self) -> Option<Bytes> {
            self.allocator.pop(&mut self.state, &mut self.arena).unwrap()
        }

        fn header_at(&self, at: u64) -> Frame {
            let mut raw = [0u8; HEADER_SIZE];
            self.arena
                .read_at(self.state.capacity.offset(at).unwrap(), &mut raw)
                .unwrap();
            decode(&raw)
        }

        fn free(&self) -> u64 { self.allocator.free_space(&self.state) }
    }

    #[test]
    fn test_wraparound_scenario() {
        // 1-byte payloads make 9-byte records
        let mut fx = Fixture::wraparound(45);

        for value in [b"1", b"2", b"3", b"4"] {
            assert!(fx.push(value));
        }
        assert_eq!(fx.state.write_offset(), 36);
        assert_eq!(fx.pop().as_deref(), Some(&b"1"[..]));
        assert_eq!(fx.state.read_offset(), 9);

        // Case B in place, ends exactly at capacity
        assert!(fx.push(b"5"));
        assert_eq!(fx.state.write_offset(), 45);
        assert!(!fx.state.is_wrapped());

        // Case B wrap into the popped region
        assert!(fx.push(b"6"));
        assert_eq!(fx.state.write_offset(), 9);
        assert_eq!(fx.state.wrap_boundary(), 45);
        assert_eq!(fx.state.item_count(), 5);

        // Case D: read == write with records is full, not empty
        assert_eq!(fx.state.read_offset(), fx.state.write_offset());
        assert!(fx.allocator.is_full(&fx.state));
        assert_eq!(fx.free(), 0);
        assert!(!fx.push(b"7"));

        let drained: Vec<Bytes> = std::iter::from_fn(|| fx.pop()).collect();
        assert_eq!(drained, vec!["2", "3", "4", "5", "6"]);
        assert_eq!(fx.state, QueueState::empty(Capacity::new(45)));
    }

    #[test_case(45, 37, true ; "fits exactly")]
    #[test_case(45, 38, false ; "one byte too many")]
    fn test_case_a_empty_queue(capacity: u64, payload_len: usize, fits: bool) {
        let mut fx = Fixture::wraparound(capacity);
        assert_eq!(fx.allocator.will_fit(&fx.state, payload_len as u64), fits);

        if fits {
            assert!(fx.push(&vec![7u8; payload_len]));
            assert_eq!(fx.state.write_offset(), capacity);
        } else {
            assert!(matches!(
                fx.allocator
                    .push(&mut fx.state, &mut fx.arena, &vec![7u8; payload_len]),
                Err(QueueError::PayloadTooLarge { .. })
            ));
        }
    }

    #[test]
    fn test_case_b_no_wrap_when_leading_region_too_small() {
        let mut fx = Fixture::wraparound(45);
        for _ in 0..4 {
            assert!(fx.push(b"x"));
        }
        fx.pop();

        // 9 bytes free at the tail, 9 bytes free at the head: 10-byte record
        // fits nowhere
        assert!(!fx.allocator.will_fit(&fx.state, 2));
        assert!(!fx.push(b"yy"));
        assert_eq!(fx.state.wrap_boundary(), 45);
        assert_eq!(fx.state.write_offset(), 36);
    }

    #[test]
    fn test_case_c_wrapped_gap() {
        let mut fx = Fixture::wraparound(45);
        for _ in 0..4 {
            assert!(fx.push(b"x"));
        }
        fx.pop();
        fx.pop();
        // read = 18, tail has 9 bytes left; a 10-byte record wraps
        assert!(fx.push(b"yy"));
        assert!(fx.state.is_wrapped());
        assert_eq!(fx.state.write_offset(), 10);
        assert_eq!(fx.state.wrap_boundary(), 36);

        // Gap between write (10) and read (18) is 8 bytes
        assert!(!fx.allocator.will_fit(&fx.state, 1));
        assert!(fx.allocator.is_full(&fx.state));
        assert_eq!(fx.state.used_space(), 36 - 18 + 10);
        assert_eq!(fx.free() + fx.state.used_space(), 45);
    }

    #[test]
    fn test_read_cursor_follows_wrap_boundary() {
        let mut fx = Fixture::wraparound(45);
        for _ in 0..4 {
            assert!(fx.push(b"x"));
        }
        fx.pop();
        fx.pop();
        assert!(fx.push(b"yy"));

        assert_eq!(fx.pop().as_deref(), Some(&b"x"[..]));
        assert_eq!(fx.pop().as_deref(), Some(&b"x"[..]));
        // Reached wrap_boundary 36: read returns to 0 and the ring unwraps
        assert_eq!(fx.state.read_offset(), 0);
        assert_eq!(fx.state.wrap_boundary(), 45);
        assert!(!fx.state.is_wrapped());
        assert_eq!(fx.pop().as_deref(), Some(&b"yy"[..]));
        assert!(fx.state.is_empty());
    }

    #[test]
    fn test_front_marker_follows_pops() {
        let mut fx = Fixture::wraparound(100);
        assert!(fx.push(b"a"));
        assert!(fx.push(b"b"));

        assert!(matches!(fx.header_at(0), Frame::Record(h) if h.epoch_start()));
        assert!(matches!(fx.header_at(9), Frame::Record(h) if !h.epoch_start()));

        fx.pop();
        assert!(matches!(fx.header_at(9), Frame::Record(h) if h.epoch_start()));
    }

    #[test]
    fn test_sentinel_written_after_push_and_on_empty() {
        let mut fx = Fixture::wraparound(100);
        fx.arena
            .write_at(fx.state.capacity.offset(9).unwrap(), &[0xAA; 8])
            .unwrap();

        assert!(fx.push(b"a"));
        assert_eq!(fx.header_at(9), Frame::EndOfData);

        fx.pop();
        assert_eq!(fx.header_at(0), Frame::EndOfData);
    }

    #[test]
    fn test_corrupted_front_is_reported_and_state_kept() {
        let mut fx = Fixture::wraparound(100);
        assert!(fx.push(b"abc"));
        fx.arena
            .write_at(Offset::ZERO, &[0xFF, 0, 0, 0, 1, 2, 0, 0])
            .unwrap();
        let before = fx.state;

        let result = fx.allocator.pop(&mut fx.state, &mut fx.arena);

        assert!(matches!(
            result,
            Err(QueueError::CorruptedRecord { offset: 0, .. })
        ));
        assert_eq!(fx.state, before);
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let mut fx = Fixture::wraparound(100);
        assert!(matches!(
            fx.allocator.push(&mut fx.state, &mut fx.arena, b""),
            Err(QueueError::EmptyPayload)
        ));
        assert!(!fx.allocator.will_fit(&fx.state, 0));
    }

    #[test]
    fn test_compaction_never_wraps() {
        let mut fx = Fixture::compaction(45, u64::MAX, 1.0);
        for _ in 0..5 {
            assert!(fx.push(b"x"));
        }
        fx.pop();

        assert!(!fx.push(b"x"));
        assert_eq!(fx.free(), 0);
        assert_eq!(fx.state.used_space(), 36);
        assert!(fx.allocator.is_full(&fx.state));
    }

    #[test]
    fn test_compaction_threshold_triggers_after_pop() {
        let mut fx = Fixture::compaction(100, 18, 1.0);
        for value in [b"a", b"b", b"c", b"d"] {
            assert!(fx.push(value));
        }

        fx.pop();
        assert_eq!(fx.state.read_offset(), 9);

        fx.pop();
        // 18 wasted bytes reached min_bytes
        assert_eq!(fx.state.read_offset(), 0);
        assert_eq!(fx.state.write_offset(), 18);
        assert!(matches!(fx.header_at(0), Frame::Record(h) if h.epoch_start()));
        assert_eq!(fx.header_at(18), Frame::EndOfData);

        assert_eq!(fx.pop().as_deref(), Some(&b"c"[..]));
        assert_eq!(fx.pop().as_deref(), Some(&b"d"[..]));
    }

    #[test]
    fn test_forced_compaction() {
        let mut fx = Fixture::compaction(100, u64::MAX, 1.0);
        for value in [b"a", b"b", b"c"] {
            assert!(fx.push(value));
        }
        fx.pop();

        assert!(
            fx.allocator
                .compact(&mut fx.state, &mut fx.arena)
                .unwrap()
        );
        assert_eq!(fx.state.read_offset(), 0);
        assert_eq!(fx.state.write_offset(), 18);
        assert_eq!(fx.free(), 82);

        // Nothing left to reclaim
        assert!(
            !fx.allocator
                .compact(&mut fx.state, &mut fx.arena)
                .unwrap()
        );
        assert_eq!(fx.pop().as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn test_wraparound_ignores_compact() {
        let mut fx = Fixture::wraparound(100);
        assert!(fx.push(b"a"));
        assert!(fx.push(b"b"));
        fx.pop();

        assert!(
            !fx.allocator
                .compact(&mut fx.state, &mut fx.arena)
                .unwrap()
        );
        assert_eq!(fx.state.read_offset(), 9);
    }

    #[test]
    fn test_conservation_under_churn() {
        let mut fx = Fixture::wraparound(200);
        let mut expected = std::collections::VecDeque::new();

        for round in 0u32..500 {
            let payload = round.to_le_bytes().repeat((round % 5 + 1) as usize);
            if fx.push(&payload) {
                expected.push_back(payload);
            }
            if round % 3 == 0 {
                assert_eq!(fx.pop().map(|b| b.to_vec()), expected.pop_front());
            }
            assert_eq!(fx.state.used_space() + fx.free(), 200);
            assert_eq!(fx.state.item_count(), expected.len() as u64);
        }
    }
}
