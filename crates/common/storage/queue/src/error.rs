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

use std::{io, path::PathBuf};

use snafu::{Location, Snafu};

/// Queue operation errors.
///
/// Capacity exhaustion is not an error: `push` reports it as `Ok(false)`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("IO error at {loc}"), context(false))]
    Io {
        source: io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// Failed to open or create an arena or snapshot file.
    #[snafu(display("Failed to open {}", path.display()))]
    OpenFile {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// Memory mapping operation failed.
    #[snafu(display("Mmap operation failed: {message}"))]
    MmapFailed { message: String },

    /// Arena access outside `[0, capacity]`.
    #[snafu(display("Access of {len} bytes at offset {offset} exceeds arena capacity {capacity}"))]
    OutOfBounds {
        offset:   u64,
        len:      u64,
        capacity: u64,
    },

    /// Zero-length payloads collide with the end-of-data sentinel.
    #[snafu(display("Empty payloads cannot be pushed"))]
    EmptyPayload,

    /// Payload can never fit in this queue.
    #[snafu(display("Payload of {len} bytes exceeds the maximum of {max} bytes"))]
    PayloadTooLarge { len: u64, max: u64 },

    /// A record header inside the live region failed validation.
    #[snafu(display(
        "Corrupted record at offset {offset} (stored checksum {stored:#06x}, computed {computed:#06x})"
    ))]
    CorruptedRecord {
        offset:   u64,
        stored:   u16,
        computed: u16,
        #[snafu(implicit)]
        loc:      Location,
    },

    /// The queue saw a corrupted live region and refuses further use.
    #[snafu(display("Queue {name} is poisoned by an earlier corruption; flush it to reuse"))]
    Poisoned { name: String },

    /// Snapshot stream is truncated or malformed.
    #[snafu(display("Snapshot corrupted: {reason}"))]
    SnapshotCorrupted {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    /// Stored capacity disagrees with the configured one.
    #[snafu(display("Capacity mismatch: expected {expected} bytes, found {actual} bytes"))]
    CapacityMismatch { expected: u64, actual: u64 },

    /// Rejected builder input.
    #[snafu(display("Invalid queue configuration: {reason}"))]
    InvalidConfig { reason: String },

    /// Unexpected internal failure (e.g. a background task panicked).
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

/// Result type for queue operations.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
