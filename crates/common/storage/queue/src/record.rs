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

//! Record framing.
//!
//! Every payload in an arena is prefixed by a fixed 8-byte header:
//!
//! ```text
//! ┌─────────────────┬────────────────┬───────────┬────────────┐
//! │  Size (4B)      │  Checksum (2B) │ Flags (1B)│ Reserved   │
//! │  little-endian  │  little-endian │ bit0=front│ (1B, zero) │
//! └─────────────────┴────────────────┴───────────┴────────────┘
//! ```
//!
//! - **Size**: payload length; `0` is the end-of-data sentinel
//! - **Checksum**: CRC-32 over size and flags, folded to 16 bits
//! - **Flags**: bit 0 (`epoch_start`) marks the logical front of the queue
//!
//! The stream `[header][payload][header][payload]...` starting at offset 0
//! is self-describing: recovery can rebuild the queue by replaying it.

use bytes::{BufMut, Bytes, BytesMut};
use snafu::ensure;

use crate::{
    Result,
    crc::header_checksum,
    error::{EmptyPayloadSnafu, PayloadTooLargeSnafu},
};

/// Size of a record header in bytes.
pub const HEADER_SIZE: usize = 8;

/// A zeroed header, read back as end of data.
pub(crate) const SENTINEL: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

const FLAG_EPOCH_START: u8 = 0b0000_0001;

/// Total arena bytes used by a record with a payload of `payload_len` bytes.
#[inline]
pub const fn record_len(payload_len: u64) -> u64 { HEADER_SIZE as u64 + payload_len }

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    payload_size: u32,
    checksum:     u16,
    epoch_start:  bool,
}

impl RecordHeader {
    /// Builds a header with a freshly computed checksum.
    pub fn new(payload_size: u32, epoch_start: bool) -> Self {
        Self {
            payload_size,
            checksum: header_checksum(payload_size, flags(epoch_start)),
            epoch_start,
        }
    }

    pub const fn payload_size(&self) -> u32 { self.payload_size }

    pub const fn checksum(&self) -> u16 { self.checksum }

    /// Whether this record is the logical front of the queue.
    pub const fn epoch_start(&self) -> bool { self.epoch_start }

    /// Header plus payload length.
    pub const fn record_len(&self) -> u64 { record_len(self.payload_size as u64) }

    /// Same header with the front marker set or cleared.
    #[must_use]
    pub fn with_epoch_start(self, epoch_start: bool) -> Self {
        Self::new(self.payload_size, epoch_start)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[4..6].copy_from_slice(&self.checksum.to_le_bytes());
        buf[6] = flags(self.epoch_start);
        buf
    }
}

const fn flags(epoch_start: bool) -> u8 {
    if epoch_start { FLAG_EPOCH_START } else { 0 }
}

/// Outcome of decoding the header bytes at some offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A valid record header.
    Record(RecordHeader),
    /// `payload_size == 0`: no further record.
    EndOfData,
    /// The header failed validation.
    Corrupt { stored: u16, computed: u16 },
}

/// Decodes a raw header.
///
/// End of data is reported before the checksum is looked at, so a zero-filled
/// region always reads as [`Frame::EndOfData`].
pub fn decode(raw: &[u8; HEADER_SIZE]) -> Frame {
    let payload_size = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if payload_size == 0 {
        return Frame::EndOfData;
    }

    let stored = u16::from_le_bytes([raw[4], raw[5]]);
    let flag_byte = raw[6];
    let computed = header_checksum(payload_size, flag_byte);

    if stored != computed || flag_byte & !FLAG_EPOCH_START != 0 || raw[7] != 0 {
        return Frame::Corrupt { stored, computed };
    }

    Frame::Record(RecordHeader {
        payload_size,
        checksum: stored,
        epoch_start: flag_byte & FLAG_EPOCH_START != 0,
    })
}

/// Encodes `payload` as one contiguous `[header][payload]` buffer.
///
/// # Errors
///
/// Rejects empty payloads and payloads whose length does not fit in a `u32`.
pub fn encode(payload: &[u8], epoch_start: bool) -> Result<Bytes> {
    ensure!(!payload.is_empty(), EmptyPayloadSnafu);

    let payload_size = u32::try_from(payload.len()).map_err(|_| {
        PayloadTooLargeSnafu {
            len: payload.len() as u64,
            max: u64::from(u32::MAX),
        }
        .build()
    })?;

    let header = RecordHeader::new(payload_size, epoch_start);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}
