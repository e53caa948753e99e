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

//! Checksum utilities for record headers and snapshots.
//!
//! Uses CRC-32 (IEEE polynomial) via crc32fast. Record headers only have room
//! for 16 bits, so the 32-bit CRC is folded in half.

use std::io::{self, Read, Write};

use crc32fast::Hasher;

/// Calculates the 16-bit checksum stored in a record header.
///
/// Covers the payload length and the flag byte, not the payload itself. A
/// torn or partially written header fails this check.
#[inline]
pub(crate) fn header_checksum(payload_size: u32, flags: u8) -> u16 {
    let mut hasher = Hasher::new();
    hasher.update(&payload_size.to_le_bytes());
    hasher.update(&[flags]);
    fold(hasher.finalize())
}

#[allow(clippy::cast_possible_truncation)]
#[inline]
const fn fold(crc: u32) -> u16 { ((crc >> 16) ^ (crc & 0xffff)) as u16 }

/// Writer adapter that checksums everything passing through it.
pub(crate) struct CrcWriter<W> {
    inner:  W,
    hasher: Hasher,
}

impl<W: Write> CrcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Checksum of all bytes written so far.
    pub fn checksum(&self) -> u32 { self.hasher.clone().finalize() }

    pub fn into_inner(self) -> W { self.inner }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { self.inner.flush() }
}

/// Reader adapter that checksums everything read through it.
pub(crate) struct CrcReader<R> {
    inner:  R,
    hasher: Hasher,
}

impl<R: Read> CrcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    /// Checksum of all bytes read so far.
    pub fn checksum(&self) -> u32 { self.hasher.clone().finalize() }

    pub fn into_inner(self) -> R { self.inner }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
