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

//! Block-boundary accounting for a streamed byte range.
//!
//! As a fetch for `[range_start, ..)` flows through, the slicer buffers
//! only the bytes belonging to the block currently being filled (plus a
//! possible prefix of the next one) and yields every block the range
//! covered end to end. Blocks the range only grazes are dropped from the
//! buffer without being yielded: they can never be persisted because part
//! of their bytes was never fetched.
//!
//! The arithmetic is pure; callers own the I/O.

use bytes::{Bytes, BytesMut};

/// A fully covered block ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CompleteBlock {
    pub block: u64,
    /// Exactly `block_size` bytes; the final block arrives zero-padded.
    pub bytes: Bytes,
}

pub(crate) struct BlockSlicer {
    file_size:   u64,
    block_size:  u64,
    range_start: u64,
    cur_pos:     u64,
    buf:         BytesMut,
    last_block:  u64,
    last_start:  u64,
    last_end:    u64,
}

impl BlockSlicer {
    pub(crate) fn new(file_size: u64, block_size: u64, range_start: u64) -> Self {
        let (last_block, last_start, last_end) = block_bounds(range_start, block_size, file_size);
        Self {
            file_size,
            block_size,
            range_start,
            cur_pos: range_start,
            buf: BytesMut::new(),
            last_block,
            last_start,
            last_end,
        }
    }

    /// Account for the next streamed chunk, returning every block it
    /// completed. A single chunk may cross several block boundaries.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<CompleteBlock> {
        self.buf.extend_from_slice(chunk);
        self.cur_pos += chunk.len() as u64;

        let mut completed = Vec::new();
        while self.cur_pos >= (self.last_block + 1) * self.block_size {
            // Invariant: the buffer starts at max(last_start, range_start)
            // and extends to cur_pos, so the current block's share is the
            // distance from there to its end.
            let covered_from = self.last_start.max(self.range_start);
            let split = usize::try_from(self.last_end - covered_from).expect("split fits in usize");
            debug_assert!(split <= self.buf.len());
            let block_bytes = self.buf.split_to(split.min(self.buf.len())).freeze();

            if block_bytes.len() as u64 == self.block_size {
                completed.push(CompleteBlock {
                    block: self.last_block,
                    bytes: block_bytes,
                });
            }

            let (block, start, end) = block_bounds(self.last_end, self.block_size, self.file_size);
            self.last_block = block;
            self.last_start = start;
            self.last_end = end;
        }
        completed
    }

    /// Finish the stream. Returns the final block, zero-padded to
    /// `block_size`, when the range reached end-of-file and covered the
    /// whole logical tail.
    pub(crate) fn finish(mut self) -> Option<CompleteBlock> {
        let tail = self.file_size % self.block_size;
        if tail == 0 || self.cur_pos != self.file_size {
            return None;
        }
        if self.buf.len() as u64 != tail {
            // The range began inside the final block; the tail is
            // incomplete and must not be persisted.
            return None;
        }
        self.buf
            .resize(usize::try_from(self.block_size).expect("block fits in memory"), 0);
        Some(CompleteBlock {
            block: self.last_block,
            bytes: self.buf.freeze(),
        })
    }

    /// Bytes accounted so far, relative to `range_start`.
    pub(crate) const fn bytes_seen(&self) -> u64 { self.cur_pos - self.range_start }
}

fn block_bounds(pos: u64, block_size: u64, file_size: u64) -> (u64, u64, u64) {
    let block = pos / block_size;
    let start = block * block_size;
    let end = ((block + 1) * block_size).min(file_size);
    (block, start, end)
}
