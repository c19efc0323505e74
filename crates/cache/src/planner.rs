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

//! Partitioning of a requested byte range into cache-hit and remote-fetch
//! tasks.
//!
//! The planner walks the blocks overlapping `[start, end)` and groups
//! maximal runs of same-state blocks into tasks, clipping the first and
//! last run to the requested endpoints. Remote runs are further split so
//! no single fetch exceeds `remote_range_size` bytes, which bounds the
//! memory held by one in-flight fetch and lets large misses spread across
//! the worker pool.

use snafu::ensure;

use crate::{
    block_file::BlockFile,
    error::{InvalidRangeSnafu, Result},
};

/// Whether a planned range is served from disk or fetched from origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Cached,
    Remote,
}

/// One contiguous slice of the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRange {
    /// Position in the plan, ascending from zero.
    pub task_no: usize,
    pub kind:    RangeKind,
    /// Inclusive start offset.
    pub start:   u64,
    /// Exclusive end offset.
    pub end:     u64,
}

impl PlannedRange {
    #[must_use]
    pub const fn len(&self) -> u64 { self.end - self.start }

    #[must_use]
    pub const fn is_empty(&self) -> bool { self.start == self.end }
}

/// Partition `[start, end)` into an ordered, gap-free, non-overlapping
/// sequence of cached and remote ranges according to the file's bitmap.
///
/// `start == 0 && end == 0` yields an empty plan ("no content requested").
///
/// # Errors
/// `InvalidRange` when `start >= end` or `end` exceeds the file size.
pub fn plan(
    file: &BlockFile,
    start: u64,
    end: u64,
    remote_range_size: u64,
) -> Result<Vec<PlannedRange>> {
    if start == 0 && end == 0 {
        return Ok(Vec::new());
    }
    ensure!(
        start < end && end <= file.file_size(),
        InvalidRangeSnafu {
            start,
            end,
            file_size: file.file_size(),
        }
    );

    let start_block = start / file.block_size();
    let end_block = (end - 1) / file.block_size();

    let mut tasks = Vec::new();
    let mut task_no = 0;
    let mut run_start = start;
    let mut run_is_remote = !file.has_block(start_block)?;
    let mut cur_pos = start;

    for cur_block in start_block..=end_block {
        let (_, _, block_end) = file.block_bounds(cur_pos);
        let cur_is_remote = !file.has_block(cur_block)?;
        if cur_is_remote != run_is_remote {
            if run_start < cur_pos {
                push_run(
                    &mut tasks,
                    &mut task_no,
                    run_is_remote,
                    run_start,
                    cur_pos,
                    remote_range_size,
                );
            }
            run_start = cur_pos;
            run_is_remote = cur_is_remote;
        }
        cur_pos = block_end;
    }
    push_run(
        &mut tasks,
        &mut task_no,
        run_is_remote,
        run_start,
        end,
        remote_range_size,
    );

    Ok(tasks)
}

fn push_run(
    tasks: &mut Vec<PlannedRange>,
    task_no: &mut usize,
    remote: bool,
    start: u64,
    end: u64,
    remote_range_size: u64,
) {
    if !remote {
        tasks.push(PlannedRange {
            task_no: *task_no,
            kind: RangeKind::Cached,
            start,
            end,
        });
        *task_no += 1;
        return;
    }

    if remote_range_size == 0 {
        tasks.push(PlannedRange {
            task_no: *task_no,
            kind: RangeKind::Remote,
            start,
            end,
        });
        *task_no += 1;
        return;
    }

    let mut sub_start = start;
    while sub_start < end {
        let sub_end = (sub_start + remote_range_size).min(end);
        tasks.push(PlannedRange {
            task_no: *task_no,
            kind: RangeKind::Remote,
            start: sub_start,
            end: sub_end,
        });
        *task_no += 1;
        sub_start = sub_end;
    }
}
