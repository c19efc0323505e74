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

use std::time::Duration;

use bon::Builder;
use hubstream_base::readable_size::ReadableSize;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::error::{CacheError, Result};

/// Configuration for the block cache engine and the ranged download
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct DownloadConfig {
    /// Block granularity of cached files. Immutable for files already on
    /// disk, so changing it requires wiping the cache directory.
    #[default(ReadableSize::mb(8))]
    pub block_size: ReadableSize,

    /// Maximum bytes covered by a single remote sub-task. Zero disables
    /// splitting. Must be a multiple of `block_size`.
    #[default(ReadableSize(0))]
    pub remote_range_size: ReadableSize,

    /// Outbound queue byte budget per remote task.
    #[default(ReadableSize::mb(32))]
    pub remote_buffer_size: ReadableSize,

    /// Read chunk size for origin response bodies.
    #[default(ReadableSize::kb(8))]
    pub resp_chunk_size: ReadableSize,

    /// Default channel depth, in frames.
    #[default = 30]
    pub resp_chan_size: usize,

    /// Concurrent remote fetches per file request.
    #[default = 8]
    pub max_workers_per_file: usize,

    /// Delay between remote task submissions, in seconds. Zero disables
    /// the pacing sleep.
    #[default = 1]
    pub range_submit_delay: u64,

    /// Origin request timeout, in seconds.
    #[default = 30]
    pub req_timeout: u64,
}

impl DownloadConfig {
    /// Validate every field against its allowed range.
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let block_size = self.block_size.as_bytes();
        if !(ReadableSize::mb(1).as_bytes()..=ReadableSize::mb(128).as_bytes())
            .contains(&block_size)
        {
            return invalid("block_size must be between 1MiB and 128MiB");
        }
        if self.remote_range_size.as_bytes() > ReadableSize::gb(1).as_bytes() {
            return invalid("remote_range_size must not exceed 1GiB");
        }
        if self.remote_range_size.as_bytes() % block_size != 0 {
            return invalid("remote_range_size must be a multiple of block_size");
        }
        if self.remote_buffer_size.as_bytes() > ReadableSize::mb(128).as_bytes() {
            return invalid("remote_buffer_size must not exceed 128MiB");
        }
        if !(ReadableSize::kb(4).as_bytes()..=ReadableSize::mb(8).as_bytes())
            .contains(&self.resp_chunk_size.as_bytes())
        {
            return invalid("resp_chunk_size must be between 4KiB and 8MiB");
        }
        if self.resp_chan_size == 0 {
            return invalid("resp_chan_size must be at least 1");
        }
        if !(1..=8).contains(&self.max_workers_per_file) {
            return invalid("max_workers_per_file must be between 1 and 8");
        }
        if self.range_submit_delay > 10 {
            return invalid("range_submit_delay must not exceed 10 seconds");
        }
        if self.req_timeout == 0 {
            return invalid("req_timeout must be at least 1 second");
        }
        Ok(())
    }

    #[must_use]
    pub const fn req_timeout(&self) -> Duration { Duration::from_secs(self.req_timeout) }

    #[must_use]
    pub const fn submit_delay(&self) -> Duration { Duration::from_secs(self.range_submit_delay) }

    /// Queue depth for a remote task streaming `range_len` bytes:
    /// `min(remote_buffer_size, range_len) / resp_chunk_size + 1` frames.
    #[must_use]
    pub fn queue_size(&self, range_len: u64) -> usize {
        let budget = self.remote_buffer_size.as_bytes().min(range_len);
        usize::try_from(budget / self.resp_chunk_size.as_bytes() + 1).unwrap_or(usize::MAX)
    }
}

/// Retry policy for the initial origin request of each remote task.
///
/// Only pre-stream failures are retried; once the body has started
/// flowing, a failure is terminal for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SmartDefault, Builder)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[default = 3]
    pub attempts: usize,

    /// Delay between attempts, in seconds.
    #[default = 1]
    pub delay: u64,
}

impl RetryConfig {
    /// # Errors
    /// Returns `InvalidConfig` when a field is outside its allowed range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.attempts) {
            return invalid("retry.attempts must be between 1 and 5");
        }
        if self.delay > 60 {
            return invalid("retry.delay must not exceed 60 seconds");
        }
        Ok(())
    }

    #[must_use]
    pub const fn delay(&self) -> Duration { Duration::from_secs(self.delay) }
}

fn invalid<T>(reason: &str) -> Result<T> {
    Err(CacheError::InvalidConfig {
        reason: reason.to_string(),
    })
}
