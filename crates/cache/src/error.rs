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

use std::path::PathBuf;

use snafu::Snafu;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    #[snafu(display("invalid range [{start}, {end}) for file of {file_size} bytes"))]
    InvalidRange {
        start:     u64,
        end:       u64,
        file_size: u64,
    },

    #[snafu(display("corrupt cache metadata at {}: {reason}", path.display()))]
    CorruptMetadata { path: PathBuf, reason: String },

    #[snafu(display("block {block} out of range, file has {block_count} blocks"))]
    OutOfRange { block: u64, block_count: u64 },

    #[snafu(display("block {block} is not materialized"))]
    NotCached { block: u64 },

    #[snafu(display("block {block} payload is {actual} bytes, expected {expected}"))]
    BlockSize {
        block:    u64,
        expected: u64,
        actual:   u64,
    },

    #[snafu(display("metadata I/O error at {}: {source}", path.display()))]
    MetaIo {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("data I/O error at {}: {source}", path.display()))]
    DataIo {
        path:   PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("network error: {source}"))]
    Network { source: reqwest::Error },

    #[snafu(display("origin returned HTTP {status} for {url}"))]
    Origin { status: u16, url: String },

    #[snafu(display("origin stream truncated: expected {expected} bytes, received {actual}"))]
    StreamTruncated { expected: u64, actual: u64 },

    #[snafu(display("failed to decode {encoding} response body: {source}"))]
    Decode {
        encoding: String,
        source:   std::io::Error,
    },

    #[snafu(display("unsupported content encoding {encoding:?}"))]
    UnsupportedEncoding { encoding: String },

    #[snafu(display("invalid cache configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("background task failed: {source}"))]
    Join { source: tokio::task::JoinError },
}

impl CacheError {
    /// Whether a pre-stream origin error is worth another attempt.
    ///
    /// Client errors (4xx) are permanent; everything else (connect failures,
    /// timeouts, 5xx) may be transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            CacheError::Network { .. } => true,
            CacheError::Origin { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
