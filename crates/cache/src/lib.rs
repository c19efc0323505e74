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

//! Block-addressed partial-file cache engine with a concurrent ranged
//! download pipeline.
//!
//! Cached artifacts are split into fixed-size blocks with a bitmap
//! recording which blocks are materialized. A ranged read is partitioned
//! into cache-hit and remote-fetch tasks; remote tasks stream from origin
//! through a bounded worker pool while newly completed blocks are
//! persisted as a side effect, and the assembler reorders nothing: frames
//! reach the response channel in strict offset order.

mod block_file;
mod config;
mod download;
mod error;
mod fetcher;
mod planner;
mod registry;
mod slicer;

pub use block_file::BlockFile;
pub use config::{DownloadConfig, RetryConfig};
pub use download::{Downloader, RangeRequest};
pub use error::{CacheError, Result};
pub use planner::{PlannedRange, RangeKind, plan};
pub use registry::{CacheHandle, CacheRegistry};
