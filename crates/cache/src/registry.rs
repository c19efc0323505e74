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

//! Process-wide table of open cached files.
//!
//! Concurrent requests for the same artifact must share one [`BlockFile`]
//! so that all of them observe a single bitmap and serialize block writes
//! through its per-file lock. The registry hands out reference-counted
//! handles; the last release flushes the bitmap and closes the file.

use std::{
    collections::HashMap,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{block_file::BlockFile, error::Result};

/// Shared registry mapping cache paths to open block files.
pub struct CacheRegistry {
    block_size: u64,
    entries:    Mutex<HashMap<PathBuf, Arc<Entry>>>,
}

struct Entry {
    file: Arc<BlockFile>,
    refs: AtomicI64,
}

impl CacheRegistry {
    #[must_use]
    pub fn new(block_size: u64) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire a handle on the cached file at `path`, opening or creating
    /// it on first use.
    ///
    /// The registry lock covers only the map access (the open itself is a
    /// quick header read); block I/O never runs under it.
    pub fn acquire(self: &Arc<Self>, path: impl AsRef<Path>, file_size: u64) -> Result<CacheHandle> {
        let path = path.as_ref().to_path_buf();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&path) {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(CacheHandle {
                registry: Arc::clone(self),
                path,
                file: Arc::clone(&entry.file),
            });
        }

        let file = Arc::new(BlockFile::open_or_create(&path, file_size, self.block_size)?);
        entries.insert(
            path.clone(),
            Arc::new(Entry {
                file: Arc::clone(&file),
                refs: AtomicI64::new(1),
            }),
        );
        Ok(CacheHandle {
            registry: Arc::clone(self),
            path,
            file,
        })
    }

    fn release(&self, path: &Path) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(path) else {
            warn!(path = %path.display(), "released a cache handle with no registry entry");
            return;
        };
        if entry.refs.fetch_sub(1, Ordering::AcqRel) <= 1 {
            if let Err(e) = entry.file.flush() {
                warn!(path = %path.display(), error = %e, "failed to flush block file on close");
            }
            entries.remove(path);
            debug!(path = %path.display(), "closed block file");
        }
    }

    /// Number of currently open files.
    #[must_use]
    pub fn open_files(&self) -> usize { self.entries.lock().len() }
}

/// A reference-counted handle on a shared [`BlockFile`].
///
/// Dropping the handle releases the reference; the last drop closes the
/// file and removes the registry entry.
pub struct CacheHandle {
    registry: Arc<CacheRegistry>,
    path:     PathBuf,
    file:     Arc<BlockFile>,
}

impl CacheHandle {
    /// The shared file, for tasks that outlive the borrow of the handle.
    #[must_use]
    pub fn block_file(&self) -> Arc<BlockFile> { Arc::clone(&self.file) }
}

impl Deref for CacheHandle {
    type Target = BlockFile;

    fn deref(&self) -> &BlockFile { &self.file }
}

impl Drop for CacheHandle {
    fn drop(&mut self) { self.registry.release(&self.path); }
}
