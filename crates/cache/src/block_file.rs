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

//! One cached artifact on disk: fixed-size blocks plus a presence bitmap.
//!
//! ## On-disk layout
//!
//! The artifact bytes live in a plain data file at `path`, so block `i`
//! starts at exactly `i * block_size`. Presence tracking lives in a sibling
//! metadata file `<path>.meta`:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Header (32 bytes)                       │
//! ├────────────┬───────────────┬────────────────┬─────────────────┤
//! │ magic (4B) │ version (4B)  │ file_size (8B) │ block_size (8B) │
//! ├────────────┴───────────────┴────────────────┴─────────────────┤
//! │ reserved (8B)                                                 │
//! └───────────────────────────────────────────────────────────────┘
//! ┌───────────────────────────────────────────────────────────────┐
//! │ bitmap (⌈block_count / 8⌉ bytes, bit i = block i present)     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The data file is created sparse at `file_size` bytes. Every block write
//! is exactly `block_size` bytes, so materializing the final block of a
//! file whose size is not block-aligned extends the data file with zero
//! padding; readers clamp served ranges to `file_size`.
//!
//! A bitmap bit is set in memory, and its byte persisted, only after the
//! corresponding data write has returned. A crash can therefore lose
//! recently set bits (the blocks are re-fetched later) but can never claim
//! a block that was not fully written.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::warn;

use crate::error::{
    CacheError, CorruptMetadataSnafu, DataIoSnafu, MetaIoSnafu, NotCachedSnafu, OutOfRangeSnafu,
    Result,
};

const META_MAGIC: [u8; 4] = *b"HSBC";
const META_VERSION: u32 = 1;
const META_HEADER_SIZE: u64 = 32;

/// A block-addressed cached file shared by all concurrent requests for the
/// same artifact.
///
/// `file_size` and `block_size` are fixed at creation. Reads of
/// materialized blocks take no lock; `write_block` serializes under the
/// per-file mutex guarding the bitmap.
pub struct BlockFile {
    path:        PathBuf,
    meta_path:   PathBuf,
    file_size:   u64,
    block_size:  u64,
    block_count: u64,
    data:        File,
    state:       Mutex<MetaState>,
}

struct MetaState {
    meta:   File,
    bitmap: Vec<u8>,
}

impl BlockFile {
    /// Open an existing cached file or create a fresh one.
    ///
    /// An existing metadata header must agree with `file_size` and
    /// `block_size`; any mismatch surfaces as `CorruptMetadata` rather
    /// than silently reinterpreting on-disk blocks.
    pub fn open_or_create(path: impl AsRef<Path>, file_size: u64, block_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta_path = meta_path_for(&path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(DataIoSnafu { path: path.clone() })?;
        }

        let block_count = file_size.div_ceil(block_size);
        let bitmap_len = usize::try_from(block_count.div_ceil(8)).expect("bitmap fits in memory");

        if meta_path.exists() {
            let data = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .context(DataIoSnafu { path: path.clone() })?;
            let meta = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&meta_path)
                .context(MetaIoSnafu {
                    path: meta_path.clone(),
                })?;

            let mut header = [0u8; META_HEADER_SIZE as usize];
            meta.read_exact_at(&mut header, 0).context(MetaIoSnafu {
                path: meta_path.clone(),
            })?;
            validate_header(&header, &meta_path, file_size, block_size)?;

            let mut bitmap = vec![0u8; bitmap_len];
            meta.read_exact_at(&mut bitmap, META_HEADER_SIZE)
                .context(MetaIoSnafu {
                    path: meta_path.clone(),
                })?;

            Ok(Self {
                path,
                meta_path,
                file_size,
                block_size,
                block_count,
                data,
                state: Mutex::new(MetaState { meta, bitmap }),
            })
        } else {
            let data = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .context(DataIoSnafu { path: path.clone() })?;
            data.set_len(file_size)
                .context(DataIoSnafu { path: path.clone() })?;

            let meta = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&meta_path)
                .context(MetaIoSnafu {
                    path: meta_path.clone(),
                })?;

            let bitmap = vec![0u8; bitmap_len];
            let header = encode_header(file_size, block_size);
            meta.write_all_at(&header, 0).context(MetaIoSnafu {
                path: meta_path.clone(),
            })?;
            meta.write_all_at(&bitmap, META_HEADER_SIZE)
                .context(MetaIoSnafu {
                    path: meta_path.clone(),
                })?;

            Ok(Self {
                path,
                meta_path,
                file_size,
                block_size,
                block_count,
                data,
                state: Mutex::new(MetaState { meta, bitmap }),
            })
        }
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn file_size(&self) -> u64 { self.file_size }

    pub fn block_size(&self) -> u64 { self.block_size }

    pub fn block_count(&self) -> u64 { self.block_count }

    /// The block containing `pos`, with its `[start, end)` byte interval
    /// clamped to `file_size`.
    pub fn block_bounds(&self, pos: u64) -> (u64, u64, u64) {
        let block = pos / self.block_size;
        let start = block * self.block_size;
        let end = ((block + 1) * self.block_size).min(self.file_size);
        (block, start, end)
    }

    /// Whether block `block` is fully materialized on disk.
    pub fn has_block(&self, block: u64) -> Result<bool> {
        self.check_block(block)?;
        let state = self.state.lock();
        Ok(bit_is_set(&state.bitmap, block))
    }

    /// Number of materialized blocks.
    pub fn cached_blocks(&self) -> u64 {
        let state = self.state.lock();
        state
            .bitmap
            .iter()
            .map(|byte| u64::from(byte.count_ones()))
            .sum()
    }

    /// Read block `block` from disk; always exactly `block_size` bytes,
    /// the final block padded with zeros past `file_size`.
    pub fn read_block(&self, block: u64) -> Result<Bytes> {
        self.check_block(block)?;
        {
            let state = self.state.lock();
            snafu::ensure!(bit_is_set(&state.bitmap, block), NotCachedSnafu { block });
        }

        // The bit is set, so the full padded block exists on disk and is
        // immutable from here on; no lock is needed for the read.
        let mut buf = vec![0u8; usize::try_from(self.block_size).expect("block fits in memory")];
        self.data
            .read_exact_at(&mut buf, block * self.block_size)
            .context(DataIoSnafu {
                path: self.path.clone(),
            })?;
        Ok(Bytes::from(buf))
    }

    /// Persist block `block`. Idempotent: if the block is already present
    /// the call is a no-op and the existing bytes win.
    ///
    /// The payload must be exactly `block_size` bytes (the caller pads the
    /// final block). The bitmap bit is set only after the data write has
    /// succeeded, and the touched bitmap byte is persisted immediately.
    pub fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        self.check_block(block)?;
        snafu::ensure!(
            data.len() as u64 == self.block_size,
            crate::error::BlockSizeSnafu {
                block,
                expected: self.block_size,
                actual: data.len() as u64,
            }
        );

        let mut state = self.state.lock();
        if bit_is_set(&state.bitmap, block) {
            return Ok(());
        }

        self.data
            .write_all_at(data, block * self.block_size)
            .context(DataIoSnafu {
                path: self.path.clone(),
            })?;

        set_bit(&mut state.bitmap, block);
        let byte_index = usize::try_from(block / 8).expect("bitmap fits in memory");
        let byte = state.bitmap[byte_index];
        state
            .meta
            .write_all_at(&[byte], META_HEADER_SIZE + block / 8)
            .context(MetaIoSnafu {
                path: self.meta_path.clone(),
            })?;
        Ok(())
    }

    /// Rewrite the full metadata header and bitmap and sync it to disk.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let header = encode_header(self.file_size, self.block_size);
        state.meta.write_all_at(&header, 0).context(MetaIoSnafu {
            path: self.meta_path.clone(),
        })?;
        state
            .meta
            .write_all_at(&state.bitmap, META_HEADER_SIZE)
            .context(MetaIoSnafu {
                path: self.meta_path.clone(),
            })?;
        state.meta.sync_data().context(MetaIoSnafu {
            path: self.meta_path.clone(),
        })?;
        Ok(())
    }

    fn check_block(&self, block: u64) -> Result<()> {
        snafu::ensure!(
            block < self.block_count,
            OutOfRangeSnafu {
                block,
                block_count: self.block_count,
            }
        );
        Ok(())
    }
}

impl Drop for BlockFile {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush block file bitmap");
        }
    }
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish_non_exhaustive()
    }
}

fn meta_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".meta");
    PathBuf::from(os)
}

fn encode_header(file_size: u64, block_size: u64) -> [u8; META_HEADER_SIZE as usize] {
    let mut header = [0u8; META_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&META_MAGIC);
    header[4..8].copy_from_slice(&META_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&file_size.to_le_bytes());
    header[16..24].copy_from_slice(&block_size.to_le_bytes());
    header
}

fn validate_header(
    header: &[u8; META_HEADER_SIZE as usize],
    meta_path: &Path,
    file_size: u64,
    block_size: u64,
) -> Result<()> {
    if header[0..4] != META_MAGIC {
        return corrupt(meta_path, "bad magic");
    }
    let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
    if version != META_VERSION {
        return corrupt(meta_path, &format!("unsupported version {version}"));
    }
    let stored_file_size = u64::from_le_bytes(header[8..16].try_into().unwrap());
    if stored_file_size != file_size {
        return corrupt(
            meta_path,
            &format!("file size mismatch: stored {stored_file_size}, requested {file_size}"),
        );
    }
    let stored_block_size = u64::from_le_bytes(header[16..24].try_into().unwrap());
    if stored_block_size != block_size {
        return corrupt(
            meta_path,
            &format!("block size mismatch: stored {stored_block_size}, requested {block_size}"),
        );
    }
    Ok(())
}

fn corrupt<T>(meta_path: &Path, reason: &str) -> Result<T> {
    CorruptMetadataSnafu {
        path:   meta_path.to_path_buf(),
        reason: reason.to_string(),
    }
    .fail()
}

fn bit_is_set(bitmap: &[u8], block: u64) -> bool {
    let byte = usize::try_from(block / 8).expect("bitmap fits in memory");
    bitmap[byte] & (1 << (block % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], block: u64) {
    let byte = usize::try_from(block / 8).expect("bitmap fits in memory");
    bitmap[byte] |= 1 << (block % 8);
}
