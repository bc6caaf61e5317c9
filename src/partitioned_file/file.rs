// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Descriptor of a finished data file and index file pair.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use log::warn;

use super::index::{INDEX_ENTRY_SIZE, IndexEntry};
use super::read_at::ReadAt;
use crate::config::{DATA_FILE_SUFFIX, INDEX_FILE_SUFFIX};
use crate::error::{Result, ShuffleFileError};

/// Returns the data file path for a base path.
pub fn data_file_path(base_path: &Path) -> PathBuf {
    with_suffix(base_path, DATA_FILE_SUFFIX)
}

/// Returns the index file path for a base path.
pub fn index_file_path(base_path: &Path) -> PathBuf {
    with_suffix(base_path, INDEX_FILE_SUFFIX)
}

fn with_suffix(base_path: &Path, suffix: &str) -> PathBuf {
    let mut path = base_path.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// Immutable description of a finished partitioned file.
///
/// Only a writer's successful `finish` (or [`PartitionedFile::open`] on a
/// pair that was finished earlier) creates one. Any number of readers may
/// share it. The files themselves belong to the owner of the shuffle output,
/// which removes them through [`PartitionedFile::delete_quietly`].
#[derive(Debug, Clone)]
pub struct PartitionedFile {
    data_file_path: PathBuf,
    index_file_path: PathBuf,
    num_subpartitions: usize,
    num_regions: usize,
    data_file_size: u64,
    index_file_size: u64,
    /// Entire index file contents, kept when it never had to spill
    index_entry_cache: Option<Bytes>,
}

impl PartitionedFile {
    pub(crate) fn new(
        data_file_path: PathBuf,
        index_file_path: PathBuf,
        num_subpartitions: usize,
        num_regions: usize,
        data_file_size: u64,
        index_file_size: u64,
        index_entry_cache: Option<Bytes>,
    ) -> Self {
        Self {
            data_file_path,
            index_file_path,
            num_subpartitions,
            num_regions,
            data_file_size,
            index_file_size,
            index_entry_cache,
        }
    }

    /// Rebuilds the descriptor of a pair finished earlier at `base_path`.
    ///
    /// The region count is derived from the index file size, which must be
    /// a whole number of regions.
    pub fn open(base_path: impl AsRef<Path>, num_subpartitions: usize) -> Result<Self> {
        if num_subpartitions == 0 {
            return Err(ShuffleFileError::IllegalState(
                "Number of subpartitions must be positive".to_owned(),
            ));
        }
        let data_file_path = data_file_path(base_path.as_ref());
        let index_file_path = index_file_path(base_path.as_ref());
        let data_file_size = std::fs::metadata(&data_file_path)?.len();
        let index_file_size = std::fs::metadata(&index_file_path)?.len();

        let region_size = (num_subpartitions * INDEX_ENTRY_SIZE) as u64;
        if index_file_size % region_size != 0 {
            return Err(ShuffleFileError::FormatError(format!(
                "Invalid index file size: {index_file_size} \
                 (must be a multiple of {region_size})"
            )));
        }

        Ok(Self::new(
            data_file_path,
            index_file_path,
            num_subpartitions,
            (index_file_size / region_size) as usize,
            data_file_size,
            index_file_size,
            None,
        ))
    }

    /// Path of the data file.
    pub fn data_file_path(&self) -> &Path {
        &self.data_file_path
    }

    /// Path of the index file.
    pub fn index_file_path(&self) -> &Path {
        &self.index_file_path
    }

    /// Number of subpartitions.
    pub fn num_subpartitions(&self) -> usize {
        self.num_subpartitions
    }

    /// Number of regions written.
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    /// Size of the data file in bytes.
    pub fn data_file_size(&self) -> u64 {
        self.data_file_size
    }

    /// Size of the index file in bytes.
    pub fn index_file_size(&self) -> u64 {
        self.index_file_size
    }

    /// Returns true if the index is held in memory.
    pub fn has_index_cache(&self) -> bool {
        self.index_entry_cache.is_some()
    }

    /// Byte offset of the entry for `(region, subpartition)` in the index file.
    pub fn index_entry_offset(&self, region: usize, subpartition: usize) -> Result<u64> {
        self.check_bounds(region, subpartition)?;
        Ok(IndexEntry::offset_in_index(
            region,
            subpartition,
            self.num_subpartitions,
        ))
    }

    /// Looks up the entry for `(region, subpartition)`.
    ///
    /// Served from the index cache when present. Otherwise the entry is read
    /// from `index_file` into `scratch`.
    pub fn index_entry<R: ReadAt + ?Sized>(
        &self,
        region: usize,
        subpartition: usize,
        index_file: &R,
        scratch: &mut [u8; INDEX_ENTRY_SIZE],
    ) -> Result<IndexEntry> {
        let offset = self.index_entry_offset(region, subpartition)?;
        if let Some(cache) = &self.index_entry_cache {
            let start = offset as usize;
            let mut entry = cache.get(start..start + INDEX_ENTRY_SIZE).ok_or_else(|| {
                ShuffleFileError::FormatError(format!(
                    "Index cache of {} bytes has no entry at {start}",
                    cache.len()
                ))
            })?;
            return IndexEntry::decode(&mut entry);
        }

        index_file
            .read_exact_at(scratch, offset)
            .map_err(|e| ShuffleFileError::from_read(e, "index entry"))?;
        IndexEntry::decode(&mut scratch.as_slice())
    }

    /// Removes both files, logging failures instead of returning them.
    pub fn delete_quietly(&self) {
        for path in [&self.data_file_path, &self.index_file_path] {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to delete partitioned file {path:?}: {e:?}");
            }
        }
    }

    fn check_bounds(&self, region: usize, subpartition: usize) -> Result<()> {
        if region >= self.num_regions || subpartition >= self.num_subpartitions {
            return Err(ShuffleFileError::IllegalState(format!(
                "No index entry for region {region}, subpartition {subpartition} \
                 (regions: {}, subpartitions: {})",
                self.num_regions, self.num_subpartitions
            )));
        }
        Ok(())
    }
}
