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

//! Configuration for partitioned file writers.

use crate::error::{Result, ShuffleFileError};
use crate::partitioned_file::INDEX_ENTRY_SIZE;

/// Suffix appended to the base path to name the data file.
pub const DATA_FILE_SUFFIX: &str = ".shuffle.data";
/// Suffix appended to the base path to name the index file.
pub const INDEX_FILE_SUFFIX: &str = ".shuffle.index";

/// Configuration for [`PartitionedFileWriter`].
///
/// Controls how much of the index is kept in memory, the buffering of file
/// writes and whether the files are synced when the writer finishes.
///
/// [`PartitionedFileWriter`]: crate::partitioned_file::PartitionedFileWriter
#[derive(Debug, Clone)]
pub struct PartitionedFileConfig {
    /// Bytes of index entries held in memory before they are spilled to the
    /// index file (default: 4MB). A finished file whose index never spilled
    /// keeps the whole index cached in memory for its readers.
    pub max_index_buffer_size: usize,
    /// Capacity of the buffered data and index file writers (default: 64KB)
    pub write_buffer_size: usize,
    /// Whether to fsync both files in `finish` (default: false)
    pub sync_on_finish: bool,
}

impl Default for PartitionedFileConfig {
    fn default() -> Self {
        Self {
            max_index_buffer_size: 4 * 1024 * 1024, // 4 MB
            write_buffer_size: 64 * 1024,           // 64 KB
            sync_on_finish: false,
        }
    }
}

impl PartitionedFileConfig {
    /// Creates a new configuration with the specified settings.
    pub fn new(
        max_index_buffer_size: usize,
        write_buffer_size: usize,
        sync_on_finish: bool,
    ) -> Self {
        Self {
            max_index_buffer_size,
            write_buffer_size,
            sync_on_finish,
        }
    }

    /// Checks the settings for values no writer can work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_index_buffer_size == 0 {
            return Err(ShuffleFileError::IllegalState(
                "max_index_buffer_size must be positive".to_owned(),
            ));
        }
        if self.write_buffer_size == 0 {
            return Err(ShuffleFileError::IllegalState(
                "write_buffer_size must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the index spill threshold for a file with the given number of
    /// subpartitions. The threshold never drops below one region's entries.
    pub fn index_spill_threshold(&self, num_subpartitions: usize) -> usize {
        self.max_index_buffer_size
            .max(num_subpartitions * INDEX_ENTRY_SIZE)
    }
}
