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

//! Writer producing a partitioned file region by region.
//!
//! Data of one region is laid out as one contiguous span per subpartition,
//! in the order the subpartitions are first written. When the region closes
//! an index entry per subpartition is appended to the in-memory index
//! buffer, which spills to the index file once it grows past the configured
//! threshold.
//!
//! A broadcast region carries identical data for every subpartition. Only
//! the buffers of the first subpartition written in the region reach the
//! data file; the buffers supplied for other subpartitions are dropped and
//! all index entries of the region point at the single stored span.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use log::{debug, info, warn};

use super::buffer::Buffer;
use super::file::{PartitionedFile, data_file_path, index_file_path};
use super::header::{BUFFER_HEADER_SIZE, BufferHeader};
use super::index::IndexEntry;
use super::sequencer::{ChannelSequencer, RunTransition};
use crate::config::PartitionedFileConfig;
use crate::error::{Result, ShuffleFileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Writing,
    Finished,
    Failed,
    Released,
}

/// Bookkeeping of the region being written.
#[derive(Debug)]
struct Region {
    is_broadcast: bool,
    /// Data file offset at which the region starts
    start_offset: u64,
    /// Subpartition whose buffers are stored for a broadcast region
    broadcast_source: Option<usize>,
}

/// Appends buffers of many subpartitions to a data file and index file pair.
///
/// Not safe for concurrent callers; the ordering rules are defined over the
/// sequence of `write_buffers` calls on one writer.
#[derive(Debug)]
pub struct PartitionedFileWriter {
    num_subpartitions: usize,
    config: PartitionedFileConfig,
    data_file_path: PathBuf,
    index_file_path: PathBuf,
    data_file: Option<BufWriter<File>>,
    index_file: Option<BufWriter<File>>,
    state: WriterState,
    region: Option<Region>,
    sequencer: ChannelSequencer,
    /// Start offset of each subpartition's span in the current region
    subpartition_offsets: Vec<u64>,
    /// Buffers written per subpartition in the current region
    subpartition_buffers: Vec<u32>,
    /// Bytes written per subpartition in the current region
    subpartition_bytes: Vec<u64>,
    total_bytes_written: u64,
    num_regions: usize,
    /// Index entries not yet written to the index file
    index_buffer: BytesMut,
    index_spill_threshold: usize,
    index_spilled: bool,
    header_buffer: BytesMut,
}

impl PartitionedFileWriter {
    /// Creates the data and index files for `base_path` and a writer over
    /// them.
    ///
    /// Fails if either file already exists.
    pub fn try_new(
        num_subpartitions: usize,
        base_path: impl AsRef<Path>,
        config: PartitionedFileConfig,
    ) -> Result<Self> {
        if num_subpartitions == 0 {
            return Err(ShuffleFileError::IllegalState(
                "Number of subpartitions must be positive".to_owned(),
            ));
        }
        config.validate()?;

        let base_path = base_path.as_ref();
        if let Some(parent) = base_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let data_file_path = data_file_path(base_path);
        let index_file_path = index_file_path(base_path);

        let data_file = create_file(&data_file_path, config.write_buffer_size)?;
        let index_file = match create_file(&index_file_path, config.write_buffer_size) {
            Ok(file) => file,
            Err(e) => {
                drop(data_file);
                remove_quietly(&data_file_path);
                return Err(e);
            }
        };

        debug!(
            "Created partitioned file writer for {num_subpartitions} subpartitions at {data_file_path:?}"
        );

        let index_spill_threshold = config.index_spill_threshold(num_subpartitions);
        Ok(Self {
            num_subpartitions,
            data_file_path,
            index_file_path,
            data_file: Some(data_file),
            index_file: Some(index_file),
            state: WriterState::Writing,
            region: None,
            sequencer: ChannelSequencer::new(num_subpartitions),
            subpartition_offsets: vec![0; num_subpartitions],
            subpartition_buffers: vec![0; num_subpartitions],
            subpartition_bytes: vec![0; num_subpartitions],
            total_bytes_written: 0,
            num_regions: 0,
            index_buffer: BytesMut::new(),
            index_spill_threshold,
            index_spilled: false,
            header_buffer: BytesMut::with_capacity(BUFFER_HEADER_SIZE),
            config,
        })
    }

    /// Number of subpartitions of the file being written.
    pub fn num_subpartitions(&self) -> usize {
        self.num_subpartitions
    }

    /// Number of regions closed so far.
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    /// Bytes appended to the data file so far.
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Closes the current region, if any, and opens a new one.
    pub fn start_new_region(&mut self, is_broadcast: bool) -> Result<()> {
        self.check_writable()?;
        let result = self.close_region();
        self.guard(result)?;

        self.region = Some(Region {
            is_broadcast,
            start_offset: self.total_bytes_written,
            broadcast_source: None,
        });
        Ok(())
    }

    /// Appends buffers, each tagged with its subpartition, in the given order.
    ///
    /// Each subpartition must be written as one contiguous run per region:
    /// once a different subpartition has been written after it, writing it
    /// again in the same region fails with
    /// [`ShuffleFileError::IllegalSequencing`] and nothing of the call is
    /// written. Writing without a started region opens a non-broadcast one.
    pub fn write_buffers(
        &mut self,
        buffers: impl IntoIterator<Item = (Buffer, usize)>,
    ) -> Result<()> {
        self.check_writable()?;
        let buffers: Vec<(Buffer, usize)> = buffers.into_iter().collect();
        if buffers.is_empty() {
            return Ok(());
        }

        let mut sequencer = self.sequencer.clone();
        let mut transitions = Vec::with_capacity(buffers.len());
        for (_, subpartition) in &buffers {
            match sequencer.advance(*subpartition) {
                Ok(transition) => transitions.push(transition),
                Err(e) => {
                    self.state = WriterState::Failed;
                    return Err(e);
                }
            }
        }
        self.sequencer = sequencer;

        if self.region.is_none() {
            self.region = Some(Region {
                is_broadcast: false,
                start_offset: self.total_bytes_written,
                broadcast_source: None,
            });
        }

        let result = self.append_buffers(buffers, transitions);
        self.guard(result)
    }

    /// Closes the last region, flushes and closes both files and returns the
    /// finished file.
    pub fn finish(&mut self) -> Result<PartitionedFile> {
        match self.state {
            WriterState::Writing => {}
            WriterState::Finished => {
                return Err(ShuffleFileError::IllegalState(
                    "Partitioned file writer has already finished".to_owned(),
                ));
            }
            WriterState::Failed | WriterState::Released => {
                return Err(ShuffleFileError::IllegalState(
                    "Partitioned file writer has failed and cannot finish".to_owned(),
                ));
            }
        }

        let result = self.close_files();
        let partitioned_file = self.guard(result)?;
        self.state = WriterState::Finished;

        info!(
            "Finished partitioned file {:?}: {} regions, {} subpartitions, \
             {} data bytes, {} index bytes, index cached: {}",
            partitioned_file.data_file_path(),
            partitioned_file.num_regions(),
            partitioned_file.num_subpartitions(),
            partitioned_file.data_file_size(),
            partitioned_file.index_file_size(),
            partitioned_file.has_index_cache()
        );
        Ok(partitioned_file)
    }

    /// Abandons an unfinished writer: closes and deletes both files.
    ///
    /// Does nothing once the writer has finished, since the files then
    /// belong to the returned [`PartitionedFile`], or when it was already
    /// released.
    pub fn release_quietly(&mut self) {
        if matches!(self.state, WriterState::Finished | WriterState::Released) {
            return;
        }
        self.state = WriterState::Released;
        self.data_file.take();
        self.index_file.take();
        remove_quietly(&self.data_file_path);
        remove_quietly(&self.index_file_path);
    }

    fn check_writable(&self) -> Result<()> {
        match self.state {
            WriterState::Writing => Ok(()),
            WriterState::Finished => Err(ShuffleFileError::IllegalState(
                "Partitioned file writer has already finished".to_owned(),
            )),
            WriterState::Failed => Err(ShuffleFileError::IllegalState(
                "Partitioned file writer has failed".to_owned(),
            )),
            WriterState::Released => Err(ShuffleFileError::IllegalState(
                "Partitioned file writer has been released".to_owned(),
            )),
        }
    }

    /// Marks the writer failed if `result` is an error.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.state = WriterState::Failed;
        }
        result
    }

    fn append_buffers(
        &mut self,
        buffers: Vec<(Buffer, usize)>,
        transitions: Vec<RunTransition>,
    ) -> Result<()> {
        for ((buffer, subpartition), transition) in buffers.into_iter().zip(transitions) {
            if !self.accept_for_region(subpartition) {
                continue;
            }
            if transition.starts_run() {
                self.subpartition_offsets[subpartition] = self.total_bytes_written;
            }
            let num_bytes = self.write_buffer(buffer)?;
            self.subpartition_buffers[subpartition] += 1;
            self.subpartition_bytes[subpartition] += num_bytes;
        }
        Ok(())
    }

    /// Returns false if the buffer is a copy of broadcast data that is
    /// already stored for another subpartition.
    fn accept_for_region(&mut self, subpartition: usize) -> bool {
        match self.region.as_mut() {
            Some(region) if region.is_broadcast => match region.broadcast_source {
                None => {
                    region.broadcast_source = Some(subpartition);
                    true
                }
                Some(source) => source == subpartition,
            },
            _ => true,
        }
    }

    /// Writes header and payload, consuming the buffer. Returns the number of
    /// bytes appended.
    fn write_buffer(&mut self, buffer: Buffer) -> Result<u64> {
        let length = u32::try_from(buffer.readable_bytes()).map_err(|_| {
            ShuffleFileError::IllegalState(format!(
                "Buffer of {} bytes exceeds the maximum payload length {}",
                buffer.readable_bytes(),
                u32::MAX
            ))
        })?;
        let header = BufferHeader::new(buffer.data_kind(), buffer.is_compressed(), length);

        self.header_buffer.clear();
        header.encode(&mut self.header_buffer);

        let data_file = self.data_file.as_mut().ok_or_else(|| {
            ShuffleFileError::IllegalState("Data file is already closed".to_owned())
        })?;
        data_file.write_all(&self.header_buffer)?;
        data_file.write_all(buffer.payload())?;

        let num_bytes = header.stored_size();
        self.total_bytes_written += num_bytes;
        Ok(num_bytes)
    }

    /// Appends the index entries of the current region and resets the
    /// per-region bookkeeping.
    fn close_region(&mut self) -> Result<()> {
        let Some(region) = self.region.take() else {
            return Ok(());
        };

        for subpartition in 0..self.num_subpartitions {
            let entry = if region.is_broadcast {
                match region.broadcast_source {
                    Some(source) => IndexEntry::new(
                        region.start_offset,
                        self.subpartition_buffers[source],
                        self.subpartition_bytes[source],
                    ),
                    None => IndexEntry::new(self.total_bytes_written, 0, 0),
                }
            } else if self.subpartition_buffers[subpartition] == 0 {
                IndexEntry::new(self.total_bytes_written, 0, 0)
            } else {
                IndexEntry::new(
                    self.subpartition_offsets[subpartition],
                    self.subpartition_buffers[subpartition],
                    self.subpartition_bytes[subpartition],
                )
            };
            entry.encode(&mut self.index_buffer);
        }

        debug!(
            "Closed region {} of {:?} (broadcast: {}, {} bytes)",
            self.num_regions,
            self.data_file_path,
            region.is_broadcast,
            self.total_bytes_written - region.start_offset
        );

        self.num_regions += 1;
        self.sequencer.reset();
        self.subpartition_buffers.iter_mut().for_each(|n| *n = 0);
        self.subpartition_bytes.iter_mut().for_each(|n| *n = 0);

        if self.index_buffer.len() >= self.index_spill_threshold {
            self.spill_index()?;
        }
        Ok(())
    }

    fn spill_index(&mut self) -> Result<()> {
        let index_file = self.index_file.as_mut().ok_or_else(|| {
            ShuffleFileError::IllegalState("Index file is already closed".to_owned())
        })?;
        index_file.write_all(&self.index_buffer)?;
        debug!(
            "Spilled {} bytes of index entries to {:?}",
            self.index_buffer.len(),
            self.index_file_path
        );
        self.index_buffer.clear();
        self.index_spilled = true;
        Ok(())
    }

    fn close_files(&mut self) -> Result<PartitionedFile> {
        self.close_region()?;

        let (Some(mut data_file), Some(mut index_file)) =
            (self.data_file.take(), self.index_file.take())
        else {
            return Err(ShuffleFileError::IllegalState(
                "Partitioned file writer is already closed".to_owned(),
            ));
        };

        index_file.write_all(&self.index_buffer)?;
        data_file.flush()?;
        index_file.flush()?;
        if self.config.sync_on_finish {
            data_file.get_ref().sync_all()?;
            index_file.get_ref().sync_all()?;
        }

        let data_file_size = data_file.get_ref().metadata()?.len();
        let index_file_size = index_file.get_ref().metadata()?.len();
        let index_entry_cache = if self.index_spilled {
            None
        } else {
            Some(self.index_buffer.split().freeze())
        };

        Ok(PartitionedFile::new(
            self.data_file_path.clone(),
            self.index_file_path.clone(),
            self.num_subpartitions,
            self.num_regions,
            data_file_size,
            index_file_size,
            index_entry_cache,
        ))
    }
}

impl Drop for PartitionedFileWriter {
    fn drop(&mut self) {
        // Unfinished output is never readable
        self.release_quietly();
    }
}

fn create_file(path: &Path, capacity: usize) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(BufWriter::with_capacity(capacity, file))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to delete partitioned file {path:?}: {e:?}");
    }
}
