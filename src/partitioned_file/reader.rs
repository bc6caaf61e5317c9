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

//! Reader for one subpartition of a partitioned file.
//!
//! The reader walks the regions in order. For each region it looks up the
//! subpartition's index entry, reads the span at its offset and rebuilds
//! buffers into the memory segments supplied by the caller. A call stops when the span is
//! exhausted or the next buffer no longer fits the remaining segments; the
//! following call resumes at the first buffer not yet delivered.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use log::trace;

use super::buffer::CompositeBuffer;
use super::file::PartitionedFile;
use super::header::{BUFFER_HEADER_SIZE, BufferHeader};
use super::index::{INDEX_ENTRY_SIZE, IndexEntry};
use super::read_at::ReadAt;
use super::segment::{BufferRecycler, MemorySegment, SegmentSlice, SharedSegment};
use crate::error::{Result, ShuffleFileError};

/// Position of a reader within its subpartition's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderPosition {
    /// Region currently being read
    pub region_index: usize,
    /// Bytes of the region's span already delivered
    pub consumed_bytes: u64,
    /// Buffers of the region's span already delivered
    pub consumed_buffers: u32,
}

/// A segment taken from the caller and the number of bytes filled so far.
struct FilledSegment {
    segment: MemorySegment,
    used: usize,
}

impl FilledSegment {
    fn remaining(&self) -> usize {
        self.segment.size() - self.used
    }
}

/// A buffer read from the file, not yet handed to the caller.
struct PendingBuffer {
    header: BufferHeader,
    /// (index into the filled segments, byte range within that segment)
    parts: Vec<(usize, Range<usize>)>,
}

/// Reads the buffers of one subpartition, region after region.
///
/// Each reader owns its position. All reads are positioned, so the file
/// handles may be shared with other readers, also across threads (for
/// example `&File` or `Arc<File>`). One reader must not be used from several
/// threads at once.
pub struct PartitionedFileReader<R> {
    partitioned_file: Arc<PartitionedFile>,
    subpartition: usize,
    data_file: R,
    index_file: R,
    header_scratch: [u8; BUFFER_HEADER_SIZE],
    index_scratch: [u8; INDEX_ENTRY_SIZE],
    position: ReaderPosition,
    /// Index entry of the current region, loaded on first use
    current_entry: Option<IndexEntry>,
}

impl<R: ReadAt> PartitionedFileReader<R> {
    /// Creates a reader for `subpartition` over the given file handles.
    pub fn try_new(
        partitioned_file: Arc<PartitionedFile>,
        subpartition: usize,
        data_file: R,
        index_file: R,
    ) -> Result<Self> {
        if subpartition >= partitioned_file.num_subpartitions() {
            return Err(ShuffleFileError::IllegalState(format!(
                "Subpartition {subpartition} out of range (num subpartitions: {})",
                partitioned_file.num_subpartitions()
            )));
        }
        Ok(Self {
            partitioned_file,
            subpartition,
            data_file,
            index_file,
            header_scratch: [0u8; BUFFER_HEADER_SIZE],
            index_scratch: [0u8; INDEX_ENTRY_SIZE],
            position: ReaderPosition::default(),
            current_entry: None,
        })
    }

    /// Subpartition served by this reader.
    pub fn subpartition(&self) -> usize {
        self.subpartition
    }

    /// The file being read.
    pub fn partitioned_file(&self) -> &Arc<PartitionedFile> {
        &self.partitioned_file
    }

    /// Current position.
    pub fn position(&self) -> ReaderPosition {
        self.position
    }

    /// Returns true while regions remain to be read.
    pub fn has_remaining(&self) -> bool {
        self.position.region_index < self.partitioned_file.num_regions()
    }

    /// Data file offset at which the next call starts reading, or `None`
    /// once all regions are read.
    pub fn next_offset_to_read(&mut self) -> Result<Option<u64>> {
        if !self.has_remaining() {
            return Ok(None);
        }
        let entry = self.load_entry()?;
        Ok(Some(entry.data_offset + self.position.consumed_bytes))
    }

    /// Reads buffers of the current region into `segments`.
    ///
    /// Segments are taken from the front of the queue as needed; unused ones
    /// stay in it. Every rebuilt buffer is passed to `on_buffer_ready` in
    /// write order. A filled segment goes to `recycler` once every buffer
    /// referencing it has been dropped.
    ///
    /// The region is left once all of its bytes for this subpartition are
    /// delivered; otherwise the next call continues where this one stopped.
    /// A region without data for the subpartition is skipped by the call.
    pub fn read_current_region<F>(
        &mut self,
        segments: &mut VecDeque<MemorySegment>,
        recycler: Arc<dyn BufferRecycler>,
        mut on_buffer_ready: F,
    ) -> Result<()>
    where
        F: FnMut(CompositeBuffer),
    {
        if !self.has_remaining() {
            if self.partitioned_file.num_regions() == 0 {
                return Ok(());
            }
            return Err(ShuffleFileError::IllegalState(format!(
                "Subpartition {} of {:?} has no remaining regions",
                self.subpartition,
                self.partitioned_file.data_file_path()
            )));
        }

        let entry = self.load_entry()?;
        if entry.is_empty() {
            trace!(
                "Subpartition {} has no data in region {}",
                self.subpartition, self.position.region_index
            );
            self.advance_region();
            return Ok(());
        }

        let mut filled = Vec::new();
        let mut pending = Vec::new();
        let (consumed_bytes, consumed_buffers) =
            match self.fill_segments(&entry, segments, &mut filled, &mut pending) {
                Ok(consumed) => consumed,
                Err(e) => {
                    filled
                        .into_iter()
                        .for_each(|f: FilledSegment| recycler.recycle(f.segment));
                    return Err(e);
                }
            };

        if pending.is_empty() {
            return Err(ShuffleFileError::IllegalState(format!(
                "Next buffer of subpartition {} does not fit into the {} supplied bytes \
                 of memory segments",
                self.subpartition,
                segments.iter().map(|s| s.size()).sum::<usize>()
            )));
        }

        if consumed_bytes == entry.num_bytes {
            if consumed_buffers != entry.num_buffers {
                filled
                    .into_iter()
                    .for_each(|f: FilledSegment| recycler.recycle(f.segment));
                return Err(ShuffleFileError::FormatError(format!(
                    "Region {} of subpartition {} holds {consumed_buffers} buffers, \
                     index says {}",
                    self.position.region_index, self.subpartition, entry.num_buffers
                )));
            }
            trace!(
                "Finished region {} of subpartition {}",
                self.position.region_index, self.subpartition
            );
            self.advance_region();
        } else {
            self.position.consumed_bytes = consumed_bytes;
            self.position.consumed_buffers = consumed_buffers;
        }

        let sealed: Vec<Arc<SharedSegment>> = filled
            .into_iter()
            .map(|f| SharedSegment::seal(f.segment, recycler.clone()))
            .collect();
        for buffer in pending {
            let slices = buffer
                .parts
                .into_iter()
                .map(|(index, range)| SegmentSlice::new(sealed[index].clone(), range))
                .collect();
            on_buffer_ready(CompositeBuffer::new(buffer.header, slices));
        }
        Ok(())
    }

    /// Reads as many whole buffers as fit the segments. Returns the region's
    /// consumed bytes and buffers after the last buffer read.
    fn fill_segments(
        &mut self,
        entry: &IndexEntry,
        segments: &mut VecDeque<MemorySegment>,
        filled: &mut Vec<FilledSegment>,
        pending: &mut Vec<PendingBuffer>,
    ) -> Result<(u64, u32)> {
        let mut consumed_bytes = self.position.consumed_bytes;
        let mut consumed_buffers = self.position.consumed_buffers;
        let mut offset = entry.data_offset + consumed_bytes;

        while consumed_bytes < entry.num_bytes {
            self.data_file
                .read_exact_at(&mut self.header_scratch, offset)
                .map_err(|e| ShuffleFileError::from_read(e, "buffer header"))?;
            let header = BufferHeader::decode(&mut self.header_scratch.as_slice())?;
            if consumed_bytes + header.stored_size() > entry.num_bytes {
                return Err(ShuffleFileError::FormatError(format!(
                    "Buffer of {} bytes at {} overruns the span of {} bytes at {}",
                    header.stored_size(),
                    entry.data_offset + consumed_bytes,
                    entry.num_bytes,
                    entry.data_offset
                )));
            }

            let length = header.length as usize;
            let available = filled.last().map_or(0, |f| f.remaining())
                + segments.iter().map(|s| s.size()).sum::<usize>();
            if length > available {
                break;
            }

            offset += BUFFER_HEADER_SIZE as u64;
            let mut parts = Vec::new();
            let mut left = length;
            while left > 0 {
                if filled.last().is_none_or(|f| f.remaining() == 0) {
                    let segment = segments.pop_front().ok_or_else(|| {
                        ShuffleFileError::IllegalState(
                            "Ran out of memory segments".to_owned(),
                        )
                    })?;
                    filled.push(FilledSegment { segment, used: 0 });
                }
                let index = filled.len() - 1;
                let current = &mut filled[index];
                let start = current.used;
                let n = left.min(current.remaining());
                self.data_file
                    .read_exact_at(
                        &mut current.segment.as_mut_slice()[start..start + n],
                        offset,
                    )
                    .map_err(|e| ShuffleFileError::from_read(e, "buffer payload"))?;
                offset += n as u64;
                current.used += n;
                parts.push((index, start..start + n));
                left -= n;
            }

            pending.push(PendingBuffer { header, parts });
            consumed_bytes += header.stored_size();
            consumed_buffers += 1;
        }
        Ok((consumed_bytes, consumed_buffers))
    }

    fn load_entry(&mut self) -> Result<IndexEntry> {
        if let Some(entry) = self.current_entry {
            return Ok(entry);
        }
        let entry = self.partitioned_file.index_entry(
            self.position.region_index,
            self.subpartition,
            &self.index_file,
            &mut self.index_scratch,
        )?;
        let end = entry.data_offset.checked_add(entry.num_bytes);
        if entry.is_empty() != (entry.num_bytes == 0)
            || end.is_none_or(|end| end > self.partitioned_file.data_file_size())
        {
            return Err(ShuffleFileError::FormatError(format!(
                "Invalid index entry {entry:?} for region {} (data file size {})",
                self.position.region_index,
                self.partitioned_file.data_file_size()
            )));
        }
        self.current_entry = Some(entry);
        Ok(entry)
    }

    fn advance_region(&mut self) {
        self.position = ReaderPosition {
            region_index: self.position.region_index + 1,
            consumed_bytes: 0,
            consumed_buffers: 0,
        };
        self.current_entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionedFileConfig;
    use crate::partitioned_file::buffer::Buffer;
    use crate::partitioned_file::header::DataKind;
    use crate::partitioned_file::segment::{FreeingBufferRecycler, QueueRecycler};
    use crate::partitioned_file::writer::PartitionedFileWriter;
    use bytes::{Bytes, BytesMut};
    use std::fs::{File, OpenOptions};
    use tempfile::TempDir;

    fn payload(len: usize, seed: u8) -> Buffer {
        let data: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
        Buffer::new(DataKind::DataBuffer, Bytes::from(data))
    }

    fn segments(count: usize, size: usize) -> VecDeque<MemorySegment> {
        (0..count).map(|_| MemorySegment::allocate(size)).collect()
    }

    fn write_file(
        temp_dir: &TempDir,
        num_subpartitions: usize,
        regions: Vec<Vec<(Buffer, usize)>>,
    ) -> Result<Arc<PartitionedFile>> {
        let mut writer = PartitionedFileWriter::try_new(
            num_subpartitions,
            temp_dir.path().join("output"),
            PartitionedFileConfig::default(),
        )?;
        for region in regions {
            writer.start_new_region(false)?;
            writer.write_buffers(region)?;
        }
        Ok(Arc::new(writer.finish()?))
    }

    fn open_reader(
        file: &Arc<PartitionedFile>,
        subpartition: usize,
    ) -> Result<PartitionedFileReader<File>> {
        PartitionedFileReader::try_new(
            file.clone(),
            subpartition,
            File::open(file.data_file_path())?,
            File::open(file.index_file_path())?,
        )
    }

    #[test]
    fn test_resume_partial_region() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let written = vec![payload(100, 1), payload(100, 2), payload(100, 3)];
        let file = write_file(
            &temp_dir,
            2,
            vec![
                written.iter().cloned().map(|b| (b, 0)).collect(),
                vec![(payload(10, 4), 0)],
            ],
        )?;

        let mut reader = open_reader(&file, 0)?;
        let recycler = Arc::new(FreeingBufferRecycler);
        let mut read = Vec::new();
        for call in 0..3 {
            assert!(reader.has_remaining());
            assert_eq!(reader.position().region_index, 0);
            let mut queue = segments(1, 100);
            reader.read_current_region(&mut queue, recycler.clone(), |b| read.push(b))?;
            assert_eq!(read.len(), call + 1);
            assert!(queue.is_empty());
        }
        assert_eq!(reader.position(), ReaderPosition {
            region_index: 1,
            consumed_bytes: 0,
            consumed_buffers: 0,
        });
        assert!(reader.has_remaining());
        for (expected, actual) in written.iter().zip(&read) {
            assert!(actual.content_eq(expected));
        }
        Ok(())
    }

    #[test]
    fn test_position_after_partial_read() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(
            &temp_dir,
            1,
            vec![vec![(payload(40, 0), 0), (payload(40, 1), 0)]],
        )?;
        let mut reader = open_reader(&file, 0)?;
        assert_eq!(reader.next_offset_to_read()?, Some(0));

        let mut queue = segments(1, 64);
        reader.read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {})?;
        let stored = (BUFFER_HEADER_SIZE + 40) as u64;
        assert_eq!(reader.position(), ReaderPosition {
            region_index: 0,
            consumed_bytes: stored,
            consumed_buffers: 1,
        });
        assert_eq!(reader.next_offset_to_read()?, Some(stored));

        let mut queue = segments(1, 64);
        reader.read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {})?;
        assert!(!reader.has_remaining());
        assert_eq!(reader.next_offset_to_read()?, None);
        Ok(())
    }

    #[test]
    fn test_payload_spanning_segments() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let written = payload(250, 7);
        let file = write_file(&temp_dir, 1, vec![vec![(written.clone(), 0)]])?;

        let mut reader = open_reader(&file, 0)?;
        let mut queue = segments(4, 100);
        let mut read = Vec::new();
        reader.read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |b| {
            read.push(b)
        })?;

        assert_eq!(queue.len(), 1);
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].num_slices(), 3);
        assert_eq!(read[0].readable_bytes(), 250);
        assert!(read[0] == written);
        assert!(!reader.has_remaining());
        Ok(())
    }

    #[test]
    fn test_segments_recycled_after_last_buffer_dropped() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(
            &temp_dir,
            1,
            vec![vec![(payload(30, 0), 0), (payload(30, 1), 0), (payload(30, 2), 0)]],
        )?;

        let recycler = QueueRecycler::default();
        let mut reader = open_reader(&file, 0)?;
        let mut queue = segments(2, 64);
        let mut read = Vec::new();
        reader.read_current_region(&mut queue, Arc::new(recycler.clone()), |b| {
            read.push(b)
        })?;

        // first segment holds buffers 0 and 1 plus the head of buffer 2
        assert_eq!(read.len(), 3);
        assert_eq!(read[2].num_slices(), 2);
        assert_eq!(recycler.available(), 0);

        let last = read.pop();
        drop(read);
        assert_eq!(recycler.available(), 0);
        drop(last);
        assert_eq!(recycler.available(), 2);
        Ok(())
    }

    #[test]
    fn test_buffer_larger_than_segments() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(&temp_dir, 1, vec![vec![(payload(300, 0), 0)]])?;
        let mut reader = open_reader(&file, 0)?;

        let mut queue = segments(2, 100);
        let err = reader
            .read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {})
            .unwrap_err();
        assert!(matches!(err, ShuffleFileError::IllegalState(_)));
        assert_eq!(queue.len(), 2);
        assert_eq!(reader.position(), ReaderPosition::default());

        let mut queue = segments(3, 100);
        let mut read = 0;
        reader.read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {
            read += 1
        })?;
        assert_eq!(read, 1);
        Ok(())
    }

    #[test]
    fn test_empty_region_is_skipped_by_one_call() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(
            &temp_dir,
            2,
            vec![vec![(payload(5, 0), 1)], vec![(payload(5, 1), 0)]],
        )?;
        let mut reader = open_reader(&file, 0)?;

        let mut queue = segments(1, 16);
        let mut read = 0;
        reader.read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {
            read += 1
        })?;
        assert_eq!(read, 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(reader.position().region_index, 1);

        reader.read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {
            read += 1
        })?;
        assert_eq!(read, 1);
        assert!(!reader.has_remaining());
        Ok(())
    }

    #[test]
    fn test_read_past_end() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(&temp_dir, 1, vec![vec![(payload(5, 0), 0)]])?;
        let mut reader = open_reader(&file, 0)?;
        let recycler: Arc<dyn BufferRecycler> = Arc::new(FreeingBufferRecycler);

        reader.read_current_region(&mut segments(1, 16), recycler.clone(), |_| {})?;
        assert!(!reader.has_remaining());
        let err = reader
            .read_current_region(&mut segments(1, 16), recycler, |_| {})
            .unwrap_err();
        assert!(matches!(err, ShuffleFileError::IllegalState(_)));
        Ok(())
    }

    #[test]
    fn test_truncated_data_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(
            &temp_dir,
            1,
            vec![vec![(payload(20, 0), 0), (payload(20, 1), 0)]],
        )?;
        OpenOptions::new()
            .write(true)
            .open(file.data_file_path())?
            .set_len((BUFFER_HEADER_SIZE + 20 + BUFFER_HEADER_SIZE + 5) as u64)?;

        let recycler = QueueRecycler::default();
        let mut reader = open_reader(&file, 0)?;
        let mut queue = segments(2, 64);
        let mut read = 0;
        let err = reader
            .read_current_region(&mut queue, Arc::new(recycler.clone()), |_| read += 1)
            .unwrap_err();

        assert!(err.is_corruption());
        assert_eq!(read, 0);
        assert_eq!(reader.position(), ReaderPosition::default());
        assert_eq!(queue.len() + recycler.available(), 2);
        Ok(())
    }

    #[test]
    fn test_index_entry_past_u64_range() -> Result<()> {
        let mut index = BytesMut::new();
        IndexEntry::new(u64::MAX - 2, 1, 10).encode(&mut index);
        let index = index.freeze();
        let file = Arc::new(PartitionedFile::new(
            "d".into(),
            "i".into(),
            1,
            1,
            64,
            index.len() as u64,
            None,
        ));
        let mut reader = PartitionedFileReader::try_new(file, 0, vec![0u8; 64], index.to_vec())?;

        let mut queue = segments(1, 64);
        let err = reader
            .read_current_region(&mut queue, Arc::new(FreeingBufferRecycler), |_| {})
            .unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(queue.len(), 1);
        assert_eq!(reader.position(), ReaderPosition::default());
        Ok(())
    }

    #[test]
    fn test_readers_share_file_handles_across_threads() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let num_subpartitions = 8;
        let region = |seed: u8| -> Vec<(Buffer, usize)> {
            (0..num_subpartitions)
                .flat_map(|sub| {
                    (0..4).map(move |i| {
                        let tag = seed.wrapping_add((sub * 4 + i) as u8);
                        (payload(50 + sub * 13 + i, tag), sub)
                    })
                })
                .collect()
        };
        let file = write_file(&temp_dir, num_subpartitions, vec![region(0), region(100)])?;
        let data = File::open(file.data_file_path())?;
        let index = File::open(file.index_file_path())?;

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..num_subpartitions)
                .map(|sub| {
                    let (file, data, index) = (file.clone(), &data, &index);
                    scope.spawn(move || -> Result<Vec<Bytes>> {
                        let mut reader = PartitionedFileReader::try_new(file, sub, data, index)?;
                        let mut read = Vec::new();
                        while reader.has_remaining() {
                            let mut queue = segments(1, 256);
                            reader.read_current_region(
                                &mut queue,
                                Arc::new(FreeingBufferRecycler),
                                |b| read.push(b.to_bytes()),
                            )?;
                        }
                        Ok(read)
                    })
                })
                .collect();

            for (sub, handle) in handles.into_iter().enumerate() {
                let read = handle.join().unwrap()?;
                let expected: Vec<Bytes> = [region(0), region(100)]
                    .into_iter()
                    .flatten()
                    .filter(|(_, target)| *target == sub)
                    .map(|(buffer, _)| buffer.payload().clone())
                    .collect();
                assert_eq!(read, expected);
            }
            Ok(())
        })
    }

    #[test]
    fn test_subpartition_out_of_range() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = write_file(&temp_dir, 2, vec![])?;
        assert!(matches!(
            open_reader(&file, 2),
            Err(ShuffleFileError::IllegalState(_))
        ));
        Ok(())
    }
}
