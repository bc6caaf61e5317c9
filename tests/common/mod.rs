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

use std::collections::VecDeque;
use std::fs::File;
use std::sync::Arc;

use ballista_shuffle_file::error::Result;
use ballista_shuffle_file::partitioned_file::{
    Buffer, BufferRecycler, DataKind, FreeingBufferRecycler, MemorySegment,
    PartitionedFile, PartitionedFileReader,
};
use bytes::Bytes;
use rand::Rng;
use rand::rngs::StdRng;

#[ctor::ctor]
fn init() {
    // Enable RUST_LOG logging configuration for test
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_filters("ballista_shuffle_file=debug")
        .is_test(true)
        .try_init();
}

/// Creates a data or event buffer with 1..=`max_size` random payload bytes.
pub fn create_buffer(rng: &mut StdRng, max_size: usize) -> Buffer {
    let data_kind = if rng.random_bool(0.5) {
        DataKind::DataBuffer
    } else {
        DataKind::EventBuffer
    };
    let mut data = vec![0u8; rng.random_range(1..=max_size)];
    rng.fill(&mut data[..]);
    Buffer::new(data_kind, Bytes::from(data))
}

pub fn allocate_segments(count: usize, size: usize) -> VecDeque<MemorySegment> {
    (0..count).map(|_| MemorySegment::allocate(size)).collect()
}

/// Reads every buffer of a subpartition with fresh segments for each call.
pub fn read_subpartition(
    file: &Arc<PartitionedFile>,
    subpartition: usize,
    segments_per_call: usize,
    segment_size: usize,
) -> Result<Vec<Buffer>> {
    let data_file = File::open(file.data_file_path())?;
    let index_file = File::open(file.index_file_path())?;
    let mut reader =
        PartitionedFileReader::try_new(file.clone(), subpartition, data_file, index_file)?;

    let recycler: Arc<dyn BufferRecycler> = Arc::new(FreeingBufferRecycler);
    let mut read = Vec::new();
    while reader.has_remaining() {
        reader.read_current_region(
            &mut allocate_segments(segments_per_call, segment_size),
            recycler.clone(),
            |buffer| read.push(buffer.into_buffer()),
        )?;
    }
    Ok(read)
}
