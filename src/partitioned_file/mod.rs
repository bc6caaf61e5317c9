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

//! Region-partitioned shuffle file.
//!
//! A task writes the buffers of all its output subpartitions into a single
//! data file, grouped into successive regions, plus an index file with one
//! fixed-size entry per (region, subpartition). A consumer reads back only
//! its own subpartition by looking up its span in each region.
//!
//! ```text
//! data  : [region 0: span(sp a) span(sp b) ...][region 1: ...] ...
//!         span = [header][payload][header][payload] ...
//! index : [region 0: entry(sp 0) ... entry(sp n-1)][region 1: ...] ...
//! ```
//!
//! Broadcast regions store their data once and point the entries of every
//! subpartition at the same span.

mod buffer;
mod file;
mod header;
mod index;
mod read_at;
mod reader;
mod segment;
mod sequencer;
mod writer;

pub use buffer::{Buffer, CompositeBuffer};
pub use file::{PartitionedFile, data_file_path, index_file_path};
pub use header::{BUFFER_HEADER_SIZE, BufferHeader, DataKind};
pub use index::{INDEX_ENTRY_SIZE, IndexEntry};
pub use read_at::ReadAt;
pub use reader::{PartitionedFileReader, ReaderPosition};
pub use segment::{
    BufferRecycler, FreeingBufferRecycler, MemorySegment, QueueRecycler, SegmentSlice,
};
pub use sequencer::{ChannelSequencer, RunTransition};
pub use writer::PartitionedFileWriter;
