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

//! Caller-supplied memory segments and their recycling.
//!
//! Readers fill fixed-size [`MemorySegment`]s taken from the caller. Once
//! filled, a segment is sealed into a reference-counted shared segment that
//! the reconstructed buffers slice into. When the last buffer referencing it
//! is dropped, the segment is handed to the [`BufferRecycler`] supplied with
//! the read call.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

/// Fixed-size unit of memory supplied by the caller for reads.
pub struct MemorySegment {
    data: Box<[u8]>,
}

impl MemorySegment {
    /// Allocates a zeroed segment of `size` bytes.
    pub fn allocate(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
        }
    }

    /// Wraps existing memory as a segment.
    pub fn wrap(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    /// Returns the capacity of the segment in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the segment contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the segment contents for writing.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("size", &self.size())
            .finish()
    }
}

/// Receives segments whose bytes have been fully delivered and released.
pub trait BufferRecycler: Send + Sync {
    /// Takes back a segment that is no longer referenced by any buffer.
    fn recycle(&self, segment: MemorySegment);
}

/// Recycler that simply frees the memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct FreeingBufferRecycler;

impl BufferRecycler for FreeingBufferRecycler {
    fn recycle(&self, _segment: MemorySegment) {}
}

/// Recycler that returns segments to a shared queue the caller draws from
/// for its next read.
#[derive(Debug, Default, Clone)]
pub struct QueueRecycler {
    queue: Arc<Mutex<VecDeque<MemorySegment>>>,
}

impl QueueRecycler {
    /// Creates a recycler pre-filled with `count` segments of `size` bytes.
    pub fn with_segments(count: usize, size: usize) -> Self {
        let queue = (0..count).map(|_| MemorySegment::allocate(size)).collect();
        Self {
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    /// Takes up to `max` segments out of the queue.
    pub fn take(&self, max: usize) -> VecDeque<MemorySegment> {
        let mut queue = self.queue.lock();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Puts unused segments back.
    pub fn give_back(&self, segments: impl IntoIterator<Item = MemorySegment>) {
        self.queue.lock().extend(segments);
    }

    /// Number of segments currently available.
    pub fn available(&self) -> usize {
        self.queue.lock().len()
    }
}

impl BufferRecycler for QueueRecycler {
    fn recycle(&self, segment: MemorySegment) {
        self.queue.lock().push_back(segment);
    }
}

/// A filled segment shared by the buffers sliced out of it.
pub(crate) struct SharedSegment {
    segment: Option<MemorySegment>,
    recycler: Arc<dyn BufferRecycler>,
}

impl SharedSegment {
    pub(crate) fn seal(
        segment: MemorySegment,
        recycler: Arc<dyn BufferRecycler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            segment: Some(segment),
            recycler,
        })
    }

    fn bytes(&self) -> &[u8] {
        self.segment.as_ref().map(|s| s.as_slice()).unwrap_or(&[])
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.recycler.recycle(segment);
        }
    }
}

/// Read-only view of a byte range within a shared segment.
#[derive(Clone)]
pub struct SegmentSlice {
    segment: Arc<SharedSegment>,
    range: Range<usize>,
}

impl SegmentSlice {
    pub(crate) fn new(segment: Arc<SharedSegment>, range: Range<usize>) -> Self {
        Self { segment, range }
    }

    /// Returns the bytes of the slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.segment.bytes()[self.range.clone()]
    }

    /// Returns the length of the slice in bytes.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Returns true if the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl fmt::Debug for SegmentSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentSlice")
            .field("range", &self.range)
            .finish()
    }
}
