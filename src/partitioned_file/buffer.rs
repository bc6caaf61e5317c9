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

//! Buffers written to and reconstructed from a partitioned file.
//!
//! Writers take ownership of a [`Buffer`] and release it once its bytes are
//! in the data file. Readers hand out a [`CompositeBuffer`], whose payload is
//! an ordered list of slices over the caller's memory segments.

use bytes::{Bytes, BytesMut};

use super::header::{BufferHeader, DataKind};
use super::segment::SegmentSlice;

/// A unit of shuffle data destined for one subpartition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data_kind: DataKind,
    is_compressed: bool,
    payload: Bytes,
}

impl Buffer {
    /// Creates an uncompressed buffer.
    pub fn new(data_kind: DataKind, payload: Bytes) -> Self {
        Self {
            data_kind,
            is_compressed: false,
            payload,
        }
    }

    /// Marks the payload as compressed upstream.
    pub fn with_compressed(mut self, is_compressed: bool) -> Self {
        self.is_compressed = is_compressed;
        self
    }

    /// Returns the kind of data in the buffer.
    pub fn data_kind(&self) -> DataKind {
        self.data_kind
    }

    /// Returns true if the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the payload length in bytes.
    pub fn readable_bytes(&self) -> usize {
        self.payload.len()
    }
}

/// Buffer reconstructed by a reader, possibly spanning several segments.
///
/// Holding a composite buffer keeps its segments alive; dropping the last
/// buffer that references a segment sends it back to the recycler.
#[derive(Debug, Clone)]
pub struct CompositeBuffer {
    data_kind: DataKind,
    is_compressed: bool,
    slices: Vec<SegmentSlice>,
    length: usize,
}

impl CompositeBuffer {
    pub(crate) fn new(header: BufferHeader, slices: Vec<SegmentSlice>) -> Self {
        let length = slices.iter().map(|s| s.len()).sum();
        debug_assert_eq!(length, header.length as usize);
        Self {
            data_kind: header.data_kind,
            is_compressed: header.is_compressed,
            slices,
            length,
        }
    }

    /// Returns the kind of data in the buffer.
    pub fn data_kind(&self) -> DataKind {
        self.data_kind
    }

    /// Returns true if the payload is compressed.
    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Returns the combined payload length in bytes.
    pub fn readable_bytes(&self) -> usize {
        self.length
    }

    /// Returns the number of segment slices making up the payload.
    pub fn num_slices(&self) -> usize {
        self.slices.len()
    }

    /// Iterates over the payload as contiguous chunks, in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.slices.iter().map(|s| s.as_slice())
    }

    /// Copies the payload into one contiguous allocation.
    pub fn to_bytes(&self) -> Bytes {
        if let [single] = self.slices.as_slice() {
            return Bytes::copy_from_slice(single.as_slice());
        }
        let mut buf = BytesMut::with_capacity(self.length);
        for chunk in self.chunks() {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }

    /// Converts into a plain buffer, releasing the segments.
    pub fn into_buffer(self) -> Buffer {
        Buffer {
            data_kind: self.data_kind,
            is_compressed: self.is_compressed,
            payload: self.to_bytes(),
        }
    }

    /// Returns true if `other` carries the same kind, flag and payload.
    pub fn content_eq(&self, other: &Buffer) -> bool {
        if self.data_kind != other.data_kind
            || self.is_compressed != other.is_compressed
            || self.length != other.payload.len()
        {
            return false;
        }
        let mut rest = other.payload.as_ref();
        for chunk in self.chunks() {
            let (head, tail) = rest.split_at(chunk.len());
            if head != chunk {
                return false;
            }
            rest = tail;
        }
        true
    }
}

impl PartialEq<Buffer> for CompositeBuffer {
    fn eq(&self, other: &Buffer) -> bool {
        self.content_eq(other)
    }
}
