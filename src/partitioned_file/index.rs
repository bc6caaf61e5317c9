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

//! Index entries of a partitioned file.
//!
//! The index file holds one fixed-size entry per (region, subpartition),
//! regions in write order and, within a region, subpartitions in index
//! order:
//!
//! ```text
//! [u64: data_offset][u32: num_buffers][u64: num_bytes]
//! ```
//!
//! - All values are little-endian
//! - `data_offset` = byte offset in the data file where the span starts
//! - `num_bytes` = span length including buffer headers
//! - An entry with `num_buffers == 0` marks a subpartition absent from the
//!   region and carries no data bytes

use bytes::{Buf, BufMut};

use crate::error::{Result, ShuffleFileError};

/// Size in bytes of an encoded [`IndexEntry`].
pub const INDEX_ENTRY_SIZE: usize = 20;

/// Location of one subpartition's span within one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    /// Offset of the span in the data file
    pub data_offset: u64,
    /// Number of buffers in the span
    pub num_buffers: u32,
    /// Length of the span in bytes
    pub num_bytes: u64,
}

impl IndexEntry {
    /// Creates a new index entry.
    pub fn new(data_offset: u64, num_buffers: u32, num_bytes: u64) -> Self {
        Self {
            data_offset,
            num_buffers,
            num_bytes,
        }
    }

    /// Returns true if the subpartition has no data in this region.
    pub fn is_empty(&self) -> bool {
        self.num_buffers == 0
    }

    /// Returns the byte offset of the entry for `(region, subpartition)` in
    /// an index file of `num_subpartitions` entries per region.
    pub fn offset_in_index(
        region: usize,
        subpartition: usize,
        num_subpartitions: usize,
    ) -> u64 {
        ((region * num_subpartitions + subpartition) * INDEX_ENTRY_SIZE) as u64
    }

    /// Encodes the entry.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.data_offset);
        buf.put_u32_le(self.num_buffers);
        buf.put_u64_le(self.num_bytes);
    }

    /// Decodes an entry, consuming [`INDEX_ENTRY_SIZE`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < INDEX_ENTRY_SIZE {
            return Err(ShuffleFileError::FormatError(format!(
                "Index entry needs {INDEX_ENTRY_SIZE} bytes, got {}",
                buf.remaining()
            )));
        }
        Ok(Self {
            data_offset: buf.get_u64_le(),
            num_buffers: buf.get_u32_le(),
            num_bytes: buf.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_encode_and_decode() -> Result<()> {
        let mut buf = BytesMut::new();
        let entry = IndexEntry::new(4096, 3, 1500);
        entry.encode(&mut buf);
        IndexEntry::default().encode(&mut buf);
        assert_eq!(buf.len(), 2 * INDEX_ENTRY_SIZE);

        let mut frozen = buf.freeze();
        assert_eq!(IndexEntry::decode(&mut frozen)?, entry);
        let empty = IndexEntry::decode(&mut frozen)?;
        assert!(empty.is_empty());
        assert_eq!(frozen.remaining(), 0);
        Ok(())
    }

    #[test]
    fn test_decode_short_buffer() {
        let mut buf: &[u8] = &[0u8; INDEX_ENTRY_SIZE - 1];
        assert!(IndexEntry::decode(&mut buf).unwrap_err().is_corruption());
    }

    #[test]
    fn test_offset_in_index() {
        assert_eq!(IndexEntry::offset_in_index(0, 0, 4), 0);
        assert_eq!(IndexEntry::offset_in_index(0, 3, 4), 60);
        assert_eq!(IndexEntry::offset_in_index(2, 1, 4), 180);
    }
}
