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

//! Fixed-size buffer header shared by the data file and read buffers.
//!
//! Every buffer in the data file is stored as the header followed by the
//! payload bytes:
//!
//! ```text
//! [u16: data kind][u16: compressed flag][u32: payload length][payload]
//! ```
//!
//! All values are little-endian. The compressed flag is 0 or 1.

use bytes::{Buf, BufMut};

use crate::error::{Result, ShuffleFileError};

/// Size in bytes of an encoded [`BufferHeader`].
pub const BUFFER_HEADER_SIZE: usize = 8;

/// Kind of data carried by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    /// Ordinary record payload.
    DataBuffer,
    /// Control event travelling in-band with the data.
    EventBuffer,
    /// Control event that overtakes queued data on the consumer side.
    PrioritizedEventBuffer,
    /// Checkpoint barrier that must be aligned across inputs.
    AlignedCheckpointBarrier,
}

impl DataKind {
    /// Returns the tag persisted in the header for this kind.
    pub fn tag(&self) -> u16 {
        match self {
            DataKind::DataBuffer => 0,
            DataKind::EventBuffer => 1,
            DataKind::PrioritizedEventBuffer => 2,
            DataKind::AlignedCheckpointBarrier => 3,
        }
    }

    /// Returns the kind for a persisted tag.
    pub fn from_tag(tag: u16) -> Result<Self> {
        match tag {
            0 => Ok(DataKind::DataBuffer),
            1 => Ok(DataKind::EventBuffer),
            2 => Ok(DataKind::PrioritizedEventBuffer),
            3 => Ok(DataKind::AlignedCheckpointBarrier),
            other => Err(ShuffleFileError::FormatError(format!(
                "Unknown data kind tag {other}"
            ))),
        }
    }
}

/// Header preceding every payload in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Kind of the data in the payload
    pub data_kind: DataKind,
    /// Whether the payload was compressed upstream
    pub is_compressed: bool,
    /// Payload length in bytes, not counting the header
    pub length: u32,
}

impl BufferHeader {
    /// Creates a new header.
    pub fn new(data_kind: DataKind, is_compressed: bool, length: u32) -> Self {
        Self {
            data_kind,
            is_compressed,
            length,
        }
    }

    /// Total size of the header plus payload on disk.
    pub fn stored_size(&self) -> u64 {
        BUFFER_HEADER_SIZE as u64 + self.length as u64
    }

    /// Encodes the header.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.data_kind.tag());
        buf.put_u16_le(u16::from(self.is_compressed));
        buf.put_u32_le(self.length);
    }

    /// Decodes a header, consuming [`BUFFER_HEADER_SIZE`] bytes.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < BUFFER_HEADER_SIZE {
            return Err(ShuffleFileError::FormatError(format!(
                "Buffer header needs {BUFFER_HEADER_SIZE} bytes, got {}",
                buf.remaining()
            )));
        }
        let data_kind = DataKind::from_tag(buf.get_u16_le())?;
        let is_compressed = match buf.get_u16_le() {
            0 => false,
            1 => true,
            other => {
                return Err(ShuffleFileError::FormatError(format!(
                    "Invalid compressed flag {other}"
                )));
            }
        };
        let length = buf.get_u32_le();
        Ok(Self {
            data_kind,
            is_compressed,
            length,
        })
    }
}
