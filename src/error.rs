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

//! Error types for partitioned shuffle files

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

/// Result type alias for partitioned file operations.
pub type Result<T> = result::Result<T, ShuffleFileError>;

/// Errors raised while writing or reading a partitioned file.
#[derive(Debug)]
pub enum ShuffleFileError {
    /// A subpartition was written again after its run in the current region
    /// was closed.
    IllegalSequencing(String),
    /// The operation is not allowed in the current state of the writer or
    /// reader (finished, failed, exhausted, or an argument out of range).
    IllegalState(String),
    /// A header or index entry is truncated or malformed.
    FormatError(String),
    /// Failure of the underlying file I/O.
    IoError(io::Error),
}

impl ShuffleFileError {
    /// Returns true if the error is a contract violation by the caller.
    ///
    /// These are never transient; the offending writer or reader must be
    /// discarded.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            ShuffleFileError::IllegalSequencing(_) | ShuffleFileError::IllegalState(_)
        )
    }

    /// Returns true if the error indicates a truncated or mismatched
    /// data/index file pair.
    pub fn is_corruption(&self) -> bool {
        matches!(self, ShuffleFileError::FormatError(_))
    }

    /// Maps a short read while decoding fixed-size records to a format error,
    /// leaving every other I/O failure untouched.
    pub(crate) fn from_read(e: io::Error, what: &str) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ShuffleFileError::FormatError(format!("Unexpected end of file reading {what}"))
        } else {
            ShuffleFileError::IoError(e)
        }
    }
}

impl From<io::Error> for ShuffleFileError {
    fn from(e: io::Error) -> Self {
        ShuffleFileError::IoError(e)
    }
}

impl Display for ShuffleFileError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ShuffleFileError::IllegalSequencing(desc) => {
                write!(f, "Illegal sequencing: {desc}")
            }
            ShuffleFileError::IllegalState(desc) => write!(f, "Illegal state: {desc}"),
            ShuffleFileError::FormatError(desc) => write!(f, "Format error: {desc}"),
            ShuffleFileError::IoError(desc) => write!(f, "IO error: {desc}"),
        }
    }
}

impl Error for ShuffleFileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShuffleFileError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_is_format_error() {
        let e = ShuffleFileError::from_read(
            io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
            "buffer header",
        );
        assert!(e.is_corruption());
        assert!(e.to_string().contains("buffer header"));

        let e = ShuffleFileError::from_read(
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
            "buffer header",
        );
        assert!(matches!(e, ShuffleFileError::IoError(_)));
        assert!(e.source().is_some());
    }

    #[test]
    fn test_classification() {
        assert!(ShuffleFileError::IllegalSequencing("x".to_owned()).is_programming_error());
        assert!(ShuffleFileError::IllegalState("x".to_owned()).is_programming_error());
        assert!(!ShuffleFileError::FormatError("x".to_owned()).is_programming_error());
        assert_eq!(
            ShuffleFileError::IllegalState("finished".to_owned()).to_string(),
            "Illegal state: finished"
        );
    }
}
