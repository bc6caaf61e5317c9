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

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// The current version of this crate, derived from the Cargo package version.
pub const BALLISTA_SHUFFLE_FILE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration of partitioned file writers.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Partitioned file format, writer and reader.
pub mod partitioned_file;
