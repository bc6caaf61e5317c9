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

//! Per-region subpartition ordering.
//!
//! Within a region every subpartition's buffers must form one contiguous
//! run in the data file, so that a single `(offset, length)` index entry can
//! describe them. The sequencer tracks the subpartition of the current run
//! and the set of subpartitions whose runs are already closed.

use crate::error::{Result, ShuffleFileError};

/// Outcome of accepting one buffer for a subpartition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    /// The buffer starts the first run of the region.
    Start,
    /// The buffer extends the current run.
    Extend,
    /// The buffer closes the previous run and starts a new one.
    Switch {
        /// Subpartition whose run was closed
        closed: usize,
    },
}

impl RunTransition {
    /// Returns true if the buffer begins a new run.
    pub fn starts_run(&self) -> bool {
        !matches!(self, RunTransition::Extend)
    }
}

/// Ordering state of the region being written.
#[derive(Debug, Clone)]
pub struct ChannelSequencer {
    active: Option<usize>,
    closed: Vec<bool>,
}

impl ChannelSequencer {
    /// Creates a sequencer for `num_subpartitions` channels.
    pub fn new(num_subpartitions: usize) -> Self {
        Self {
            active: None,
            closed: vec![false; num_subpartitions],
        }
    }

    /// Forgets all runs; called when a new region starts.
    pub fn reset(&mut self) {
        self.active = None;
        self.closed.iter_mut().for_each(|c| *c = false);
    }

    #[cfg(test)]
    fn active(&self) -> Option<usize> {
        self.active
    }

    #[cfg(test)]
    fn is_closed(&self, subpartition: usize) -> bool {
        self.closed.get(subpartition).copied().unwrap_or(false)
    }

    /// Checks whether a buffer for `subpartition` may be written next,
    /// without changing any state.
    pub fn check(&self, subpartition: usize) -> Result<RunTransition> {
        if subpartition >= self.closed.len() {
            return Err(ShuffleFileError::IllegalState(format!(
                "Subpartition {subpartition} out of range (num subpartitions: {})",
                self.closed.len()
            )));
        }
        match self.active {
            Some(active) if active == subpartition => Ok(RunTransition::Extend),
            _ if self.closed[subpartition] => Err(ShuffleFileError::IllegalSequencing(
                format!(
                    "Data of subpartition {subpartition} must be written together, \
                     but its run in the current region is already closed"
                ),
            )),
            Some(active) => Ok(RunTransition::Switch { closed: active }),
            None => Ok(RunTransition::Start),
        }
    }

    /// Accepts a buffer for `subpartition`, updating the state.
    pub fn advance(&mut self, subpartition: usize) -> Result<RunTransition> {
        let transition = self.check(subpartition)?;
        if let RunTransition::Switch { closed } = transition {
            self.closed[closed] = true;
        }
        self.active = Some(subpartition);
        Ok(transition)
    }
}
