// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use crate::{Backing, FlushMode, Queue, QueueConfig, ReclaimPolicy, Result};

pub struct QueueBuilder {
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            config: QueueConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn from_config(config: QueueConfig) -> Self { Self { config } }

    pub fn capacity(mut self, bytes: u64) -> Self {
        self.config.capacity = bytes;
        self
    }

    /// Keep the arena in memory; persistence goes through snapshots.
    pub fn memory(mut self) -> Self {
        self.config.backing = Backing::Memory;
        self
    }

    /// Map the arena onto the file at `path`.
    pub fn file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.backing = Backing::File(path.into());
        self
    }

    pub fn policy(mut self, policy: ReclaimPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    pub fn init_chunk(mut self, bytes: usize) -> Self {
        self.config.init_chunk = bytes;
        self
    }

    /// Directory a memory queue is restored from on open.
    pub fn snapshot_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.snapshot_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Queue> { Queue::open(self.config) }
}
