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

use snafu::ensure;

use crate::{Result, error::InvalidConfigSnafu, record::HEADER_SIZE};

/// Zero-fill chunk used when initialising a fresh arena file.
pub const DEFAULT_INIT_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name:         String,
    pub capacity:     u64,
    pub backing:      Backing,
    pub policy:       ReclaimPolicy,
    pub flush_mode:   FlushMode,
    pub init_chunk:   usize,
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name:         "default".to_string(),
            capacity:     64 * 1024 * 1024,
            backing:      Backing::Memory,
            policy:       ReclaimPolicy::Wraparound,
            flush_mode:   FlushMode::Async,
            init_chunk:   DEFAULT_INIT_CHUNK,
            snapshot_dir: None,
        }
    }
}

impl QueueConfig {
    /// Checks the configuration before any arena is touched.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.name.is_empty(),
            InvalidConfigSnafu {
                reason: "queue name must not be empty",
            }
        );
        ensure!(
            u16::try_from(self.name.len()).is_ok(),
            InvalidConfigSnafu {
                reason: format!("queue name is {} bytes, limit is {}", self.name.len(), u16::MAX),
            }
        );
        ensure!(
            !self.name.contains(['/', '\\']),
            InvalidConfigSnafu {
                reason: format!("queue name {:?} must not contain path separators", self.name),
            }
        );
        ensure!(
            self.capacity > HEADER_SIZE as u64,
            InvalidConfigSnafu {
                reason: format!(
                    "capacity {} must exceed the {HEADER_SIZE}-byte record header",
                    self.capacity
                ),
            }
        );
        ensure!(
            self.init_chunk > 0,
            InvalidConfigSnafu {
                reason: "init_chunk must be non-zero",
            }
        );
        // Scan recovery cannot see records on the far side of a wrap.
        ensure!(
            !(matches!(self.backing, Backing::File(_)) && self.policy == ReclaimPolicy::Wraparound),
            InvalidConfigSnafu {
                reason: "file-backed queues recover by scanning and require the compaction policy",
            }
        );
        if let ReclaimPolicy::Compaction(threshold) = &self.policy {
            ensure!(
                (0.0..=1.0).contains(&threshold.min_fraction),
                InvalidConfigSnafu {
                    reason: format!(
                        "compaction min_fraction {} must be within [0, 1]",
                        threshold.min_fraction
                    ),
                }
            );
        }
        Ok(())
    }
}

/// Storage substrate of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    /// Volatile; persisted only through snapshots.
    Memory,
    /// Memory-mapped file; recovered by scanning its record stream.
    File(PathBuf),
}

/// How space vacated by `pop` becomes writable again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReclaimPolicy {
    /// Ring buffer: the write cursor returns to offset 0 when the tail is
    /// exhausted. No data movement.
    Wraparound,
    /// Append-only; the live region is periodically moved down to offset 0.
    Compaction(CompactionThreshold),
}

impl ReclaimPolicy {
    /// Compaction with the default threshold.
    pub fn compaction() -> Self { Self::Compaction(CompactionThreshold::default()) }

    pub(crate) const fn tag(&self) -> u8 {
        match self {
            Self::Wraparound => 0,
            Self::Compaction(_) => 1,
        }
    }

    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Wraparound => "wraparound",
            Self::Compaction(_) => "compaction",
        }
    }
}

/// Reclamation heuristic for the compaction policy.
///
/// Compaction runs after a pop once the space below the read cursor reaches
/// `min_bytes` or `min_fraction` of the capacity, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionThreshold {
    pub min_bytes:    u64,
    pub min_fraction: f64,
}

impl Default for CompactionThreshold {
    fn default() -> Self {
        Self {
            min_bytes:    64 * 1024,
            min_fraction: 0.5,
        }
    }
}

impl CompactionThreshold {
    #[allow(clippy::cast_precision_loss)]
    pub fn should_compact(&self, wasted: u64, capacity: u64) -> bool {
        wasted > 0
            && (wasted >= self.min_bytes || wasted as f64 >= self.min_fraction * capacity as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Leave write-back to the OS.
    Async,
    /// Sync the arena after every mutation.
    Sync,
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(QueueConfig::default().validate().is_ok());
    }

    fn empty_name(config: &mut QueueConfig) { config.name.clear(); }

    fn separator_in_name(config: &mut QueueConfig) { config.name = "a/b".to_string(); }

    fn tiny_capacity(config: &mut QueueConfig) { config.capacity = HEADER_SIZE as u64; }

    fn zero_chunk(config: &mut QueueConfig) { config.init_chunk = 0; }

    fn file_with_wraparound(config: &mut QueueConfig) {
        config.backing = Backing::File(PathBuf::from("/tmp/q.arena"));
        config.policy = ReclaimPolicy::Wraparound;
    }

    fn bad_fraction(config: &mut QueueConfig) {
        config.policy = ReclaimPolicy::Compaction(CompactionThreshold {
            min_bytes:    0,
            min_fraction: 1.5,
        });
    }

    #[test_case(empty_name ; "empty name")]
    #[test_case(separator_in_name ; "separator in name")]
    #[test_case(tiny_capacity ; "capacity not above header")]
    #[test_case(zero_chunk ; "zero init chunk")]
    #[test_case(file_with_wraparound ; "file arena with wraparound")]
    #[test_case(bad_fraction ; "fraction out of range")]
    fn test_invalid_config(mutate: fn(&mut QueueConfig)) {
        let mut config = QueueConfig::default();
        mutate(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_with_compaction_is_valid() {
        let config = QueueConfig {
            backing: Backing::File(PathBuf::from("/tmp/q.arena")),
            policy: ReclaimPolicy::compaction(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compaction_threshold() {
        let threshold = CompactionThreshold {
            min_bytes:    100,
            min_fraction: 0.5,
        };

        assert!(!threshold.should_compact(0, 1000));
        assert!(!threshold.should_compact(99, 1000));
        assert!(threshold.should_compact(100, 1000));
        // Fraction kicks in before the byte floor on small arenas
        assert!(threshold.should_compact(60, 100));
        assert!(!threshold.should_compact(40, 100));
    }

    #[test]
    fn test_eager_threshold_compacts_on_any_waste() {
        let threshold = CompactionThreshold {
            min_bytes:    0,
            min_fraction: 0.0,
        };
        assert!(threshold.should_compact(1, 1000));
        assert!(!threshold.should_compact(0, 1000));
    }
}
