// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configurations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default max running background job.
const DEFAULT_MAX_BG_JOB: usize = 4;

/// Default capacity of the background job queue.
const DEFAULT_JOB_QUEUE_SIZE: usize = 256;

/// Modes that control how a merge combines rows with equal sort keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Keep every row.
    #[default]
    Ordinary,
    /// Keep the last row per sort key; `OPTIMIZE ... CLEANUP` is only
    /// allowed in this mode.
    Replacing,
}

/// Configuration for [MergeTreeTable](crate::table::MergeTreeTable).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MergeTreeConfig {
    // Background job configs:
    /// Max number of running background jobs (default 4).
    pub max_background_jobs: usize,
    /// Capacity of the background job queue (default 256).
    pub job_queue_size: usize,
    /// Free job slots required before merges may use the full
    /// `max_source_parts_size_for_merge` budget.
    pub free_entries_to_lower_max_size: usize,
    /// Soft limit for memory reserved by background jobs.
    /// Zero disables the check.
    pub background_memory_soft_limit: u64,

    // Merge configs:
    /// Total size budget for the source parts of one merge.
    pub max_source_parts_size_for_merge: u64,
    /// Size budget for the single source part of one mutation.
    pub max_source_part_size_for_mutation: u64,
    /// Max number of parts combined by one merge job.
    pub merge_max_parts_per_job: usize,
    /// Min size advantage ratio required before merging a run of parts.
    pub merge_min_size_ratio: f64,
    /// Max concurrent TTL merges.
    pub max_number_of_merges_with_ttl_in_pool: usize,
    /// How rows with equal sort keys are combined.
    pub merge_mode: MergeMode,

    // Mutation configs:
    /// Cumulative command size budget when coalescing mutations into one job.
    pub max_expanded_ast_elements: usize,
    /// Upper bound for the per-part exponential backoff after a failed
    /// mutation.
    #[serde(with = "humantime_serde")]
    pub max_postpone_time_for_failed_mutations: Duration,
    /// Number of finished mutation entries kept on disk.
    pub finished_mutations_to_keep: usize,

    // Cleanup configs:
    /// Grace window before an outdated part is removed from disk.
    #[serde(with = "humantime_serde")]
    pub old_parts_lifetime: Duration,
    /// Lifetime of orphaned `tmp_*` directories.
    #[serde(with = "humantime_serde")]
    pub temporary_directories_lifetime: Duration,
    /// Interval between old-part cleanups.
    #[serde(with = "humantime_serde")]
    pub clear_old_parts_interval: Duration,
    /// Interval between temp-dir cleanups.
    #[serde(with = "humantime_serde")]
    pub clear_old_temp_dirs_interval: Duration,

    // Lock configs:
    /// Timeout for user-facing lock acquisition (drains, updates, kills).
    #[serde(with = "humantime_serde")]
    pub lock_acquire_timeout: Duration,
    /// Timeout for lock acquisition inside background operations.
    #[serde(with = "humantime_serde")]
    pub lock_acquire_timeout_for_background_operations: Duration,

    // Partition op configs:
    /// Max number of parts moved by one MOVE PARTITION.
    pub max_parts_to_move: usize,
    /// Storage policy name; MOVE PARTITION requires matching policies.
    pub storage_policy: String,

    // Insert configs:
    /// Max active parts in one partition before inserts are rejected.
    pub parts_to_throw_insert: usize,

    /// Tick interval of the background driver.
    #[serde(with = "humantime_serde")]
    pub background_tick_interval: Duration,
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        MergeTreeConfig {
            max_background_jobs: DEFAULT_MAX_BG_JOB.min(divide_num_cpus(2)).max(2),
            job_queue_size: DEFAULT_JOB_QUEUE_SIZE,
            free_entries_to_lower_max_size: 8,
            background_memory_soft_limit: 0,
            max_source_parts_size_for_merge: 150 * 1024 * 1024 * 1024,
            max_source_part_size_for_mutation: 100 * 1024 * 1024 * 1024,
            merge_max_parts_per_job: 100,
            merge_min_size_ratio: 0.0,
            max_number_of_merges_with_ttl_in_pool: 2,
            merge_mode: MergeMode::Ordinary,
            max_expanded_ast_elements: 500_000,
            max_postpone_time_for_failed_mutations: Duration::from_secs(300),
            finished_mutations_to_keep: 100,
            old_parts_lifetime: Duration::from_secs(8 * 60),
            temporary_directories_lifetime: Duration::from_secs(86400),
            clear_old_parts_interval: Duration::from_secs(1),
            clear_old_temp_dirs_interval: Duration::from_secs(60),
            lock_acquire_timeout: Duration::from_secs(120),
            lock_acquire_timeout_for_background_operations: Duration::from_secs(120),
            max_parts_to_move: 1000,
            storage_policy: "default".to_string(),
            parts_to_throw_insert: 3000,
            background_tick_interval: Duration::from_millis(100),
        }
    }
}

impl MergeTreeConfig {
    /// Sanitize incorrect configurations.
    pub fn sanitize(&mut self) {
        if self.max_background_jobs == 0 {
            warn!("Sanitize max background jobs 0 to {}", DEFAULT_MAX_BG_JOB);
            self.max_background_jobs = DEFAULT_MAX_BG_JOB;
        }

        if self.job_queue_size == 0 {
            warn!("Sanitize job queue size 0 to 1");
            self.job_queue_size = 1;
        }

        if self.merge_max_parts_per_job < 2 {
            warn!(
                "Sanitize merge_max_parts_per_job {} to 2",
                self.merge_max_parts_per_job
            );
            self.merge_max_parts_per_job = 2;
        }

        if self.background_tick_interval.is_zero() {
            self.background_tick_interval = Duration::from_millis(100);
        }
    }
}

/// Divide cpu num by a non-zero `divisor` and returns at least 1.
fn divide_num_cpus(divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    let cores = num_cpus::get();
    debug_assert!(cores > 0);

    (cores + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        let mut config = MergeTreeConfig {
            max_background_jobs: 0,
            job_queue_size: 0,
            merge_max_parts_per_job: 1,
            ..Default::default()
        };
        config.sanitize();
        assert_eq!(DEFAULT_MAX_BG_JOB, config.max_background_jobs);
        assert_eq!(1, config.job_queue_size);
        assert_eq!(2, config.merge_max_parts_per_job);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = MergeTreeConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let parsed: MergeTreeConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, parsed);
    }
}
