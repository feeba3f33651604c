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

//! Partition-scoped operations: DROP/ATTACH/REPLACE/MOVE PARTITION,
//! DROP PART and TRUNCATE.
//!
//! They all follow the same stop-and-drain protocol: acquire a merge
//! blocker so no new merge starts, wait until no tagged part intersects the
//! target, then commit the change through the regular part commit path.
//! Dropping goes through empty covering parts, which yields the same
//! visibility semantics as a merge commit.

use tracing::{debug, info};

use crate::block::BlockOp;
use crate::error::{
    BadArgumentsSnafu, LogicalSnafu, NoSuchDataPartSnafu, Result, TooManyPartsSnafu,
};
use crate::merge::MergeBlockerGuard;
use crate::part::info::PartInfo;
use crate::part::{PartHandle, PartState};
use crate::table::{background, MergeTreeTable};

impl MergeTreeTable {
    /// Blocks all new merges and waits until no background job owns any
    /// part of the table.
    pub(crate) async fn stop_merges_and_wait(&self) -> Result<MergeBlockerGuard> {
        let inner = self.inner();
        let guard = inner.blockers.block_all();
        inner
            .registry
            .wait_drained(None, inner.config.lock_acquire_timeout)
            .await?;
        Ok(guard)
    }

    /// Same as [MergeTreeTable::stop_merges_and_wait], but only drains jobs
    /// on parts of one partition.
    pub(crate) async fn stop_merges_and_wait_for_partition(
        &self,
        partition_id: &str,
    ) -> Result<MergeBlockerGuard> {
        debug!("Stopping merges and waiting for partition {}", partition_id);
        let inner = self.inner();
        let guard = inner.blockers.block_partition(partition_id);
        inner
            .registry
            .wait_drained(Some(partition_id), inner.config.lock_acquire_timeout)
            .await?;
        Ok(guard)
    }

    /// Replaces each given part with a zero-row covering part one level up.
    async fn commit_empty_covering_parts(&self, parts: Vec<PartHandle>) -> Result<()> {
        let inner = self.inner();
        let count = parts.len();
        for part in parts {
            let info = PartInfo {
                level: part.info().level + 1,
                ..part.info().clone()
            };
            let staged = inner.store.stage_part("empty", Vec::new()).await?;
            let meta = inner
                .store
                .commit_part(staged, info, part.meta().applied_patch_version)
                .await?;
            let handle = inner.new_part_handle(meta);
            let covered = inner.parts.commit_new_part(handle, true)?;
            if covered.len() > 1 {
                return LogicalSnafu {
                    reason: format!(
                        "empty part expected to cover not more than 1 part, covered {}",
                        covered.len()
                    ),
                }
                .fail();
            }
        }
        info!("Covered {} parts with empty parts", count);
        Ok(())
    }

    /// Drops every part of a partition; with `detach` the parts are cloned
    /// into `detached/` first.
    pub async fn drop_partition(&self, partition_id: &str, detach: bool) -> Result<()> {
        self.inner().assert_not_readonly()?;
        let _blocker = self.stop_merges_and_wait_for_partition(partition_id).await?;

        let parts = self.snapshot().in_partition(partition_id);
        if detach {
            for part in &parts {
                self.inner().store.detach_part(&part.name()).await?;
            }
        }
        let count = parts.len();
        self.commit_empty_covering_parts(parts).await?;
        info!(
            "{} partition {} with {} parts",
            if detach { "Detached" } else { "Dropped" },
            partition_id,
            count
        );

        background::run_parts_cleanup(self.inner().clone()).await;
        Ok(())
    }

    /// Drops a single part by name.
    pub async fn drop_part(&self, part_name: &str, detach: bool) -> Result<()> {
        self.inner().assert_not_readonly()?;
        let _blocker = self.stop_merges_and_wait().await?;

        let Some(part) = self.inner().parts.lookup(part_name, &[PartState::Active]) else {
            return NoSuchDataPartSnafu {
                name: part_name.to_string(),
            }
            .fail();
        };
        if detach {
            self.inner().store.detach_part(part_name).await?;
        }
        self.commit_empty_covering_parts(vec![part]).await?;
        info!(
            "{} part {} by replacing it with an empty part",
            if detach { "Detached" } else { "Dropped" },
            part_name
        );

        background::run_parts_cleanup(self.inner().clone()).await;
        Ok(())
    }

    /// Drops every part of the table and erases finished mutations.
    pub async fn truncate(&self) -> Result<()> {
        self.inner().assert_not_readonly()?;
        let _blocker = self.stop_merges_and_wait().await?;

        let parts: Vec<PartHandle> = self.snapshot().parts().cloned().collect();
        let count = parts.len();
        self.commit_empty_covering_parts(parts).await?;
        info!("Truncated table with {} parts", count);

        {
            let mut log = self.inner().mutations.lock().await;
            let min_version = self.inner().parts.snapshot().min_data_version();
            log.clear_finished(min_version, 0).await;
        }
        self.inner().mutation_wait.notify_waiters();

        background::run_parts_cleanup(self.inner().clone()).await;
        Ok(())
    }

    /// Attaches a quarantined part from `detached/` under a fresh block
    /// number, resetting its level and mutation.
    pub async fn attach_part(&self, part_name: &str) -> Result<String> {
        self.inner().assert_not_readonly()?;
        let old_info: PartInfo = part_name.parse()?;

        let (staged, _old_meta) = self.inner().store.stage_detached(part_name).await?;

        let block = self.inner().allocator.allocate(BlockOp::NewPart);
        let keep_level = self.inner().config.merge_mode != crate::config::MergeMode::Ordinary
            && old_info.level > 0;
        let info = PartInfo {
            partition_id: old_info.partition_id,
            min_block: block.number(),
            max_block: block.number(),
            level: if keep_level { 1 } else { 0 },
            mutation: 0,
        };
        let meta = self.inner().store.commit_part(staged, info, 0).await?;
        let handle = self.inner().new_part_handle(meta);
        let name = handle.name();
        self.inner().parts.commit_new_part(handle, false)?;
        drop(block);

        info!("Attached part {} as {}", part_name, name);
        self.inner().trigger_background();
        Ok(name)
    }

    /// Clones every part of `partition_id` from `source` into this table
    /// under fresh block numbers; with `replace` the partition's previous
    /// contents are dropped after the commit.
    pub async fn replace_partition_from(
        &self,
        source: &MergeTreeTable,
        partition_id: &str,
        replace: bool,
    ) -> Result<()> {
        self.inner().assert_not_readonly()?;
        PartInfo::validate_partition_id(partition_id)?;
        debug!(
            "Replace partition {} from source table, replace: {}",
            partition_id, replace
        );

        let _blocker = self.stop_merges_and_wait_for_partition(partition_id).await?;

        let src_parts = source.snapshot().in_partition(partition_id);
        if src_parts.is_empty() && !replace {
            return Ok(());
        }

        let mut staged_parts = Vec::with_capacity(src_parts.len());
        for part in &src_parts {
            let staged = self
                .inner()
                .store
                .clone_part_from(&source.inner().store, &part.name(), "replace_from")
                .await?;
            staged_parts.push(staged);
        }

        // The drop range ends below every number allocated for the clones,
        // leaving a hole so the new parts survive the removal.
        let drop_block = replace.then(|| self.inner().allocator.allocate(BlockOp::NewPart));

        let mut block_guards = Vec::with_capacity(staged_parts.len());
        for (part, staged) in src_parts.iter().zip(staged_parts) {
            let block = self.inner().allocator.allocate(BlockOp::NewPart);
            let info = PartInfo {
                partition_id: partition_id.to_string(),
                min_block: block.number(),
                max_block: block.number(),
                level: part.info().level,
                mutation: 0,
            };
            let meta = self.inner().store.commit_part(staged, info, 0).await?;
            let handle = self.inner().new_part_handle(meta);
            self.inner().parts.commit_new_part(handle, false)?;
            block_guards.push(block);
        }

        if let Some(drop_block) = &drop_block {
            let range = PartInfo::drop_range(partition_id, drop_block.number());
            let removed = self.inner().parts.remove_in_range(&range, true);
            info!(
                "Replaced partition {}: {} new parts, {} dropped",
                partition_id,
                block_guards.len(),
                removed.len()
            );
        }

        self.inner().trigger_background();
        Ok(())
    }

    /// Moves every part of a partition to `destination`. The move is not
    /// atomic across the two tables: parts appear in the destination before
    /// they disappear here.
    pub async fn move_partition_to(
        &self,
        destination: &MergeTreeTable,
        partition_id: &str,
    ) -> Result<()> {
        self.inner().assert_not_readonly()?;
        destination.inner().assert_not_readonly()?;

        if self.inner().config.storage_policy != destination.inner().config.storage_policy {
            return BadArgumentsSnafu {
                reason: format!(
                    "destination table should have the same storage policy, {} != {}",
                    self.inner().config.storage_policy,
                    destination.inner().config.storage_policy
                ),
            }
            .fail();
        }

        let _blocker = self.stop_merges_and_wait().await?;

        let src_parts = self.snapshot().in_partition(partition_id);
        if src_parts.len() > self.inner().config.max_parts_to_move {
            // Merging is blocked, so waiting here could deadlock; abort and
            // let the user retry once parts are merged.
            return TooManyPartsSnafu {
                count: src_parts.len(),
                limit: self.inner().config.max_parts_to_move,
            }
            .fail();
        }
        if src_parts.is_empty() {
            return Ok(());
        }

        let mut block_guards = Vec::with_capacity(src_parts.len());
        for part in &src_parts {
            let staged = destination
                .inner()
                .store
                .clone_part_from(&self.inner().store, &part.name(), "move_from")
                .await?;
            let block = destination.inner().allocator.allocate(BlockOp::NewPart);
            let info = PartInfo {
                partition_id: partition_id.to_string(),
                min_block: block.number(),
                max_block: block.number(),
                level: part.info().level,
                mutation: 0,
            };
            let meta = destination.inner().store.commit_part(staged, info, 0).await?;
            let handle = destination.inner().new_part_handle(meta);
            destination.inner().parts.commit_new_part(handle, false)?;
            block_guards.push(block);
        }

        for part in &src_parts {
            self.inner().parts.outdate(&part.name(), true)?;
        }
        info!(
            "Moved {} parts of partition {} to destination table",
            src_parts.len(),
            partition_id
        );

        destination.inner().trigger_background();
        background::run_parts_cleanup(self.inner().clone()).await;
        Ok(())
    }
}
