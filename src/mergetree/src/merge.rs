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

//! Merge bookkeeping: prospective merged parts, merge blockers, the list of
//! running background jobs and disk space reservations.

pub mod picker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{LogicalSnafu, NotEnoughSpaceSnafu, Result};
use crate::part::info::PartInfo;
use crate::part::PartHandle;

/// Kind of a merge job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    Regular,
    /// Merge that drops expired rows.
    TtlDelete,
}

/// Why merge selection produced no job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectFailureReason {
    CannotSelect,
    NothingToMerge,
}

/// Typed failure of merge selection.
#[derive(Debug, Clone)]
pub struct SelectMergeFailure {
    pub reason: SelectFailureReason,
    pub explanation: String,
}

impl SelectMergeFailure {
    pub fn cannot_select(explanation: impl Into<String>) -> Self {
        SelectMergeFailure {
            reason: SelectFailureReason::CannotSelect,
            explanation: explanation.into(),
        }
    }

    pub fn nothing_to_merge(explanation: impl Into<String>) -> Self {
        SelectMergeFailure {
            reason: SelectFailureReason::NothingToMerge,
            explanation: explanation.into(),
        }
    }
}

/// The prospective result of a merge or mutation; transient, its lifetime is
/// bounded by the job.
#[derive(Debug, Clone)]
pub struct FutureMergedMutatedPart {
    pub parts: Vec<PartHandle>,
    pub part_info: PartInfo,
    pub name: String,
    pub merge_type: MergeType,
}

impl FutureMergedMutatedPart {
    /// Prospective result of merging `parts`: union of the source ranges at
    /// `max(level) + 1`, carrying the highest source mutation forward.
    pub fn for_merge(parts: Vec<PartHandle>, merge_type: MergeType) -> Result<Self> {
        if parts.is_empty() {
            return LogicalSnafu {
                reason: "merging an empty part list".to_string(),
            }
            .fail();
        }
        let partition_id = parts[0].info().partition_id.clone();
        if parts.iter().any(|p| p.info().partition_id != partition_id) {
            return LogicalSnafu {
                reason: "merging parts of different partitions".to_string(),
            }
            .fail();
        }

        let part_info = PartInfo {
            partition_id,
            min_block: parts.iter().map(|p| p.info().min_block).min().unwrap(),
            max_block: parts.iter().map(|p| p.info().max_block).max().unwrap(),
            level: parts.iter().map(|p| p.info().level).max().unwrap() + 1,
            mutation: parts.iter().map(|p| p.info().mutation).max().unwrap(),
        };
        let name = part_info.part_name();
        Ok(FutureMergedMutatedPart {
            parts,
            part_info,
            name,
            merge_type,
        })
    }

    /// Prospective result of mutating one part up to `target_version`.
    pub fn for_mutation(part: PartHandle, target_version: i64) -> Self {
        let part_info = PartInfo {
            mutation: target_version,
            ..part.info().clone()
        };
        let name = part_info.part_name();
        FutureMergedMutatedPart {
            parts: vec![part],
            part_info,
            name,
            merge_type: MergeType::Regular,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.part_info.partition_id
    }

    /// Highest data version among the sources.
    pub fn sources_data_version(&self) -> i64 {
        self.parts
            .iter()
            .map(|p| p.data_version())
            .max()
            .unwrap_or(0)
    }
}

/// Estimated disk space a job writing these sources needs.
pub fn estimate_needed_disk_space(parts: &[PartHandle]) -> u64 {
    parts.iter().map(|p| p.byte_size()).sum()
}

#[derive(Debug, Default)]
struct BlockerState {
    all: usize,
    partitions: HashMap<String, usize>,
}

/// Prevents new merges from being selected, table-wide or per partition,
/// while any blocker guard is alive.
#[derive(Debug, Clone, Default)]
pub struct MergeBlockers {
    state: Arc<Mutex<BlockerState>>,
}

impl MergeBlockers {
    pub fn new() -> MergeBlockers {
        MergeBlockers::default()
    }

    pub fn block_all(&self) -> MergeBlockerGuard {
        self.state.lock().unwrap().all += 1;
        MergeBlockerGuard {
            state: self.state.clone(),
            partition_id: None,
        }
    }

    pub fn block_partition(&self, partition_id: &str) -> MergeBlockerGuard {
        *self
            .state
            .lock()
            .unwrap()
            .partitions
            .entry(partition_id.to_string())
            .or_insert(0) += 1;
        MergeBlockerGuard {
            state: self.state.clone(),
            partition_id: Some(partition_id.to_string()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().all > 0
    }

    /// Selectors must honor cancellation by partition.
    pub fn is_cancelled_for_partition(&self, partition_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.all > 0 || state.partitions.get(partition_id).copied().unwrap_or(0) > 0
    }
}

/// Scoped merge blocker.
#[derive(Debug)]
pub struct MergeBlockerGuard {
    state: Arc<Mutex<BlockerState>>,
    partition_id: Option<String>,
}

impl Drop for MergeBlockerGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        match &self.partition_id {
            None => state.all -= 1,
            Some(pid) => {
                if let Some(count) = state.partitions.get_mut(pid) {
                    *count -= 1;
                    if *count == 0 {
                        state.partitions.remove(pid);
                    }
                }
            }
        }
    }
}

/// One running background job visible in the merge list.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub partition_id: String,
    pub result_part: String,
    /// Target mutation version of a mutation job, zero for plain merges.
    pub target_mutation: i64,
    pub cancel: CancellationToken,
    pub is_ttl: bool,
}

#[derive(Debug, Default)]
struct MergeListState {
    next_id: u64,
    entries: HashMap<u64, RunningJob>,
    /// TTL merges booked at selection time plus running ones.
    ttl_booked: usize,
}

/// Tracks running merges and mutations of one table.
#[derive(Debug, Clone, Default)]
pub struct MergeList {
    state: Arc<Mutex<MergeListState>>,
}

impl MergeList {
    pub fn new() -> MergeList {
        MergeList::default()
    }

    /// Books a TTL merge slot if the pool limit allows another one.
    pub fn try_book_ttl_merge(&self, limit: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.ttl_booked >= limit {
            return false;
        }
        state.ttl_booked += 1;
        true
    }

    /// Releases a TTL slot booked for a job that was never scheduled.
    pub fn cancel_ttl_merge(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.ttl_booked > 0);
        state.ttl_booked = state.ttl_booked.saturating_sub(1);
    }

    pub fn ttl_merges(&self) -> usize {
        self.state.lock().unwrap().ttl_booked
    }

    pub fn running(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Registers a running job. The returned handle removes the entry (and
    /// releases the TTL slot of a TTL merge) when dropped.
    pub fn register(&self, job: RunningJob) -> MergeListHandle {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let is_ttl = job.is_ttl;
        state.entries.insert(id, job);
        MergeListHandle {
            state: self.state.clone(),
            id,
            is_ttl,
        }
    }

    /// Cancels running jobs matching the filter, returning how many matched.
    pub fn cancel_matching(&self, filter: impl Fn(&RunningJob) -> bool) -> usize {
        let state = self.state.lock().unwrap();
        let mut cancelled = 0;
        for job in state.entries.values() {
            if filter(job) {
                job.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancels mutation jobs targeting `version`.
    pub fn cancel_part_mutations(&self, version: i64) -> usize {
        self.cancel_matching(|job| job.target_mutation == version)
    }
}

/// Scoped merge list registration.
#[derive(Debug)]
pub struct MergeListHandle {
    state: Arc<Mutex<MergeListState>>,
    id: u64,
    is_ttl: bool,
}

impl Drop for MergeListHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(&self.id);
        if self.is_ttl {
            state.ttl_booked = state.ttl_booked.saturating_sub(1);
        }
    }
}

/// Byte budget shared by all background jobs of one table. A `None`
/// capacity means unbounded.
#[derive(Debug)]
pub struct DiskManager {
    capacity: Option<u64>,
    reserved: Arc<AtomicU64>,
}

impl DiskManager {
    pub fn new(capacity: Option<u64>) -> DiskManager {
        DiskManager {
            capacity,
            reserved: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Currently reserved bytes, also used as the background memory proxy.
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    /// Reserves `bytes` for writing `part`, released on guard drop.
    pub fn reserve(&self, bytes: u64, part: &str) -> Result<SpaceReservation> {
        if let Some(capacity) = self.capacity {
            let reserved = self.reserved.load(Ordering::Relaxed);
            if reserved.saturating_add(bytes) > capacity {
                return NotEnoughSpaceSnafu {
                    requested: bytes,
                    part: part.to_string(),
                }
                .fail();
            }
        }
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        Ok(SpaceReservation {
            reserved: self.reserved.clone(),
            bytes,
        })
    }
}

/// Scoped disk space reservation.
#[derive(Debug)]
pub struct SpaceReservation {
    reserved: Arc<AtomicU64>,
    bytes: u64,
}

impl Drop for SpaceReservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::part::purger::NoopPurger;
    use crate::part::PartMeta;

    fn part(name: &str, bytes: u64) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: name.parse().unwrap(),
                byte_size: bytes,
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    #[test]
    fn test_future_part_for_merge() {
        let future = FutureMergedMutatedPart::for_merge(
            vec![part("p_1_1_0", 1), part("p_2_2_0_7", 1), part("p_3_4_1", 1)],
            MergeType::Regular,
        )
        .unwrap();
        assert_eq!("p_1_4_2_7", future.name);
        assert_eq!(7, future.sources_data_version());

        assert!(FutureMergedMutatedPart::for_merge(vec![], MergeType::Regular).is_err());
        assert!(FutureMergedMutatedPart::for_merge(
            vec![part("p_1_1_0", 1), part("q_2_2_0", 1)],
            MergeType::Regular
        )
        .is_err());
    }

    #[test]
    fn test_future_part_for_mutation() {
        let future = FutureMergedMutatedPart::for_mutation(part("p_1_4_2", 1), 9);
        assert_eq!("p_1_4_2_9", future.name);
        assert_eq!(9, future.part_info.mutation);
    }

    #[test]
    fn test_merge_blockers() {
        let blockers = MergeBlockers::new();
        assert!(!blockers.is_cancelled_for_partition("p"));

        {
            let _guard = blockers.block_partition("p");
            assert!(!blockers.is_cancelled());
            assert!(blockers.is_cancelled_for_partition("p"));
            assert!(!blockers.is_cancelled_for_partition("q"));
        }
        assert!(!blockers.is_cancelled_for_partition("p"));

        {
            let _guard = blockers.block_all();
            assert!(blockers.is_cancelled());
            assert!(blockers.is_cancelled_for_partition("q"));
        }
        assert!(!blockers.is_cancelled());
    }

    #[test]
    fn test_merge_list_ttl_slots() {
        let list = MergeList::new();
        assert!(list.try_book_ttl_merge(2));
        assert!(list.try_book_ttl_merge(2));
        assert!(!list.try_book_ttl_merge(2));

        // Slot booked for a task that is not scheduled must be released.
        list.cancel_ttl_merge();
        assert!(list.try_book_ttl_merge(2));

        let handle = list.register(RunningJob {
            partition_id: "p".to_string(),
            result_part: "p_1_2_1".to_string(),
            target_mutation: 0,
            cancel: CancellationToken::new(),
            is_ttl: true,
        });
        assert_eq!(1, list.running());
        assert_eq!(2, list.ttl_merges());

        drop(handle);
        assert_eq!(0, list.running());
        assert_eq!(1, list.ttl_merges());
    }

    #[test]
    fn test_merge_list_cancels_mutations() {
        let list = MergeList::new();
        let token = CancellationToken::new();
        let _handle = list.register(RunningJob {
            partition_id: "p".to_string(),
            result_part: "p_1_1_0_9".to_string(),
            target_mutation: 9,
            cancel: token.clone(),
            is_ttl: false,
        });

        assert_eq!(0, list.cancel_part_mutations(7));
        assert!(!token.is_cancelled());
        assert_eq!(1, list.cancel_part_mutations(9));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_disk_manager() {
        let disk = DiskManager::new(Some(100));
        let r1 = disk.reserve(60, "a").unwrap();
        assert_eq!(60, disk.reserved());

        let err = disk.reserve(50, "b").unwrap_err();
        assert!(matches!(err, crate::error::Error::NotEnoughSpace { .. }));

        drop(r1);
        assert_eq!(0, disk.reserved());
        let _r2 = disk.reserve(100, "b").unwrap();

        let unbounded = DiskManager::new(None);
        let _r3 = unbounded.reserve(u64::MAX, "c").unwrap();
    }
}
