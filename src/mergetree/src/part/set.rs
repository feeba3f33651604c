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

//! The authoritative in-memory index of all known parts.
//!
//! The active working set is managed in a copy-on-write fashion: every
//! commit builds a new immutable [ActiveVersion] and swaps it in under the
//! write lock, so a snapshot taken by a reader is a cheap `Arc` clone and
//! stays stable for its lifetime regardless of later commits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::error::{LogicalSnafu, NoSuchDataPartSnafu, Result};
use crate::part::info::PartInfo;
use crate::part::{PartHandle, PartState};

/// Immutable view of the active working set.
#[derive(Debug, Default)]
pub struct ActiveVersion {
    /// Active parts ordered by `(partition_id, min_block, max_block, level, mutation)`.
    parts: BTreeMap<PartInfo, PartHandle>,
}

pub type ActiveVersionRef = Arc<ActiveVersion>;

impl ActiveVersion {
    pub fn parts(&self) -> impl Iterator<Item = &PartHandle> {
        self.parts.values()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn get(&self, info: &PartInfo) -> Option<&PartHandle> {
        self.parts.get(info)
    }

    /// Active parts of one partition in block order.
    pub fn in_partition(&self, partition_id: &str) -> Vec<PartHandle> {
        self.parts
            .values()
            .filter(|p| p.partition_id() == partition_id)
            .cloned()
            .collect()
    }

    /// Active patch parts carrying updates for the given base partition.
    pub fn patches_of(&self, base_partition_id: &str) -> Vec<PartHandle> {
        self.parts
            .values()
            .filter(|p| p.info().is_patch() && p.info().base_partition_id() == base_partition_id)
            .cloned()
            .collect()
    }

    /// Distinct partition ids of active parts, patch partitions included.
    pub fn partition_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .parts
            .keys()
            .map(|info| info.partition_id.clone())
            .collect();
        ids.dedup();
        ids
    }

    /// Smallest data version among active non-patch parts.
    pub fn min_data_version(&self) -> Option<i64> {
        self.parts
            .values()
            .filter(|p| !p.info().is_patch())
            .map(|p| p.data_version())
            .min()
    }

    pub fn total_rows(&self) -> u64 {
        self.parts.values().map(|p| p.row_count()).sum()
    }
}

/// Parts transitioned to Outdated by one commit.
pub type CoveredParts = Vec<PartHandle>;

#[derive(Debug)]
struct PartSetData {
    active: ActiveVersionRef,
    /// Outdated parts by name, kept until the grace window passes and no
    /// snapshot references them.
    outdated: HashMap<String, PartHandle>,
}

/// The part index of one table.
#[derive(Debug)]
pub struct PartSet {
    data: RwLock<PartSetData>,
}

impl Default for PartSet {
    fn default() -> Self {
        PartSet::new()
    }
}

impl PartSet {
    pub fn new() -> PartSet {
        PartSet {
            data: RwLock::new(PartSetData {
                active: Arc::new(ActiveVersion::default()),
                outdated: HashMap::new(),
            }),
        }
    }

    /// Rebuilds the working set from parts found on disk. Among overlapping
    /// parts the covering one wins; covered leftovers become Outdated.
    pub fn restore(&self, parts: Vec<PartHandle>) {
        let mut active = BTreeMap::new();
        let mut outdated = HashMap::new();

        for part in &parts {
            let covered = parts
                .iter()
                .any(|other| other.info() != part.info() && other.info().contains(part.info()));
            if covered {
                part.set_remove_time(unix_now());
                outdated.insert(part.name(), part.clone());
            } else {
                active.insert(part.info().clone(), part.clone());
            }
        }

        let mut data = self.data.write().unwrap();
        data.active = Arc::new(ActiveVersion { parts: active });
        data.outdated = outdated;
    }

    /// Returns a consistent, immutable view of the active parts.
    pub fn snapshot(&self) -> ActiveVersionRef {
        self.data.read().unwrap().active.clone()
    }

    /// Atomically inserts `candidate` as Active and transitions every active
    /// part strictly covered by it to Outdated.
    ///
    /// Fails with a logical error when the candidate overlaps an active part
    /// it does not cover; the working set is left unchanged in that case.
    pub fn commit_new_part(&self, candidate: PartHandle, clear_covered_now: bool) -> Result<CoveredParts> {
        let mut data = self.data.write().unwrap();

        let mut covered = Vec::new();
        for (info, part) in data.active.parts.iter() {
            if info == candidate.info() || info.is_disjoint(candidate.info()) {
                continue;
            }
            if candidate.info().contains(info) {
                covered.push(part.clone());
            } else {
                return LogicalSnafu {
                    reason: format!(
                        "part {} intersects next part {}",
                        candidate.name(),
                        part.name()
                    ),
                }
                .fail();
            }
        }

        if data.active.parts.contains_key(candidate.info()) {
            return LogicalSnafu {
                reason: format!("part {} already exists in the active set", candidate.name()),
            }
            .fail();
        }

        let mut parts = data.active.parts.clone();
        let remove_time = if clear_covered_now { 0 } else { unix_now() };
        for part in &covered {
            parts.remove(part.info());
            part.set_remove_time(remove_time);
            data.outdated.insert(part.name(), part.clone());
        }
        parts.insert(candidate.info().clone(), candidate);
        data.active = Arc::new(ActiveVersion { parts });

        Ok(covered)
    }

    /// Forcibly moves an active part out of the working set.
    pub fn outdate(&self, part_name: &str, clear_now: bool) -> Result<PartHandle> {
        let info: PartInfo = part_name.parse()?;
        let mut data = self.data.write().unwrap();

        let Some(part) = data.active.parts.get(&info).cloned() else {
            return NoSuchDataPartSnafu { name: part_name }.fail();
        };

        let mut parts = data.active.parts.clone();
        parts.remove(&info);
        part.set_remove_time(if clear_now { 0 } else { unix_now() });
        data.outdated.insert(part.name(), part.clone());
        data.active = Arc::new(ActiveVersion { parts });

        Ok(part)
    }

    /// Marks every active part whose range is within `range` as Outdated.
    pub fn remove_in_range(&self, range: &PartInfo, clear_now: bool) -> Vec<PartHandle> {
        let mut data = self.data.write().unwrap();

        let removed: Vec<PartHandle> = data
            .active
            .parts
            .values()
            .filter(|p| range.contains(p.info()))
            .cloned()
            .collect();
        if removed.is_empty() {
            return removed;
        }

        let mut parts = data.active.parts.clone();
        let remove_time = if clear_now { 0 } else { unix_now() };
        for part in &removed {
            parts.remove(part.info());
            part.set_remove_time(remove_time);
            data.outdated.insert(part.name(), part.clone());
        }
        data.active = Arc::new(ActiveVersion { parts });

        info!("Removed {} parts in range {}", removed.len(), range);
        removed
    }

    /// Looks a part up by name in the given states.
    pub fn lookup(&self, part_name: &str, states: &[PartState]) -> Option<PartHandle> {
        let info: PartInfo = part_name.parse().ok()?;
        let data = self.data.read().unwrap();
        if states.contains(&PartState::Active) {
            if let Some(part) = data.active.parts.get(&info) {
                return Some(part.clone());
            }
        }
        if states.contains(&PartState::Outdated) {
            if let Some(part) = data.outdated.get(part_name) {
                return Some(part.clone());
            }
        }
        None
    }

    /// Active parts of one partition.
    pub fn in_partition(&self, partition_id: &str) -> Vec<PartHandle> {
        self.snapshot().in_partition(partition_id)
    }

    /// Takes Outdated parts whose grace window has passed and which no
    /// snapshot references anymore, marking them for deletion from disk.
    pub fn take_removable(&self, lifetime_secs: i64) -> Vec<PartHandle> {
        let now = unix_now();
        let mut data = self.data.write().unwrap();

        let names: Vec<String> = data
            .outdated
            .iter()
            .filter(|(_, part)| {
                let expired =
                    part.remove_time() == 0 || now - part.remove_time() >= lifetime_secs;
                expired && part.is_unique()
            })
            .map(|(name, _)| name.clone())
            .collect();

        names
            .iter()
            .filter_map(|name| {
                let part = data.outdated.remove(name)?;
                part.mark_deleted();
                Some(part)
            })
            .collect()
    }

    pub fn active_len(&self) -> usize {
        self.data.read().unwrap().active.len()
    }

    pub fn outdated_len(&self) -> usize {
        self.data.read().unwrap().outdated.len()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::purger::NoopPurger;
    use crate::part::PartMeta;

    fn part(name: &str, rows: u64) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: name.parse().unwrap(),
                row_count: rows,
                byte_size: rows * 16,
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    #[test]
    fn test_commit_covers_sources() {
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        set.commit_new_part(part("p_2_2_0", 10), false).unwrap();
        set.commit_new_part(part("p_3_3_0", 10), false).unwrap();
        assert_eq!(3, set.active_len());

        let covered = set.commit_new_part(part("p_1_3_1", 30), false).unwrap();
        assert_eq!(3, covered.len());
        assert_eq!(1, set.active_len());
        assert_eq!(3, set.outdated_len());

        let snapshot = set.snapshot();
        assert_eq!(30, snapshot.total_rows());
    }

    #[test]
    fn test_commit_rejects_partial_overlap() {
        let set = PartSet::new();
        set.commit_new_part(part("p_1_3_1", 30), false).unwrap();

        let err = set.commit_new_part(part("p_3_5_1", 20), false).unwrap_err();
        assert!(err.to_string().contains("intersects"));
        // Working set unchanged.
        assert_eq!(1, set.active_len());
        assert_eq!(0, set.outdated_len());
    }

    #[test]
    fn test_snapshot_is_stable() {
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        let before = set.snapshot();

        set.commit_new_part(part("p_2_2_0", 10), false).unwrap();
        set.commit_new_part(part("p_1_2_1", 20), false).unwrap();

        assert_eq!(1, before.len());
        assert_eq!(10, before.total_rows());
        assert_eq!(20, set.snapshot().total_rows());
    }

    #[test]
    fn test_remove_in_range() {
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        set.commit_new_part(part("p_2_2_0", 10), false).unwrap();
        set.commit_new_part(part("q_1_1_0", 10), false).unwrap();

        let range = PartInfo::drop_range("p", 100);
        let removed = set.remove_in_range(&range, true);
        assert_eq!(2, removed.len());
        assert_eq!(1, set.active_len());
        assert!(set.snapshot().in_partition("p").is_empty());
    }

    #[test]
    fn test_take_removable_respects_snapshots() {
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        let snapshot = set.snapshot();

        set.outdate("p_1_1_0", true).unwrap();
        // A snapshot still references the part.
        assert!(set.take_removable(0).is_empty());

        drop(snapshot);
        let removed = set.take_removable(0);
        assert_eq!(1, removed.len());
        assert_eq!(0, set.outdated_len());
    }

    #[test]
    fn test_restore_prefers_covering_parts() {
        let set = PartSet::new();
        set.restore(vec![
            part("p_1_1_0", 10),
            part("p_2_2_0", 10),
            part("p_1_2_1", 20),
            part("p_3_3_0", 5),
            part("p_3_3_0_7", 3),
        ]);

        let snapshot = set.snapshot();
        let names: Vec<String> = snapshot.parts().map(|p| p.name()).collect();
        assert_eq!(vec!["p_1_2_1".to_string(), "p_3_3_0_7".to_string()], names);
        assert_eq!(3, set.outdated_len());
    }

    #[test]
    fn test_outdate_missing_part() {
        let set = PartSet::new();
        let err = set.outdate("p_1_1_0", false).unwrap_err();
        assert!(matches!(err, crate::error::Error::NoSuchDataPart { .. }));
    }
}
