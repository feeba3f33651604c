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

//! Pluggable merge selection policies.
//!
//! Pickers are pure: they propose source parts from a snapshot and never
//! mutate engine state. The caller splits each partition into contiguous
//! runs of eligible parts (parts tagged by a background job break a run)
//! before invoking a picker.

use std::fmt::Debug;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::merge::MergeType;
use crate::part::PartHandle;

/// Per-tick limits applied to any picker.
#[derive(Debug, Clone)]
pub struct SelectionConstraints {
    /// Total size budget for the source parts; zero means no merges now.
    pub max_source_parts_size: u64,
    /// Max number of source parts in one job.
    pub max_parts: usize,
    /// Min size advantage ratio of a window over its largest part.
    pub min_size_ratio: f64,
    /// Whether a TTL merge slot is available.
    pub ttl_allowed: bool,
    /// Unix seconds used to evaluate row expiration.
    pub now: i64,
}

/// Source parts proposed by a picker.
#[derive(Debug, Clone)]
pub struct MergeProposal {
    pub parts: Vec<PartHandle>,
    pub merge_type: MergeType,
}

/// A merge selection strategy.
pub trait MergePicker: Send + Sync + Debug {
    /// Proposes one merge out of contiguous runs of eligible parts of a
    /// single partition.
    fn pick(&self, runs: &[Vec<PartHandle>], constraints: &SelectionConstraints)
        -> Option<MergeProposal>;
}

pub type MergePickerRef = Arc<dyn MergePicker>;

/// Size-based picker.
///
/// Prefers the window with the most parts, breaking ties towards smaller
/// total size, then lower level, then older blocks. When a TTL slot is
/// available, parts with expired rows take precedence and may be rewritten
/// alone.
#[derive(Debug, Default)]
pub struct SimplePicker {}

impl SimplePicker {
    fn pick_ttl(
        &self,
        runs: &[Vec<PartHandle>],
        constraints: &SelectionConstraints,
    ) -> Option<MergeProposal> {
        for run in runs {
            let expired: Vec<PartHandle> = run
                .iter()
                .filter(|p| p.meta().has_expired_rows(constraints.now))
                .take(constraints.max_parts)
                .cloned()
                .collect();
            if !expired.is_empty() {
                return Some(MergeProposal {
                    parts: expired,
                    merge_type: MergeType::TtlDelete,
                });
            }
        }
        None
    }

    fn pick_regular(
        &self,
        runs: &[Vec<PartHandle>],
        constraints: &SelectionConstraints,
    ) -> Option<MergeProposal> {
        // (parts, total size, max level, min block) of the best window.
        let mut best: Option<(SmallVec<[PartHandle; 8]>, u64, u32, i64)> = None;

        for run in runs {
            for start in 0..run.len() {
                let mut size = 0u64;
                for end in start..run.len() {
                    let count = end - start + 1;
                    if count > constraints.max_parts {
                        break;
                    }
                    size += run[end].byte_size();
                    if size > constraints.max_source_parts_size {
                        break;
                    }
                    if count < 2 {
                        continue;
                    }

                    let window = &run[start..=end];
                    let largest = window.iter().map(|p| p.byte_size()).max().unwrap_or(0);
                    if largest > 0 {
                        let advantage = (size - largest) as f64 / largest as f64;
                        if advantage < constraints.min_size_ratio {
                            continue;
                        }
                    }

                    let level = window.iter().map(|p| p.info().level).max().unwrap_or(0);
                    let min_block = window[0].info().min_block;
                    let better = match &best {
                        None => true,
                        Some((parts, best_size, best_level, best_min)) => {
                            (count, std::cmp::Reverse(size), std::cmp::Reverse(level), std::cmp::Reverse(min_block))
                                > (
                                    parts.len(),
                                    std::cmp::Reverse(*best_size),
                                    std::cmp::Reverse(*best_level),
                                    std::cmp::Reverse(*best_min),
                                )
                        }
                    };
                    if better {
                        best = Some((window.iter().cloned().collect::<SmallVec<_>>(), size, level, min_block));
                    }
                }
            }
        }

        best.map(|(parts, _, _, _)| MergeProposal {
            parts: parts.into_vec(),
            merge_type: MergeType::Regular,
        })
    }
}

impl MergePicker for SimplePicker {
    fn pick(
        &self,
        runs: &[Vec<PartHandle>],
        constraints: &SelectionConstraints,
    ) -> Option<MergeProposal> {
        if constraints.max_source_parts_size == 0 {
            return None;
        }
        if constraints.ttl_allowed {
            if let Some(proposal) = self.pick_ttl(runs, constraints) {
                return Some(proposal);
            }
        }
        self.pick_regular(runs, constraints)
    }
}

/// Proposal covering every given part, used by `OPTIMIZE ... FINAL`.
pub fn propose_entire_partition(parts: &[PartHandle]) -> Option<MergeProposal> {
    if parts.is_empty() {
        return None;
    }
    Some(MergeProposal {
        parts: parts.to_vec(),
        merge_type: MergeType::Regular,
    })
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
                row_count: bytes,
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    fn expired_part(name: &str, bytes: u64, expire_at: i64) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: name.parse().unwrap(),
                byte_size: bytes,
                row_count: bytes,
                min_expire_at: Some(expire_at),
                max_expire_at: Some(expire_at),
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    fn constraints(max_size: u64) -> SelectionConstraints {
        SelectionConstraints {
            max_source_parts_size: max_size,
            max_parts: 100,
            min_size_ratio: 0.0,
            ttl_allowed: false,
            now: 1_000,
        }
    }

    #[test]
    fn test_picks_widest_window() {
        let picker = SimplePicker::default();
        let runs = vec![vec![
            part("p_1_1_0", 10),
            part("p_2_2_0", 10),
            part("p_3_3_0", 10),
        ]];

        let proposal = picker.pick(&runs, &constraints(100)).unwrap();
        assert_eq!(3, proposal.parts.len());
        assert_eq!(MergeType::Regular, proposal.merge_type);
    }

    #[test]
    fn test_respects_size_budget() {
        let picker = SimplePicker::default();
        let runs = vec![vec![
            part("p_1_1_0", 10),
            part("p_2_2_0", 10),
            part("p_3_3_0", 1000),
        ]];

        let proposal = picker.pick(&runs, &constraints(50)).unwrap();
        let names: Vec<String> = proposal.parts.iter().map(|p| p.name()).collect();
        assert_eq!(vec!["p_1_1_0".to_string(), "p_2_2_0".to_string()], names);

        // Zero budget means no merges now.
        assert!(picker.pick(&runs, &constraints(0)).is_none());
    }

    #[test]
    fn test_runs_are_not_bridged() {
        let picker = SimplePicker::default();
        // Two runs, the gap between them being a busy part.
        let runs = vec![
            vec![part("p_1_1_0", 10), part("p_2_2_0", 10)],
            vec![part("p_4_4_0", 10), part("p_5_5_0", 10), part("p_6_6_0", 10)],
        ];

        let proposal = picker.pick(&runs, &constraints(100)).unwrap();
        assert_eq!(3, proposal.parts.len());
        assert_eq!("p_4_4_0", proposal.parts[0].name());
    }

    #[test]
    fn test_single_part_is_not_merged() {
        let picker = SimplePicker::default();
        let runs = vec![vec![part("p_1_1_0", 10)]];
        assert!(picker.pick(&runs, &constraints(100)).is_none());
    }

    #[test]
    fn test_ttl_merge_takes_precedence() {
        let picker = SimplePicker::default();
        let runs = vec![vec![
            part("p_1_1_0", 10),
            expired_part("p_2_2_0", 10, 500),
        ]];

        let mut c = constraints(100);
        c.ttl_allowed = true;
        let proposal = picker.pick(&runs, &c).unwrap();
        assert_eq!(MergeType::TtlDelete, proposal.merge_type);
        assert_eq!(vec!["p_2_2_0".to_string()], proposal
            .parts
            .iter()
            .map(|p| p.name())
            .collect::<Vec<_>>());

        // Without a TTL slot the regular policy applies.
        c.ttl_allowed = false;
        let proposal = picker.pick(&runs, &c).unwrap();
        assert_eq!(MergeType::Regular, proposal.merge_type);
    }

    #[test]
    fn test_min_size_ratio_filters_lopsided_windows() {
        let picker = SimplePicker::default();
        let runs = vec![vec![part("p_1_1_0", 1000), part("p_2_2_0", 1)]];

        let mut c = constraints(10_000);
        c.min_size_ratio = 0.1;
        assert!(picker.pick(&runs, &c).is_none());

        c.min_size_ratio = 0.0;
        assert!(picker.pick(&runs, &c).is_some());
    }

    #[test]
    fn test_propose_entire_partition() {
        assert!(propose_entire_partition(&[]).is_none());
        let proposal =
            propose_entire_partition(&[part("p_1_1_0", 1), part("p_2_2_0", 1)]).unwrap();
        assert_eq!(2, proposal.parts.len());
    }
}
