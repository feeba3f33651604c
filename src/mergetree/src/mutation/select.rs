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

//! Selection of the next mutation job.

use tracing::debug;

use crate::mutation::command::{contain_barrier_command, MutationCommand};
use crate::mutation::log::{MutationLog, TxnProvider};
use crate::part::set::ActiveVersion;
use crate::part::PartHandle;
use crate::registry::ProcessingRegistry;

/// One selected mutation job: a single part brought from its data version
/// up to `last_version` by the coalesced commands.
#[derive(Debug)]
pub struct MutationSelection {
    pub part: PartHandle,
    pub first_version: i64,
    pub last_version: i64,
    pub commands: Vec<MutationCommand>,
}

/// Picks at most one part to mutate.
///
/// Consecutive entries of the same transaction coalesce into one job; the
/// coalescing stops before an entry of a different transaction, before a
/// barrier (which is applied alone) and when the cumulative command size
/// crosses `max_ast_elements`.
pub fn select_part_to_mutate(
    log: &MutationLog,
    parts: &ActiveVersion,
    registry: &ProcessingRegistry,
    txn: &dyn TxnProvider,
    max_source_part_size: u64,
    max_ast_elements: usize,
) -> Option<MutationSelection> {
    if log.is_empty() {
        return None;
    }
    if max_source_part_size == 0 {
        debug!("Not enough free background slots to apply mutations at the moment");
        return None;
    }

    for part in parts.parts() {
        if part.info().is_patch() || registry.contains(&part.name()) {
            continue;
        }

        let data_version = part.data_version();
        let mut pending = log.entries_after(data_version).peekable();
        let Some(first) = pending.peek() else {
            continue;
        };

        if part.byte_size() > max_source_part_size {
            debug!(
                "Current max source part size for mutation is {} but part size {}, will not mutate part {} yet",
                max_source_part_size,
                part.byte_size(),
                part.name()
            );
            continue;
        }

        if !log.backoff.part_can_be_mutated(&part.name()) {
            debug!(
                "According to the backoff policy, do not mutate part {} yet",
                part.name()
            );
            continue;
        }

        let first_tid = first.tid;
        if let Some(tid) = first_tid {
            // Mutate only parts visible to the transaction of the first
            // pending entry.
            if !txn.is_visible(tid, part) {
                continue;
            }
        }

        let mut commands: Vec<MutationCommand> = Vec::new();
        let mut current_ast_elements = 0usize;
        let mut first_version = 0i64;
        let mut last_version = None;
        for entry in pending {
            // Entries of different transactions commit or roll back
            // independently; never squash them.
            if entry.tid != first_tid {
                break;
            }

            let entry_size: usize = entry.commands.iter().map(|c| c.ast_size()).sum();
            if current_ast_elements + entry_size >= max_ast_elements && !commands.is_empty() {
                break;
            }

            if contain_barrier_command(&entry.commands) {
                if commands.is_empty() {
                    commands.extend(entry.commands.iter().cloned());
                    first_version = entry.block_number;
                    last_version = Some(entry.block_number);
                }
                break;
            }

            current_ast_elements += entry_size;
            if commands.is_empty() {
                first_version = entry.block_number;
            }
            commands.extend(entry.commands.iter().cloned());
            last_version = Some(entry.block_number);
        }

        if let Some(last_version) = last_version {
            return Some(MutationSelection {
                part: part.clone(),
                first_version,
                last_version,
                commands,
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::mutation::command::Predicate;
    use crate::mutation::log::NoTxn;
    use crate::part::purger::NoopPurger;
    use crate::part::set::PartSet;
    use crate::part::{PartHandle, PartMeta};

    fn part(name: &str, bytes: u64) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: name.parse().unwrap(),
                byte_size: bytes,
                row_count: 1,
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    fn update(column: &str) -> Vec<MutationCommand> {
        vec![MutationCommand::UpdateSet {
            column: column.to_string(),
            value: json!(0),
            predicate: Predicate::All,
        }]
    }

    fn drop_column(name: &str) -> Vec<MutationCommand> {
        vec![MutationCommand::DropColumn {
            name: name.to_string(),
        }]
    }

    async fn log_with(entries: Vec<(i64, Vec<MutationCommand>)>) -> (tempfile::TempDir, MutationLog) {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        for (version, commands) in entries {
            log.append(commands, None, version).await.unwrap();
        }
        (dir, log)
    }

    #[tokio::test]
    async fn test_coalesces_consecutive_data_mutations() {
        let (_dir, log) = log_with(vec![(5, update("a")), (6, update("b")), (7, update("c"))]).await;
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        let registry = ProcessingRegistry::new();

        let selection =
            select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
                .unwrap();
        assert_eq!(5, selection.first_version);
        assert_eq!(7, selection.last_version);
        assert_eq!(3, selection.commands.len());
    }

    #[tokio::test]
    async fn test_barrier_is_applied_alone() {
        let (_dir, log) = log_with(vec![
            (5, update("a")),
            (6, drop_column("a")),
            (7, update("b")),
        ])
        .await;
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        let registry = ProcessingRegistry::new();

        // First job stops before the barrier.
        let selection =
            select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
                .unwrap();
        assert_eq!(5, selection.last_version);

        // A part already at version 5 gets the barrier alone.
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0_5", 10), false).unwrap();
        let selection =
            select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
                .unwrap();
        assert_eq!(6, selection.first_version);
        assert_eq!(6, selection.last_version);
        assert_eq!(1, selection.commands.len());
    }

    #[tokio::test]
    async fn test_respects_size_budget_and_busy_parts() {
        let (_dir, log) = log_with(vec![(5, update("a")), (6, update("b"))]).await;
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        set.commit_new_part(part("p_2_2_0", 10_000), false).unwrap();
        let registry = ProcessingRegistry::new();

        // Oversized part is skipped; zero budget selects nothing.
        let selection =
            select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
                .unwrap();
        assert_eq!("p_1_1_0", selection.part.name());
        assert!(
            select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 0, 100_000).is_none()
        );

        // The AST budget cuts the coalescing after the first entry.
        let selection =
            select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 6).unwrap();
        assert_eq!(5, selection.last_version);

        // A tagged part is not selected.
        let tagged = set.snapshot().in_partition("p")[0].clone();
        let _tagger = registry.tag(&[tagged]).unwrap();
        assert!(select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
            .is_none());
    }

    #[tokio::test]
    async fn test_backoff_skips_part() {
        let (_dir, mut log) = log_with(vec![(5, update("a"))]).await;
        log.backoff.add_failure("p_1_1_0", Duration::from_secs(60));
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0", 10), false).unwrap();
        let registry = ProcessingRegistry::new();

        assert!(select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
            .is_none());
    }

    #[tokio::test]
    async fn test_parts_up_to_date_are_skipped() {
        let (_dir, log) = log_with(vec![(5, update("a"))]).await;
        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0_5", 10), false).unwrap();
        let registry = ProcessingRegistry::new();

        assert!(select_part_to_mutate(&log, &set.snapshot(), &registry, &NoTxn, 1000, 100_000)
            .is_none());
    }
}
