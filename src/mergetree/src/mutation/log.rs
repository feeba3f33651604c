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

//! The persistent, versioned log of mutation entries of one table.
//!
//! The log itself is plain data; the table guards it with its background
//! mutex, the same lock that covers selection and the processing registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{LogicalSnafu, Result};
use crate::mutation::command::MutationCommand;
use crate::mutation::entry::{
    is_tmp_mutation_file, try_parse_file_name, LatestFail, MutationBackupEntry, MutationEntry,
};
use crate::part::set::ActiveVersion;
use crate::part::PartHandle;

/// Visibility seam towards the optional transaction log.
///
/// The default provider treats every entry as committed and every part as
/// visible, which is the non-transactional path.
pub trait TxnProvider: Send + Sync + fmt::Debug {
    /// Whether the transaction that wrote `tid` was rolled back.
    fn is_aborted(&self, tid: u64) -> bool;

    /// Whether `part` is visible to the transaction `tid`.
    fn is_visible(&self, tid: u64, part: &PartHandle) -> bool;

    /// Transaction currently holding a removal lock on `part`, if any.
    fn locked_by(&self, part: &PartHandle) -> Option<u64>;
}

#[derive(Debug, Default)]
pub struct NoTxn;

impl TxnProvider for NoTxn {
    fn is_aborted(&self, _tid: u64) -> bool {
        false
    }

    fn is_visible(&self, _tid: u64, _part: &PartHandle) -> bool {
        true
    }

    fn locked_by(&self, _part: &PartHandle) -> Option<u64> {
        None
    }
}

/// Externally visible progress of one mutation entry.
#[derive(Debug, Clone)]
pub struct MutationStatus {
    pub file_name: String,
    pub version: i64,
    pub create_time: DateTime<Utc>,
    pub command_lines: Vec<String>,
    /// Names of active parts still below this version.
    pub parts_to_do: Vec<String>,
    pub is_done: bool,
    pub latest_fail: Option<LatestFail>,
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Exponential backoff per part name after failed mutation attempts.
#[derive(Debug, Default)]
pub struct MutationBackoffPolicy {
    failures: HashMap<String, PartFailure>,
}

#[derive(Debug)]
struct PartFailure {
    count: u32,
    retry_at: Instant,
}

impl MutationBackoffPolicy {
    pub fn add_failure(&mut self, part_name: &str, max_postpone: Duration) {
        let entry = self
            .failures
            .entry(part_name.to_string())
            .or_insert(PartFailure {
                count: 0,
                retry_at: Instant::now(),
            });
        entry.count += 1;
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << (entry.count - 1).min(16))
            .min(max_postpone);
        entry.retry_at = Instant::now() + delay;
    }

    pub fn part_can_be_mutated(&self, part_name: &str) -> bool {
        self.failures
            .get(part_name)
            .map(|f| Instant::now() >= f.retry_at)
            .unwrap_or(true)
    }

    pub fn remove_part(&mut self, part_name: &str) {
        self.failures.remove(part_name);
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}

/// In-memory view over the `mutation_<version>.txt` files of one table.
#[derive(Debug)]
pub struct MutationLog {
    dir: PathBuf,
    entries: BTreeMap<i64, MutationEntry>,
    pub backoff: MutationBackoffPolicy,
}

impl MutationLog {
    /// Scans `dir` for mutation entries, dropping temporary files and
    /// entries of aborted transactions.
    pub async fn load(dir: &Path, txn: &dyn TxnProvider) -> Result<MutationLog> {
        let mut log = MutationLog {
            dir: dir.to_path_buf(),
            entries: BTreeMap::new(),
            backoff: MutationBackoffPolicy::default(),
        };

        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                warn!("Cannot scan mutation log dir {}: {}", dir.display(), e);
                return Ok(log);
            }
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_tmp_mutation_file(&name) {
                let _ = tokio::fs::remove_file(entry.path()).await;
                continue;
            }
            let Some(version) = try_parse_file_name(&name) else {
                continue;
            };
            let loaded = MutationEntry::load(&entry.path()).await?;
            debug!(
                "Loading mutation: {} entry, commands size: {}",
                name,
                loaded.commands.len()
            );

            if let Some(tid) = loaded.tid {
                if loaded.csn.is_none() && txn.is_aborted(tid) {
                    info!(
                        "Mutation entry {} was created by transaction {} that did not commit, removing it",
                        name, tid
                    );
                    let _ = tokio::fs::remove_file(entry.path()).await;
                    continue;
                }
            }

            if log.entries.insert(version, loaded).is_some() {
                return LogicalSnafu {
                    reason: format!("mutation {version} already exists"),
                }
                .fail();
            }
        }

        Ok(log)
    }

    /// Persists and registers a new entry under an allocated version.
    pub async fn append(
        &mut self,
        commands: Vec<MutationCommand>,
        tid: Option<u64>,
        version: i64,
    ) -> Result<String> {
        if self.entries.contains_key(&version) {
            return LogicalSnafu {
                reason: format!("mutation {version} already exists"),
            }
            .fail();
        }
        let entry = MutationEntry::new(commands, tid, version);
        entry.commit_file(&self.dir).await?;
        let file_name = entry.file_name();
        self.entries.insert(version, entry);
        Ok(file_name)
    }

    /// Removes an entry and its file. Returns the removed entry, or `None`
    /// when the version is unknown.
    pub async fn kill(&mut self, version: i64) -> Option<MutationEntry> {
        let entry = self.entries.remove(&version)?;
        if let Err(e) = entry.remove_file(&self.dir).await {
            warn!("Cannot remove file of killed mutation {}: {}", version, e);
        }
        self.backoff.reset();
        Some(entry)
    }

    pub fn get(&self, version: i64) -> Option<&MutationEntry> {
        self.entries.get(&version)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn max_version(&self) -> Option<i64> {
        self.entries.keys().next_back().copied()
    }

    /// Entries with version strictly greater than `data_version`, ascending.
    pub fn entries_after(&self, data_version: i64) -> impl Iterator<Item = &MutationEntry> {
        self.entries
            .range(data_version + 1..)
            .map(|(_, entry)| entry)
    }

    /// The latest version at or below `data_version`, zero if none.
    pub fn current_version_for(&self, data_version: i64) -> i64 {
        self.entries
            .range(..=data_version)
            .next_back()
            .map(|(v, _)| *v)
            .unwrap_or(0)
    }

    /// Records the latest failure on every entry a failed job was applying,
    /// i.e. versions in `(sources_data_version, result_data_version]`.
    pub async fn mark_failure(
        &mut self,
        sources_data_version: i64,
        result_data_version: i64,
        failed_part: &str,
        reason: &str,
        error_code: &str,
        max_postpone: Duration,
    ) {
        if sources_data_version == result_data_version {
            return;
        }
        let now = Utc::now().timestamp();
        for (version, entry) in self
            .entries
            .range_mut(sources_data_version + 1..=result_data_version)
        {
            entry.latest_fail = Some(LatestFail {
                part: failed_part.to_string(),
                reason: reason.to_string(),
                error_code: error_code.to_string(),
                time: now,
            });
            if *version == result_data_version {
                self.backoff.add_failure(failed_part, max_postpone);
            }
            if let Err(e) = entry.rewrite_file(&self.dir).await {
                warn!(
                    "Cannot persist failure record of mutation {}: {}",
                    version, e
                );
            }
        }
    }

    /// Clears failure records of entries a successful job has applied.
    pub async fn clear_failure(
        &mut self,
        sources_data_version: i64,
        result_data_version: i64,
        part_name: &str,
    ) {
        if sources_data_version == result_data_version {
            return;
        }
        for (version, entry) in self
            .entries
            .range_mut(sources_data_version + 1..=result_data_version)
        {
            if entry.latest_fail.is_some() {
                entry.latest_fail = None;
                if let Err(e) = entry.rewrite_file(&self.dir).await {
                    warn!("Cannot clear failure record of mutation {}: {}", version, e);
                }
            }
            if *version == result_data_version {
                self.backoff.remove_part(part_name);
            }
        }
    }

    /// Marks entries every active part has caught up with as done, then
    /// erases done entries beyond the retention count. Returns the number of
    /// removed entries.
    pub async fn clear_finished(
        &mut self,
        min_active_data_version: Option<i64>,
        keep: usize,
    ) -> usize {
        let done_below = match min_active_data_version {
            Some(version) => version,
            // No active parts: everything is done.
            None => i64::MAX,
        };

        let mut done_versions = Vec::new();
        for (version, entry) in self.entries.iter_mut() {
            if *version > done_below {
                break;
            }
            entry.is_done = true;
            done_versions.push(*version);
        }

        if done_versions.len() <= keep {
            return 0;
        }
        let to_remove = done_versions.len() - keep;
        let mut removed = 0;
        for version in done_versions.into_iter().take(to_remove) {
            if let Some(entry) = self.entries.remove(&version) {
                info!("Removing mutation: {}", entry.file_name());
                if let Err(e) = entry.remove_file(&self.dir).await {
                    warn!("Cannot remove finished mutation {}: {}", version, e);
                }
                removed += 1;
            }
        }
        removed
    }

    /// Progress of one entry against the visible part set. `None` means the
    /// entry no longer exists (killed or cleaned up).
    pub fn incomplete_status(
        &self,
        version: i64,
        parts: &ActiveVersion,
        txn: &dyn TxnProvider,
    ) -> Option<MutationStatus> {
        let entry = self.entries.get(&version)?;
        let mut status = self.status_of(entry, parts);

        if !status.is_done && entry.latest_fail.is_none() {
            // A part locked by a concurrent transaction will most likely
            // never be mutated; surface that as a failure.
            if let Some(tid) = entry.tid {
                for part in parts.parts() {
                    if part.data_version() < version {
                        if let Some(lock_tid) = txn.locked_by(part) {
                            if lock_tid != tid {
                                status.latest_fail = Some(LatestFail {
                                    part: part.name(),
                                    reason: format!(
                                        "part {} is locked by transaction {}",
                                        part.name(),
                                        lock_tid
                                    ),
                                    error_code: "PART_IS_LOCKED".to_string(),
                                    time: Utc::now().timestamp(),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        }

        Some(status)
    }

    fn status_of(&self, entry: &MutationEntry, parts: &ActiveVersion) -> MutationStatus {
        let parts_to_do: Vec<String> = parts
            .parts()
            .filter(|p| !p.info().is_patch() && p.data_version() < entry.block_number)
            .map(|p| p.name())
            .collect();

        MutationStatus {
            file_name: entry.file_name(),
            version: entry.block_number,
            create_time: entry.create_time,
            command_lines: entry.commands.iter().map(|c| c.to_string()).collect(),
            is_done: parts_to_do.is_empty(),
            parts_to_do,
            latest_fail: entry.latest_fail.clone(),
        }
    }

    /// Status of every entry, the `system.mutations` analogue.
    pub fn statuses(&self, parts: &ActiveVersion) -> Vec<MutationStatus> {
        self.entries
            .values()
            .map(|entry| self.status_of(entry, parts))
            .collect()
    }

    /// Commands of entries some active part has not applied yet, used by
    /// readers that materialize mutations on the fly.
    pub fn unfinished_commands(&self, parts: &ActiveVersion) -> Vec<(String, Vec<MutationCommand>)> {
        let min_version = parts.min_data_version().unwrap_or(i64::MAX);
        self.entries
            .range(min_version + 1..)
            .map(|(_, entry)| (entry.file_name(), entry.commands.as_ref().clone()))
            .collect()
    }

    /// Round-trippable copies of entries with version >= `min_version`, for
    /// the backup driver.
    pub fn backup_entries(&self, min_version: i64) -> Vec<MutationBackupEntry> {
        self.entries
            .range(min_version..)
            .map(|(_, entry)| MutationBackupEntry {
                file_name: entry.file_name(),
                content: entry.to_file_text(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mutation::command::Predicate;
    use crate::part::purger::NoopPurger;
    use crate::part::set::PartSet;
    use crate::part::{PartHandle, PartMeta};

    fn delete_all() -> Vec<MutationCommand> {
        vec![MutationCommand::DeleteWhere {
            predicate: Predicate::All,
        }]
    }

    fn part(name: &str) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: name.parse().unwrap(),
                row_count: 1,
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    #[tokio::test]
    async fn test_append_load_kill() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();

        let file = log.append(delete_all(), None, 3).await.unwrap();
        assert_eq!("mutation_3.txt", file);
        log.append(delete_all(), None, 5).await.unwrap();
        assert_eq!(Some(5), log.max_version());

        // Duplicate version is a logical error.
        assert!(log.append(delete_all(), None, 3).await.is_err());

        let reloaded = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        assert_eq!(2, reloaded.len());

        let mut log = reloaded;
        assert!(log.kill(3).await.is_some());
        assert!(log.kill(3).await.is_none());
        assert!(!dir.path().join("mutation_3.txt").exists());
    }

    #[tokio::test]
    async fn test_load_removes_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("tmp_mutation_9.txt"), b"partial")
            .await
            .unwrap();

        let log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        assert!(log.is_empty());
        assert!(!dir.path().join("tmp_mutation_9.txt").exists());
    }

    #[tokio::test]
    async fn test_load_discards_aborted_transactions() {
        #[derive(Debug)]
        struct AbortAll;
        impl TxnProvider for AbortAll {
            fn is_aborted(&self, _tid: u64) -> bool {
                true
            }
            fn is_visible(&self, _tid: u64, _part: &PartHandle) -> bool {
                true
            }
            fn locked_by(&self, _part: &PartHandle) -> Option<u64> {
                None
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        log.append(delete_all(), Some(7), 1).await.unwrap();
        log.append(delete_all(), None, 2).await.unwrap();

        let reloaded = MutationLog::load(dir.path(), &AbortAll).await.unwrap();
        assert_eq!(1, reloaded.len());
        assert!(reloaded.get(2).is_some());
        assert!(!dir.path().join("mutation_1.txt").exists());
    }

    #[tokio::test]
    async fn test_version_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        log.append(delete_all(), None, 2).await.unwrap();
        log.append(delete_all(), None, 5).await.unwrap();
        log.append(delete_all(), None, 9).await.unwrap();

        let after: Vec<i64> = log.entries_after(2).map(|e| e.block_number).collect();
        assert_eq!(vec![5, 9], after);
        assert_eq!(2, log.current_version_for(4));
        assert_eq!(0, log.current_version_for(1));
        assert_eq!(9, log.current_version_for(100));
    }

    #[tokio::test]
    async fn test_failure_records_and_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        log.append(delete_all(), None, 5).await.unwrap();

        log.mark_failure(1, 5, "p_1_1_0", "no space", "NOT_ENOUGH_SPACE", Duration::from_secs(60))
            .await;
        assert!(!log.backoff.part_can_be_mutated("p_1_1_0"));
        assert!(log.backoff.part_can_be_mutated("p_2_2_0"));
        let fail = log.get(5).unwrap().latest_fail.as_ref().unwrap();
        assert_eq!("NOT_ENOUGH_SPACE", fail.error_code);

        // The failure record survives a reload.
        let reloaded = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        assert!(reloaded.get(5).unwrap().latest_fail.is_some());

        log.clear_failure(1, 5, "p_1_1_0").await;
        assert!(log.get(5).unwrap().latest_fail.is_none());
        assert!(log.backoff.part_can_be_mutated("p_1_1_0"));
    }

    #[tokio::test]
    async fn test_statuses_and_clear_finished() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        log.append(delete_all(), None, 3).await.unwrap();
        log.append(delete_all(), None, 8).await.unwrap();

        let set = PartSet::new();
        set.commit_new_part(part("p_1_1_0_5"), false).unwrap();
        let snapshot = set.snapshot();

        let statuses = log.statuses(&snapshot);
        assert!(statuses[0].is_done);
        assert!(!statuses[1].is_done);
        assert_eq!(vec!["p_1_1_0_5".to_string()], statuses[1].parts_to_do);

        let status = log.incomplete_status(8, &snapshot, &NoTxn).unwrap();
        assert!(!status.is_done);
        assert!(log.incomplete_status(999, &snapshot, &NoTxn).is_none());

        // Version 3 is done; with keep = 0 it gets erased.
        let removed = log.clear_finished(snapshot.min_data_version(), 0).await;
        assert_eq!(1, removed);
        assert!(log.get(3).is_none());
        assert!(!dir.path().join("mutation_3.txt").exists());
        assert!(log.get(8).is_some());
    }

    #[tokio::test]
    async fn test_backup_entries_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = MutationLog::load(dir.path(), &NoTxn).await.unwrap();
        log.append(delete_all(), None, 4).await.unwrap();
        log.append(delete_all(), None, 6).await.unwrap();

        let backup = log.backup_entries(5);
        assert_eq!(1, backup.len());
        assert_eq!("mutation_6.txt", backup[0].file_name);
        let parsed =
            MutationEntry::from_file_text(&backup[0].file_name, 6, &backup[0].content).unwrap();
        assert_eq!(*log.get(6).unwrap().commands, *parsed.commands);
    }
}
