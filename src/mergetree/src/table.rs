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

//! The per-table merge engine.

pub mod background;
pub mod partition;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::{BlockNumberAllocator, BlockOp};
use crate::config::{MergeMode, MergeTreeConfig};
use crate::error::{
    AbortedSnafu, BadArgumentsSnafu, MutationFailedSnafu, NoSuchDataPartSnafu, Result,
    TableIsReadOnlySnafu, TooManyPartsSnafu,
};
use crate::merge::picker::{MergePickerRef, SimplePicker};
use crate::merge::{DiskManager, MergeBlockers, MergeList};
use crate::mutation::command::{contain_barrier_command, MutationCommand};
use crate::mutation::entry::{try_parse_file_name, MutationBackupEntry};
use crate::mutation::log::{MutationLog, MutationStatus, NoTxn, TxnProvider};
use crate::part::info::{PartInfo, PATCH_PART_PREFIX};
use crate::part::purger::{LocalPartPurger, PartPurgerRef};
use crate::part::set::{ActiveVersionRef, PartSet};
use crate::part::{PartHandle, PartState};
use crate::registry::ProcessingRegistry;
use crate::schedule::scheduler::{LocalScheduler, Scheduler};
use crate::store::{merge_rows, CheckResult, MergeRowsOptions, PartStore, Row};
use crate::update::{LightweightUpdateGate, UpdateMode};

/// Result of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationCode {
    CancelSent,
    NotFound,
}

/// Outcome of waiting for a mutation.
#[derive(Debug, Clone)]
pub enum MutationWaitResult {
    Done(MutationStatus),
    /// The entry disappeared, most likely killed.
    Missing,
}

/// Filter of a CHECK TABLE request.
#[derive(Debug, Clone)]
pub enum CheckFilter {
    All,
    Partition(String),
    Part(String),
}

/// Options of an OPTIMIZE request.
#[derive(Debug, Clone, Default)]
pub struct OptimizeOptions {
    pub partition_id: Option<String>,
    pub final_: bool,
    /// `Some(vec![])` deduplicates by every column.
    pub deduplicate: Option<Vec<String>>,
    pub cleanup: bool,
}

/// Everything the backup driver needs to re-create the table state.
#[derive(Debug, Clone)]
pub struct BackupSnapshot {
    pub part_names: Vec<String>,
    pub mutations: Vec<MutationBackupEntry>,
}

pub(crate) struct CleanupTimers {
    pub(crate) last_parts_cleanup: Instant,
    pub(crate) last_temp_cleanup: Instant,
}

/// Shared state of one table.
pub(crate) struct TableInner {
    pub(crate) config: MergeTreeConfig,
    pub(crate) store: PartStore,
    pub(crate) parts: PartSet,
    pub(crate) allocator: BlockNumberAllocator,
    pub(crate) registry: ProcessingRegistry,
    pub(crate) merge_list: MergeList,
    pub(crate) blockers: MergeBlockers,
    pub(crate) disk: DiskManager,
    pub(crate) update_gate: LightweightUpdateGate,
    pub(crate) picker: MergePickerRef,
    pub(crate) txn: Arc<dyn TxnProvider>,
    pub(crate) purger: PartPurgerRef,
    pub(crate) scheduler: Arc<LocalScheduler>,
    /// The background mutex: guards the mutation log, selection and the
    /// operational transitions around them.
    pub(crate) mutations: tokio::sync::Mutex<MutationLog>,
    /// Wakes synchronous mutation waiters.
    pub(crate) mutation_wait: Notify,
    /// Wakes the background driver out of its tick interval.
    pub(crate) trigger: Notify,
    pub(crate) shutdown: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) read_only: AtomicBool,
    pub(crate) cleanup_timers: Mutex<CleanupTimers>,
}

impl TableInner {
    pub(crate) fn assert_not_readonly(&self) -> Result<()> {
        if self.read_only.load(Ordering::Relaxed) {
            return TableIsReadOnlySnafu {}.fail();
        }
        Ok(())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub(crate) fn new_part_handle(&self, meta: crate::part::PartMeta) -> PartHandle {
        PartHandle::new(meta, self.purger.clone())
    }

    /// Kicks the background driver.
    pub(crate) fn trigger_background(&self) {
        self.trigger.notify_one();
    }
}

/// A single-node, log-structured merge engine over immutable versioned
/// parts.
#[derive(Clone)]
pub struct MergeTreeTable {
    inner: Arc<TableInner>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MergeTreeTable {
    /// Opens (or creates) the table rooted at `dir`: loads parts and the
    /// mutation log, cleans leftovers of interrupted operations and starts
    /// the background driver.
    pub async fn open(mut config: MergeTreeConfig, dir: &Path) -> Result<MergeTreeTable> {
        config.sanitize();
        Self::open_with_txn(config, dir, Arc::new(NoTxn)).await
    }

    pub async fn open_with_txn(
        config: MergeTreeConfig,
        dir: &Path,
        txn: Arc<dyn TxnProvider>,
    ) -> Result<MergeTreeTable> {
        tokio::fs::create_dir_all(dir).await.context(crate::error::IoSnafu {
            path: dir.display().to_string(),
        })?;

        let scheduler = Arc::new(LocalScheduler::new(
            config.job_queue_size,
            config.max_background_jobs,
        ));
        let purger: PartPurgerRef = Arc::new(LocalPartPurger::new(
            scheduler.clone(),
            dir.to_path_buf(),
        ));
        let store = PartStore::new(dir.to_path_buf());

        // Reserved temp prefixes are removed unconditionally on startup.
        let _ = store
            .remove_temp_dirs(config.temporary_directories_lifetime.as_secs())
            .await;

        let metas = store.load_parts().await?;
        let mut max_block = 0i64;
        let handles: Vec<PartHandle> = metas
            .into_iter()
            .map(|meta| {
                max_block = max_block
                    .max(meta.info.max_block)
                    .max(meta.info.mutation);
                PartHandle::new(meta, purger.clone())
            })
            .collect();
        let part_count = handles.len();
        let parts = PartSet::new();
        parts.restore(handles);

        let mutations = MutationLog::load(dir, txn.as_ref()).await?;
        let max_mutation = mutations.max_version().unwrap_or(0);

        let allocator = BlockNumberAllocator::new();
        allocator.seed(max_block.max(max_mutation));

        info!(
            "Opened table at {}, {} parts, {} mutations",
            dir.display(),
            part_count,
            mutations.len()
        );

        let inner = Arc::new(TableInner {
            disk: DiskManager::new(None),
            update_gate: LightweightUpdateGate::new(),
            picker: Arc::new(SimplePicker::default()) as MergePickerRef,
            txn,
            purger,
            scheduler,
            store,
            parts,
            allocator,
            registry: ProcessingRegistry::new(),
            merge_list: MergeList::new(),
            blockers: MergeBlockers::new(),
            mutations: tokio::sync::Mutex::new(mutations),
            mutation_wait: Notify::new(),
            trigger: Notify::new(),
            shutdown: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            read_only: AtomicBool::new(false),
            cleanup_timers: Mutex::new(CleanupTimers {
                last_parts_cleanup: Instant::now(),
                last_temp_cleanup: Instant::now(),
            }),
            config,
        });

        let driver = tokio::spawn(background::drive(inner.clone()));
        Ok(MergeTreeTable {
            inner,
            driver: Arc::new(Mutex::new(Some(driver))),
        })
    }

    pub fn config(&self) -> &MergeTreeConfig {
        &self.inner.config
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::Relaxed);
    }

    /// A consistent, immutable view of the visible parts. Never blocks
    /// writers and is unaffected by later commits.
    pub fn snapshot(&self) -> ActiveVersionRef {
        self.inner.parts.snapshot()
    }

    /// Commands of mutations some visible part has not applied yet, paired
    /// with their entry file names. Readers materialize these on the fly.
    pub async fn mutations_snapshot(&self) -> Vec<(String, Vec<MutationCommand>)> {
        let log = self.inner.mutations.lock().await;
        log.unfinished_commands(&self.snapshot())
    }

    /// Inserts rows as one new part of `partition_id`.
    pub async fn insert(&self, partition_id: &str, rows: Vec<Row>) -> Result<String> {
        self.inner.assert_not_readonly()?;
        PartInfo::validate_partition_id(partition_id)?;
        if rows.is_empty() {
            return BadArgumentsSnafu {
                reason: "inserting an empty row set".to_string(),
            }
            .fail();
        }

        let active = self.snapshot().in_partition(partition_id).len();
        if active >= self.inner.config.parts_to_throw_insert {
            return TooManyPartsSnafu {
                count: active,
                limit: self.inner.config.parts_to_throw_insert,
            }
            .fail();
        }

        let staged = self.inner.store.stage_part("insert", rows).await?;

        // Obtaining the block number and making the part visible happen
        // while the committing block is held, so settle-waiters observe the
        // insert or its absence, never a half state.
        let block = self.inner.allocator.allocate(BlockOp::Insert);
        let info = PartInfo::new_inserted(partition_id, block.number());
        let meta = self.inner.store.commit_part(staged, info, 0).await?;
        let handle = self.inner.new_part_handle(meta);
        let name = handle.name();
        self.inner.parts.commit_new_part(handle, false)?;
        drop(block);

        debug!("Inserted part {}", name);
        self.inner.trigger_background();
        Ok(name)
    }

    /// Appends a mutation entry and returns `(version, entry file name)`.
    ///
    /// An entry containing a barrier command waits synchronously for every
    /// previously enqueued mutation first.
    pub async fn mutate(&self, commands: Vec<MutationCommand>) -> Result<(i64, String)> {
        self.inner.assert_not_readonly()?;
        if commands.is_empty() {
            return BadArgumentsSnafu {
                reason: "empty mutation command list".to_string(),
            }
            .fail();
        }

        if contain_barrier_command(&commands) {
            let prev = {
                let log = self.inner.mutations.lock().await;
                log.max_version()
            };
            if let Some(prev) = prev {
                debug!(
                    "Mutation contains a barrier command, waiting for mutation {} first",
                    prev
                );
                self.wait_for_mutation(prev).await?;
            }
        }

        let block = self.inner.allocator.allocate(BlockOp::Mutation);
        let version = block.number();
        let file_name = {
            let mut log = self.inner.mutations.lock().await;
            log.append(commands, None, version).await?
        };
        drop(block);

        info!("Added mutation: {}", file_name);
        self.inner.trigger_background();
        Ok((version, file_name))
    }

    /// Appends a mutation entry and blocks until it is applied everywhere,
    /// killed, or fails.
    pub async fn mutate_and_wait(&self, commands: Vec<MutationCommand>) -> Result<MutationWaitResult> {
        let (version, _) = self.mutate(commands).await?;
        self.wait_for_mutation(version).await
    }

    /// Waits until every visible part reaches `version`. Returns `Missing`
    /// if the entry disappears (killed) and an error if a failure is
    /// recorded on it.
    pub async fn wait_for_mutation(&self, version: i64) -> Result<MutationWaitResult> {
        info!("Waiting mutation: {}", version);
        loop {
            // Register before checking so completions are never missed.
            let mut notified = std::pin::pin!(self.inner.mutation_wait.notified());
            notified.as_mut().enable();

            if self.inner.is_shutdown() {
                return AbortedSnafu {
                    reason: "table shutdown".to_string(),
                }
                .fail();
            }

            let status = {
                let log = self.inner.mutations.lock().await;
                log.incomplete_status(version, &self.snapshot(), self.inner.txn.as_ref())
            };
            match status {
                None => return Ok(MutationWaitResult::Missing),
                Some(status) if status.is_done => {
                    info!("Mutation {} done", version);
                    return Ok(MutationWaitResult::Done(status));
                }
                Some(status) => {
                    if let Some(fail) = status.latest_fail {
                        return MutationFailedSnafu {
                            version,
                            part: fail.part,
                            reason: fail.reason,
                        }
                        .fail();
                    }
                }
            }

            notified.await;
        }
    }

    /// Status of every known mutation entry.
    pub async fn mutation_statuses(&self) -> Vec<MutationStatus> {
        let log = self.inner.mutations.lock().await;
        log.statuses(&self.snapshot())
    }

    /// Removes a mutation entry by file name, cancelling in-flight jobs
    /// targeting its version.
    pub async fn kill_mutation(&self, file_name: &str) -> Result<CancellationCode> {
        self.inner.assert_not_readonly()?;
        debug!("Killing mutation {}", file_name);

        let Some(version) = try_parse_file_name(file_name) else {
            return Ok(CancellationCode::NotFound);
        };
        let killed = {
            let mut log = self.inner.mutations.lock().await;
            log.kill(version).await
        };
        if killed.is_none() {
            return Ok(CancellationCode::NotFound);
        }

        let cancelled = self.inner.merge_list.cancel_part_mutations(version);
        debug!(
            "Cancelled {} part mutations and removed mutation file {}",
            cancelled, file_name
        );
        self.inner.mutation_wait.notify_waiters();
        // Another mutation may have been blocked by the killed one.
        self.inner.trigger_background();
        Ok(CancellationCode::CancelSent)
    }

    /// Forces merge selection; with `final_` every part of the affected
    /// partitions is merged into one, waiting for in-flight merges first.
    pub async fn optimize(&self, options: OptimizeOptions) -> Result<()> {
        self.inner.assert_not_readonly()?;

        if options.cleanup && self.inner.config.merge_mode != MergeMode::Replacing {
            return crate::error::CannotAssignOptimizeSnafu {
                reason: "only the replacing merge mode supports CLEANUP".to_string(),
            }
            .fail();
        }

        if options.partition_id.is_none() && options.final_ {
            let partitions: Vec<String> = self
                .snapshot()
                .partition_ids()
                .into_iter()
                .filter(|pid| !pid.starts_with(PATCH_PART_PREFIX))
                .collect();
            for pid in partitions {
                background::merge_once(
                    &self.inner,
                    Some(&pid),
                    true,
                    options.deduplicate.clone(),
                    options.cleanup,
                )
                .await?;
            }
            return Ok(());
        }

        background::merge_once(
            &self.inner,
            options.partition_id.as_deref(),
            options.final_,
            options.deduplicate,
            options.cleanup,
        )
        .await
    }

    /// Applies a lightweight update: builds patch parts that override the
    /// written columns until a merge or mutation materializes them.
    pub async fn update_lightweight(
        &self,
        commands: Vec<MutationCommand>,
        mode: UpdateMode,
    ) -> Result<Vec<String>> {
        self.inner.assert_not_readonly()?;
        if commands.is_empty()
            || !commands
                .iter()
                .all(|c| matches!(c, MutationCommand::UpdateSet { .. }))
        {
            return BadArgumentsSnafu {
                reason: "lightweight updates support UPDATE commands only".to_string(),
            }
            .fail();
        }

        let mut columns: Vec<String> = commands.iter().flat_map(|c| c.updated_columns()).collect();
        columns.sort();
        columns.dedup();

        let timeout = self.inner.config.lock_acquire_timeout;
        let _lock = self.inner.update_gate.lock(mode, &columns, timeout).await?;

        let block = self.inner.allocator.allocate(BlockOp::Update);
        // See every prior insert and mutation, but not other updates.
        self.inner
            .allocator
            .wait_until_settled(block.number(), timeout, |op| op == BlockOp::Update)
            .await?;

        let snapshot = self.snapshot();
        let mut patch_names = Vec::new();
        for pid in snapshot.partition_ids() {
            if pid.starts_with(PATCH_PART_PREFIX) {
                continue;
            }
            let rows = self.visible_rows_of(&snapshot, &pid).await?;

            let mut patch_rows = Vec::new();
            for row in rows {
                let mut patched = row.clone();
                for command in &commands {
                    let MutationCommand::UpdateSet {
                        column,
                        value,
                        predicate,
                    } = command
                    else {
                        unreachable!("validated above");
                    };
                    if predicate.matches(|c| patched.lookup(c)) {
                        patched.columns.insert(column.clone(), value.clone());
                    }
                }
                if patched != row {
                    let mut slim = Row::new(patched.key);
                    for column in &columns {
                        if let Some(value) = patched.columns.get(column) {
                            slim.columns.insert(column.clone(), value.clone());
                        }
                    }
                    patch_rows.push(slim);
                }
            }
            if patch_rows.is_empty() {
                continue;
            }

            let staged = self.inner.store.stage_part("update", patch_rows).await?;
            let info = PartInfo::new_inserted(format!("{PATCH_PART_PREFIX}{pid}"), block.number());
            let meta = self.inner.store.commit_part(staged, info, 0).await?;
            let handle = self.inner.new_part_handle(meta);
            patch_names.push(handle.name());
            self.inner.parts.commit_new_part(handle, false)?;
        }
        drop(block);

        info!("Lightweight update created patch parts: {:?}", patch_names);
        self.inner.trigger_background();
        Ok(patch_names)
    }

    /// Rows of one partition as a reader would see them: active parts
    /// merged with every active patch applied.
    pub async fn read_partition(&self, partition_id: &str) -> Result<Vec<Row>> {
        let snapshot = self.snapshot();
        self.visible_rows_of(&snapshot, partition_id).await
    }

    async fn visible_rows_of(
        &self,
        snapshot: &crate::part::set::ActiveVersion,
        partition_id: &str,
    ) -> Result<Vec<Row>> {
        let mut sources = Vec::new();
        for part in snapshot.in_partition(partition_id) {
            sources.push(self.inner.store.read_rows(&part.name()).await?);
        }
        let patches = background::collect_patches(&self.inner, snapshot, partition_id).await?;
        let options = MergeRowsOptions {
            replacing: self.inner.config.merge_mode == MergeMode::Replacing,
            ..Default::default()
        };
        Ok(merge_rows(sources, &patches, &options))
    }

    /// Recomputes and validates checksums per part.
    pub async fn check(&self, filter: CheckFilter) -> Result<Vec<CheckResult>> {
        let parts: Vec<PartHandle> = match &filter {
            CheckFilter::All => self.snapshot().parts().cloned().collect(),
            CheckFilter::Partition(pid) => self.snapshot().in_partition(pid),
            CheckFilter::Part(name) => {
                let part = self
                    .inner
                    .parts
                    .lookup(name, &[PartState::Active, PartState::Outdated])
                    .ok_or_else(|| NoSuchDataPartSnafu { name: name.as_str() }.build())?;
                vec![part]
            }
        };

        let mut results = Vec::with_capacity(parts.len());
        for part in parts {
            results.push(self.inner.store.check_part(&part.name()).await);
        }
        Ok(results)
    }

    /// Enumerates parts and mutation entries for the backup driver without
    /// mutating any state.
    pub async fn backup(&self) -> BackupSnapshot {
        let snapshot = self.snapshot();
        let min_data_version = snapshot
            .parts()
            .map(|p| p.data_version() + 1)
            .min()
            .unwrap_or(0);
        let log = self.inner.mutations.lock().await;
        BackupSnapshot {
            part_names: snapshot.parts().map(|p| p.name()).collect(),
            mutations: log.backup_entries(min_data_version),
        }
    }

    /// Stops background processing and waits for in-flight jobs to finish.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!("Shutting down table");
        self.inner.cancel.cancel();
        self.inner.mutation_wait.notify_waiters();
        self.inner.registry.notify_all();
        self.inner.trigger.notify_waiters();

        let driver = self.driver.lock().unwrap().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Background driver exited abnormally: {}", e);
            }
        }
        self.inner.scheduler.stop(true).await
    }

    pub(crate) fn inner(&self) -> &Arc<TableInner> {
        &self.inner
    }
}

/// Convenience constructor of update commands for lightweight updates.
pub fn update_set(column: &str, value: Value, predicate: crate::mutation::command::Predicate) -> MutationCommand {
    MutationCommand::UpdateSet {
        column: column.to_string(),
        value,
        predicate,
    }
}
