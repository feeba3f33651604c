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

//! Background job selection and execution.
//!
//! Each tick picks at most one merge or one mutation per table, otherwise
//! falls back to periodic cleanups. Selection happens under the background
//! mutex; jobs run without it and report back through the part set commit.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MergeMode;
use crate::error::{AbortedSnafu, CannotAssignOptimizeSnafu, Error, Result};
use crate::merge::picker::{propose_entire_partition, MergeProposal, SelectionConstraints};
use crate::merge::{
    estimate_needed_disk_space, FutureMergedMutatedPart, MergeType, RunningJob,
    SelectFailureReason, SelectMergeFailure, SpaceReservation,
};
use crate::mutation::command::MutationCommand;
use crate::mutation::log::MutationLog;
use crate::mutation::select::select_part_to_mutate;
use crate::part::info::PATCH_PART_PREFIX;
use crate::part::set::ActiveVersion;
use crate::part::PartHandle;
use crate::registry::ProcessingTagger;
use crate::schedule::scheduler::Scheduler;
use crate::store::{apply_commands, merge_rows, MergeRowsOptions, PatchData};
use crate::table::TableInner;

/// A merge chosen by selection: sources tagged, disk space reserved.
pub(crate) struct SelectedMerge {
    pub(crate) future_part: FutureMergedMutatedPart,
    pub(crate) tagger: ProcessingTagger,
    pub(crate) reservation: SpaceReservation,
    pub(crate) is_ttl: bool,
    pub(crate) deduplicate: Option<Vec<String>>,
    pub(crate) cleanup: bool,
}

/// A mutation chosen by selection.
pub(crate) struct SelectedMutation {
    pub(crate) future_part: FutureMergedMutatedPart,
    pub(crate) commands: Vec<MutationCommand>,
    pub(crate) tagger: ProcessingTagger,
    pub(crate) reservation: SpaceReservation,
}

pub(crate) enum MergeSelectOutcome {
    Selected(SelectedMerge),
    Failed(SelectMergeFailure),
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The periodic driver of one table.
pub(crate) async fn drive(inner: Arc<TableInner>) {
    let mut interval = tokio::time::interval(inner.config.background_tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.trigger.notified() => {}
            _ = interval.tick() => {}
        }
        if inner.is_shutdown() {
            break;
        }
        tick(&inner).await;
    }
    debug!("Background driver stopped");
}

fn memory_over_soft_limit(inner: &TableInner) -> bool {
    let limit = inner.config.background_memory_soft_limit;
    limit > 0 && inner.disk.reserved() > limit
}

/// Per-tick source size budget, shrinking as job slots fill up.
fn max_source_parts_size(inner: &TableInner) -> u64 {
    let free = inner
        .config
        .max_background_jobs
        .saturating_sub(inner.merge_list.running());
    if free == 0 {
        return 0;
    }
    let threshold = inner.config.free_entries_to_lower_max_size;
    let max = inner.config.max_source_parts_size_for_merge;
    if free >= threshold {
        max
    } else {
        max >> (((threshold - free) * 2).min(62) as u32)
    }
}

fn max_source_part_size_for_mutation(inner: &TableInner) -> u64 {
    if inner.config.max_background_jobs <= inner.merge_list.running() {
        return 0;
    }
    inner.config.max_source_part_size_for_mutation
}

/// Splits the active parts of one partition into contiguous runs of parts a
/// merge may combine: runs break at tagged parts and wherever neighbors
/// disagree on their current pending-mutation version.
fn eligible_runs(
    inner: &TableInner,
    snapshot: &ActiveVersion,
    partition_id: &str,
    log: &MutationLog,
) -> Vec<Vec<PartHandle>> {
    let mut runs: Vec<Vec<PartHandle>> = Vec::new();
    let mut current: Vec<PartHandle> = Vec::new();

    for part in snapshot.in_partition(partition_id) {
        if inner.registry.contains(&part.name()) {
            if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(prev) = current.last() {
            // Merging across this boundary would skip a pending mutation
            // for one side of the result.
            if log.current_version_for(prev.data_version())
                != log.current_version_for(part.data_version())
            {
                runs.push(std::mem::take(&mut current));
            }
        }
        current.push(part);
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Merge selection under the background mutex. Tags the sources and
/// reserves disk space before returning; failure to reserve is a hard
/// `NotEnoughSpace` error.
pub(crate) fn try_select_merge(
    inner: &TableInner,
    log: &MutationLog,
    partition_id: Option<&str>,
    final_: bool,
) -> Result<MergeSelectOutcome> {
    if memory_over_soft_limit(inner) {
        return Ok(MergeSelectOutcome::Failed(SelectMergeFailure::cannot_select(
            format!(
                "current background tasks memory usage ({}) is more than the soft limit ({})",
                inner.disk.reserved(),
                inner.config.background_memory_soft_limit
            ),
        )));
    }

    let snapshot = inner.parts.snapshot();
    let proposal: MergeProposal = match partition_id {
        None => {
            let max_size = max_source_parts_size(inner);
            if max_size == 0 {
                return Ok(MergeSelectOutcome::Failed(
                    SelectMergeFailure::cannot_select("current value of max_source_parts_size is zero"),
                ));
            }
            let constraints = SelectionConstraints {
                max_source_parts_size: max_size,
                max_parts: inner.config.merge_max_parts_per_job,
                min_size_ratio: inner.config.merge_min_size_ratio,
                ttl_allowed: inner.merge_list.ttl_merges()
                    < inner.config.max_number_of_merges_with_ttl_in_pool,
                now: unix_now(),
            };

            let mut picked = None;
            for pid in snapshot.partition_ids() {
                if pid.starts_with(PATCH_PART_PREFIX)
                    || inner.blockers.is_cancelled_for_partition(&pid)
                {
                    continue;
                }
                let runs = eligible_runs(inner, &snapshot, &pid, log);
                if let Some(proposal) = inner.picker.pick(&runs, &constraints) {
                    picked = Some(proposal);
                    break;
                }
            }
            match picked {
                Some(proposal) => proposal,
                None => {
                    return Ok(MergeSelectOutcome::Failed(
                        SelectMergeFailure::nothing_to_merge("there is nothing to merge"),
                    ))
                }
            }
        }
        Some(pid) => {
            let parts = snapshot.in_partition(pid);
            if parts.is_empty() {
                return Ok(MergeSelectOutcome::Failed(
                    SelectMergeFailure::nothing_to_merge(format!("partition {pid} has no parts")),
                ));
            }
            if final_ {
                if parts.iter().any(|p| inner.registry.contains(&p.name())) {
                    return Ok(MergeSelectOutcome::Failed(
                        SelectMergeFailure::cannot_select(
                            "waiting for currently running merges before OPTIMIZE FINAL",
                        ),
                    ));
                }
                let first_version = log.current_version_for(parts[0].data_version());
                if parts
                    .iter()
                    .any(|p| log.current_version_for(p.data_version()) != first_version)
                {
                    return Ok(MergeSelectOutcome::Failed(
                        SelectMergeFailure::cannot_select(
                            "parts have different pending mutation versions",
                        ),
                    ));
                }
                if parts.len() == 1
                    && parts[0].info().level > 0
                    && log.entries_after(parts[0].data_version()).next().is_none()
                    && snapshot.patches_of(pid).is_empty()
                {
                    return Ok(MergeSelectOutcome::Failed(
                        SelectMergeFailure::nothing_to_merge("partition is already merged"),
                    ));
                }
                match propose_entire_partition(&parts) {
                    Some(proposal) => proposal,
                    None => {
                        return Ok(MergeSelectOutcome::Failed(
                            SelectMergeFailure::nothing_to_merge("no parts to merge"),
                        ))
                    }
                }
            } else {
                let constraints = SelectionConstraints {
                    max_source_parts_size: inner.config.max_source_parts_size_for_merge,
                    max_parts: inner.config.merge_max_parts_per_job,
                    min_size_ratio: inner.config.merge_min_size_ratio,
                    ttl_allowed: inner.merge_list.ttl_merges()
                        < inner.config.max_number_of_merges_with_ttl_in_pool,
                    now: unix_now(),
                };
                let runs = eligible_runs(inner, &snapshot, pid, log);
                match inner.picker.pick(&runs, &constraints) {
                    Some(proposal) => proposal,
                    None => {
                        return Ok(MergeSelectOutcome::Failed(
                            SelectMergeFailure::nothing_to_merge(format!(
                                "nothing to merge in partition {pid}"
                            )),
                        ))
                    }
                }
            }
        }
    };

    let is_ttl = proposal.merge_type == MergeType::TtlDelete;
    if is_ttl
        && !inner
            .merge_list
            .try_book_ttl_merge(inner.config.max_number_of_merges_with_ttl_in_pool)
    {
        return Ok(MergeSelectOutcome::Failed(SelectMergeFailure::cannot_select(
            "too many merges with TTL in the pool",
        )));
    }

    let release_ttl = |inner: &TableInner| {
        if is_ttl {
            inner.merge_list.cancel_ttl_merge();
        }
    };

    let future_part = match FutureMergedMutatedPart::for_merge(proposal.parts, proposal.merge_type)
    {
        Ok(future_part) => future_part,
        Err(e) => {
            release_ttl(inner);
            return Err(e);
        }
    };
    let tagger = match inner.registry.tag(&future_part.parts) {
        Ok(tagger) => tagger,
        Err(e) => {
            release_ttl(inner);
            return Err(e);
        }
    };
    let needed = estimate_needed_disk_space(&future_part.parts);
    let reservation = match inner.disk.reserve(needed, &future_part.name) {
        Ok(reservation) => reservation,
        Err(e) => {
            release_ttl(inner);
            return Err(e);
        }
    };

    Ok(MergeSelectOutcome::Selected(SelectedMerge {
        future_part,
        tagger,
        reservation,
        is_ttl,
        deduplicate: None,
        cleanup: false,
    }))
}

/// One scheduler tick: merge, else mutation, else due cleanups.
/// Returns whether any work was scheduled.
pub(crate) async fn tick(inner: &Arc<TableInner>) -> bool {
    if inner.is_shutdown() {
        return false;
    }

    enum Job {
        Merge(SelectedMerge),
        Mutation(SelectedMutation),
    }

    let (job, has_mutations) = {
        let mut log = inner.mutations.lock().await;
        if inner.blockers.is_cancelled() {
            return false;
        }

        let mut job = match try_select_merge(inner, &log, None, false) {
            Ok(MergeSelectOutcome::Selected(selected)) => Some(Job::Merge(selected)),
            Ok(MergeSelectOutcome::Failed(failure)) => {
                debug!("Didn't start merge: {}", failure.explanation);
                None
            }
            Err(e) => {
                warn!("Merge selection failed: {}", e);
                None
            }
        };

        if job.is_none() && !log.is_empty() {
            let snapshot = inner.parts.snapshot();
            let selection = select_part_to_mutate(
                &log,
                &snapshot,
                &inner.registry,
                inner.txn.as_ref(),
                max_source_part_size_for_mutation(inner),
                inner.config.max_expanded_ast_elements,
            );
            if let Some(selection) = selection {
                let future_part = FutureMergedMutatedPart::for_mutation(
                    selection.part.clone(),
                    selection.last_version,
                );
                match inner.registry.tag(&future_part.parts) {
                    Ok(tagger) => {
                        let needed = estimate_needed_disk_space(&future_part.parts);
                        match inner.disk.reserve(needed, &future_part.name) {
                            Ok(reservation) => {
                                job = Some(Job::Mutation(SelectedMutation {
                                    future_part,
                                    commands: selection.commands,
                                    tagger,
                                    reservation,
                                }));
                            }
                            Err(e) => {
                                let part_name = selection.part.name();
                                log.mark_failure(
                                    selection.part.data_version(),
                                    selection.last_version,
                                    &part_name,
                                    &e.to_string(),
                                    e.status_code().name(),
                                    inner.config.max_postpone_time_for_failed_mutations,
                                )
                                .await;
                                drop(tagger);
                            }
                        }
                    }
                    Err(e) => warn!("Cannot tag part for mutation: {}", e),
                }
            } else {
                debug!("Didn't start mutation");
            }
        }

        (job, !log.is_empty())
    };

    match job {
        Some(Job::Merge(selected)) => {
            if inner
                .blockers
                .is_cancelled_for_partition(selected.future_part.partition_id())
            {
                if selected.is_ttl {
                    inner.merge_list.cancel_ttl_merge();
                }
                return false;
            }
            let is_ttl = selected.is_ttl;
            let job_inner = inner.clone();
            let scheduled = inner
                .scheduler
                .schedule(Box::pin(async move {
                    run_merge_job(job_inner, selected).await;
                }))
                .is_ok();
            if !scheduled {
                warn!("Failed to schedule merge job");
                // The slot was booked at selection time; the task that
                // would release it never runs.
                if is_ttl {
                    inner.merge_list.cancel_ttl_merge();
                }
            }
            scheduled
        }
        Some(Job::Mutation(selected)) => {
            let job_inner = inner.clone();
            let scheduled = inner
                .scheduler
                .schedule(Box::pin(async move {
                    run_mutation_job(job_inner, selected).await;
                }))
                .is_ok();
            if !scheduled {
                warn!("Failed to schedule mutation job");
            }
            scheduled
        }
        None => {
            if has_mutations {
                // Notify waiters so recorded errors propagate even when no
                // mutation could be selected.
                inner.mutation_wait.notify_waiters();
            }
            schedule_due_cleanups(inner)
        }
    }
}

fn schedule_due_cleanups(inner: &Arc<TableInner>) -> bool {
    let (parts_due, temp_due) = {
        let mut timers = inner.cleanup_timers.lock().unwrap();
        let now = std::time::Instant::now();
        let parts_due =
            now.duration_since(timers.last_parts_cleanup) >= inner.config.clear_old_parts_interval;
        if parts_due {
            timers.last_parts_cleanup = now;
        }
        let temp_due = now.duration_since(timers.last_temp_cleanup)
            >= inner.config.clear_old_temp_dirs_interval;
        if temp_due {
            timers.last_temp_cleanup = now;
        }
        (parts_due, temp_due)
    };

    let mut scheduled = false;
    if parts_due {
        let job_inner = inner.clone();
        scheduled |= inner
            .scheduler
            .schedule(Box::pin(async move {
                run_parts_cleanup(job_inner).await;
            }))
            .is_ok();
    }
    if temp_due {
        let job_inner = inner.clone();
        scheduled |= inner
            .scheduler
            .schedule(Box::pin(async move {
                let lifetime = job_inner.config.temporary_directories_lifetime.as_secs();
                if let Err(e) = job_inner.store.remove_temp_dirs(lifetime).await {
                    warn!("Temporary directory cleanup failed: {}", e);
                }
            }))
            .is_ok();
    }
    scheduled
}

/// Forces one merge, used by OPTIMIZE. With `final_` the call waits for
/// in-flight merges on the partition (bounded) and retries selection.
pub(crate) async fn merge_once(
    inner: &Arc<TableInner>,
    partition_id: Option<&str>,
    final_: bool,
    deduplicate: Option<Vec<String>>,
    cleanup: bool,
) -> Result<()> {
    let timeout = inner.config.lock_acquire_timeout_for_background_operations;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let outcome = {
            let log = inner.mutations.lock().await;
            let cancelled = match partition_id {
                Some(pid) => inner.blockers.is_cancelled_for_partition(pid),
                None => inner.blockers.is_cancelled(),
            };
            if cancelled {
                return AbortedSnafu {
                    reason: "cancelled merging parts".to_string(),
                }
                .fail();
            }
            try_select_merge(inner, &log, partition_id, final_)?
        };

        match outcome {
            MergeSelectOutcome::Selected(mut selected) => {
                selected.deduplicate = deduplicate;
                selected.cleanup = cleanup;
                return execute_merge(inner, selected).await.map(|_| ());
            }
            MergeSelectOutcome::Failed(failure) => match failure.reason {
                // Nothing to merge counts as success, OPTIMIZE FINAL
                // relies on that.
                SelectFailureReason::NothingToMerge => return Ok(()),
                SelectFailureReason::CannotSelect => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return CannotAssignOptimizeSnafu {
                            reason: failure.explanation,
                        }
                        .fail();
                    }
                    if final_ && partition_id.is_some() && !inner.registry.is_empty() {
                        debug!(
                            "Waiting for currently running merges to perform OPTIMIZE FINAL: {}",
                            failure.explanation
                        );
                        if inner
                            .registry
                            .wait_drained(partition_id, deadline - now)
                            .await
                            .is_err()
                        {
                            return CannotAssignOptimizeSnafu {
                                reason: "timeout while waiting for already running merges before OPTIMIZE FINAL".to_string(),
                            }
                            .fail();
                        }
                        continue;
                    }
                    if partition_id.is_some() && memory_over_soft_limit(inner) {
                        // Poll the memory condition at a 1-second cadence.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return CannotAssignOptimizeSnafu {
                        reason: failure.explanation,
                    }
                    .fail();
                }
            },
        }
    }
}

/// Patch parts of one base partition as mergeable patch data, oldest first.
pub(crate) async fn collect_patches(
    inner: &TableInner,
    snapshot: &ActiveVersion,
    partition_id: &str,
) -> Result<Vec<PatchData>> {
    let mut patch_parts = snapshot.patches_of(partition_id);
    patch_parts.sort_by_key(|p| p.info().min_block);

    let mut patches = Vec::with_capacity(patch_parts.len());
    for part in patch_parts {
        patches.push(PatchData {
            version: part.info().min_block,
            columns: part.meta().columns.clone(),
            rows: inner.store.read_rows(&part.name()).await?,
        });
    }
    Ok(patches)
}

async fn run_merge_job(inner: Arc<TableInner>, selected: SelectedMerge) {
    let name = selected.future_part.name.clone();
    match execute_merge(&inner, selected).await {
        Ok(part) => info!("Merged to part {}", part.name()),
        Err(e) if matches!(e, Error::Aborted { .. }) => info!("Merge of {} cancelled", name),
        Err(e) => error!("Merge of {} failed: {}", name, e),
    }
    inner.trigger_background();
}

/// Runs a merge to completion: reads sources, merges, commits the result
/// and outdates the covered parts. The tagger, the disk reservation and the
/// merge list entry release when this returns.
pub(crate) async fn execute_merge(
    inner: &Arc<TableInner>,
    selected: SelectedMerge,
) -> Result<PartHandle> {
    let SelectedMerge {
        future_part,
        tagger,
        reservation,
        is_ttl,
        deduplicate,
        cleanup,
    } = selected;
    let _tagger = tagger;
    let _reservation = reservation;

    let cancel = CancellationToken::new();
    let _list_entry = inner.merge_list.register(RunningJob {
        partition_id: future_part.partition_id().to_string(),
        result_part: future_part.name.clone(),
        target_mutation: 0,
        cancel: cancel.clone(),
        is_ttl,
    });

    let cancelled = || {
        cancel.is_cancelled()
            || inner.is_shutdown()
            || inner
                .blockers
                .is_cancelled_for_partition(future_part.partition_id())
    };
    let abort = || -> Result<PartHandle> {
        AbortedSnafu {
            reason: "cancelled merging parts".to_string(),
        }
        .fail()
    };
    if cancelled() {
        return abort();
    }

    let mut sources = Vec::with_capacity(future_part.parts.len());
    for part in &future_part.parts {
        sources.push(inner.store.read_rows(&part.name()).await?);
    }
    let snapshot = inner.parts.snapshot();
    let patches = collect_patches(inner, &snapshot, future_part.partition_id()).await?;

    let options = MergeRowsOptions {
        replacing: inner.config.merge_mode == MergeMode::Replacing,
        cleanup,
        deduplicate,
        drop_expired_before: (future_part.merge_type == MergeType::TtlDelete)
            .then(unix_now),
    };
    let rows = merge_rows(sources, &patches, &options);

    if cancelled() {
        return abort();
    }
    let staged = inner.store.stage_part("merge", rows).await?;
    if cancelled() {
        inner.store.abandon_part(staged).await;
        return abort();
    }

    let applied_patch_version = future_part
        .parts
        .iter()
        .map(|p| p.meta().applied_patch_version)
        .chain(patches.iter().map(|p| p.version))
        .max()
        .unwrap_or(0);
    let meta = inner
        .store
        .commit_part(staged, future_part.part_info.clone(), applied_patch_version)
        .await?;
    let handle = inner.new_part_handle(meta);
    let covered = inner.parts.commit_new_part(handle.clone(), false)?;
    debug!(
        "Merge of {} parts covered {} parts",
        future_part.parts.len(),
        covered.len()
    );
    Ok(handle)
}

async fn run_mutation_job(inner: Arc<TableInner>, selected: SelectedMutation) {
    let sources_data_version = selected.future_part.sources_data_version();
    let target_version = selected.future_part.part_info.mutation;
    let source_name = selected.future_part.parts[0].name();

    match execute_mutation(&inner, selected).await {
        Ok(part) => {
            info!("Mutated part {} to {}", source_name, part.name());
            let mut log = inner.mutations.lock().await;
            log.clear_failure(sources_data_version, target_version, &source_name)
                .await;
        }
        Err(e) if matches!(e, Error::Aborted { .. }) => {
            info!("Mutation of {} cancelled", source_name);
        }
        Err(e) => {
            error!("Mutation of {} failed: {}", source_name, e);
            let mut log = inner.mutations.lock().await;
            log.mark_failure(
                sources_data_version,
                target_version,
                &source_name,
                &e.to_string(),
                e.status_code().name(),
                inner.config.max_postpone_time_for_failed_mutations,
            )
            .await;
        }
    }
    inner.mutation_wait.notify_waiters();
    inner.trigger_background();
}

/// Applies coalesced commands to one part, producing its next version.
pub(crate) async fn execute_mutation(
    inner: &Arc<TableInner>,
    selected: SelectedMutation,
) -> Result<PartHandle> {
    let SelectedMutation {
        future_part,
        commands,
        tagger,
        reservation,
    } = selected;
    let _tagger = tagger;
    let _reservation = reservation;

    let cancel = CancellationToken::new();
    let _list_entry = inner.merge_list.register(RunningJob {
        partition_id: future_part.partition_id().to_string(),
        result_part: future_part.name.clone(),
        target_mutation: future_part.part_info.mutation,
        cancel: cancel.clone(),
        is_ttl: false,
    });

    let cancelled = || {
        cancel.is_cancelled()
            || inner.is_shutdown()
            || inner
                .blockers
                .is_cancelled_for_partition(future_part.partition_id())
    };
    let abort = || -> Result<PartHandle> {
        AbortedSnafu {
            reason: "cancelled mutating parts".to_string(),
        }
        .fail()
    };
    if cancelled() {
        return abort();
    }

    let source = &future_part.parts[0];
    let rows = inner.store.read_rows(&source.name()).await?;
    let snapshot = inner.parts.snapshot();
    let patches = collect_patches(inner, &snapshot, future_part.partition_id()).await?;
    let rows = merge_rows(vec![rows], &patches, &MergeRowsOptions::default());
    let rows = apply_commands(rows, &commands);

    if cancelled() {
        return abort();
    }
    let staged = inner.store.stage_part("mutate", rows).await?;
    if cancelled() {
        inner.store.abandon_part(staged).await;
        return abort();
    }

    let applied_patch_version = patches
        .iter()
        .map(|p| p.version)
        .max()
        .unwrap_or(source.meta().applied_patch_version)
        .max(source.meta().applied_patch_version);
    let meta = inner
        .store
        .commit_part(staged, future_part.part_info.clone(), applied_patch_version)
        .await?;
    let handle = inner.new_part_handle(meta);
    let covered = inner.parts.commit_new_part(handle.clone(), false)?;
    debug_assert_eq!(1, covered.len());
    Ok(handle)
}

/// The composed part cleanup: finished mutations, empty parts, stale patch
/// parts, then outdated parts past their grace window.
pub(crate) async fn run_parts_cleanup(inner: Arc<TableInner>) {
    {
        let mut log = inner.mutations.lock().await;
        let min_version = inner.parts.snapshot().min_data_version();
        let removed = log
            .clear_finished(min_version, inner.config.finished_mutations_to_keep)
            .await;
        if removed > 0 {
            debug!("Removed {} finished mutations", removed);
        }
    }

    clear_empty_parts(&inner);
    clear_stale_patch_parts(&inner);

    let lifetime = inner.config.old_parts_lifetime.as_secs() as i64;
    let removed = inner.parts.take_removable(lifetime);
    if !removed.is_empty() {
        info!("Removing {} old parts from filesystem", removed.len());
    }
    // Dropping the handles sends the purge requests.
}

fn clear_empty_parts(inner: &TableInner) {
    let snapshot = inner.parts.snapshot();
    for part in snapshot.parts() {
        if part.row_count() == 0 && !inner.registry.contains(&part.name()) {
            match inner.parts.outdate(&part.name(), false) {
                Ok(_) => info!("Removed empty part {}", part.name()),
                Err(e) => debug!("Cannot remove empty part {}: {}", part.name(), e),
            }
        }
    }
}

/// A patch part is stale once every active base part of its partition has
/// either mutated past it or materialized it during a merge.
fn clear_stale_patch_parts(inner: &TableInner) {
    let snapshot = inner.parts.snapshot();
    for patch in snapshot.parts().filter(|p| p.info().is_patch()) {
        if inner.registry.contains(&patch.name()) {
            continue;
        }
        let version = patch.info().min_block;
        let stale = snapshot
            .in_partition(patch.info().base_partition_id())
            .iter()
            .all(|p| p.data_version().max(p.meta().applied_patch_version) >= version);
        if stale {
            match inner.parts.outdate(&patch.name(), false) {
                Ok(_) => info!("Removed stale patch part {}", patch.name()),
                Err(e) => debug!("Cannot remove stale patch part {}: {}", patch.name(), e),
            }
        }
    }
}
