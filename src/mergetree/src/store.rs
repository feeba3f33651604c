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

//! Native on-disk part store.
//!
//! A part is an immutable directory holding `data.jsonl` (rows in sort key
//! order), `meta.json` and `checksums.txt`. Writes stage into a `tmp_*`
//! directory; the atomic rename into the final part name is the visibility
//! point.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tracing::{info, warn};

use crate::error::{IoSnafu, NoSuchDataPartSnafu, Result, SerdeJsonSnafu};
use crate::mutation::command::MutationCommand;
use crate::part::info::PartInfo;
use crate::part::PartMeta;

pub const DATA_FILE: &str = "data.jsonl";
pub const META_FILE: &str = "meta.json";
pub const CHECKSUMS_FILE: &str = "checksums.txt";

pub const DETACHED_DIR: &str = "detached";

const TMP_PREFIX: &str = "tmp_";
/// Reserved prefixes, removed unconditionally on startup.
const RESERVED_TMP_PREFIXES: &[&str] = &["tmp-fetch_", "delete_tmp_"];

/// One row of a part. `key` is the sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: i64,
    #[serde(default)]
    pub columns: BTreeMap<String, Value>,
    /// Unix seconds after which the row may be dropped by a TTL merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<i64>,
    /// Tombstone flag honored by replacing merges with cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<bool>,
}

impl Row {
    pub fn new(key: i64) -> Row {
        Row {
            key,
            columns: BTreeMap::new(),
            expire_at: None,
            tombstone: None,
        }
    }

    pub fn with_column(mut self, name: &str, value: Value) -> Row {
        self.columns.insert(name.to_string(), value);
        self
    }

    /// Scalar lookup used by predicates; `key` resolves to the sort key.
    pub fn lookup(&self, column: &str) -> Option<Value> {
        if column == "key" {
            return Some(Value::from(self.key));
        }
        self.columns.get(column).cloned()
    }
}

/// Result of validating one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub part_name: String,
    pub is_ok: bool,
    pub message: String,
}

/// A staged, not yet visible part directory.
#[derive(Debug)]
pub struct StagedPart {
    dir_name: String,
    row_count: u64,
    byte_size: u64,
    columns: Vec<String>,
    min_expire_at: Option<i64>,
    max_expire_at: Option<i64>,
}

/// Part storage rooted at one table directory.
#[derive(Debug)]
pub struct PartStore {
    table_dir: PathBuf,
    staging_seq: AtomicU64,
}

impl PartStore {
    pub fn new(table_dir: PathBuf) -> PartStore {
        PartStore {
            table_dir,
            staging_seq: AtomicU64::new(0),
        }
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    pub fn part_path(&self, part_name: &str) -> PathBuf {
        self.table_dir.join(part_name)
    }

    fn next_staging_dir(&self, kind: &str) -> String {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        format!("{TMP_PREFIX}{kind}_{seq}")
    }

    /// Writes rows into a fresh staging directory. Rows are sorted by the
    /// sort key before writing.
    pub async fn stage_part(&self, kind: &str, mut rows: Vec<Row>) -> Result<StagedPart> {
        rows.sort_by_key(|r| r.key);

        let dir_name = self.next_staging_dir(kind);
        let dir = self.table_dir.join(&dir_name);
        tokio::fs::create_dir_all(&dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;

        let mut data = String::new();
        let mut columns: Vec<String> = Vec::new();
        let mut min_expire_at = None;
        let mut max_expire_at = None;
        for row in &rows {
            data.push_str(&serde_json::to_string(row).context(SerdeJsonSnafu)?);
            data.push('\n');
            for name in row.columns.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
            if let Some(expire) = row.expire_at {
                min_expire_at = Some(min_expire_at.map_or(expire, |m: i64| m.min(expire)));
                max_expire_at = Some(max_expire_at.map_or(expire, |m: i64| m.max(expire)));
            }
        }
        columns.sort();

        let data_path = dir.join(DATA_FILE);
        tokio::fs::write(&data_path, data.as_bytes())
            .await
            .context(IoSnafu {
                path: data_path.display().to_string(),
            })?;

        Ok(StagedPart {
            dir_name,
            row_count: rows.len() as u64,
            byte_size: data.len() as u64,
            columns,
            min_expire_at,
            max_expire_at,
        })
    }

    /// Seals a staged directory under its final identity and renames it into
    /// place. Returns the metadata now on disk.
    pub async fn commit_part(
        &self,
        staged: StagedPart,
        info: PartInfo,
        applied_patch_version: i64,
    ) -> Result<PartMeta> {
        let meta = PartMeta {
            info,
            row_count: staged.row_count,
            byte_size: staged.byte_size,
            columns: staged.columns,
            min_expire_at: staged.min_expire_at,
            max_expire_at: staged.max_expire_at,
            applied_patch_version,
        };

        let dir = self.table_dir.join(&staged.dir_name);
        self.write_meta_and_checksums(&dir, &meta).await?;

        let target = self.part_path(&meta.info.part_name());
        if let Err(e) = tokio::fs::rename(&dir, &target).await {
            // Revert the precommit so a failed rename leaves no residue.
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e).context(IoSnafu {
                path: target.display().to_string(),
            });
        }
        Ok(meta)
    }

    /// Drops a staged directory without committing it.
    pub async fn abandon_part(&self, staged: StagedPart) {
        let dir = self.table_dir.join(&staged.dir_name);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    async fn write_meta_and_checksums(&self, dir: &Path, meta: &PartMeta) -> Result<()> {
        let meta_path = dir.join(META_FILE);
        let meta_text = serde_json::to_string_pretty(meta).context(SerdeJsonSnafu)?;
        tokio::fs::write(&meta_path, meta_text.as_bytes())
            .await
            .context(IoSnafu {
                path: meta_path.display().to_string(),
            })?;

        let checksums = self.compute_checksums(dir).await?;
        let checksums_path = dir.join(CHECKSUMS_FILE);
        tokio::fs::write(&checksums_path, checksums.as_bytes())
            .await
            .context(IoSnafu {
                path: checksums_path.display().to_string(),
            })?;
        Ok(())
    }

    async fn compute_checksums(&self, dir: &Path) -> Result<String> {
        let mut text = String::new();
        for file in [DATA_FILE, META_FILE] {
            let path = dir.join(file);
            let bytes = tokio::fs::read(&path).await.context(IoSnafu {
                path: path.display().to_string(),
            })?;
            text.push_str(&format!("{} {}\n", file, crc32fast::hash(&bytes)));
        }
        Ok(text)
    }

    pub async fn read_meta(&self, part_name: &str) -> Result<PartMeta> {
        let path = self.part_path(part_name).join(META_FILE);
        let text = tokio::fs::read_to_string(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&text).context(SerdeJsonSnafu)
    }

    pub async fn read_rows(&self, part_name: &str) -> Result<Vec<Row>> {
        let path = self.part_path(part_name).join(DATA_FILE);
        let text = tokio::fs::read_to_string(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        let mut rows = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(line).context(SerdeJsonSnafu)?);
        }
        Ok(rows)
    }

    /// Scans the table directory for committed parts. Directories with an
    /// unreadable meta are quarantined under `detached/broken_*`.
    pub async fn load_parts(&self) -> Result<Vec<PartMeta>> {
        let mut metas = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.table_dir).await.context(IoSnafu {
            path: self.table_dir.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: self.table_dir.display().to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() || name.parse::<PartInfo>().is_err() {
                continue;
            }
            match self.read_meta(&name).await {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    warn!("Quarantining broken part {}: {}", name, e);
                    let target = self
                        .table_dir
                        .join(DETACHED_DIR)
                        .join(format!("broken_{name}"));
                    let _ = tokio::fs::create_dir_all(self.table_dir.join(DETACHED_DIR)).await;
                    let _ = tokio::fs::rename(entry.path(), target).await;
                }
            }
        }
        Ok(metas)
    }

    /// Recomputes checksums of a part and compares them with the stored
    /// file; writes the file when absent.
    pub async fn check_part(&self, part_name: &str) -> CheckResult {
        let dir = self.part_path(part_name);
        let computed = match self.compute_checksums(&dir).await {
            Ok(c) => c,
            Err(e) => {
                return CheckResult {
                    part_name: part_name.to_string(),
                    is_ok: false,
                    message: format!("check of part finished with error: {e}"),
                }
            }
        };

        let checksums_path = dir.join(CHECKSUMS_FILE);
        match tokio::fs::read_to_string(&checksums_path).await {
            Ok(stored) if stored == computed => CheckResult {
                part_name: part_name.to_string(),
                is_ok: true,
                message: String::new(),
            },
            Ok(_) => CheckResult {
                part_name: part_name.to_string(),
                is_ok: false,
                message: "checksum mismatch".to_string(),
            },
            Err(_) => {
                // No checksums on disk, recount and persist them.
                match tokio::fs::write(&checksums_path, computed.as_bytes()).await {
                    Ok(()) => CheckResult {
                        part_name: part_name.to_string(),
                        is_ok: true,
                        message: "checksums recounted and written to disk".to_string(),
                    },
                    Err(e) => CheckResult {
                        part_name: part_name.to_string(),
                        is_ok: false,
                        message: format!("cannot write checksums: {e}"),
                    },
                }
            }
        }
    }

    /// Clones a committed part of `src` into a staging directory of this
    /// store, hardlinking the data file when possible and copying otherwise.
    pub async fn clone_part_from(
        &self,
        src: &PartStore,
        src_part_name: &str,
        kind: &str,
    ) -> Result<StagedPart> {
        let src_meta = src.read_meta(src_part_name).await?;
        let dir_name = self.next_staging_dir(kind);
        let dir = self.table_dir.join(&dir_name);
        tokio::fs::create_dir_all(&dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;

        let src_data = src.part_path(src_part_name).join(DATA_FILE);
        let dst_data = dir.join(DATA_FILE);
        if tokio::fs::hard_link(&src_data, &dst_data).await.is_err() {
            tokio::fs::copy(&src_data, &dst_data).await.context(IoSnafu {
                path: dst_data.display().to_string(),
            })?;
        }

        Ok(StagedPart {
            dir_name,
            row_count: src_meta.row_count,
            byte_size: src_meta.byte_size,
            columns: src_meta.columns,
            min_expire_at: src_meta.min_expire_at,
            max_expire_at: src_meta.max_expire_at,
        })
    }

    /// Clones a part into `detached/`.
    pub async fn detach_part(&self, part_name: &str) -> Result<()> {
        let detached = self.table_dir.join(DETACHED_DIR);
        tokio::fs::create_dir_all(&detached).await.context(IoSnafu {
            path: detached.display().to_string(),
        })?;
        let target = detached.join(part_name);
        let src = self.part_path(part_name);
        copy_dir(&src, &target).await?;
        info!("Detached part {}", part_name);
        Ok(())
    }

    /// Moves a detached part back into a staging directory, returning its
    /// staged form and the rows' statistics read from the detached meta.
    pub async fn stage_detached(&self, part_name: &str) -> Result<(StagedPart, PartMeta)> {
        let src = self.table_dir.join(DETACHED_DIR).join(part_name);
        if !src.is_dir() {
            return NoSuchDataPartSnafu { name: part_name }.fail();
        }
        let meta_path = src.join(META_FILE);
        let text = tokio::fs::read_to_string(&meta_path).await.context(IoSnafu {
            path: meta_path.display().to_string(),
        })?;
        let meta: PartMeta = serde_json::from_str(&text).context(SerdeJsonSnafu)?;

        let dir_name = self.next_staging_dir("attach");
        let dir = self.table_dir.join(&dir_name);
        tokio::fs::create_dir_all(&dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;
        let src_data = src.join(DATA_FILE);
        let dst_data = dir.join(DATA_FILE);
        tokio::fs::copy(&src_data, &dst_data).await.context(IoSnafu {
            path: dst_data.display().to_string(),
        })?;
        let _ = tokio::fs::remove_dir_all(&src).await;

        let staged = StagedPart {
            dir_name,
            row_count: meta.row_count,
            byte_size: meta.byte_size,
            columns: meta.columns.clone(),
            min_expire_at: meta.min_expire_at,
            max_expire_at: meta.max_expire_at,
        };
        Ok((staged, meta))
    }

    /// Removes leftover staging directories. Reserved prefixes are removed
    /// unconditionally; regular `tmp_*` directories only once older than
    /// `lifetime_secs`.
    pub async fn remove_temp_dirs(&self, lifetime_secs: u64) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.table_dir).await.context(IoSnafu {
            path: self.table_dir.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: self.table_dir.display().to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().to_string();
            let reserved = RESERVED_TMP_PREFIXES.iter().any(|p| name.starts_with(p));
            let temporary = name.starts_with(TMP_PREFIX);
            if !reserved && !temporary {
                continue;
            }
            if !entry.path().is_dir() {
                continue;
            }
            let old_enough = reserved
                || entry
                    .metadata()
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|t| t.elapsed().ok())
                    .map(|age| age.as_secs() >= lifetime_secs)
                    .unwrap_or(true);
            if old_enough && tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                info!("Removed temporary directory {}", name);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dst).await.context(IoSnafu {
        path: dst.display().to_string(),
    })?;
    let mut entries = tokio::fs::read_dir(src).await.context(IoSnafu {
        path: src.display().to_string(),
    })?;
    while let Some(entry) = entries.next_entry().await.context(IoSnafu {
        path: src.display().to_string(),
    })? {
        let target = dst.join(entry.file_name());
        tokio::fs::copy(entry.path(), &target).await.context(IoSnafu {
            path: target.display().to_string(),
        })?;
    }
    Ok(())
}

/// A patch applied during merges: update version, overridden columns and the
/// patch rows keyed by sort key.
#[derive(Debug, Clone)]
pub struct PatchData {
    pub version: i64,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Options of one merge over row streams. The steps compose: replacing
/// collapses equal keys first, then deduplication, then the tombstone and
/// expiration filters.
#[derive(Debug, Clone, Default)]
pub struct MergeRowsOptions {
    /// Keep only the last row per sort key.
    pub replacing: bool,
    /// Drop tombstoned rows.
    pub cleanup: bool,
    /// Deduplicate rows equal on these columns (every column when empty).
    pub deduplicate: Option<Vec<String>>,
    /// Drop rows expired at this timestamp.
    pub drop_expired_before: Option<i64>,
}

/// Merges sorted row sets of several parts into the row set of one part.
pub fn merge_rows(
    sources: Vec<Vec<Row>>,
    patches: &[PatchData],
    options: &MergeRowsOptions,
) -> Vec<Row> {
    let mut rows: Vec<(usize, Row)> = sources
        .into_iter()
        .enumerate()
        .flat_map(|(idx, rows)| rows.into_iter().map(move |r| (idx, r)))
        .collect();
    rows.sort_by(|a, b| a.1.key.cmp(&b.1.key).then(a.0.cmp(&b.0)));
    let mut rows: Vec<Row> = rows.into_iter().map(|(_, r)| r).collect();

    for patch in patches {
        apply_patch(&mut rows, patch);
    }

    if options.replacing {
        let mut replaced: Vec<Row> = Vec::with_capacity(rows.len());
        for row in rows {
            match replaced.last_mut() {
                Some(last) if last.key == row.key => *last = row,
                _ => replaced.push(row),
            }
        }
        rows = replaced;
    }

    if let Some(columns) = &options.deduplicate {
        let mut deduped: Vec<Row> = Vec::with_capacity(rows.len());
        for row in rows {
            let duplicate = deduped.last().is_some_and(|last| {
                last.key == row.key
                    && if columns.is_empty() {
                        last.columns == row.columns
                    } else {
                        columns.iter().all(|c| last.lookup(c) == row.lookup(c))
                    }
            });
            if !duplicate {
                deduped.push(row);
            }
        }
        rows = deduped;
    }

    if options.cleanup {
        rows.retain(|r| r.tombstone != Some(true));
    }

    if let Some(now) = options.drop_expired_before {
        rows.retain(|r| r.expire_at.map_or(true, |expire| expire > now));
    }

    rows
}

fn apply_patch(rows: &mut [Row], patch: &PatchData) {
    for row in rows.iter_mut() {
        let Ok(idx) = patch.rows.binary_search_by_key(&row.key, |r| r.key) else {
            continue;
        };
        let patch_row = &patch.rows[idx];
        for column in &patch.columns {
            if let Some(value) = patch_row.columns.get(column) {
                row.columns.insert(column.clone(), value.clone());
            }
        }
    }
}

/// Applies mutation commands to the rows of one part, in command order.
pub fn apply_commands(mut rows: Vec<Row>, commands: &[MutationCommand]) -> Vec<Row> {
    for command in commands {
        match command {
            MutationCommand::DeleteWhere { predicate } => {
                rows.retain(|row| !predicate.matches(|c| row.lookup(c)));
            }
            MutationCommand::UpdateSet {
                column,
                value,
                predicate,
            } => {
                for row in rows.iter_mut() {
                    if predicate.matches(|c| row.lookup(c)) {
                        row.columns.insert(column.clone(), value.clone());
                    }
                }
            }
            MutationCommand::AddColumn { name, default } => {
                for row in rows.iter_mut() {
                    row.columns
                        .entry(name.clone())
                        .or_insert_with(|| default.clone());
                }
            }
            MutationCommand::DropColumn { name } => {
                for row in rows.iter_mut() {
                    row.columns.remove(name);
                }
            }
            MutationCommand::RenameColumn { from, to } => {
                for row in rows.iter_mut() {
                    if let Some(value) = row.columns.remove(from) {
                        row.columns.insert(to.clone(), value);
                    }
                }
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mutation::command::Predicate;

    fn rows_with_values(pairs: &[(i64, i64)]) -> Vec<Row> {
        pairs
            .iter()
            .map(|(k, v)| Row::new(*k).with_column("v", json!(v)))
            .collect()
    }

    #[tokio::test]
    async fn test_stage_commit_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::new(dir.path().to_path_buf());

        let staged = store
            .stage_part("insert", rows_with_values(&[(2, 20), (1, 10)]))
            .await
            .unwrap();
        let info: PartInfo = "p_1_1_0".parse().unwrap();
        let meta = store.commit_part(staged, info.clone(), 0).await.unwrap();

        assert_eq!(2, meta.row_count);
        assert_eq!(vec!["v".to_string()], meta.columns);
        assert!(dir.path().join("p_1_1_0").is_dir());

        // Rows come back in sort key order.
        let rows = store.read_rows("p_1_1_0").await.unwrap();
        assert_eq!(vec![1, 2], rows.iter().map(|r| r.key).collect::<Vec<_>>());

        let loaded = store.load_parts().await.unwrap();
        assert_eq!(vec![meta], loaded);
    }

    #[tokio::test]
    async fn test_check_part_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::new(dir.path().to_path_buf());

        let staged = store
            .stage_part("insert", rows_with_values(&[(1, 10)]))
            .await
            .unwrap();
        store
            .commit_part(staged, "p_1_1_0".parse().unwrap(), 0)
            .await
            .unwrap();

        assert!(store.check_part("p_1_1_0").await.is_ok);

        tokio::fs::write(dir.path().join("p_1_1_0").join(DATA_FILE), b"garbage")
            .await
            .unwrap();
        let result = store.check_part("p_1_1_0").await;
        assert!(!result.is_ok);
        assert_eq!("checksum mismatch", result.message);
    }

    #[tokio::test]
    async fn test_check_part_recounts_missing_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::new(dir.path().to_path_buf());

        let staged = store
            .stage_part("insert", rows_with_values(&[(1, 10)]))
            .await
            .unwrap();
        store
            .commit_part(staged, "p_1_1_0".parse().unwrap(), 0)
            .await
            .unwrap();
        tokio::fs::remove_file(dir.path().join("p_1_1_0").join(CHECKSUMS_FILE))
            .await
            .unwrap();

        let result = store.check_part("p_1_1_0").await;
        assert!(result.is_ok);
        assert!(result.message.contains("recounted"));
        assert!(store.check_part("p_1_1_0").await.is_ok);
    }

    #[tokio::test]
    async fn test_remove_temp_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartStore::new(dir.path().to_path_buf());

        tokio::fs::create_dir(dir.path().join("tmp_merge_0")).await.unwrap();
        tokio::fs::create_dir(dir.path().join("tmp-fetch_x")).await.unwrap();
        tokio::fs::create_dir(dir.path().join("delete_tmp_y")).await.unwrap();

        // Reserved prefixes go right away, young tmp_ dirs stay.
        let removed = store.remove_temp_dirs(3600).await.unwrap();
        assert_eq!(2, removed);
        assert!(dir.path().join("tmp_merge_0").is_dir());

        let removed = store.remove_temp_dirs(0).await.unwrap();
        assert_eq!(1, removed);
    }

    #[test]
    fn test_merge_rows_ordinary() {
        let merged = merge_rows(
            vec![
                rows_with_values(&[(1, 10), (3, 30)]),
                rows_with_values(&[(2, 20)]),
            ],
            &[],
            &MergeRowsOptions::default(),
        );
        assert_eq!(vec![1, 2, 3], merged.iter().map(|r| r.key).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_rows_replacing_keeps_last() {
        let merged = merge_rows(
            vec![
                rows_with_values(&[(1, 10), (2, 20)]),
                rows_with_values(&[(2, 21)]),
            ],
            &[],
            &MergeRowsOptions {
                replacing: true,
                ..Default::default()
            },
        );
        assert_eq!(2, merged.len());
        assert_eq!(Some(json!(21)), merged[1].lookup("v"));
    }

    #[test]
    fn test_merge_rows_cleanup_drops_tombstones() {
        let mut dead = Row::new(2).with_column("v", json!(0));
        dead.tombstone = Some(true);
        let merged = merge_rows(
            vec![rows_with_values(&[(1, 10), (2, 20)]), vec![dead]],
            &[],
            &MergeRowsOptions {
                replacing: true,
                cleanup: true,
                ..Default::default()
            },
        );
        assert_eq!(vec![1], merged.iter().map(|r| r.key).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_rows_deduplicate() {
        let merged = merge_rows(
            vec![
                rows_with_values(&[(1, 10)]),
                rows_with_values(&[(1, 10), (1, 11)]),
            ],
            &[],
            &MergeRowsOptions {
                deduplicate: Some(vec![]),
                ..Default::default()
            },
        );
        assert_eq!(2, merged.len());

        let merged = merge_rows(
            vec![
                rows_with_values(&[(1, 10)]),
                rows_with_values(&[(1, 10), (1, 11)]),
            ],
            &[],
            &MergeRowsOptions {
                deduplicate: Some(vec!["key".to_string()]),
                ..Default::default()
            },
        );
        assert_eq!(1, merged.len());
    }

    #[test]
    fn test_merge_rows_deduplicate_composes_with_cleanup() {
        let mut dead = Row::new(3).with_column("v", json!(0));
        dead.tombstone = Some(true);
        let merged = merge_rows(
            vec![
                rows_with_values(&[(1, 10), (2, 20)]),
                rows_with_values(&[(2, 20)]),
                vec![dead],
            ],
            &[],
            &MergeRowsOptions {
                cleanup: true,
                deduplicate: Some(vec![]),
                ..Default::default()
            },
        );
        // The duplicate of key 2 and the tombstoned row are both gone.
        assert_eq!(vec![1, 2], merged.iter().map(|r| r.key).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_rows_drops_expired() {
        let mut expiring = Row::new(1).with_column("v", json!(1));
        expiring.expire_at = Some(100);
        let merged = merge_rows(
            vec![vec![expiring], rows_with_values(&[(2, 20)])],
            &[],
            &MergeRowsOptions {
                drop_expired_before: Some(200),
                ..Default::default()
            },
        );
        assert_eq!(vec![2], merged.iter().map(|r| r.key).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_rows_applies_patches() {
        let patch = PatchData {
            version: 9,
            columns: vec!["v".to_string()],
            rows: rows_with_values(&[(1, 99)]),
        };
        let merged = merge_rows(
            vec![rows_with_values(&[(1, 10), (2, 20)])],
            &[patch],
            &MergeRowsOptions::default(),
        );
        assert_eq!(Some(json!(99)), merged[0].lookup("v"));
        assert_eq!(Some(json!(20)), merged[1].lookup("v"));
    }

    #[test]
    fn test_apply_commands_in_order() {
        let rows = rows_with_values(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
        let commands = vec![
            MutationCommand::DeleteWhere {
                predicate: Predicate::Compare {
                    column: "key".to_string(),
                    op: crate::mutation::command::Cmp::Le,
                    value: json!(2),
                },
            },
            MutationCommand::UpdateSet {
                column: "v".to_string(),
                value: json!(0),
                predicate: Predicate::All,
            },
            MutationCommand::RenameColumn {
                from: "v".to_string(),
                to: "w".to_string(),
            },
        ];
        let mutated = apply_commands(rows, &commands);
        assert_eq!(vec![3, 4], mutated.iter().map(|r| r.key).collect::<Vec<_>>());
        assert!(mutated.iter().all(|r| r.lookup("w") == Some(json!(0))));
        assert!(mutated.iter().all(|r| r.lookup("v").is_none()));
    }
}
