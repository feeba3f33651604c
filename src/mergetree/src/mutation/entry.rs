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

//! One persisted mutation entry and its line-oriented file format.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use snafu::ResultExt;
use tracing::debug;

use crate::error::{InvalidMutationFileSnafu, IoSnafu, Result};
use crate::mutation::command::MutationCommand;

const FORMAT_VERSION: u32 = 1;

const MUTATION_FILE_PREFIX: &str = "mutation_";
const TMP_MUTATION_FILE_PREFIX: &str = "tmp_mutation_";
const MUTATION_FILE_SUFFIX: &str = ".txt";

/// Failure record of the latest attempt to apply an entry to some part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LatestFail {
    pub part: String,
    pub reason: String,
    pub error_code: String,
    /// Unix seconds.
    pub time: i64,
}

/// Persistent record of a not-yet-applied-everywhere transformation.
#[derive(Debug, Clone)]
pub struct MutationEntry {
    /// Block number doubling as the mutation version.
    pub block_number: i64,
    /// Commands shared with selection and jobs without copying.
    pub commands: Arc<Vec<MutationCommand>>,
    pub create_time: DateTime<Utc>,
    /// Transaction that created the entry, if any.
    pub tid: Option<u64>,
    /// Commit sequence number assigned by the transaction log, if any.
    pub csn: Option<u64>,
    pub latest_fail: Option<LatestFail>,
    /// Every active part reached this version; maintained in memory only.
    pub is_done: bool,
}

impl MutationEntry {
    pub fn new(commands: Vec<MutationCommand>, tid: Option<u64>, block_number: i64) -> Self {
        MutationEntry {
            block_number,
            commands: Arc::new(commands),
            create_time: Utc::now(),
            tid,
            csn: None,
            latest_fail: None,
            is_done: false,
        }
    }

    pub fn file_name(&self) -> String {
        version_to_file_name(self.block_number)
    }

    /// Serializes the entry into the line-oriented text format. Round-trips
    /// through [MutationEntry::from_file_text] for backup/restore.
    pub fn to_file_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("format version: {FORMAT_VERSION}\n"));
        text.push_str(&format!(
            "create time: {}\n",
            self.create_time.to_rfc3339()
        ));
        text.push_str(&format!("commands: {}\n", self.commands.len()));
        for command in self.commands.iter() {
            text.push_str(&command.to_string());
            text.push('\n');
        }
        if let Some(tid) = self.tid {
            text.push_str(&format!("tid: {tid}\n"));
        }
        if let Some(csn) = self.csn {
            text.push_str(&format!("csn: {csn}\n"));
        }
        if let Some(fail) = &self.latest_fail {
            text.push_str(&format!("latest failed part: {}\n", fail.part));
            text.push_str(&format!("latest fail time: {}\n", fail.time));
            text.push_str(&format!(
                "latest fail reason: {}\n",
                fail.reason.replace('\n', " ")
            ));
            text.push_str(&format!("latest fail error code: {}\n", fail.error_code));
        }
        text
    }

    pub fn from_file_text(path: &str, block_number: i64, text: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            InvalidMutationFileSnafu {
                path,
                reason: reason.to_string(),
            }
            .build()
        };

        let mut lines = text.lines();
        let format_line = lines.next().ok_or_else(|| invalid("empty file"))?;
        let format: u32 = format_line
            .strip_prefix("format version: ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| invalid("missing format version"))?;
        if format != FORMAT_VERSION {
            return Err(invalid(&format!("unsupported format version {format}")));
        }

        let create_time = lines
            .next()
            .and_then(|l| l.strip_prefix("create time: "))
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| invalid("missing create time"))?;

        let count: usize = lines
            .next()
            .and_then(|l| l.strip_prefix("commands: "))
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| invalid("missing command count"))?;

        let mut commands = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines.next().ok_or_else(|| invalid("truncated commands"))?;
            commands.push(
                line.parse::<MutationCommand>()
                    .map_err(|e| invalid(&e.to_string()))?,
            );
        }

        let mut entry = MutationEntry {
            block_number,
            commands: Arc::new(commands),
            create_time,
            tid: None,
            csn: None,
            latest_fail: None,
            is_done: false,
        };

        let mut fail = LatestFail::default();
        let mut has_fail = false;
        for line in lines {
            if let Some(v) = line.strip_prefix("tid: ") {
                entry.tid = v.parse().ok();
            } else if let Some(v) = line.strip_prefix("csn: ") {
                entry.csn = v.parse().ok();
            } else if let Some(v) = line.strip_prefix("latest failed part: ") {
                fail.part = v.to_string();
                has_fail = true;
            } else if let Some(v) = line.strip_prefix("latest fail time: ") {
                fail.time = v.parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("latest fail reason: ") {
                fail.reason = v.to_string();
            } else if let Some(v) = line.strip_prefix("latest fail error code: ") {
                fail.error_code = v.to_string();
            } else if !line.is_empty() {
                return Err(invalid(&format!("unexpected line: {line}")));
            }
        }
        if has_fail {
            entry.latest_fail = Some(fail);
        }

        Ok(entry)
    }

    /// Writes the entry under `dir` through a temporary file and an atomic
    /// rename, so loads never observe a torn entry.
    pub async fn commit_file(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!(
            "{TMP_MUTATION_FILE_PREFIX}{}{MUTATION_FILE_SUFFIX}",
            self.block_number
        ));
        let target = dir.join(self.file_name());

        tokio::fs::write(&tmp, self.to_file_text())
            .await
            .context(IoSnafu {
                path: tmp.display().to_string(),
            })?;
        tokio::fs::rename(&tmp, &target).await.context(IoSnafu {
            path: target.display().to_string(),
        })?;
        debug!("Committed mutation entry {}", self.file_name());
        Ok(())
    }

    /// Rewrites the entry file in place, used when a failure record or CSN
    /// changes. The entry must have been committed before.
    pub async fn rewrite_file(&self, dir: &Path) -> Result<()> {
        self.commit_file(dir).await
    }

    pub async fn remove_file(&self, dir: &Path) -> Result<()> {
        let path = dir.join(self.file_name());
        tokio::fs::remove_file(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let version = try_parse_file_name(name).ok_or_else(|| {
            InvalidMutationFileSnafu {
                path: path.display().to_string(),
                reason: "not a mutation file name".to_string(),
            }
            .build()
        })?;
        let text = tokio::fs::read_to_string(path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Self::from_file_text(&path.display().to_string(), version, &text)
    }
}

pub fn version_to_file_name(version: i64) -> String {
    format!("{MUTATION_FILE_PREFIX}{version}{MUTATION_FILE_SUFFIX}")
}

/// Parses `mutation_<version>.txt`, returning the version.
pub fn try_parse_file_name(name: &str) -> Option<i64> {
    name.strip_prefix(MUTATION_FILE_PREFIX)?
        .strip_suffix(MUTATION_FILE_SUFFIX)?
        .parse()
        .ok()
}

/// Whether a directory entry name is a leftover temporary mutation file.
pub fn is_tmp_mutation_file(name: &str) -> bool {
    name.starts_with(TMP_MUTATION_FILE_PREFIX)
}

/// Backup representation of one entry: file name plus exact file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBackupEntry {
    pub file_name: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mutation::command::Predicate;

    fn sample_commands() -> Vec<MutationCommand> {
        vec![
            MutationCommand::DeleteWhere {
                predicate: Predicate::All,
            },
            MutationCommand::UpdateSet {
                column: "v".to_string(),
                value: json!(5),
                predicate: Predicate::All,
            },
        ]
    }

    #[test]
    fn test_file_name_roundtrip() {
        assert_eq!("mutation_42.txt", version_to_file_name(42));
        assert_eq!(Some(42), try_parse_file_name("mutation_42.txt"));
        assert_eq!(None, try_parse_file_name("mutation_.txt"));
        assert_eq!(None, try_parse_file_name("tmp_mutation_42.txt"));
        assert_eq!(None, try_parse_file_name("202401_1_1_0"));
    }

    #[test]
    fn test_entry_text_roundtrip() {
        let mut entry = MutationEntry::new(sample_commands(), Some(7), 42);
        entry.csn = Some(99);
        entry.latest_fail = Some(LatestFail {
            part: "p_1_1_0".to_string(),
            reason: "boom\nsecond line".to_string(),
            error_code: "NOT_ENOUGH_SPACE".to_string(),
            time: 1700000000,
        });

        let text = entry.to_file_text();
        let parsed = MutationEntry::from_file_text("mutation_42.txt", 42, &text).unwrap();

        assert_eq!(entry.block_number, parsed.block_number);
        assert_eq!(*entry.commands, *parsed.commands);
        assert_eq!(entry.create_time, parsed.create_time);
        assert_eq!(entry.tid, parsed.tid);
        assert_eq!(entry.csn, parsed.csn);
        let fail = parsed.latest_fail.unwrap();
        assert_eq!("boom second line", fail.reason);
        assert_eq!("NOT_ENOUGH_SPACE", fail.error_code);
    }

    #[test]
    fn test_rejects_malformed_text() {
        assert!(MutationEntry::from_file_text("f", 1, "").is_err());
        assert!(MutationEntry::from_file_text("f", 1, "format version: 2\n").is_err());

        let text = "format version: 1\ncreate time: 2024-01-01T00:00:00+00:00\ncommands: 2\nDELETE WHERE TRUE\n";
        assert!(MutationEntry::from_file_text("f", 1, text).is_err());
    }

    #[tokio::test]
    async fn test_commit_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let entry = MutationEntry::new(sample_commands(), None, 7);
        entry.commit_file(dir.path()).await.unwrap();

        let loaded = MutationEntry::load(&dir.path().join("mutation_7.txt"))
            .await
            .unwrap();
        assert_eq!(7, loaded.block_number);
        assert_eq!(*entry.commands, *loaded.commands);

        entry.remove_file(dir.path()).await.unwrap();
        assert!(!dir.path().join("mutation_7.txt").exists());
    }
}
