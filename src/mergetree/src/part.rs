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

//! Structures to describe metadata and lifecycle of parts.

pub mod info;
pub mod purger;
pub mod set;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use crate::part::info::{Level, PartInfo, PATCH_PART_PREFIX};
use crate::part::purger::{PartPurgerRef, PurgeRequest};

/// Lifecycle state of a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    /// Member of the visible working set.
    Active,
    /// Replaced by a covering part or dropped; kept until the grace window
    /// passes and no snapshot references it.
    Outdated,
    /// Scheduled for removal from disk.
    Deleting,
}

/// Metadata of a part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartMeta {
    /// Identity of the part.
    pub info: PartInfo,
    /// Number of rows stored.
    pub row_count: u64,
    /// Size of the data file in bytes.
    pub byte_size: u64,
    /// Names of the value columns present in the part.
    pub columns: Vec<String>,
    /// Earliest row expiration timestamp, if any row carries one.
    pub min_expire_at: Option<i64>,
    /// Latest row expiration timestamp, if any row carries one.
    pub max_expire_at: Option<i64>,
    /// Highest patch-part version materialized into this part.
    pub applied_patch_version: i64,
}

impl Default for PartMeta {
    fn default() -> Self {
        PartMeta {
            info: PartInfo::new_inserted("all", 0),
            row_count: 0,
            byte_size: 0,
            columns: Vec::new(),
            min_expire_at: None,
            max_expire_at: None,
            applied_patch_version: 0,
        }
    }
}

impl PartMeta {
    pub fn is_patch(&self) -> bool {
        self.info.is_patch()
    }

    /// Whether some rows of the part are past their expiration at `now`.
    pub fn has_expired_rows(&self, now: i64) -> bool {
        self.min_expire_at.map(|min| min <= now).unwrap_or(false)
    }
}

/// Handle to a part.
///
/// The handle shares ownership of the descriptor; once the last reference
/// to a part marked deleted goes away the backing directory is purged.
#[derive(Clone)]
pub struct PartHandle {
    inner: Arc<PartHandleInner>,
}

impl fmt::Debug for PartHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartHandle")
            .field("name", &self.name())
            .field("rows", &self.inner.meta.row_count)
            .field("busy", &self.is_busy())
            .field("deleted", &self.inner.deleted.load(Ordering::Relaxed))
            .finish()
    }
}

impl PartHandle {
    pub fn new(meta: PartMeta, purger: PartPurgerRef) -> PartHandle {
        PartHandle {
            inner: Arc::new(PartHandleInner::new(meta, purger)),
        }
    }

    pub fn info(&self) -> &PartInfo {
        &self.inner.meta.info
    }

    pub fn meta(&self) -> &PartMeta {
        &self.inner.meta
    }

    pub fn name(&self) -> String {
        self.inner.meta.info.part_name()
    }

    pub fn partition_id(&self) -> &str {
        &self.inner.meta.info.partition_id
    }

    pub fn data_version(&self) -> i64 {
        self.inner.meta.info.data_version()
    }

    pub fn row_count(&self) -> u64 {
        self.inner.meta.row_count
    }

    pub fn byte_size(&self) -> u64 {
        self.inner.meta.byte_size
    }

    /// Whether a background job currently owns the part.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Relaxed)
    }

    pub fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::Relaxed);
    }

    /// Mark the file as deleted and delete it on drop asynchronously.
    pub fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Relaxed);
    }

    /// Whether this handle is the only remaining reference to the part.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Unix seconds when the part left the active set, zero while active.
    pub fn remove_time(&self) -> i64 {
        self.inner.remove_time.load(Ordering::Relaxed)
    }

    pub fn set_remove_time(&self, secs: i64) {
        self.inner.remove_time.store(secs, Ordering::Relaxed);
    }
}

/// Inner data of [PartHandle].
struct PartHandleInner {
    meta: PartMeta,
    busy: AtomicBool,
    deleted: AtomicBool,
    remove_time: AtomicI64,
    purger: PartPurgerRef,
}

impl Drop for PartHandleInner {
    fn drop(&mut self) {
        if self.deleted.load(Ordering::Relaxed) {
            self.purger.send_request(PurgeRequest {
                part_name: self.meta.info.part_name(),
            });
        }
    }
}

impl PartHandleInner {
    fn new(meta: PartMeta, purger: PartPurgerRef) -> PartHandleInner {
        PartHandleInner {
            meta,
            busy: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            remove_time: AtomicI64::new(0),
            purger,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::purger::PartPurger;
    use super::*;

    #[derive(Debug, Default)]
    struct RecordingPurger {
        purged: Mutex<Vec<String>>,
    }

    impl PartPurger for RecordingPurger {
        fn send_request(&self, request: PurgeRequest) {
            self.purged.lock().unwrap().push(request.part_name);
        }
    }

    #[test]
    fn test_purge_on_drop() {
        let purger = Arc::new(RecordingPurger::default());
        let meta = PartMeta {
            info: PartInfo::new_inserted("p", 1),
            ..Default::default()
        };

        {
            let handle = PartHandle::new(meta.clone(), purger.clone());
            let other = handle.clone();
            other.mark_deleted();
        }
        assert_eq!(vec!["p_1_1_0".to_string()], *purger.purged.lock().unwrap());

        {
            let _handle = PartHandle::new(meta, purger.clone());
            // Not marked deleted, nothing to purge.
        }
        assert_eq!(1, purger.purged.lock().unwrap().len());
    }
}
