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

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::schedule::scheduler::SchedulerRef;

/// Request to remove a part directory.
#[derive(Debug)]
pub struct PurgeRequest {
    /// Name of the part.
    pub part_name: String,
}

/// A worker to delete part directories in background.
pub trait PartPurger: Send + Sync + fmt::Debug {
    /// Send a purge request to the background worker.
    fn send_request(&self, request: PurgeRequest);
}

pub type PartPurgerRef = Arc<dyn PartPurger>;

/// Purger that removes part directories of one table.
pub struct LocalPartPurger {
    scheduler: SchedulerRef,
    table_dir: PathBuf,
}

impl fmt::Debug for LocalPartPurger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPartPurger")
            .field("table_dir", &self.table_dir)
            .finish()
    }
}

impl LocalPartPurger {
    /// Creates a new purger.
    pub fn new(scheduler: SchedulerRef, table_dir: PathBuf) -> Self {
        Self {
            scheduler,
            table_dir,
        }
    }
}

impl PartPurger for LocalPartPurger {
    fn send_request(&self, request: PurgeRequest) {
        let path = self.table_dir.join(&request.part_name);
        let part_name = request.part_name;

        if let Err(e) = self.scheduler.schedule(Box::pin(async move {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => info!("Removed part directory, part: {}", part_name),
                Err(e) => {
                    error!("Failed to remove part directory, part: {}, err: {}", part_name, e)
                }
            }
        })) {
            error!("Failed to schedule the part purge request, err: {}", e);
        }
    }
}

/// Purger that drops requests on the floor, for tests that never touch disk.
#[derive(Debug, Default)]
pub struct NoopPurger {}

impl PartPurger for NoopPurger {
    fn send_request(&self, _request: PurgeRequest) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{PartHandle, PartMeta};
    use crate::part::info::PartInfo;
    use crate::schedule::scheduler::{LocalScheduler, Scheduler};

    #[tokio::test]
    async fn test_part_purge() {
        let dir = tempfile::tempdir().unwrap();
        let part_dir = dir.path().join("p_1_1_0");
        tokio::fs::create_dir_all(&part_dir).await.unwrap();
        tokio::fs::write(part_dir.join("data.jsonl"), b"{}\n")
            .await
            .unwrap();

        let scheduler = Arc::new(LocalScheduler::new(4, 1));
        let purger = Arc::new(LocalPartPurger::new(
            scheduler.clone(),
            dir.path().to_path_buf(),
        ));

        {
            let handle = PartHandle::new(
                PartMeta {
                    info: PartInfo::new_inserted("p", 1),
                    row_count: 1,
                    byte_size: 3,
                    ..Default::default()
                },
                purger,
            );
            // mark part as deleted and drop the handle, we expect the
            // directory to disappear.
            handle.mark_deleted();
        }

        scheduler.stop(true).await.unwrap();
        assert!(!part_dir.exists());
    }
}
