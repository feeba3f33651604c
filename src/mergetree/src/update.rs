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

//! Locking gate for lightweight updates.
//!
//! Sync mode serializes updates behind one table-wide lock. Auto mode locks
//! only the columns an update writes; columns are always acquired in name
//! order so two updates can never deadlock on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, TimeoutExceededSnafu};

/// Parallelism mode of a lightweight update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// One table-wide lock for the duration of the update.
    Sync,
    /// Exclusive locks on the columns the update writes.
    #[default]
    Auto,
}

/// Per-column advisory locks of one table.
#[derive(Debug, Default)]
pub struct LightweightUpdateGate {
    sync_lock: Arc<AsyncMutex<()>>,
    columns: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Locks held by one update, released on drop.
#[derive(Debug, Default)]
pub struct UpdateLock {
    _sync: Option<OwnedMutexGuard<()>>,
    _columns: Vec<OwnedMutexGuard<()>>,
}

impl LightweightUpdateGate {
    pub fn new() -> LightweightUpdateGate {
        LightweightUpdateGate::default()
    }

    /// Grants an update exclusive access to the columns it writes.
    pub async fn lock(
        &self,
        mode: UpdateMode,
        affected_columns: &[String],
        timeout: Duration,
    ) -> Result<UpdateLock> {
        let deadline = tokio::time::Instant::now() + timeout;
        match mode {
            UpdateMode::Sync => {
                let guard = tokio::time::timeout_at(deadline, self.sync_lock.clone().lock_owned())
                    .await
                    .map_err(|_| {
                        TimeoutExceededSnafu {
                            operation: "acquiring lock for lightweight update in sync mode"
                                .to_string(),
                            timeout,
                        }
                        .build()
                    })?;
                debug!("Got lock for lightweight update in sync mode");
                Ok(UpdateLock {
                    _sync: Some(guard),
                    _columns: Vec::new(),
                })
            }
            UpdateMode::Auto => {
                let mut names: Vec<String> = affected_columns.to_vec();
                names.sort();
                names.dedup();

                let mut guards = Vec::with_capacity(names.len());
                for name in &names {
                    let column_lock = {
                        let mut columns = self.columns.lock().unwrap();
                        columns
                            .entry(name.clone())
                            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                            .clone()
                    };
                    let guard = tokio::time::timeout_at(deadline, column_lock.lock_owned())
                        .await
                        .map_err(|_| {
                            TimeoutExceededSnafu {
                                operation: format!(
                                    "acquiring lock on column {name} for lightweight update"
                                ),
                                timeout,
                            }
                            .build()
                        })?;
                    guards.push(guard);
                }
                debug!(
                    "Got lock for lightweight update in auto mode, columns: {:?}",
                    names
                );
                Ok(UpdateLock {
                    _sync: None,
                    _columns: guards,
                })
            }
        }
    }
}
