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

//! Registry of parts currently owned by a background merge or mutation.
//!
//! Tagging is a scoped acquisition: the tag is released exactly once when
//! the tagger drops, on success and failure alike. Partition drains wait on
//! the registry until no tagged part intersects their target.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{LogicalSnafu, Result, TimeoutExceededSnafu};
use crate::part::PartHandle;

#[derive(Debug, Default)]
struct RegistryInner {
    /// Tagged part name -> base partition id.
    parts: Mutex<HashMap<String, String>>,
    /// Wakes drain waiters whenever a tag is released.
    notify: Notify,
}

/// The currently-merging/mutating part set of one table.
#[derive(Debug, Clone, Default)]
pub struct ProcessingRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessingRegistry {
    pub fn new() -> ProcessingRegistry {
        ProcessingRegistry::default()
    }

    /// Tags every part of a prospective job.
    ///
    /// Tagging an already tagged part is a fatal logical error; at any
    /// instant each part belongs to at most one job.
    pub fn tag(&self, parts: &[PartHandle]) -> Result<ProcessingTagger> {
        let mut tagged = self.inner.parts.lock().unwrap();
        for part in parts {
            if tagged.contains_key(&part.name()) {
                return LogicalSnafu {
                    reason: format!("tagging already tagged part {}", part.name()),
                }
                .fail();
            }
        }
        for part in parts {
            tagged.insert(
                part.name(),
                part.info().base_partition_id().to_string(),
            );
            part.set_busy(true);
        }

        Ok(ProcessingTagger {
            inner: self.inner.clone(),
            parts: parts.to_vec(),
        })
    }

    pub fn contains(&self, part_name: &str) -> bool {
        self.inner.parts.lock().unwrap().contains_key(part_name)
    }

    pub fn len(&self) -> usize {
        self.inner.parts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tagged parts whose base partition matches.
    pub fn tagged_in_partition(&self, partition_id: &str) -> usize {
        self.inner
            .parts
            .lock()
            .unwrap()
            .values()
            .filter(|pid| pid.as_str() == partition_id)
            .count()
    }

    /// Waits until no tagged part intersects the target partition, or the
    /// whole set when `partition_id` is `None`.
    pub async fn wait_drained(
        &self,
        partition_id: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        let pending = || match partition_id {
            Some(pid) => self.tagged_in_partition(pid),
            None => self.len(),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking so releases are never missed.
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            let remaining = pending();
            if remaining == 0 {
                return Ok(());
            }
            debug!(
                "Waiting for currently running merges ({} parts are merging right now)",
                remaining
            );
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return TimeoutExceededSnafu {
                    operation: "waiting for already running merges".to_string(),
                    timeout,
                }
                .fail();
            }
        }
    }

    /// Wakes every drain waiter, used on shutdown.
    pub fn notify_all(&self) {
        self.inner.notify.notify_waiters();
    }
}

/// Scoped tag over the parts of one background job.
#[derive(Debug)]
pub struct ProcessingTagger {
    inner: Arc<RegistryInner>,
    parts: Vec<PartHandle>,
}

impl ProcessingTagger {
    pub fn parts(&self) -> &[PartHandle] {
        &self.parts
    }
}

impl Drop for ProcessingTagger {
    fn drop(&mut self) {
        let mut tagged = self.inner.parts.lock().unwrap();
        for part in &self.parts {
            // A missing tag would mean a double release.
            assert!(tagged.remove(&part.name()).is_some());
            part.set_busy(false);
        }
        drop(tagged);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::purger::NoopPurger;
    use crate::part::{PartInfo, PartMeta};

    fn part(name: &str) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: name.parse::<PartInfo>().unwrap(),
                ..Default::default()
            },
            Arc::new(NoopPurger::default()),
        )
    }

    #[test]
    fn test_tag_and_release() {
        let registry = ProcessingRegistry::new();
        let a = part("p_1_1_0");
        let b = part("p_2_2_0");

        let tagger = registry.tag(&[a.clone(), b.clone()]).unwrap();
        assert!(registry.contains("p_1_1_0"));
        assert!(a.is_busy());
        assert_eq!(2, registry.tagged_in_partition("p"));
        assert_eq!(0, registry.tagged_in_partition("q"));

        drop(tagger);
        assert!(registry.is_empty());
        assert!(!a.is_busy());
        assert!(!b.is_busy());
    }

    #[test]
    fn test_retagging_is_logical_error() {
        let registry = ProcessingRegistry::new();
        let a = part("p_1_1_0");

        let _tagger = registry.tag(&[a.clone()]).unwrap();
        let err = registry.tag(&[a]).unwrap_err();
        assert!(matches!(err, crate::error::Error::LogicalError { .. }));
        // The failed tag call must not have tagged anything extra.
        assert_eq!(1, registry.len());
    }

    #[test]
    fn test_patch_parts_drain_with_base_partition() {
        let registry = ProcessingRegistry::new();
        let patch = part("patch-p_3_3_0");
        let _tagger = registry.tag(&[patch]).unwrap();
        assert_eq!(1, registry.tagged_in_partition("p"));
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let registry = ProcessingRegistry::new();
        let a = part("p_1_1_0");
        let tagger = registry.tag(&[a]).unwrap();

        let drain_registry = registry.clone();
        let waiter = tokio::spawn(async move {
            drain_registry
                .wait_drained(Some("p"), Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(tagger);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_drained_other_partition_returns_immediately() {
        let registry = ProcessingRegistry::new();
        let a = part("p_1_1_0");
        let _tagger = registry.tag(&[a]).unwrap();

        registry
            .wait_drained(Some("q"), Duration::from_millis(10))
            .await
            .unwrap();

        let err = registry
            .wait_drained(None, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::TimeoutExceeded { .. }));
    }
}
