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

//! Allocation of committing block numbers.
//!
//! A committing block is an allocated but not-yet-visible sequence number.
//! It is held from allocation until the write it represents becomes visible
//! or is abandoned; the release happens on guard drop so every exit path is
//! covered. Allocation order is visibility order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Result, TimeoutExceededSnafu};

/// Kind of the write a committing block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Insert,
    Mutation,
    Update,
    NewPart,
}

/// An allocated, in-flight block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittingBlock {
    pub op: BlockOp,
    pub number: i64,
}

#[derive(Debug)]
struct AllocatorInner {
    /// In-flight blocks by number.
    committing: Mutex<AllocatorState>,
    /// Wakes settle-waiters whenever a block is released.
    notify: Notify,
}

#[derive(Debug)]
struct AllocatorState {
    next: i64,
    blocks: BTreeMap<i64, BlockOp>,
}

/// Monotonic generator of committing block numbers for one table.
#[derive(Debug, Clone)]
pub struct BlockNumberAllocator {
    inner: Arc<AllocatorInner>,
}

impl Default for BlockNumberAllocator {
    fn default() -> Self {
        BlockNumberAllocator::new()
    }
}

impl BlockNumberAllocator {
    pub fn new() -> BlockNumberAllocator {
        BlockNumberAllocator {
            inner: Arc::new(AllocatorInner {
                committing: Mutex::new(AllocatorState {
                    next: 1,
                    blocks: BTreeMap::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Raises the next number above everything seen during startup.
    pub fn seed(&self, max_seen: i64) {
        let mut state = self.inner.committing.lock().unwrap();
        state.next = state.next.max(max_seen + 1);
    }

    /// Allocates the next block number; the returned guard releases it on
    /// drop and wakes settle-waiters.
    pub fn allocate(&self, op: BlockOp) -> CommittingBlockGuard {
        let number = {
            let mut state = self.inner.committing.lock().unwrap();
            let number = state.next;
            state.next += 1;
            state.blocks.insert(number, op);
            number
        };
        debug!("Allocated block number {}", number);

        CommittingBlockGuard {
            inner: self.inner.clone(),
            block: CommittingBlock { op, number },
        }
    }

    /// Waits until every in-flight block with number strictly less than
    /// `below` for which `exempt` returns false has been released.
    ///
    /// Lightweight updates pass `exempt = |op| op == BlockOp::Update` so they
    /// observe all prior inserts and mutations without waiting on each other.
    pub async fn wait_until_settled<F>(
        &self,
        below: i64,
        timeout: Duration,
        exempt: F,
    ) -> Result<()>
    where
        F: Fn(BlockOp) -> bool,
    {
        let settled = || {
            let state = self.inner.committing.lock().unwrap();
            state
                .blocks
                .range(..below)
                .all(|(_, op)| exempt(*op))
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before checking, releases between the check and the
            // await must not be missed.
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if settled() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return TimeoutExceededSnafu {
                    operation: format!(
                        "waiting for inserts and mutations to commit up to block number {below}"
                    ),
                    timeout,
                }
                .fail();
            }
        }
    }

    /// Numbers of all in-flight blocks, for introspection.
    pub fn committing_blocks(&self) -> Vec<CommittingBlock> {
        let state = self.inner.committing.lock().unwrap();
        state
            .blocks
            .iter()
            .map(|(number, op)| CommittingBlock {
                op: *op,
                number: *number,
            })
            .collect()
    }
}

/// Scoped acquisition of a committing block.
#[derive(Debug)]
pub struct CommittingBlockGuard {
    inner: Arc<AllocatorInner>,
    block: CommittingBlock,
}

impl CommittingBlockGuard {
    pub fn number(&self) -> i64 {
        self.block.number
    }

    pub fn op(&self) -> BlockOp {
        self.block.op
    }
}

impl Drop for CommittingBlockGuard {
    fn drop(&mut self) {
        let mut state = self.inner.committing.lock().unwrap();
        state.blocks.remove(&self.block.number);
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_monotonic() {
        let allocator = BlockNumberAllocator::new();
        let b1 = allocator.allocate(BlockOp::Insert);
        let b2 = allocator.allocate(BlockOp::Mutation);
        let b3 = allocator.allocate(BlockOp::NewPart);
        assert!(b1.number() < b2.number());
        assert!(b2.number() < b3.number());

        assert_eq!(3, allocator.committing_blocks().len());
        drop(b2);
        assert_eq!(2, allocator.committing_blocks().len());
    }

    #[test]
    fn test_seed_skips_used_numbers() {
        let allocator = BlockNumberAllocator::new();
        allocator.seed(41);
        let block = allocator.allocate(BlockOp::Insert);
        assert_eq!(42, block.number());
    }

    #[tokio::test]
    async fn test_wait_until_settled() {
        let allocator = BlockNumberAllocator::new();
        let insert = allocator.allocate(BlockOp::Insert);
        let update = allocator.allocate(BlockOp::Update);
        let below = update.number();

        let wait_allocator = allocator.clone();
        let waiter = tokio::spawn(async move {
            wait_allocator
                .wait_until_settled(below, Duration::from_secs(5), |op| op == BlockOp::Update)
                .await
        });

        // The waiter must not finish while the insert is in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(insert);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_settled_ignores_exempt_ops() {
        let allocator = BlockNumberAllocator::new();
        let _other_update = allocator.allocate(BlockOp::Update);
        let update = allocator.allocate(BlockOp::Update);

        // Another in-flight update does not block the wait.
        allocator
            .wait_until_settled(update.number(), Duration::from_millis(100), |op| {
                op == BlockOp::Update
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_settled_times_out() {
        let allocator = BlockNumberAllocator::new();
        let insert = allocator.allocate(BlockOp::Insert);

        let err = allocator
            .wait_until_settled(insert.number() + 1, Duration::from_millis(20), |_| false)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::TimeoutExceeded { .. }));
    }
}
