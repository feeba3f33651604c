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

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{JobQueueFullSnafu, JoinSnafu, Result, SchedulerStoppedSnafu};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

const STATE_RUNNING: u8 = 0;
const STATE_STOP: u8 = 1;
const STATE_AWAIT_TERMINATION: u8 = 2;

/// [Scheduler] defines a set of API to schedule Jobs
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedules a Job
    fn schedule(&self, job: Job) -> Result<()>;

    /// Stops scheduler
    async fn stop(&self, await_termination: bool) -> Result<()>;
}

pub type SchedulerRef = Arc<dyn Scheduler>;

/// Runs background jobs on a fixed pool of consumer tasks fed by a bounded
/// queue.
pub struct LocalScheduler {
    sender: Mutex<Option<flume::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Token used to halt the scheduler
    cancel_token: CancellationToken,
    /// State of scheduler.
    state: Arc<AtomicU8>,
}

impl LocalScheduler {
    /// `cap`: capacity of the job queue.
    /// `num`: the number of consumer tasks.
    pub fn new(cap: usize, num: usize) -> Self {
        let (tx, rx) = flume::bounded(cap);
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));

        let mut handles = Vec::with_capacity(num);

        for _ in 0..num {
            let child = token.child_token();
            let receiver = rx.clone();
            let state = Arc::clone(&state);
            let handle = tokio::spawn(async move {
                while state.load(Ordering::Relaxed) == STATE_RUNNING {
                    tokio::select! {
                        _ = child.cancelled() => {
                            break;
                        }
                        job = receiver.recv_async() => {
                            let Ok(job) = job else {
                                break;
                            };
                            job.await;
                        }
                    }
                }
                // Drain the queue before terminating when asked to.
                if state.load(Ordering::Relaxed) == STATE_AWAIT_TERMINATION {
                    while let Ok(job) = receiver.try_recv() {
                        job.await;
                    }
                }
            });
            handles.push(handle);
        }

        Self {
            sender: Mutex::new(Some(tx)),
            cancel_token: token,
            handles: Mutex::new(handles),
            state,
        }
    }

    #[inline]
    fn running(&self) -> bool {
        self.state.load(Ordering::Relaxed) == STATE_RUNNING
    }
}

#[async_trait::async_trait]
impl Scheduler for LocalScheduler {
    fn schedule(&self, job: Job) -> Result<()> {
        if !self.running() {
            return SchedulerStoppedSnafu {}.fail();
        }
        let sender = self.sender.lock().unwrap();
        let Some(tx) = sender.as_ref() else {
            return SchedulerStoppedSnafu {}.fail();
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => JobQueueFullSnafu {}.fail(),
            Err(flume::TrySendError::Disconnected(_)) => SchedulerStoppedSnafu {}.fail(),
        }
    }

    async fn stop(&self, await_termination: bool) -> Result<()> {
        let state = if await_termination {
            STATE_AWAIT_TERMINATION
        } else {
            STATE_STOP
        };
        self.state.store(state, Ordering::Relaxed);
        self.cancel_token.cancel();
        let _ = self.sender.lock().unwrap().take();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            handle.await.context(JoinSnafu)?;
        }
        Ok(())
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        self.state.store(STATE_STOP, Ordering::Relaxed);
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI32;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;

    #[tokio::test]
    async fn test_schedule_runs_jobs() {
        let sum = Arc::new(AtomicI32::new(0));
        let scheduler = LocalScheduler::new(16, 2);

        for _ in 0..10 {
            let sum = Arc::clone(&sum);
            scheduler
                .schedule(Box::pin(async move {
                    sum.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        scheduler.stop(true).await.unwrap();

        assert_eq!(10, sum.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_stop_without_termination_discards_pending() {
        let sum = Arc::new(AtomicI32::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let scheduler = LocalScheduler::new(16, 1);

        let gate = barrier.clone();
        scheduler
            .schedule(Box::pin(async move {
                gate.wait().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }))
            .unwrap();
        for _ in 0..5 {
            let sum = Arc::clone(&sum);
            scheduler
                .schedule(Box::pin(async move {
                    sum.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }

        barrier.wait().await;
        scheduler.stop(false).await.unwrap();
        assert_eq!(0, sum.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_schedule_after_stop_fails() {
        let scheduler = LocalScheduler::new(4, 1);
        scheduler.stop(true).await.unwrap();

        let result = scheduler.schedule(Box::pin(async {}));
        assert!(result.is_err());
    }
}
