//! Single-consumer job queue.
//!
//! Jobs run one at a time on a dedicated consumer task, highest priority first
//! and FIFO within a priority. The queue tracks an estimate of the bytes held
//! by waiting and running jobs; producers wait once that estimate would exceed
//! the configured ceiling. Pausing stops further dequeues without touching the
//! job that is already running.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::JobQueueError;

/// A unit of deferred work.
pub struct Job {
    action: BoxFuture<'static, ()>,
    priority: i32,
    size: usize,
}

impl Job {
    /// `size` is the caller's estimate of the memory the job pins while queued.
    pub fn new<F>(action: F, priority: i32, size: usize) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            action: Box::pin(action),
            priority,
            size,
        }
    }
}

struct Pending {
    action: BoxFuture<'static, ()>,
    priority: i32,
    seq: u64,
    budget: OwnedSemaphorePermit,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Max-heap: higher priority wins, then the earlier sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<Pending>,
    next_seq: u64,
    paused: bool,
    disposed: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    wake: Notify,
    budget: Arc<Semaphore>,
    max_permits: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct JobQueue {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create the queue and start its consumer. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Self {
        let max_permits = u32::try_from(max_bytes.max(1)).unwrap_or(u32::MAX);
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            budget: Arc::new(Semaphore::new(max_permits as usize)),
            max_permits,
        });
        let consumer = tokio::spawn(consume(Arc::clone(&shared)));
        Self {
            shared,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Queue a job, waiting while the queue is over its byte ceiling.
    ///
    /// A job larger than the whole ceiling is admitted once the queue has
    /// drained completely.
    pub async fn queue_job(&self, job: Job) -> Result<(), JobQueueError> {
        if self.shared.lock().disposed {
            return Err(JobQueueError::Disposed);
        }

        let permits = u32::try_from(job.size)
            .unwrap_or(u32::MAX)
            .clamp(1, self.shared.max_permits);
        let budget = Arc::clone(&self.shared.budget)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| JobQueueError::Disposed)?;

        {
            let mut state = self.shared.lock();
            if state.disposed {
                return Err(JobQueueError::Disposed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(Pending {
                action: job.action,
                priority: job.priority,
                seq,
                budget,
            });
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Stop dequeuing. A job that is already running finishes normally.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
        debug!(queue = %self.shared.name, "job queue paused");
    }

    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.wake.notify_one();
        debug!(queue = %self.shared.name, "job queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Drop every job that has not started yet. Returns how many were dropped.
    pub fn discard_pending(&self) -> usize {
        let dropped = std::mem::take(&mut self.shared.lock().pending);
        dropped.len()
    }

    /// Reject further jobs and stop the consumer once the running job ends.
    pub fn dispose(&self) {
        {
            let mut state = self.shared.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.pending.clear();
        }
        self.shared.budget.close();
        self.shared.wake.notify_one();
        debug!(queue = %self.shared.name, "job queue disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// Dispose and wait for the consumer task to exit.
    pub async fn shutdown(&self) {
        self.dispose();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn consume(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut state = shared.lock();
            if state.disposed {
                break;
            }
            if state.paused {
                None
            } else {
                state.pending.pop()
            }
        };

        let Some(job) = next else {
            shared.wake.notified().await;
            continue;
        };

        let Pending {
            action,
            priority,
            seq,
            budget,
        } = job;
        // Run on its own task so a panicking job cannot take the consumer down.
        if let Err(e) = tokio::spawn(action).await {
            error!(queue = %shared.name, priority, seq, error = %e, "job panicked");
        }
        drop(budget);
    }
    debug!(queue = %shared.name, "job queue consumer stopped");
}
