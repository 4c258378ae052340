use super::error::ValidationError;
use super::job::Job;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::time::SystemTime;
use tokio::sync::Mutex;

const DEAD_LETTER_CAPACITY: usize = 256;

/// A job retired after exhausting its placement attempts.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: String,
    pub retired_at: SystemTime,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<Job>,
    /// Ids of every job the queue is responsible for, including jobs
    /// dequeued by the scheduler whose decision is still in flight.
    owned: HashSet<String>,
    dead_letters: VecDeque<DeadLetter>,
}

/// FIFO buffer of jobs awaiting placement.
///
/// Every operation takes the lock once and never awaits while holding it.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new job, returning the queue length after the append.
    pub async fn submit(&self, job: Job) -> Result<usize, ValidationError> {
        let mut inner = self.inner.lock().await;
        if !inner.owned.insert(job.id.clone()) {
            return Err(ValidationError::DuplicateId(job.id));
        }
        inner.pending.push_back(job);
        Ok(inner.pending.len())
    }

    /// Removes the oldest job without blocking on an empty queue.
    ///
    /// The job stays owned by the queue until it is re-queued, retired or
    /// dead-lettered, so its id cannot be submitted a second time meanwhile.
    pub async fn try_dequeue(&self) -> Option<Job> {
        self.inner.lock().await.pending.pop_front()
    }

    /// Puts a previously dequeued job back at the tail.
    pub async fn requeue(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        inner.owned.insert(job.id.clone());
        inner.pending.push_back(job);
    }

    /// Releases a dispatched job.
    pub async fn retire(&self, job_id: &str) {
        self.inner.lock().await.owned.remove(job_id);
    }

    pub async fn dead_letter(&self, job: Job, reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.owned.remove(&job.id);
        if inner.dead_letters.len() == DEAD_LETTER_CAPACITY {
            inner.dead_letters.pop_front();
        }
        inner.dead_letters.push_back(DeadLetter {
            job,
            reason: reason.into(),
            retired_at: SystemTime::now(),
        });
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    pub async fn pending(&self) -> Vec<Job> {
        self.inner.lock().await.pending.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead_letters.iter().cloned().collect()
    }
}
