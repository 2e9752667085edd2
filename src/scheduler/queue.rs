use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::{QmError, Result};
use crate::scheduler::job::JobDescription;

/// FIFO of pending jobs of a single type.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<JobDescription>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job at the tail.
    pub fn append(&mut self, job: JobDescription) {
        self.jobs.push_back(job);
    }

    /// Remove and return the oldest job, `None` when empty.
    pub fn pop(&mut self) -> Option<JobDescription> {
        self.jobs.pop_front()
    }

    pub fn peek(&self) -> Option<&JobDescription> {
        self.jobs.front()
    }

    /// Clone of the pending jobs, oldest first.
    pub fn snapshot(&self) -> Vec<JobDescription> {
        self.jobs.iter().cloned().collect()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.jobs.iter().any(|j| j.uid() == uid)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Job queues keyed by job type.
///
/// The set of types is fixed at construction: a job whose type has no queue
/// is rejected with [`QmError::UnknownQueueType`].
#[derive(Debug, Default)]
pub struct QueueSet {
    queues: BTreeMap<String, JobQueue>,
}

impl QueueSet {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: types
                .into_iter()
                .map(|t| (t.into(), JobQueue::new()))
                .collect(),
        }
    }

    pub fn has_type(&self, job_type: &str) -> bool {
        self.queues.contains_key(job_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn queue(&self, job_type: &str) -> Result<&JobQueue> {
        self.queues
            .get(job_type)
            .ok_or_else(|| QmError::UnknownQueueType(job_type.to_string()))
    }

    pub fn append(&mut self, job: JobDescription) -> Result<()> {
        let queue = self
            .queues
            .get_mut(job.job_type())
            .ok_or_else(|| QmError::UnknownQueueType(job.job_type().to_string()))?;
        queue.append(job);
        Ok(())
    }

    pub fn pop(&mut self, job_type: &str) -> Result<Option<JobDescription>> {
        self.queues
            .get_mut(job_type)
            .map(JobQueue::pop)
            .ok_or_else(|| QmError::UnknownQueueType(job_type.to_string()))
    }

    /// Pending jobs of every queue, keyed by type.
    pub fn snapshot_all(&self) -> BTreeMap<String, Vec<JobDescription>> {
        self.queues
            .iter()
            .map(|(t, q)| (t.clone(), q.snapshot()))
            .collect()
    }

    /// Total number of pending jobs across all queues.
    pub fn len(&self) -> usize {
        self.queues.values().map(JobQueue::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split the set into its writing and reading handles.
    ///
    /// When `queuelist` is set, every mutation rewrites a JSON snapshot of all
    /// queues to that path.
    pub fn split(self, queuelist: Option<PathBuf>) -> (QueueProducer, QueueConsumer) {
        let shared = Arc::new(Shared {
            queues: RwLock::new(self),
            revision: AtomicU64::new(0),
            queuelist,
            written: Mutex::new(0),
        });
        (
            QueueProducer {
                shared: shared.clone(),
            },
            QueueConsumer { shared },
        )
    }
}

type Listing = BTreeMap<String, Vec<JobDescription>>;

#[derive(Debug)]
struct Shared {
    queues: RwLock<QueueSet>,
    /// Bumped on every mutation, while the write lock is held.
    revision: AtomicU64,
    queuelist: Option<PathBuf>,
    /// Revision of the last listing written to `queuelist`.
    written: Mutex<u64>,
}

impl Shared {
    /// Record a mutation of `set`. Must be called with the write lock held;
    /// the returned listing is written by [`Shared::publish`] after the lock
    /// is released.
    fn stage(&self, set: &QueueSet) -> Option<(u64, Listing)> {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        self.queuelist
            .as_ref()
            .map(|_| (revision, set.snapshot_all()))
    }

    /// Write a staged listing unless a newer one has been written already.
    async fn publish(&self, staged: Option<(u64, Listing)>) {
        let (Some(path), Some((revision, listing))) = (&self.queuelist, staged) else {
            return;
        };
        let mut written = self.written.lock().await;
        if revision <= *written {
            return;
        }
        match write_queuelist(path, &listing).await {
            Ok(()) => *written = revision,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write queue list")
            }
        }
    }

    async fn snapshot(&self, job_type: &str) -> Result<Vec<JobDescription>> {
        Ok(self.queues.read().await.queue(job_type)?.snapshot())
    }
}

async fn write_queuelist(path: &Path, listing: &Listing) -> Result<()> {
    let json = serde_json::to_vec_pretty(listing)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Appending side of the queues, held by the spool event handler.
#[derive(Debug)]
pub struct QueueProducer {
    shared: Arc<Shared>,
}

impl QueueProducer {
    pub async fn accepts(&self, job_type: &str) -> bool {
        self.shared.queues.read().await.has_type(job_type)
    }

    pub async fn append(&self, job: JobDescription) -> Result<()> {
        let staged = {
            let mut queues = self.shared.queues.write().await;
            let uid = job.uid().to_string();
            let job_type = job.job_type().to_string();
            queues.append(job)?;
            tracing::debug!(
                uid = %uid,
                job_type = %job_type,
                pending = queues.queue(&job_type).map(JobQueue::len).unwrap_or(0),
                "Job queued"
            );
            self.shared.stage(&queues)
        };
        self.shared.publish(staged).await;
        Ok(())
    }

    pub async fn snapshot(&self, job_type: &str) -> Result<Vec<JobDescription>> {
        self.shared.snapshot(job_type).await
    }
}

/// Popping side of the queues, held by the dispatcher.
#[derive(Debug)]
pub struct QueueConsumer {
    shared: Arc<Shared>,
}

impl QueueConsumer {
    pub async fn accepts(&self, job_type: &str) -> bool {
        self.shared.queues.read().await.has_type(job_type)
    }

    /// Take the oldest job of `job_type`. Returns immediately with `None`
    /// when the queue is empty.
    pub async fn pop(&self, job_type: &str) -> Result<Option<JobDescription>> {
        let (job, staged) = {
            let mut queues = self.shared.queues.write().await;
            let job = queues.pop(job_type)?;
            let staged = job.as_ref().and_then(|_| self.shared.stage(&queues));
            (job, staged)
        };
        self.shared.publish(staged).await;
        Ok(job)
    }

    /// Types with a queue, in the order the set keeps them.
    pub async fn types(&self) -> Vec<String> {
        self.shared.queues.read().await.types().map(str::to_string).collect()
    }

    pub async fn snapshot(&self, job_type: &str) -> Result<Vec<JobDescription>> {
        self.shared.snapshot(job_type).await
    }

    pub async fn snapshot_all(&self) -> BTreeMap<String, Vec<JobDescription>> {
        self.shared.queues.read().await.snapshot_all()
    }

    pub async fn len(&self) -> usize {
        self.shared.queues.read().await.len()
    }
}
