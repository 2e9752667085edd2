use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::MalformedPolicy;
use crate::error::{QmError, Result};
use crate::scheduler::job::JobDescription;
use crate::scheduler::queue::QueueProducer;
use crate::spool::spooler::{is_hidden, JobSpooler, SpoolDir};

/// Result of handling one file event.
#[derive(Debug)]
pub enum Ingest {
    /// The job was claimed into `cur` and appended to its queue.
    Queued { uid: String, job_type: String },
    /// Nothing to do: hidden file, directory, or a file that is already gone.
    Ignored,
    /// The file was not queued.
    Rejected(QmError),
}

impl Ingest {
    pub fn is_queued(&self) -> bool {
        matches!(self, Ingest::Queued { .. })
    }
}

/// Turns job files appearing in the spool into queued jobs.
#[derive(Debug)]
pub struct EventHandler {
    spooler: JobSpooler,
    queues: QueueProducer,
    malformed: MalformedPolicy,
}

impl EventHandler {
    pub fn new(spooler: JobSpooler, queues: QueueProducer, malformed: MalformedPolicy) -> Self {
        Self {
            spooler,
            queues,
            malformed,
        }
    }

    pub fn queues(&self) -> &QueueProducer {
        &self.queues
    }

    /// Parse a new job file, claim it into `cur/<uid>.cfg` and queue it.
    ///
    /// Safe to call more than once for the same path: once the file has
    /// been claimed it is no longer in `new` and later calls are ignored.
    pub async fn handle(&self, path: &Path) -> Ingest {
        if !self.is_candidate(path).await {
            return Ingest::Ignored;
        }
        tracing::info!(path = %path.display(), "Found new job file, processing");

        let job = match JobDescription::from_file(path).await {
            Ok(job) => job,
            Err(QmError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ingest::Ignored,
            Err(e) => {
                tracing::warn!(error = %e, "Error parsing job file");
                if self.malformed == MalformedPolicy::Quarantine {
                    self.quarantine(path).await;
                }
                return Ingest::Rejected(e);
            }
        };
        tracing::debug!(job = ?job, "Job file parsed");

        if !self.queues.accepts(job.job_type()).await {
            let err = QmError::UnknownQueueType(job.job_type().to_string());
            tracing::error!(uid = %job.uid(), error = %err, "Rejecting job");
            self.quarantine(path).await;
            return Ingest::Rejected(err);
        }

        match self.spooler.claim(path, job.uid()).await {
            Ok(_) => {}
            Err(QmError::Io(e)) if e.kind() == ErrorKind::NotFound => return Ingest::Ignored,
            Err(err @ QmError::DuplicateJob(_)) => {
                tracing::warn!(uid = %job.uid(), error = %err, "Rejecting job");
                self.quarantine(path).await;
                return Ingest::Rejected(err);
            }
            Err(err) => {
                tracing::error!(uid = %job.uid(), error = %err, "Failed to claim job file");
                return Ingest::Rejected(err);
            }
        }

        self.enqueue(job).await
    }

    /// Re-queue job files left in `cur` by a previous run, oldest first.
    /// Returns how many were queued.
    pub async fn recover_claimed(&self) -> usize {
        let files = match self.spooler.pending_files(SpoolDir::Cur).await {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list claimed job files");
                return 0;
            }
        };

        let mut recovered = 0;
        for path in files {
            let job = match JobDescription::from_file(&path).await {
                Ok(job) if self.spooler.claimed_path(job.uid()) == path => job,
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "Claimed job file is not recoverable");
                    self.quarantine(&path).await;
                    continue;
                }
            };
            if !self.queues.accepts(job.job_type()).await {
                tracing::warn!(uid = %job.uid(), job_type = %job.job_type(), "No queue for recovered job");
                self.quarantine(&path).await;
                continue;
            }
            if self.enqueue(job).await.is_queued() {
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "Recovered claimed jobs from previous run");
        }
        recovered
    }

    async fn enqueue(&self, job: JobDescription) -> Ingest {
        let uid = job.uid().to_string();
        let job_type = job.job_type().to_string();
        if let Err(e) = self.queues.append(job).await {
            tracing::error!(uid = %uid, error = %e, "Failed to queue job");
            return Ingest::Rejected(e);
        }
        tracing::info!(uid = %uid, job_type = %job_type, "Job queued");
        Ingest::Queued { uid, job_type }
    }

    async fn is_candidate(&self, path: &Path) -> bool {
        if is_hidden(path) {
            return false;
        }
        matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
    }

    async fn quarantine(&self, path: &Path) {
        match self.spooler.quarantine(path).await {
            Ok(target) => {
                tracing::warn!(path = %path.display(), to = %target.display(), "Job file quarantined")
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Failed to quarantine job file")
            }
        }
    }
}

/// Watches the `new` spool directory and feeds every created file to an
/// [`EventHandler`].
///
/// Notifications are pushed into an unbounded channel from the notify
/// callback and handled one at a time by a single task, so bursts are
/// queued rather than dropped. Files already present when the watch starts
/// are handled first, oldest first.
pub struct SpoolWatcher {
    watcher: RecommendedWatcher,
    dir: PathBuf,
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl SpoolWatcher {
    pub fn start(handler: EventHandler, shutdown: &CancellationToken) -> Result<Self> {
        let new_dir = handler.spooler.dir(SpoolDir::New);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for path in created_paths(event) {
                        if let Err(e) = tx.send(path) {
                            tracing::debug!(path = %e.0.display(), "Watcher task gone, dropping event");
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(&new_dir, RecursiveMode::NonRecursive)?;
        tracing::info!(dir = %new_dir.display(), "Watching spool directory");

        let stop = shutdown.child_token();
        let task = tokio::spawn(
            Self::process(handler, rx, stop.clone()).instrument(tracing::info_span!("watcher")),
        );

        Ok(Self {
            watcher,
            dir: new_dir,
            task,
            stop,
        })
    }

    async fn process(
        handler: EventHandler,
        mut rx: mpsc::UnboundedReceiver<PathBuf>,
        stop: CancellationToken,
    ) {
        match handler.spooler.pending_files(SpoolDir::New).await {
            Ok(existing) => {
                for path in existing {
                    if stop.is_cancelled() {
                        return;
                    }
                    handler.handle(&path).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to scan spool directory"),
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                path = rx.recv() => match path {
                    Some(path) => {
                        handler.handle(&path).await;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Watcher task stopped");
    }

    /// Stop receiving notifications and wait for the current event to finish.
    pub async fn stop(self) {
        let Self {
            mut watcher,
            dir,
            task,
            stop,
        } = self;
        if let Err(e) = watcher.unwatch(&dir) {
            tracing::debug!(error = %e, "Failed to remove watch");
        }
        drop(watcher);
        stop.cancel();
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Watcher task failed");
        }
    }
}

/// Paths that became visible in the watched directory: created files and
/// files renamed into it.
fn created_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        // Paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).collect()
        }
        _ => Vec::new(),
    }
}
