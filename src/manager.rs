use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::QmConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::scheduler::{DispatchReport, Dispatcher, QueueSet};
use crate::spool::{EventHandler, JobSpooler, SpoolWatcher};

/// What a finished run left behind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub report: DispatchReport,
    /// Uids still queued at shutdown. Their files stay in `cur`.
    pub remaining: Vec<String>,
}

/// Wires the spool, the queues, the watcher and the dispatcher together.
pub struct QueueManager<E: Engine> {
    config: QmConfig,
    spooler: JobSpooler,
    engine: E,
}

impl<E: Engine> QueueManager<E> {
    pub fn new(config: QmConfig, spooler: JobSpooler, engine: E) -> Self {
        Self {
            config,
            spooler,
            engine,
        }
    }

    pub fn spooler(&self) -> &JobSpooler {
        &self.spooler
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Startup order:
    /// 1. Build one queue per configured job type
    /// 2. Create the dispatcher (fails fast on an unknown dispatch type)
    /// 3. Re-queue job files left in `cur` by a previous run, if enabled
    /// 4. Start watching `new` (existing files are picked up first)
    /// 5. Run the dispatch loop in the current task
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher's job type has no queue or the
    /// watch on `new` cannot be registered. Per-job failures are logged and
    /// never end the run.
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunSummary> {
        let (producer, consumer) = QueueSet::new(self.config.queue_types.iter().cloned())
            .split(self.config.queuelist.clone());

        let mut dispatcher = Dispatcher::new(
            self.engine,
            consumer,
            self.spooler.clone(),
            self.config.dispatch.clone(),
        )
        .await?;

        let handler = EventHandler::new(self.spooler.clone(), producer, self.config.malformed);
        if self.config.recover_claimed {
            handler.recover_claimed().await;
        }
        let watcher = SpoolWatcher::start(handler, &shutdown)?;

        let report = dispatcher
            .run(&shutdown)
            .instrument(tracing::info_span!("dispatch"))
            .await;

        watcher.stop().await;

        let remaining: Vec<String> = dispatcher
            .queues()
            .snapshot_all()
            .await
            .into_values()
            .flatten()
            .map(|job| job.uid().to_string())
            .collect();
        if !remaining.is_empty() {
            tracing::warn!(
                remaining = ?remaining,
                "Jobs still queued at shutdown, they will be recovered on next start"
            );
        }

        Ok(RunSummary { report, remaining })
    }
}
