use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{DispatchConfig, InFlightPolicy};
use crate::engine::{Engine, ExecutionHandle, ExecutionState, JobRequest, Termination};
use crate::error::{QmError, Result};
use crate::scheduler::job::JobDescription;
use crate::scheduler::queue::QueueConsumer;
use crate::spool::JobSpooler;

/// How a dispatched job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The execution reached its terminal state.
    Completed { termination: Termination, polls: u32 },
    /// The engine refused the job.
    SubmissionFailed { reason: String },
    /// The execution outlived the configured maximum wait and was killed.
    TimedOut { waited: Duration, polls: u32 },
    /// Shutdown was requested while the job ran under
    /// [`InFlightPolicy::Abandon`].
    Abandoned { polls: u32 },
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, JobOutcome::Completed { termination, .. } if termination.succeeded())
    }
}

/// Counts of job outcomes over one run of the dispatch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Abandoned { .. } => self.abandoned += 1,
            o if o.succeeded() => self.succeeded += 1,
            _ => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.abandoned
    }
}

/// Human-readable meaning of known HuCore exit codes.
pub fn exit_code_hint(code: i32) -> Option<&'static str> {
    match code {
        143 => Some("process was terminated by a signal"),
        165 => Some("the parameter file could not be parsed (missing or invalid)"),
        _ => None,
    }
}

/// Pops jobs one at a time and drives each through the engine until it is
/// terminal. At most one job is in flight.
///
/// Every queue is served in turn, starting with the configured job type; an
/// empty queue passes its turn to the next one.
pub struct Dispatcher<E: Engine> {
    engine: E,
    queues: QueueConsumer,
    spooler: JobSpooler,
    config: DispatchConfig,
    order: Vec<String>,
    cursor: usize,
}

impl<E: Engine> Dispatcher<E> {
    /// Fails with [`QmError::UnknownQueueType`] if the configured job type
    /// has no queue.
    pub async fn new(
        engine: E,
        queues: QueueConsumer,
        spooler: JobSpooler,
        config: DispatchConfig,
    ) -> Result<Self> {
        if !queues.accepts(&config.job_type).await {
            return Err(QmError::UnknownQueueType(config.job_type.clone()));
        }
        let order = service_order(&config.job_type, queues.types().await);
        Ok(Self {
            engine,
            queues,
            spooler,
            config,
            order,
            cursor: 0,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn queues(&self) -> &QueueConsumer {
        &self.queues
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation interrupts the wait for new jobs immediately. A job that
    /// is already running is handled according to the configured
    /// [`InFlightPolicy`].
    pub async fn run(&mut self, shutdown: &CancellationToken) -> DispatchReport {
        let mut report = DispatchReport::default();
        tracing::info!(job_types = ?self.order, "Dispatcher started");

        while !shutdown.is_cancelled() {
            if let Some((_, outcome)) = self.dispatch_next(shutdown).await {
                report.record(&outcome);
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "Dispatcher stopped"
        );
        report
    }

    /// Pop and run the next job, if any. Returns its uid and outcome.
    pub async fn dispatch_next(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Option<(String, JobOutcome)> {
        let job = self.pop_next().await?;
        let uid = job.uid().to_string();
        let span = tracing::info_span!("job", uid = %uid);
        let outcome = self.dispatch(job, shutdown).instrument(span).await;
        Some((uid, outcome))
    }

    /// Oldest job of the first non-empty queue, starting at the cursor.
    async fn pop_next(&mut self) -> Option<JobDescription> {
        for step in 0..self.order.len() {
            let idx = (self.cursor + step) % self.order.len();
            match self.queues.pop(&self.order[idx]).await {
                Ok(Some(job)) => {
                    self.cursor = (idx + 1) % self.order.len();
                    return Some(job);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(job_type = %self.order[idx], error = %e, "Failed to pop job"),
            }
        }
        None
    }

    async fn dispatch(&mut self, job: JobDescription, shutdown: &CancellationToken) -> JobOutcome {
        if let Ok(pending) = self.queues.snapshot(job.job_type()).await {
            tracing::debug!(
                pending = ?pending.iter().map(JobDescription::uid).collect::<Vec<_>>(),
                "Dispatching next job"
            );
        }

        let outcome = self.run_job(&job, shutdown).await;
        self.report(&job, &outcome);

        if !matches!(outcome, JobOutcome::Abandoned { .. }) {
            match self.spooler.retire(job.uid(), outcome.succeeded()).await {
                Ok(path) => tracing::debug!(path = %path.display(), "Job file retired"),
                Err(e) => tracing::warn!(error = %e, "Failed to retire job file"),
            }
        }
        outcome
    }

    async fn run_job(&mut self, job: &JobDescription, shutdown: &CancellationToken) -> JobOutcome {
        let handle = match self.engine.submit(JobRequest::from(job)).await {
            Ok(handle) => handle,
            Err(e) => {
                return JobOutcome::SubmissionFailed {
                    reason: e.to_string(),
                }
            }
        };

        let started = Instant::now();
        let mut last = handle.state();
        let mut polls = 0u32;

        loop {
            if let Err(e) = self.engine.advance().await {
                tracing::warn!(error = %e, "Engine progress step failed");
            }
            polls += 1;

            let current = handle.state();
            if current != last {
                tracing::info!(state = %current, "Job changed state");
                last = current.clone();
            }
            if let ExecutionState::Terminated(termination) = current {
                return JobOutcome::Completed { termination, polls };
            }

            if let Some(max_wait) = self.config.max_wait {
                let waited = started.elapsed();
                if waited >= max_wait {
                    let err = QmError::ExecutionTimeout {
                        uid: job.uid().to_string(),
                        waited,
                    };
                    tracing::warn!(error = %err, "Giving up on job");
                    self.kill(&handle).await;
                    return JobOutcome::TimedOut { waited, polls };
                }
            }

            match self.config.in_flight {
                InFlightPolicy::Finish => tokio::time::sleep(self.config.poll_interval).await,
                InFlightPolicy::Abandon => {
                    if shutdown.is_cancelled() {
                        self.kill(&handle).await;
                        return JobOutcome::Abandoned { polls };
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn kill(&mut self, handle: &ExecutionHandle) {
        if let Err(e) = self.engine.kill(handle).await {
            tracing::warn!(error = %e, "Failed to kill execution");
        }
    }

    fn report(&self, job: &JobDescription, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { termination, polls } => {
                let output = termination
                    .output_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                match termination.exit_code {
                    Some(0) => tracing::info!(
                        exit_code = 0,
                        output = %output,
                        polls,
                        "Job terminated"
                    ),
                    code => tracing::warn!(
                        exit_code = ?code,
                        hint = code.and_then(exit_code_hint).unwrap_or(""),
                        output = %output,
                        polls,
                        "Job terminated unsuccessfully"
                    ),
                }
            }
            JobOutcome::SubmissionFailed { reason } => {
                tracing::error!(user = %job.user(), reason = %reason, "Job failed to start");
            }
            JobOutcome::TimedOut { waited, .. } => {
                tracing::warn!(waited = ?waited, "Job marked failed after timeout");
            }
            JobOutcome::Abandoned { .. } => {
                tracing::warn!("Job abandoned on shutdown, job file left for recovery");
            }
        }
    }
}

/// `primary` first, then the remaining types in their queue set order.
fn service_order(primary: &str, types: Vec<String>) -> Vec<String> {
    std::iter::once(primary.to_string())
        .chain(types.into_iter().filter(|t| t != primary))
        .collect()
}
