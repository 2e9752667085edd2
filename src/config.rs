use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::job::DEFAULT_JOB_TYPE;

/// What the spool handler does with a job file that fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Leave the file in `new`. It is retried on the next startup scan.
    Leave,
    /// Move the file to `error` so it is never picked up again.
    #[default]
    Quarantine,
}

/// What the dispatcher does with a running job when shutdown is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InFlightPolicy {
    /// Keep polling the running job until it terminates, then stop.
    #[default]
    Finish,
    /// Stop polling, ask the engine to kill the execution and leave the job
    /// file in `cur` for recovery on the next start.
    Abandon,
}

/// Configuration for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Queue the dispatcher serves first; other queues follow in turn
    pub job_type: String,
    /// Sleep between empty-queue checks and between execution polls
    pub poll_interval: Duration,
    /// Upper bound on how long a single execution may run
    pub max_wait: Option<Duration>,
    pub in_flight: InFlightPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            job_type: DEFAULT_JOB_TYPE.to_string(),
            poll_interval: Duration::from_secs(1),
            max_wait: None,
            in_flight: InFlightPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_in_flight(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight = policy;
        self
    }
}

/// Top-level queue manager configuration.
#[derive(Debug, Clone)]
pub struct QmConfig {
    /// Root of the `new`/`cur`/`done`/`error` spool tree
    pub spool_dir: PathBuf,
    /// Engine configuration file. Defaults to `<spool_dir>/engine.toml`.
    pub engine_config: Option<PathBuf>,
    /// Restrict execution to this engine resource
    pub resource: Option<String>,
    /// File that receives a JSON snapshot of the queues on every change
    pub queuelist: Option<PathBuf>,
    /// Job types that get a queue. Files of any other type are rejected.
    pub queue_types: Vec<String>,
    pub malformed: MalformedPolicy,
    /// Re-queue job files left in `cur` by a previous run
    pub recover_claimed: bool,
    pub dispatch: DispatchConfig,
}

impl Default for QmConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/var/spool/hrm"),
            engine_config: None,
            resource: None,
            queuelist: None,
            queue_types: vec![DEFAULT_JOB_TYPE.to_string()],
            malformed: MalformedPolicy::default(),
            recover_claimed: true,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl QmConfig {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_engine_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_config = Some(path.into());
        self
    }

    pub fn with_queue_type(mut self, job_type: impl Into<String>) -> Self {
        let job_type = job_type.into();
        if !self.queue_types.contains(&job_type) {
            self.queue_types.push(job_type);
        }
        self
    }

    pub fn with_malformed(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}
