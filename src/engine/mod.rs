//! Boundary to the execution engine that actually runs jobs.
//!
//! The dispatcher only talks to the [`Engine`] trait:
//! - **submit** a [`JobRequest`] and get an [`ExecutionHandle`] back
//! - **advance** the engine one bookkeeping step (start, poll, collect)
//! - observe the handle's [`ExecutionState`] until it is terminal
//!
//! Engines publish state changes through an [`ExecutionReporter`], the
//! sending half of a `tokio::sync::watch` channel created by
//! [`execution_channel`].
//!
//! [`LocalEngine`] runs each job as a child process on the local machine.

pub mod local;

pub use local::LocalEngine;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::JobDescription;

/// Final facts about an execution. Only exists once it has terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// `None` when the process was killed or its status could not be read
    pub exit_code: Option<i32>,
    pub output_dir: Option<PathBuf>,
}

impl Termination {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    NotSubmitted,
    Submitted,
    Running,
    Terminated(Termination),
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Terminated(_))
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::NotSubmitted => write!(f, "not-submitted"),
            ExecutionState::Submitted => write!(f, "submitted"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Terminated(_) => write!(f, "terminated"),
        }
    }
}

/// Read side of one execution, held by the dispatcher.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: Uuid,
    uid: String,
    state: watch::Receiver<ExecutionState>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Uid of the job this execution runs.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn state(&self) -> ExecutionState {
        self.state.borrow().clone()
    }
}

/// Write side of one execution, held by the engine.
#[derive(Debug)]
pub struct ExecutionReporter {
    id: Uuid,
    state: watch::Sender<ExecutionState>,
}

impl ExecutionReporter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn report(&self, state: ExecutionState) {
        self.state.send_replace(state);
    }

    pub fn current(&self) -> ExecutionState {
        self.state.borrow().clone()
    }
}

/// Create the reporter/handle pair for a new execution of job `uid`.
/// The state starts as [`ExecutionState::NotSubmitted`].
pub fn execution_channel(uid: impl Into<String>) -> (ExecutionReporter, ExecutionHandle) {
    let id = Uuid::new_v4();
    let (tx, rx) = watch::channel(ExecutionState::NotSubmitted);
    (
        ExecutionReporter { id, state: tx },
        ExecutionHandle {
            id,
            uid: uid.into(),
            state: rx,
        },
    )
}

/// What the engine needs to run a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub uid: String,
    pub user: String,
    pub template: String,
    pub input_files: Vec<PathBuf>,
}

impl From<&JobDescription> for JobRequest {
    fn from(job: &JobDescription) -> Self {
        Self {
            uid: job.uid().to_string(),
            user: job.user().to_string(),
            template: job.template().to_string(),
            input_files: job.input_files().to_vec(),
        }
    }
}

/// An execution target known to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    /// Working area the engine stages executions in
    pub resource_dir: PathBuf,
    pub enabled: bool,
}

#[async_trait]
pub trait Engine: Send {
    /// Restrict submissions to the named resource.
    fn select_resource(&mut self, name: &str) -> Result<()>;

    fn list_resources(&self) -> Vec<Resource>;

    /// Hand a job to the engine. Fails with
    /// [`QmError::EngineSubmission`](crate::error::QmError::EngineSubmission)
    /// when the job cannot be started.
    async fn submit(&mut self, request: JobRequest) -> Result<ExecutionHandle>;

    /// One bookkeeping step for all executions in flight.
    async fn advance(&mut self) -> Result<()>;

    /// Stop an execution. It terminates without an exit code.
    async fn kill(&mut self, handle: &ExecutionHandle) -> Result<()>;
}

/// A resource directory holding leftovers from an earlier run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncleanResource {
    pub name: String,
    pub resource_dir: PathBuf,
    pub entries: Vec<String>,
}

/// Pre-flight check: every resource directory that exists must be empty.
pub fn check_resource_dirs(resources: &[Resource]) -> std::result::Result<(), Vec<UncleanResource>> {
    let mut unclean = Vec::new();
    for resource in resources {
        tracing::info!(
            resource = %resource.name,
            resource_dir = %resource.resource_dir.display(),
            "Checking resource directory"
        );
        let entries = match std::fs::read_dir(&resource.resource_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                unclean.push(UncleanResource {
                    name: resource.name.clone(),
                    resource_dir: resource.resource_dir.clone(),
                    entries: vec![format!("<unreadable: {e}>")],
                });
                continue;
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        if !names.is_empty() {
            names.sort();
            unclean.push(UncleanResource {
                name: resource.name.clone(),
                resource_dir: resource.resource_dir.clone(),
                entries: names,
            });
        }
    }
    if unclean.is_empty() {
        Ok(())
    } else {
        Err(unclean)
    }
}
