//! Shared helpers for the spool and dispatch integration tests.
//!
//! Provides a throw-away spool tree, job file writers and a scripted engine
//! whose executions walk through a fixed list of states.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use hrm_qm::engine::{
    execution_channel, Engine, ExecutionHandle, ExecutionReporter, ExecutionState, JobRequest,
    Resource, Termination,
};
use hrm_qm::error::{QmError, Result};
use hrm_qm::spool::{JobSpooler, SpoolDir};

pub const SCRIPTED_RESOURCE: &str = "scripted";

/// A spool tree under a temporary directory, removed on drop.
pub struct TestSpool {
    dir: TempDir,
    spooler: JobSpooler,
}

impl TestSpool {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let spooler = JobSpooler::new(dir.path().join("spool"), None).unwrap();
        Self { dir, spooler }
    }

    pub fn spooler(&self) -> JobSpooler {
        self.spooler.clone()
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, dir: SpoolDir, name: &str) -> PathBuf {
        self.spooler.dir(dir).join(name)
    }

    /// Write a job file into `new` the way producers must: into a hidden
    /// temporary file first, then renamed into place.
    pub fn write_jobfile(&self, name: &str, contents: &str) -> PathBuf {
        let target = self.path(SpoolDir::New, name);
        let tmp = self.path(SpoolDir::New, &format!(".{name}.part"));
        std::fs::write(&tmp, contents).unwrap();
        std::fs::rename(&tmp, &target).unwrap();
        target
    }

    /// Write a job file directly into `dir`, bypassing the watcher.
    pub fn place(&self, dir: SpoolDir, name: &str, contents: &str) -> PathBuf {
        let target = self.path(dir, name);
        std::fs::write(&target, contents).unwrap();
        target
    }

    /// Sorted file names in `dir`.
    pub fn files(&self, dir: SpoolDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.spooler.dir(dir))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// A well-formed job file of the default type.
pub fn jobfile(user: &str, template: &str, inputs: &[&str]) -> String {
    let mut text = format!(
        "[header]\nversion = 3\nusername = {user}\n\n[job]\ntemplate = {template}\n\n[inputfiles]\n"
    );
    for (i, input) in inputs.iter().enumerate() {
        text.push_str(&format!("file{} = {}\n", i + 1, input));
    }
    text
}

/// A well-formed job file with an explicit `type`.
pub fn typed_jobfile(job_type: &str, inputs: &[&str]) -> String {
    jobfile("alice", "deconv.tcl", inputs).replace("[job]\n", &format!("[job]\ntype = {job_type}\n"))
}

#[derive(Debug, Default)]
pub struct EngineLog {
    pub submitted: Vec<String>,
    pub advances: usize,
    pub killed: Vec<String>,
}

struct ScriptedExecution {
    reporter: ExecutionReporter,
    steps: VecDeque<ExecutionState>,
}

/// Engine whose executions move through a scripted list of states, one per
/// `advance`. An exhausted script leaves the execution in its last state.
pub struct ScriptedEngine {
    default_script: Vec<ExecutionState>,
    scripts: HashMap<String, Vec<ExecutionState>>,
    failing: HashSet<String>,
    running: Vec<ScriptedExecution>,
    log: Arc<Mutex<EngineLog>>,
}

pub fn terminated(exit_code: i32) -> ExecutionState {
    ExecutionState::Terminated(Termination {
        exit_code: Some(exit_code),
        output_dir: None,
    })
}

impl ScriptedEngine {
    /// Every job runs for two polls and then exits with 0.
    pub fn new() -> Self {
        Self {
            default_script: vec![ExecutionState::Running, ExecutionState::Running, terminated(0)],
            scripts: HashMap::new(),
            failing: HashSet::new(),
            running: Vec::new(),
            log: Arc::new(Mutex::new(EngineLog::default())),
        }
    }

    pub fn with_script(mut self, uid: &str, steps: Vec<ExecutionState>) -> Self {
        self.scripts.insert(uid.to_string(), steps);
        self
    }

    /// The job never terminates on its own.
    pub fn with_hung(self, uid: &str) -> Self {
        self.with_script(uid, vec![ExecutionState::Running])
    }

    pub fn with_failing(mut self, uid: &str) -> Self {
        self.failing.insert(uid.to_string());
        self
    }

    pub fn log(&self) -> Arc<Mutex<EngineLog>> {
        self.log.clone()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn select_resource(&mut self, name: &str) -> Result<()> {
        if name == SCRIPTED_RESOURCE {
            Ok(())
        } else {
            Err(QmError::UnknownResource(name.to_string()))
        }
    }

    fn list_resources(&self) -> Vec<Resource> {
        vec![Resource {
            name: SCRIPTED_RESOURCE.to_string(),
            resource_dir: PathBuf::from("/nonexistent/scripted"),
            enabled: true,
        }]
    }

    async fn submit(&mut self, request: JobRequest) -> Result<ExecutionHandle> {
        self.log.lock().unwrap().submitted.push(request.uid.clone());
        if self.failing.contains(&request.uid) {
            return Err(QmError::EngineSubmission {
                uid: request.uid,
                reason: "scripted failure".to_string(),
            });
        }
        let steps = self
            .scripts
            .get(&request.uid)
            .unwrap_or(&self.default_script)
            .clone();
        let (reporter, handle) = execution_channel(request.uid);
        reporter.report(ExecutionState::Submitted);
        self.running.push(ScriptedExecution {
            reporter,
            steps: steps.into(),
        });
        Ok(handle)
    }

    async fn advance(&mut self) -> Result<()> {
        self.log.lock().unwrap().advances += 1;
        for execution in &mut self.running {
            if let Some(state) = execution.steps.pop_front() {
                execution.reporter.report(state);
            }
        }
        self.running.retain(|e| !e.reporter.current().is_terminal());
        Ok(())
    }

    async fn kill(&mut self, handle: &ExecutionHandle) -> Result<()> {
        self.log.lock().unwrap().killed.push(handle.uid().to_string());
        if let Some(pos) = self.running.iter().position(|e| e.reporter.id() == handle.id()) {
            let execution = self.running.remove(pos);
            execution.reporter.report(ExecutionState::Terminated(Termination {
                exit_code: None,
                output_dir: None,
            }));
        }
        Ok(())
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
