use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::{Child, Command};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::engine::{
    execution_channel, Engine, ExecutionHandle, ExecutionReporter, ExecutionState, JobRequest,
    Resource, Termination,
};
use crate::error::{QmError, Result};

const INPUTS_PLACEHOLDER: &str = "{inputs}";

/// On-disk engine configuration.
///
/// ```toml
/// output_dir = "/data/hrm/output"
///
/// [[resource]]
/// name = "localhost"
/// command = "hucore -noExecLog -template {template}"
/// resourcedir = "$HOME/.hrm/resource.d"
/// enabled = true
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineFile {
    output_dir: String,
    #[serde(default, rename = "resource")]
    resources: Vec<ResourceFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceFile {
    name: String,
    command: String,
    #[serde(rename = "resourcedir")]
    resource_dir: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone)]
struct LocalResource {
    name: String,
    command: Vec<String>,
    resource_dir: PathBuf,
    enabled: bool,
}

#[derive(Debug)]
struct LocalExecution {
    uid: String,
    child: Child,
    scratch: PathBuf,
    reporter: ExecutionReporter,
}

/// Runs jobs as child processes on the local machine.
///
/// Each execution gets a scratch directory `<resourcedir>/<uid>-<id>` as its
/// working directory, with stdout and stderr captured to `stdout.log` and
/// `stderr.log`. When the process exits the scratch directory is moved to
/// `<output_dir>/<uid>`, which becomes the execution's output location.
#[derive(Debug)]
pub struct LocalEngine {
    resources: Vec<LocalResource>,
    selected: Option<String>,
    output_dir: PathBuf,
    executions: HashMap<Uuid, LocalExecution>,
}

impl LocalEngine {
    /// Load the engine from its TOML configuration file.
    pub async fn from_config_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| config_error(path, e.to_string()))?;
        Self::from_config_str(path, &text)
    }

    /// Build the engine from configuration text. `path` is only used for
    /// error reporting.
    pub fn from_config_str(path: &Path, text: &str) -> Result<Self> {
        let file: EngineFile =
            toml::from_str(text).map_err(|e| config_error(path, e.to_string()))?;

        let output_dir = expand_path(path, "output_dir", &file.output_dir)?;

        let mut resources = Vec::with_capacity(file.resources.len());
        for resource in file.resources {
            let command: Vec<String> = resource
                .command
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if command.is_empty() {
                return Err(config_error(
                    path,
                    format!("resource '{}' has no command", resource.name),
                ));
            }
            if resources.iter().any(|r: &LocalResource| r.name == resource.name) {
                return Err(config_error(
                    path,
                    format!("resource '{}' is defined twice", resource.name),
                ));
            }
            let resource_dir = expand_path(path, "resourcedir", &resource.resource_dir)?;
            resources.push(LocalResource {
                name: resource.name,
                command,
                resource_dir,
                enabled: resource.enabled,
            });
        }

        if resources.is_empty() {
            return Err(config_error(path, "no [[resource]] table"));
        }

        Ok(Self {
            resources,
            selected: None,
            output_dir,
            executions: HashMap::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Number of executions that have not terminated yet.
    pub fn in_flight(&self) -> usize {
        self.executions.len()
    }

    fn target_resource(&self) -> Option<&LocalResource> {
        match &self.selected {
            Some(name) => self.resources.iter().find(|r| &r.name == name),
            None => self.resources.iter().find(|r| r.enabled),
        }
    }

    async fn finish(&self, execution: LocalExecution, exit_code: Option<i32>) {
        let output_dir = match collect_output(&self.output_dir, &execution).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(
                    uid = %execution.uid,
                    scratch = %execution.scratch.display(),
                    error = %e,
                    "Failed to move output, leaving it in the resource directory"
                );
                execution.scratch.clone()
            }
        };

        tracing::info!(
            uid = %execution.uid,
            exit_code = ?exit_code,
            output_dir = %output_dir.display(),
            "Execution terminated"
        );

        execution
            .reporter
            .report(ExecutionState::Terminated(Termination {
                exit_code,
                output_dir: Some(output_dir),
            }));
    }
}

#[async_trait]
impl Engine for LocalEngine {
    fn select_resource(&mut self, name: &str) -> Result<()> {
        if !self.resources.iter().any(|r| r.name == name) {
            return Err(QmError::UnknownResource(name.to_string()));
        }
        self.selected = Some(name.to_string());
        Ok(())
    }

    fn list_resources(&self) -> Vec<Resource> {
        self.resources
            .iter()
            .map(|r| Resource {
                name: r.name.clone(),
                resource_dir: r.resource_dir.clone(),
                enabled: r.enabled,
            })
            .collect()
    }

    async fn submit(&mut self, request: JobRequest) -> Result<ExecutionHandle> {
        let uid = request.uid.clone();
        let submission_error = |reason: String| QmError::EngineSubmission {
            uid: uid.clone(),
            reason,
        };

        let resource = self
            .target_resource()
            .cloned()
            .ok_or_else(|| submission_error("no enabled resource".to_string()))?;

        for input in &request.input_files {
            if !tokio::fs::try_exists(input).await.unwrap_or(false) {
                return Err(submission_error(format!(
                    "input file {} does not exist",
                    input.display()
                )));
            }
        }

        let (reporter, handle) = execution_channel(&uid);
        let scratch = resource
            .resource_dir
            .join(format!("{}-{}", uid, handle.id().simple()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| submission_error(format!("cannot create {}: {e}", scratch.display())))?;

        let child = match spawn(&resource.command, &request, &scratch) {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                return Err(submission_error(e.to_string()));
            }
        };

        tracing::info!(
            uid = %uid,
            resource = %resource.name,
            execution_id = %handle.id(),
            "Job submitted"
        );
        reporter.report(ExecutionState::Submitted);
        self.executions.insert(
            handle.id(),
            LocalExecution {
                uid,
                child,
                scratch,
                reporter,
            },
        );
        Ok(handle)
    }

    async fn advance(&mut self) -> Result<()> {
        let mut exited = Vec::new();
        for (id, execution) in self.executions.iter_mut() {
            match execution.child.try_wait() {
                Ok(Some(status)) => exited.push((*id, status.code())),
                Ok(None) => {
                    if execution.reporter.current() != ExecutionState::Running {
                        execution.reporter.report(ExecutionState::Running);
                    }
                }
                Err(e) => {
                    tracing::warn!(uid = %execution.uid, error = %e, "Failed to poll execution");
                    exited.push((*id, None));
                }
            }
        }

        for (id, exit_code) in exited {
            if let Some(execution) = self.executions.remove(&id) {
                self.finish(execution, exit_code).await;
            }
        }
        Ok(())
    }

    async fn kill(&mut self, handle: &ExecutionHandle) -> Result<()> {
        let Some(mut execution) = self.executions.remove(&handle.id()) else {
            return Ok(());
        };
        tracing::warn!(uid = %execution.uid, "Killing execution");
        if let Err(e) = execution.child.kill().await {
            tracing::warn!(uid = %execution.uid, error = %e, "Failed to kill execution");
        }
        self.finish(execution, None).await;
        Ok(())
    }
}

fn spawn(template: &[String], request: &JobRequest, scratch: &Path) -> std::io::Result<Child> {
    let args = build_args(template, request, scratch);
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| std::io::Error::other("empty command"))?;

    let stdout = std::fs::File::create(scratch.join("stdout.log"))?;
    let stderr = std::fs::File::create(scratch.join("stderr.log"))?;

    Command::new(program)
        .args(rest)
        .current_dir(scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
}

/// Expand the resource command for one job.
///
/// `{template}`, `{user}`, `{uid}` and `{scratch}` are substituted inside any
/// argument; an argument that is exactly `{inputs}` becomes one argument per
/// input file.
fn build_args(template: &[String], request: &JobRequest, scratch: &Path) -> Vec<String> {
    let mut args = Vec::with_capacity(template.len() + request.input_files.len());
    for arg in template {
        if arg == INPUTS_PLACEHOLDER {
            args.extend(
                request
                    .input_files
                    .iter()
                    .map(|f| f.to_string_lossy().into_owned()),
            );
            continue;
        }
        args.push(
            arg.replace("{template}", &request.template)
                .replace("{user}", &request.user)
                .replace("{uid}", &request.uid)
                .replace("{scratch}", &scratch.to_string_lossy()),
        );
    }
    args
}

async fn collect_output(output_root: &Path, execution: &LocalExecution) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(output_root).await?;
    let mut target = output_root.join(&execution.uid);
    if tokio::fs::try_exists(&target).await? {
        target = output_root.join(format!(
            "{}-{}",
            execution.uid,
            execution.reporter.id().simple()
        ));
    }
    move_dir(&execution.scratch, &target).await?;
    Ok(target)
}

/// Move a directory tree. When `from` and `to` are on different filesystems
/// the tree is copied and the source removed.
async fn move_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            tracing::debug!(from = %from.display(), to = %to.display(), "Copying output across filesystems");
            let (src, dst) = (from.to_path_buf(), to.to_path_buf());
            let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
                .await
                .map_err(std::io::Error::other)?;
            if let Err(e) = copied {
                let _ = tokio::fs::remove_dir_all(to).await;
                return Err(e);
            }
            tokio::fs::remove_dir_all(from).await
        }
        other => other,
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn config_error(path: &Path, reason: impl Into<String>) -> QmError {
    QmError::EngineConfig {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references. An unset variable
/// is a configuration error.
fn expand_path(path: &Path, field: &str, raw: &str) -> Result<PathBuf> {
    if raw.trim().is_empty() {
        return Err(config_error(path, format!("{field} is empty")));
    }
    shellexpand::full(raw)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| config_error(path, format!("{field}: {e}")))
}
