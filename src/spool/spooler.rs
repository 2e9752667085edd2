use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;

use crate::error::{QmError, Result};

/// Extension given to claimed job files.
pub const JOBFILE_EXTENSION: &str = "cfg";

const ENGINE_CONFIG_NAME: &str = "engine.toml";

/// Lifecycle stages of a job file, one subdirectory each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpoolDir {
    New,
    Cur,
    Done,
    Error,
}

impl SpoolDir {
    pub const ALL: [SpoolDir; 4] = [SpoolDir::New, SpoolDir::Cur, SpoolDir::Done, SpoolDir::Error];

    pub fn name(&self) -> &'static str {
        match self {
            SpoolDir::New => "new",
            SpoolDir::Cur => "cur",
            SpoolDir::Done => "done",
            SpoolDir::Error => "error",
        }
    }
}

impl fmt::Display for SpoolDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owns the spool directory tree and every move of a job file within it.
#[derive(Debug, Clone)]
pub struct JobSpooler {
    root: PathBuf,
    engine_config: PathBuf,
}

impl JobSpooler {
    /// Validate the layout under `root`, creating missing subdirectories.
    pub fn new(root: impl Into<PathBuf>, engine_config: Option<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in SpoolDir::ALL {
            let path = root.join(dir.name());
            std::fs::create_dir_all(&path).map_err(|source| QmError::SpoolLayout {
                path: path.clone(),
                source,
            })?;
            let meta = std::fs::metadata(&path).map_err(|source| QmError::SpoolLayout {
                path: path.clone(),
                source,
            })?;
            if !meta.is_dir() {
                return Err(QmError::SpoolLayout {
                    path,
                    source: std::io::Error::other("not a directory"),
                });
            }
        }

        let engine_config = engine_config.unwrap_or_else(|| root.join(ENGINE_CONFIG_NAME));
        tracing::debug!(root = %root.display(), "Spool layout ready");
        Ok(Self {
            root,
            engine_config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, dir: SpoolDir) -> PathBuf {
        self.root.join(dir.name())
    }

    pub fn engine_config(&self) -> &Path {
        &self.engine_config
    }

    /// Where a claimed job file with this uid lives.
    pub fn claimed_path(&self, uid: &str) -> PathBuf {
        self.dir(SpoolDir::Cur)
            .join(format!("{uid}.{JOBFILE_EXTENSION}"))
    }

    /// Move a job file out of `new` into `cur/<uid>.cfg`.
    ///
    /// The move never replaces an existing file: a second claim of the same
    /// uid fails with [`QmError::DuplicateJob`].
    pub async fn claim(&self, source: &Path, uid: &str) -> Result<PathBuf> {
        let target = self.claimed_path(uid);
        match move_no_clobber(source, &target).await {
            Ok(()) => {
                tracing::debug!(from = %source.display(), to = %target.display(), "Job file claimed");
                Ok(target)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(QmError::DuplicateJob(uid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a rejected file into `error`, keeping its name.
    pub async fn quarantine(&self, source: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .ok_or_else(|| QmError::malformed(source, "file name"))?;
        self.relocate(source, SpoolDir::Error, &PathBuf::from(name))
            .await
    }

    /// Move a finished job's file from `cur` to `done` or `error`.
    pub async fn retire(&self, uid: &str, succeeded: bool) -> Result<PathBuf> {
        let source = self.claimed_path(uid);
        let dir = if succeeded {
            SpoolDir::Done
        } else {
            SpoolDir::Error
        };
        let name = PathBuf::from(format!("{uid}.{JOBFILE_EXTENSION}"));
        self.relocate(&source, dir, &name).await
    }

    async fn relocate(&self, source: &Path, dir: SpoolDir, name: &Path) -> Result<PathBuf> {
        let target = self.dir(dir).join(name);
        match move_no_clobber(source, &target).await {
            Ok(()) => Ok(target),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let target = self.dir(dir).join(timestamped(name));
                move_no_clobber(source, &target).await?;
                Ok(target)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Regular, non-hidden files in `dir`, oldest first (ties broken by name).
    pub async fn pending_files(&self, dir: SpoolDir) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(self.dir(dir)).await?;
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_hidden(&path) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, path));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }
}

/// Hidden files are partial uploads by convention and never picked up.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true)
}

/// Link `source` to `target` then unlink `source`. Linking fails if `target`
/// exists, so a file can only be moved into a given name once.
async fn move_no_clobber(source: &Path, target: &Path) -> std::io::Result<()> {
    tokio::fs::hard_link(source, target).await?;
    if let Err(e) = tokio::fs::remove_file(source).await {
        let _ = tokio::fs::remove_file(target).await;
        return Err(e);
    }
    Ok(())
}

fn timestamped(name: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.extension() {
        Some(ext) => PathBuf::from(format!("{stem}.{stamp}.{}", ext.to_string_lossy())),
        None => PathBuf::from(format!("{stem}.{stamp}")),
    }
}
