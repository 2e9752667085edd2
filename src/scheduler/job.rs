use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use configparser::ini::Ini;
use serde::Serialize;

use crate::error::{QmError, Result};

/// Job file format version this build understands.
pub const JOBFILE_VERSION: &str = "3";

/// Queue type used when a job file does not name one.
pub const DEFAULT_JOB_TYPE: &str = "hucore";

const HEADER_SECTION: &str = "header";
const JOB_SECTION: &str = "job";
const LEGACY_JOB_SECTION: &str = "hucore";
const INPUT_SECTION: &str = "inputfiles";

/// A validated job record parsed from a job file.
///
/// Fields are private: a `JobDescription` can only be obtained from
/// [`JobDescription::parse`] or [`JobDescription::from_file`], so every
/// instance has a version, a user, a template and at least one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescription {
    uid: String,
    #[serde(rename = "type")]
    job_type: String,
    version: String,
    user: String,
    template: String,
    input_files: Vec<PathBuf>,
}

impl JobDescription {
    /// Read and validate a job file. The file is not modified or moved.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let uid = uid_from_path(path)?;
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(uid, path, &text)
    }

    /// Validate job file text. `path` is only used for error reporting.
    pub fn parse(uid: impl Into<String>, path: &Path, text: &str) -> Result<Self> {
        let doc = JobFile::read(text).map_err(|e| QmError::malformed(path, format!("syntax: {e}")))?;

        let header = doc
            .section(HEADER_SECTION)
            .ok_or_else(|| QmError::malformed(path, HEADER_SECTION))?;
        let version = header.required("version", path)?;
        let user = header.required("username", path)?;

        let (job_section, default_type) = match doc.section(JOB_SECTION) {
            Some(section) => (section, DEFAULT_JOB_TYPE),
            None => doc
                .section(LEGACY_JOB_SECTION)
                .map(|section| (section, LEGACY_JOB_SECTION))
                .ok_or_else(|| QmError::malformed(path, JOB_SECTION))?,
        };
        let template = job_section.required("template", path)?;
        let job_type = job_section
            .get("type")
            .filter(|t| !t.is_empty())
            .unwrap_or(default_type)
            .to_string();

        let input_files: Vec<PathBuf> = doc
            .section(INPUT_SECTION)
            .ok_or_else(|| QmError::malformed(path, INPUT_SECTION))?
            .entries
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(_, value)| PathBuf::from(value))
            .collect();
        if input_files.is_empty() {
            return Err(QmError::malformed(path, INPUT_SECTION));
        }

        let uid = uid.into();
        if version != JOBFILE_VERSION {
            tracing::warn!(
                uid = %uid,
                version = %version,
                expected = JOBFILE_VERSION,
                "Job file version not recognized, accepting anyway"
            );
        }

        Ok(Self {
            uid,
            job_type,
            version,
            user,
            template,
            input_files,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_recognized(&self) -> bool {
        self.version == JOBFILE_VERSION
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn input_files(&self) -> &[PathBuf] {
        &self.input_files
    }

    /// Render the job back into job file text. Values spanning several
    /// lines are written as indented continuation lines.
    pub fn to_jobfile(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[{HEADER_SECTION}]");
        let _ = writeln!(out, "version = {}", continued(&self.version));
        let _ = writeln!(out, "username = {}", continued(&self.user));
        let _ = writeln!(out);
        let _ = writeln!(out, "[{JOB_SECTION}]");
        let _ = writeln!(out, "type = {}", continued(&self.job_type));
        let _ = writeln!(out, "template = {}", continued(&self.template));
        let _ = writeln!(out);
        let _ = writeln!(out, "[{INPUT_SECTION}]");
        for (idx, file) in self.input_files.iter().enumerate() {
            let _ = writeln!(out, "file{} = {}", idx + 1, continued(&file.to_string_lossy()));
        }
        out
    }
}

fn continued(value: &str) -> String {
    value.replace('\n', "\n    ")
}

/// Sections of a job file in file order. Section names and keys are
/// lowercased by the reader; a key without a value reads as empty.
struct JobFile {
    sections: Vec<JobSection>,
}

struct JobSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl JobFile {
    fn read(text: &str) -> std::result::Result<Self, String> {
        let mut ini = Ini::new();
        ini.set_multiline(true);
        let sections = ini
            .read(text.to_string())?
            .into_iter()
            .map(|(name, entries)| JobSection {
                name,
                entries: entries
                    .into_iter()
                    .map(|(key, value)| (key, value.unwrap_or_default()))
                    .collect(),
            })
            .collect();
        Ok(Self { sections })
    }

    fn section(&self, name: &str) -> Option<&JobSection> {
        self.sections.iter().find(|s| s.name == name)
    }
}

impl JobSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str, path: &Path) -> Result<String> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| QmError::malformed(path, format!("{}.{}", self.name, key)))
    }
}

/// Job uid for a job file: its file name without the extension.
pub fn uid_from_path(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty() && !stem.starts_with('.'))
        .ok_or_else(|| QmError::malformed(path, "uid"))
}
