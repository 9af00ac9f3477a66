use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ControlError, Result};

/// Display format of `started` inside a record line.
pub const STARTED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Timestamp format embedded in record keys and log file names.
pub const KEY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";
pub const RECORD_EXTENSION: &str = "state";

const FIELD_SEPARATOR: char = '|';
const FIELD_COUNT: usize = 6;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JobMode {
    Full,
    FilesOnly,
    DbOnly,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Full => "full",
            JobMode::FilesOnly => "files-only",
            JobMode::DbOnly => "db-only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(JobMode::Full),
            "files-only" => Some(JobMode::FilesOnly),
            "db-only" => Some(JobMode::DbOnly),
            _ => None,
        }
    }

    /// Command line flag passed to the backup/restore executable.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            JobMode::Full => None,
            JobMode::FilesOnly => Some("--files-only"),
            JobMode::DbOnly => Some("--db-only"),
        }
    }

    /// Infers the mode from an observed argument list; `--files-only` wins over `--db-only`.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        if args.iter().any(|arg| arg.as_ref() == "--files-only") {
            JobMode::FilesOnly
        } else if args.iter().any(|arg| arg.as_ref() == "--db-only") {
            JobMode::DbOnly
        } else {
            JobMode::Full
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "killed" => Some(JobStatus::Killed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Backup,
    Restore,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::Backup => "proc-",
            RecordKind::Restore => "restore-",
        }
    }

    /// Prefix of the log files written by jobs of this kind.
    pub fn log_prefix(&self) -> &'static str {
        match self {
            RecordKind::Backup => "backup-",
            RecordKind::Restore => "restore-",
        }
    }

    pub fn key(&self, stem: &str) -> String {
        format!("{}{}", self.prefix(), stem)
    }

    /// Key prefix shared by every record of `subject`. Subjects that extend
    /// `subject` with a dash also match, so callers compare the subject field too.
    pub fn subject_prefix(&self, subject: &str) -> String {
        format!("{}{}-", self.prefix(), subject)
    }
}

/// The field that differs between backup and restore records.
pub trait RecordDetail: Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn encode(&self) -> String;
    fn decode(raw: &str) -> Option<Self>;
}

impl RecordDetail for JobMode {
    const KIND: RecordKind = RecordKind::Backup;

    fn encode(&self) -> String {
        self.as_str().to_string()
    }

    fn decode(raw: &str) -> Option<Self> {
        JobMode::parse(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreDescription(String);

impl RestoreDescription {
    pub fn new(value: &str) -> Self {
        Self(sanitize_field(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RecordDetail for RestoreDescription {
    const KIND: RecordKind = RecordKind::Restore;

    fn encode(&self) -> String {
        self.0.clone()
    }

    fn decode(raw: &str) -> Option<Self> {
        Some(Self(raw.to_string()))
    }
}

/// One persisted job attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateRecord<D> {
    pub key: String,
    pub pid: u32,
    pub subject: String,
    pub detail: D,
    pub started_at: NaiveDateTime,
    pub status: JobStatus,
    pub log_path: PathBuf,
}

pub type JobRecord = StateRecord<JobMode>;
pub type RestoreRecord = StateRecord<RestoreDescription>;

impl<D: RecordDetail> StateRecord<D> {
    pub fn to_line(&self) -> String {
        [
            self.pid.to_string(),
            self.subject.clone(),
            self.detail.encode(),
            self.started_at.format(STARTED_FORMAT).to_string(),
            self.status.as_str().to_string(),
            self.log_path.to_string_lossy().to_string(),
        ]
        .join(&FIELD_SEPARATOR.to_string())
    }

    /// Parses a record line. Returns `None` for anything malformed.
    pub fn from_line(key: &str, line: &str) -> Option<Self> {
        let parts = line.trim().splitn(FIELD_COUNT, FIELD_SEPARATOR).collect::<Vec<_>>();
        if parts.len() < FIELD_COUNT {
            return None;
        }
        let pid = parts[0].parse::<u32>().ok()?;
        let subject = parts[1].to_string();
        if subject.is_empty() {
            return None;
        }
        let detail = D::decode(parts[2])?;
        let started_at = NaiveDateTime::parse_from_str(parts[3], STARTED_FORMAT).ok()?;
        let status = JobStatus::parse(parts[4])?;
        Some(Self {
            key: key.to_string(),
            pid,
            subject,
            detail,
            started_at,
            status,
            log_path: PathBuf::from(parts[5]),
        })
    }

    pub fn log_file_name(&self) -> String {
        self.log_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl StateRecord<JobMode> {
    pub fn mode(&self) -> JobMode {
        self.detail
    }
}

impl StateRecord<RestoreDescription> {
    pub fn description(&self) -> &str {
        self.detail.as_str()
    }
}

/// `<subject>-<timestamp>[-<attempt>]`, shared by the record key and the log file name.
pub fn key_stem(subject: &str, started_at: NaiveDateTime, attempt: u32) -> String {
    let timestamp = started_at.format(KEY_TIMESTAMP_FORMAT);
    if attempt == 0 {
        format!("{}-{}", subject, timestamp)
    } else {
        format!("{}-{}-{}", subject, timestamp, attempt)
    }
}

pub fn validate_subject(subject: &str) -> Result<()> {
    let invalid = subject.is_empty()
        || subject == "."
        || subject == ".."
        || subject.starts_with('-')
        || subject
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\' | '|'));
    if invalid {
        return Err(ControlError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| if matches!(c, '|' | '\r' | '\n') { ' ' } else { c })
        .collect()
}
