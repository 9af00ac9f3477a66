use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::conf::SettingsHandle;
use crate::error::{ControlError, Result};
use crate::events::{EventBus, ReconcileEvent, ReconcileReason};
use crate::liveness::ProcessProbe;
use crate::record::{
    validate_subject, JobMode, JobRecord, JobStatus, RecordDetail, RecordKind,
    RestoreDescription, RestoreRecord, StateRecord, STARTED_FORMAT,
};
use crate::store::RecordStore;
use crate::utils::{
    append_log_line, files_matching, is_not_found, latest_file_matching, now_local, now_string,
    read_lossy, read_tail_lines,
};

/// Environment variable telling the backup executable where its log goes.
pub const LOGFILE_ENV: &str = "_TM_BACKUP_LOGFILE";
pub const TRIGGER_ARG: &str = "--trigger";
pub const TRIGGER_VALUE: &str = "api";
const RESTORE_TAIL_LINES: usize = 30;
const MAX_RETENTION_DAYS: u64 = 36_500;
const LOG_TAIL_LINES: usize = 500;
const MAX_AVAILABLE_LOGS: usize = 30;

static ERROR_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[ERROR\s*\]").expect("valid error marker pattern"));

#[derive(Clone, Debug, Serialize)]
pub struct JobHandle {
    pub key: String,
    pub subject: String,
    pub pid: u32,
    pub log_path: PathBuf,
}

pub type RestoreHandle = JobHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KillResult {
    Killed { key: String, pid: u32 },
    NotFound,
}

/// Backup record as shown to the dashboard.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct JobView {
    pub key: String,
    pub pid: u32,
    pub hostname: String,
    pub mode: JobMode,
    pub started: String,
    pub status: JobStatus,
    pub logfile: String,
    #[serde(skip)]
    pub started_at: NaiveDateTime,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            key: record.key.clone(),
            pid: record.pid,
            hostname: record.subject.clone(),
            mode: record.mode(),
            started: record.started_at.format(STARTED_FORMAT).to_string(),
            status: record.status,
            logfile: record.log_file_name(),
            started_at: record.started_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RestoreView {
    pub id: String,
    pub pid: u32,
    pub hostname: String,
    pub description: String,
    pub started: String,
    pub status: JobStatus,
    pub logfile: String,
}

impl From<&RestoreRecord> for RestoreView {
    fn from(record: &RestoreRecord) -> Self {
        Self {
            id: record.key.clone(),
            pid: record.pid,
            hostname: record.subject.clone(),
            description: record.description().to_string(),
            started: record.started_at.format(STARTED_FORMAT).to_string(),
            status: record.status,
            logfile: record.log_file_name(),
        }
    }
}

/// Tail of the newest backup log of a subject.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BackupLogView {
    pub hostname: String,
    pub logfile: String,
    pub lines: String,
    pub running: bool,
    pub available: Vec<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RestoreLogView {
    pub logfile: String,
    pub lines: String,
    pub running: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

impl RestoreRequest {
    fn description(&self) -> String {
        let mut description = self.snapshot.clone();
        if let Some(path) = non_empty(&self.path) {
            description.push(' ');
            description.push_str(path);
        }
        if let Some(target) = non_empty(&self.target) {
            description.push_str(" -> ");
            description.push_str(target);
        }
        description
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--date".to_string(),
            self.snapshot.clone(),
            "--no-confirm".to_string(),
        ];
        if let Some(path) = non_empty(&self.path) {
            args.extend(["--path".to_string(), path.to_string()]);
        }
        if let Some(target) = non_empty(&self.target) {
            args.extend(["--target".to_string(), target.to_string()]);
        }
        if let Some(format) = non_empty(&self.format) {
            args.extend(["--format".to_string(), format.to_string()]);
        }
        let mode = self.mode.as_deref().and_then(JobMode::parse);
        if let Some(flag) = mode.and_then(|mode| mode.flag()) {
            args.push(flag.to_string());
        }
        args
    }
}

/// Launches, supervises, kills and classifies backup and restore jobs.
#[derive(Clone)]
pub struct JobController {
    settings: SettingsHandle,
    store: Arc<RecordStore>,
    probe: Arc<dyn ProcessProbe>,
    events: EventBus,
    // Keys whose child is awaited by a supervisor task of this process.
    supervised: Arc<Mutex<HashSet<String>>>,
}

impl JobController {
    pub fn new(
        settings: SettingsHandle,
        store: Arc<RecordStore>,
        probe: Arc<dyn ProcessProbe>,
        events: EventBus,
    ) -> Self {
        Self {
            settings,
            store,
            probe,
            events,
            supervised: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub(crate) fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events.subscribe()
    }

    /// Records a running backup job and starts the backup executable for it.
    /// Returns once the record is written and the child is spawned; must be
    /// called from within a Tokio runtime.
    pub fn launch(&self, subject: &str, mode: JobMode) -> Result<JobHandle> {
        validate_subject(subject)?;
        let settings = self.settings.current();
        let log_dir = settings.get_log_dir().to_path_buf();
        let started_at = now_local();
        let record = self.store.create_unique(subject, started_at, |stem| JobRecord {
            key: RecordKind::Backup.key(stem),
            pid: 0,
            subject: subject.to_string(),
            detail: mode,
            started_at,
            status: JobStatus::Running,
            log_path: log_dir.join(format!("{}{}.log", RecordKind::Backup.log_prefix(), stem)),
        })?;
        info!(
            "Backup for {} recorded as {} (mode={})",
            subject,
            record.key,
            mode.as_str()
        );

        let mut command = Command::new(settings.get_backup_script());
        command.arg(subject).arg(TRIGGER_ARG).arg(TRIGGER_VALUE);
        if let Some(flag) = mode.flag() {
            command.arg(flag);
        }
        command.env(LOGFILE_ENV, &record.log_path);

        let record = self.start_child(record, command, settings.get_backup_script(), true)?;
        Ok(JobHandle {
            key: record.key,
            subject: record.subject,
            pid: record.pid,
            log_path: record.log_path,
        })
    }

    /// Sends SIGTERM to the most recent live running backup of `subject`.
    /// Does not wait for the process to exit.
    pub fn kill(&self, subject: &str) -> Result<KillResult> {
        validate_subject(subject)?;
        let mut candidates = self
            .store
            .read_all::<JobMode>(&RecordKind::Backup.subject_prefix(subject))
            .filter(|record| {
                record.subject == subject && record.status == JobStatus::Running && record.pid > 0
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.key.cmp(&a.key))
        });

        for record in candidates {
            if !self.probe.is_alive(record.pid) {
                continue;
            }
            // Mark first so the supervisor cannot record the SIGTERM exit as a failure.
            if self
                .store
                .transition::<JobMode>(&record.key, JobStatus::Killed)?
                .is_none()
            {
                continue;
            }
            if !record.log_path.as_os_str().is_empty() {
                let notice = format!(
                    "\n[{}] [WARN ] Backup killed by user via dashboard (PID {})",
                    now_string(),
                    record.pid
                );
                if let Err(err) = append_log_line(&record.log_path, &notice) {
                    debug!("Failed to append kill notice to {:?}: {}", record.log_path, err);
                }
            }
            match self.probe.terminate(record.pid) {
                Ok(()) => {}
                Err(err) if is_not_found(&err) => {
                    debug!("Process {} exited before SIGTERM", record.pid);
                }
                Err(err) => warn!("Failed to signal pid {}: {}", record.pid, err),
            }
            info!("Backup {} killed (pid={})", record.key, record.pid);
            return Ok(KillResult::Killed {
                key: record.key,
                pid: record.pid,
            });
        }
        Ok(KillResult::NotFound)
    }

    /// All backup records, running first, then newest first. Running records
    /// whose process is gone are reclassified and persisted on the way.
    pub fn list(&self) -> Vec<JobView> {
        let mut views = self
            .store
            .records::<JobMode>()
            .map(|record| self.refresh_backup(record))
            .map(|record| JobView::from(&record))
            .collect::<Vec<_>>();
        views.sort_by(|a, b| {
            let a_running = a.status == JobStatus::Running;
            let b_running = b.status == JobStatus::Running;
            b_running
                .cmp(&a_running)
                .then_with(|| b.started_at.cmp(&a.started_at))
                .then_with(|| b.key.cmp(&a.key))
        });
        views
    }

    /// `true` while a backup of `subject` is running or still being launched.
    pub fn is_running(&self, subject: &str) -> bool {
        self.store
            .read_all::<JobMode>(&RecordKind::Backup.subject_prefix(subject))
            .any(|record| {
                record.subject == subject
                    && record.status == JobStatus::Running
                    && (record.pid == 0 || self.probe.is_alive(record.pid))
            })
    }

    /// Last lines of the newest `backup-<subject>-*.log`, falling back to the
    /// subject's service log, plus the names of its most recent backup logs.
    pub fn backup_log(&self, subject: &str) -> Result<BackupLogView> {
        validate_subject(subject)?;
        let settings = self.settings.current();
        let logs = files_matching(settings.get_log_dir(), |name| is_backup_log(name, subject));
        let path = match logs.first() {
            Some(path) => path.clone(),
            None => settings.get_log_dir().join(format!("service-{subject}.log")),
        };
        if !path.is_file() {
            return Err(ControlError::NotFound(format!("No logs for {subject}")));
        }
        Ok(BackupLogView {
            hostname: subject.to_string(),
            logfile: file_name_of(&path),
            lines: read_tail_lines(&path, LOG_TAIL_LINES).join("\n"),
            running: self.is_running(subject),
            available: logs
                .iter()
                .take(MAX_AVAILABLE_LOGS)
                .map(|path| file_name_of(path))
                .collect(),
        })
    }

    /// `true` once a backup log stamped with today's date exists.
    pub fn has_backup_log_today(&self) -> bool {
        let today = format!("-{}_", now_local().format("%Y-%m-%d"));
        let prefix = RecordKind::Backup.log_prefix();
        latest_file_matching(self.settings.current().get_log_dir(), |name| {
            name.starts_with(prefix) && name.ends_with(".log") && name.contains(today.as_str())
        })
        .is_some()
    }

    /// Removes completed and failed backup records together with the exit code
    /// markers of their subjects.
    pub fn clear_finished(&self) -> usize {
        let finished = self
            .store
            .records::<JobMode>()
            .filter(|record| matches!(record.status, JobStatus::Completed | JobStatus::Failed))
            .collect::<Vec<_>>();
        self.delete_backups(finished)
    }

    pub fn delete_finished(&self, subject: &str) -> Result<usize> {
        validate_subject(subject)?;
        let finished = self
            .store
            .read_all::<JobMode>(&RecordKind::Backup.subject_prefix(subject))
            .filter(|record| {
                record.subject == subject
                    && matches!(record.status, JobStatus::Completed | JobStatus::Failed)
            })
            .collect::<Vec<_>>();
        self.store.clear_exit_code(subject)?;
        let cleared = self.delete_backups(finished);
        if cleared == 0 {
            return Err(ControlError::NotFound(format!(
                "No finished process found for {subject}"
            )));
        }
        Ok(cleared)
    }

    /// Records a running restore and starts the restore executable for it.
    pub fn launch_restore(&self, subject: &str, request: &RestoreRequest) -> Result<RestoreHandle> {
        validate_subject(subject)?;
        if request.snapshot.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "snapshot date is required".to_string(),
            ));
        }
        let settings = self.settings.current();
        let log_dir = settings.get_log_dir().to_path_buf();
        let description = RestoreDescription::new(&request.description());
        let started_at = now_local();
        let record = self.store.create_unique(subject, started_at, |stem| RestoreRecord {
            key: RecordKind::Restore.key(stem),
            pid: 0,
            subject: subject.to_string(),
            detail: description.clone(),
            started_at,
            status: JobStatus::Running,
            log_path: log_dir.join(format!("{}{}.log", RecordKind::Restore.log_prefix(), stem)),
        })?;
        info!("Restore for {} recorded as {}", subject, record.key);

        let mut command = Command::new(settings.get_restore_script());
        command.arg(subject).args(request.args());

        let record = self.start_child(record, command, settings.get_restore_script(), false)?;
        Ok(RestoreHandle {
            key: record.key,
            subject: record.subject,
            pid: record.pid,
            log_path: record.log_path,
        })
    }

    /// Restores started within the retention window, newest first.
    pub fn list_restores(&self) -> Vec<RestoreView> {
        let days = self
            .settings
            .current()
            .get_restore_retention_days()
            .min(MAX_RETENTION_DAYS);
        let cutoff = now_local() - Duration::days(days as i64);
        let mut records = self
            .store
            .records::<RestoreDescription>()
            .filter(|record| record.started_at >= cutoff)
            .map(|record| self.refresh_restore(record))
            .collect::<Vec<_>>();
        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.key.cmp(&a.key))
        });
        records.iter().map(RestoreView::from).collect()
    }

    pub fn delete_restore(&self, id: &str) -> Result<()> {
        if !id.starts_with(RecordKind::Restore.prefix()) || id.contains(['/', '\\']) {
            return Err(ControlError::NotFound("Restore task not found".to_string()));
        }
        let Some(record) = self.store.read::<RestoreDescription>(id)? else {
            return Err(ControlError::NotFound("Restore task not found".to_string()));
        };
        if record.status == JobStatus::Running && self.probe.is_alive(record.pid) {
            return Err(ControlError::Conflict(
                "Cannot delete a running restore task".to_string(),
            ));
        }
        self.store.delete(id)?;
        if !record.log_path.as_os_str().is_empty() {
            if let Err(err) = fs::remove_file(&record.log_path) {
                if !is_not_found(&err) {
                    warn!("Failed to remove restore log {:?}: {}", record.log_path, err);
                }
            }
        }
        info!("Restore {} deleted", id);
        Ok(())
    }

    /// Removes every restore record that is not still running.
    pub fn clear_restores(&self) -> usize {
        let mut cleared = 0;
        for record in self.store.records::<RestoreDescription>() {
            if record.status == JobStatus::Running && self.probe.is_alive(record.pid) {
                continue;
            }
            match self.store.delete(&record.key) {
                Ok(()) => cleared += 1,
                Err(err) => warn!("Failed to delete restore {}: {}", record.key, err),
            }
        }
        cleared
    }

    /// Last lines of a restore log. Only plain `restore-*.log` names inside the
    /// log directory are served.
    pub fn restore_log(&self, name: &str) -> Result<RestoreLogView> {
        let prefix = RecordKind::Restore.log_prefix();
        let plain = name.starts_with(prefix)
            && name.ends_with(".log")
            && !name.contains(['/', '\\'])
            && !name.contains("..");
        if !plain {
            return Err(ControlError::InvalidRequest(format!("invalid log name {name:?}")));
        }
        let path = self.settings.current().get_log_dir().join(name);
        if !path.is_file() {
            return Err(ControlError::NotFound(format!("Log file not found: {name}")));
        }
        let running = self.store.records::<RestoreDescription>().any(|record| {
            record.status == JobStatus::Running
                && record.log_file_name() == name
                && (record.pid == 0 || self.probe.is_alive(record.pid))
        });
        Ok(RestoreLogView {
            logfile: name.to_string(),
            lines: read_tail_lines(&path, LOG_TAIL_LINES).join("\n"),
            running,
        })
    }

    fn delete_backups(&self, records: Vec<JobRecord>) -> usize {
        let mut cleared = 0;
        for record in records {
            if let Err(err) = self.store.delete(&record.key) {
                warn!("Failed to delete record {}: {}", record.key, err);
                continue;
            }
            if let Err(err) = self.store.clear_exit_code(&record.subject) {
                warn!("Failed to clear exit code for {}: {}", record.subject, err);
            }
            cleared += 1;
        }
        cleared
    }

    pub(crate) fn is_supervised(&self, key: &str) -> bool {
        self.supervised
            .lock()
            .map(|keys| keys.contains(key))
            .unwrap_or(false)
    }

    fn needs_refresh<D>(&self, record: &StateRecord<D>) -> bool {
        record.status == JobStatus::Running
            && record.pid != 0
            && !self.is_supervised(&record.key)
            && !self.probe.is_alive(record.pid)
    }

    fn refresh_backup(&self, record: JobRecord) -> JobRecord {
        if !self.needs_refresh(&record) {
            return record;
        }
        let (status, reason) = classify_backup(&self.store, &record);
        self.apply_reclassification(record, status, reason)
    }

    fn refresh_restore(&self, record: RestoreRecord) -> RestoreRecord {
        if !self.needs_refresh(&record) {
            return record;
        }
        let (status, reason) = classify_restore(&record);
        self.apply_reclassification(record, status, reason)
    }

    fn apply_reclassification<D: RecordDetail>(
        &self,
        record: StateRecord<D>,
        status: JobStatus,
        reason: ReconcileReason,
    ) -> StateRecord<D> {
        match self.store.transition::<D>(&record.key, status) {
            Ok(Some(updated)) => {
                self.events.emit(ReconcileEvent::new(
                    &updated.key,
                    D::KIND,
                    &updated.subject,
                    updated.pid,
                    Some(JobStatus::Running),
                    status,
                    reason,
                ));
                updated
            }
            Ok(None) => match self.store.read::<D>(&record.key) {
                Ok(Some(current)) => current,
                _ => record,
            },
            Err(err) => {
                warn!("Failed to persist status of {}: {}", record.key, err);
                record
            }
        }
    }

    fn start_child<D: RecordDetail>(
        &self,
        record: StateRecord<D>,
        mut command: Command,
        program: &Path,
        track_exit_code: bool,
    ) -> Result<StateRecord<D>> {
        let spawned = open_log(&record.log_path).and_then(|(stdout, stderr)| {
            command
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .process_group(0)
                .spawn()
        });
        let child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let message = err.to_string();
                self.fail_launch(&record, program, &message);
                return Err(ControlError::Spawn {
                    program: program.display().to_string(),
                    message,
                });
            }
        };
        let pid = child.id().unwrap_or(0);
        let record = self
            .store
            .modify::<D, _>(&record.key, |stored| {
                if stored.status.is_terminal() {
                    return false;
                }
                stored.pid = pid;
                true
            })?
            .unwrap_or_else(|| StateRecord { pid, ..record });
        info!("Started {} for {} (pid={})", program.display(), record.subject, pid);

        if let Ok(mut keys) = self.supervised.lock() {
            keys.insert(record.key.clone());
        }
        let store = Arc::clone(&self.store);
        let supervised = Arc::clone(&self.supervised);
        let key = record.key.clone();
        let subject = record.subject.clone();
        tokio::spawn(async move {
            supervise::<D>(store, child, &key, &subject, track_exit_code).await;
            if let Ok(mut keys) = supervised.lock() {
                keys.remove(&key);
            }
        });
        Ok(record)
    }

    fn fail_launch<D: RecordDetail>(&self, record: &StateRecord<D>, program: &Path, message: &str) {
        warn!("Failed to start {} for {}: {}", program.display(), record.subject, message);
        let line = format!(
            "[{}] [ERROR] Failed to start {}: {}",
            now_string(),
            program.display(),
            message
        );
        if let Err(err) = append_log_line(&record.log_path, &line) {
            debug!("Failed to write launch error to {:?}: {}", record.log_path, err);
        }
        if let Err(err) = self.store.transition::<D>(&record.key, JobStatus::Failed) {
            warn!("Failed to mark {} as failed: {}", record.key, err);
        }
    }
}

async fn supervise<D: RecordDetail>(
    store: Arc<RecordStore>,
    mut child: Child,
    key: &str,
    subject: &str,
    track_exit_code: bool,
) {
    let exit_code = match child.wait().await {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            warn!("Failed to wait for {}: {}", key, err);
            -1
        }
    };
    if track_exit_code {
        if let Err(err) = store.set_exit_code(subject, exit_code) {
            warn!("Failed to write exit code for {}: {}", subject, err);
        }
    }
    let status = if exit_code == 0 {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    match store.transition::<D>(key, status) {
        Ok(Some(_)) => info!("{} finished with exit code {} ({})", key, exit_code, status.as_str()),
        Ok(None) => debug!("{} exited with {} after reaching a final status", key, exit_code),
        Err(err) => warn!("Failed to persist status of {}: {}", key, err),
    }
}

/// Shell convention: death by signal N reports 128 + N.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Priority: non-zero exit code marker, then an error marker in the log, else completed.
pub fn classify_backup(store: &RecordStore, record: &JobRecord) -> (JobStatus, ReconcileReason) {
    match store.exit_code(&record.subject) {
        Some(code) if code != 0 => {
            return (JobStatus::Failed, ReconcileReason::ExitCode { code });
        }
        _ => {}
    }
    let has_marker = read_lossy(&record.log_path)
        .map(|content| has_error_marker(&content))
        .unwrap_or(false);
    if has_marker {
        (JobStatus::Failed, ReconcileReason::ErrorMarker)
    } else {
        (JobStatus::Completed, ReconcileReason::NoEvidence)
    }
}

pub fn classify_restore(record: &RestoreRecord) -> (JobStatus, ReconcileReason) {
    let tail = read_tail_lines(&record.log_path, RESTORE_TAIL_LINES);
    if tail.iter().any(|line| has_error_marker(line)) {
        (JobStatus::Failed, ReconcileReason::ErrorMarker)
    } else {
        (JobStatus::Completed, ReconcileReason::NoEvidence)
    }
}

pub fn has_error_marker(text: &str) -> bool {
    ERROR_MARKER.is_match(text)
}

/// `backup-<subject>-<timestamp>.log`; the digit check keeps `db2` from
/// matching `db2-extra` logs.
pub(crate) fn is_backup_log(name: &str, subject: &str) -> bool {
    name.ends_with(".log")
        && name
            .strip_prefix(RecordKind::Backup.log_prefix())
            .and_then(|rest| rest.strip_prefix(subject))
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn open_log(path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
