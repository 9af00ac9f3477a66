use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::controller::{is_backup_log, JobController, TRIGGER_ARG};
use crate::error::Result;
use crate::events::{ReconcileEvent, ReconcileReason};
use crate::procscan::{ProcessEnumerator, ProcessInfo};
use crate::record::{
    validate_subject, JobMode, JobRecord, JobStatus, RecordDetail, RecordKind, RestoreDescription,
};
use crate::utils::{latest_file_matching, now_local};

/// Exit code recorded for jobs found dead without one, as if SIGKILLed.
pub const DEAD_AT_STARTUP_EXIT_CODE: i32 = 137;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub marked_failed: Vec<String>,
    pub adopted: Vec<String>,
}

/// Brings persisted records back in line with the processes that actually run:
/// dead `running` records become `failed`, unrecorded backup processes get a record.
pub struct Reconciler {
    controller: JobController,
    enumerator: Arc<dyn ProcessEnumerator>,
    service_started: NaiveDateTime,
    own_pid: u32,
    // Serialises passes so an orphan is adopted once.
    pass: Mutex<()>,
}

impl Reconciler {
    pub fn new(controller: JobController, enumerator: Arc<dyn ProcessEnumerator>) -> Self {
        Self {
            controller,
            enumerator,
            service_started: now_local(),
            own_pid: std::process::id(),
            pass: Mutex::new(()),
        }
    }

    /// Records without a pid that were created after this instant belong to a
    /// launch still in progress and are left alone.
    pub fn with_service_started(mut self, service_started: NaiveDateTime) -> Self {
        self.service_started = service_started;
        self
    }

    pub fn run(&self) -> Result<ReconcileReport> {
        let _pass = self.pass.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut report = ReconcileReport::default();
        self.mark_dead_backups(&mut report)?;
        self.mark_dead_restores(&mut report)?;
        self.adopt_orphans(&mut report)?;
        info!(
            "Reconcile finished: {} marked failed, {} adopted",
            report.marked_failed.len(),
            report.adopted.len()
        );
        Ok(report)
    }

    fn is_dead(&self, pid: u32, started_at: NaiveDateTime, key: &str) -> bool {
        if self.controller.is_supervised(key) {
            return false;
        }
        if pid == 0 {
            return started_at < self.service_started;
        }
        !self.controller.probe().is_alive(pid)
    }

    fn mark_dead_backups(&self, report: &mut ReconcileReport) -> Result<()> {
        let store = self.controller.store();
        let dead = store
            .records::<JobMode>()
            .filter(|record| record.status == JobStatus::Running)
            .filter(|record| self.is_dead(record.pid, record.started_at, &record.key))
            .collect::<Vec<_>>();
        for record in dead {
            let Some(updated) = store.transition::<JobMode>(&record.key, JobStatus::Failed)? else {
                continue;
            };
            if store.set_exit_code_if_absent(&updated.subject, DEAD_AT_STARTUP_EXIT_CODE)? {
                info!(
                    "Recorded exit code {} for {}",
                    DEAD_AT_STARTUP_EXIT_CODE, updated.subject
                );
            }
            self.emit_failed::<JobMode>(&updated.key, &updated.subject, updated.pid);
            report.marked_failed.push(updated.key);
        }
        Ok(())
    }

    fn mark_dead_restores(&self, report: &mut ReconcileReport) -> Result<()> {
        let store = self.controller.store();
        let dead = store
            .records::<RestoreDescription>()
            .filter(|record| record.status == JobStatus::Running)
            .filter(|record| self.is_dead(record.pid, record.started_at, &record.key))
            .collect::<Vec<_>>();
        for record in dead {
            let Some(updated) =
                store.transition::<RestoreDescription>(&record.key, JobStatus::Failed)?
            else {
                continue;
            };
            self.emit_failed::<RestoreDescription>(&updated.key, &updated.subject, updated.pid);
            report.marked_failed.push(updated.key);
        }
        Ok(())
    }

    fn emit_failed<D: RecordDetail>(&self, key: &str, subject: &str, pid: u32) {
        self.controller.events().emit(ReconcileEvent::new(
            key,
            D::KIND,
            subject,
            pid,
            Some(JobStatus::Running),
            JobStatus::Failed,
            ReconcileReason::DeadAtStartup,
        ));
    }

    fn adopt_orphans(&self, report: &mut ReconcileReport) -> Result<()> {
        let settings = self.controller.settings().current();
        let script_name = settings.get_backup_script_name();
        if script_name.is_empty() {
            return Ok(());
        }
        // Enumerate before reading records: a job launched meanwhile then
        // already has its record when the snapshot is taken.
        let processes = self.enumerator.processes();
        let store = self.controller.store();
        let records = store.records::<JobMode>().collect::<Vec<_>>();
        // Any status: a killed job may still be exiting.
        let mut tracked_pids = records
            .iter()
            .map(|record| record.pid)
            .filter(|pid| *pid != 0)
            .collect::<HashSet<_>>();
        let mut covered = records
            .into_iter()
            .filter(|record| record.status == JobStatus::Running)
            .map(|record| record.subject)
            .collect::<HashSet<_>>();

        for process in processes {
            if process.pid == self.own_pid || tracked_pids.contains(&process.pid) {
                continue;
            }
            let Some((subject, mode)) = match_backup_process(&process, &script_name) else {
                continue;
            };
            if covered.contains(&subject) {
                continue;
            }
            let log_path = latest_backup_log(settings.get_log_dir(), &subject).unwrap_or_default();
            let started_at = now_local();
            let record = store.create_unique(&subject, started_at, |stem| JobRecord {
                key: RecordKind::Backup.key(stem),
                pid: process.pid,
                subject: subject.clone(),
                detail: mode,
                started_at,
                status: JobStatus::Running,
                log_path: log_path.clone(),
            });
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!("Failed to record orphan backup of {} (pid={}): {}", subject, process.pid, err);
                    continue;
                }
            };
            self.controller.events().emit(ReconcileEvent::new(
                &record.key,
                RecordKind::Backup,
                &record.subject,
                record.pid,
                None,
                JobStatus::Running,
                ReconcileReason::OrphanAdopted,
            ));
            tracked_pids.insert(record.pid);
            covered.insert(subject);
            report.adopted.push(record.key);
        }
        Ok(())
    }
}

/// Recognises `<script> <subject> ... --trigger ...`, also when the whole
/// command sits in a single `sh -c` argument.
pub fn match_backup_process(process: &ProcessInfo, script_name: &str) -> Option<(String, JobMode)> {
    let tokens = process
        .args
        .iter()
        .flat_map(|arg| arg.split_whitespace())
        .collect::<Vec<_>>();
    if !tokens.contains(&TRIGGER_ARG) {
        return None;
    }
    let position = tokens.iter().position(|token| {
        Path::new(token)
            .file_name()
            .is_some_and(|name| name == script_name)
    })?;
    let subject = tokens.get(position + 1)?;
    validate_subject(subject).ok()?;
    Some((subject.to_string(), JobMode::from_args(&tokens)))
}

fn latest_backup_log(log_dir: &Path, subject: &str) -> Option<PathBuf> {
    latest_file_matching(log_dir, |name| is_backup_log(name, subject))
}
