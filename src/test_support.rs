use chrono::{Duration, NaiveDateTime};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

use crate::conf::{Settings, SettingsHandle};
use crate::controller::JobController;
use crate::events::EventBus;
use crate::liveness::ProcessProbe;
use crate::procscan::{ProcessEnumerator, ProcessInfo};
use crate::record::{
    key_stem, JobMode, JobRecord, JobStatus, RecordKind, RestoreDescription, RestoreRecord,
};
use crate::store::RecordStore;
use crate::utils::now_local;

#[derive(Default)]
pub struct FakeProbe {
    pub alive: Mutex<HashSet<u32>>,
    pub terminated: Mutex<Vec<u32>>,
}

impl FakeProbe {
    pub fn with_alive(pids: &[u32]) -> Arc<Self> {
        let probe = Self::default();
        probe.alive.lock().unwrap().extend(pids.iter().copied());
        Arc::new(probe)
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.terminated.lock().unwrap().push(pid);
        if self.alive.lock().unwrap().remove(&pid) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        }
    }
}

#[derive(Default)]
pub struct FakeEnumerator {
    pub processes: Mutex<Vec<ProcessInfo>>,
}

impl FakeEnumerator {
    pub fn with(processes: Vec<(u32, Vec<&str>)>) -> Arc<Self> {
        let list = processes
            .into_iter()
            .map(|(pid, args)| ProcessInfo {
                pid,
                args: args.into_iter().map(str::to_string).collect(),
            })
            .collect();
        Arc::new(Self {
            processes: Mutex::new(list),
        })
    }
}

impl ProcessEnumerator for FakeEnumerator {
    fn processes(&self) -> Vec<ProcessInfo> {
        self.processes.lock().unwrap().clone()
    }
}

/// Controller over temp state/log dirs with a fake probe. Scripts live under
/// `<temp>/bin` and do not exist unless a test writes them.
pub struct Fixture {
    pub temp: TempDir,
    pub controller: JobController,
    pub store: Arc<RecordStore>,
    pub probe: Arc<FakeProbe>,
}

impl Fixture {
    pub fn new(alive: &[u32]) -> Self {
        let temp = tempdir().expect("tempdir");
        let state_dir = temp.path().join("state");
        let log_dir = temp.path().join("log");
        fs::create_dir_all(&state_dir).unwrap();
        fs::create_dir_all(&log_dir).unwrap();
        let settings = SettingsHandle::new(Settings::new(
            &state_dir,
            &log_dir,
            temp.path().join("bin/timemachine.sh"),
            temp.path().join("bin/restore.sh"),
        ));
        let store = Arc::new(RecordStore::new(&state_dir));
        let probe = FakeProbe::with_alive(alive);
        let controller =
            JobController::new(settings, Arc::clone(&store), probe.clone(), EventBus::new());
        Self {
            temp,
            controller,
            store,
            probe,
        }
    }

    pub fn add_job(&self, subject: &str, pid: u32, age_minutes: i64, status: JobStatus) -> JobRecord {
        let started_at = minutes_ago(age_minutes);
        let stem = key_stem(subject, started_at, 0);
        let record = JobRecord {
            key: RecordKind::Backup.key(&stem),
            pid,
            subject: subject.to_string(),
            detail: JobMode::Full,
            started_at,
            status,
            log_path: self.temp.path().join(format!("log/backup-{stem}.log")),
        };
        self.store.create(&record).unwrap();
        record
    }

    pub fn add_restore(
        &self,
        subject: &str,
        pid: u32,
        age_minutes: i64,
        status: JobStatus,
    ) -> RestoreRecord {
        let started_at = minutes_ago(age_minutes);
        let stem = key_stem(subject, started_at, 0);
        let record = RestoreRecord {
            key: RecordKind::Restore.key(&stem),
            pid,
            subject: subject.to_string(),
            detail: RestoreDescription::new("2026-03-01 /etc"),
            started_at,
            status,
            log_path: self.temp.path().join(format!("log/restore-{stem}.log")),
        };
        self.store.create(&record).unwrap();
        record
    }

    pub fn status_of(&self, key: &str) -> JobStatus {
        self.store.read::<JobMode>(key).unwrap().unwrap().status
    }
}

pub fn minutes_ago(minutes: i64) -> NaiveDateTime {
    now_local() - Duration::minutes(minutes)
}
