use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tm_control::conf::{Settings, SettingsHandle};
use tm_control::controller::{JobController, KillResult, LOGFILE_ENV};
use tm_control::error::ControlError;
use tm_control::events::EventBus;
use tm_control::liveness::OsProbe;
use tm_control::procscan::SysinfoEnumerator;
use tm_control::reconciler::Reconciler;
use tm_control::record::{JobMode, JobStatus};
use tm_control::store::RecordStore;

// Scripts are written and executed by many tests; serialising avoids ETXTBSY
// when a concurrent fork still holds a write handle.
static SCRIPTS: Mutex<()> = Mutex::new(());

fn script_lock() -> MutexGuard<'static, ()> {
    SCRIPTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Env {
    temp: TempDir,
    store: Arc<RecordStore>,
    controller: JobController,
}

impl Env {
    fn new(script_name: &str, body: &str) -> Self {
        let temp = tempdir().expect("tempdir");
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let script = bin.join(script_name);
        write_script(&script, body, 0o755);
        let settings = Settings::new(
            temp.path().join("state"),
            temp.path().join("log"),
            &script,
            bin.join("restore.sh"),
        );
        let store = Arc::new(RecordStore::new(settings.get_state_dir()));
        store.ensure_dir().unwrap();
        let controller = JobController::new(
            SettingsHandle::new(settings),
            Arc::clone(&store),
            Arc::new(OsProbe),
            EventBus::new(),
        );
        Self {
            temp,
            store,
            controller,
        }
    }

    fn script(&self, name: &str) -> PathBuf {
        self.temp.path().join("bin").join(name)
    }

    async fn wait_until_finished(&self, subject: &str) -> JobStatus {
        for _ in 0..200 {
            let view = self
                .controller
                .list()
                .into_iter()
                .find(|view| view.hostname == subject)
                .expect("record listed");
            if view.status != JobStatus::Running {
                return view.status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{subject} still running");
    }

    async fn wait_for_exit_code(&self, subject: &str) -> i32 {
        for _ in 0..200 {
            if let Some(code) = self.store.exit_code(subject) {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no exit code for {subject}");
    }
}

fn write_script(path: &Path, body: &str, mode: u32) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

#[tokio::test]
async fn launch_records_running_job_then_completes() {
    let _lock = script_lock();
    let env = Env::new(
        "timemachine.sh",
        &format!("echo \"[INFO ] args: $*\"\necho \"[INFO ] log: ${LOGFILE_ENV}\"\nsleep 1\nexit 0"),
    );

    let handle = env.controller.launch("db1", JobMode::DbOnly).unwrap();
    assert!(handle.pid > 0);
    let views = env.controller.list();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].key, handle.key);
    assert_eq!(views[0].status, JobStatus::Running);
    assert_eq!(views[0].mode, JobMode::DbOnly);
    assert!(env.controller.is_running("db1"));

    assert_eq!(env.wait_until_finished("db1").await, JobStatus::Completed);
    assert_eq!(env.wait_for_exit_code("db1").await, 0);
    let log = fs::read_to_string(&handle.log_path).unwrap();
    assert!(log.contains("args: db1 --trigger api --db-only"));
    assert!(log.contains(&format!("log: {}", handle.log_path.display())));
    assert!(handle
        .log_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("backup-db1-"));
}

#[tokio::test]
async fn non_zero_exit_marks_failed() {
    let _lock = script_lock();
    let env = Env::new("timemachine.sh", "echo \"[INFO ] starting\"\nexit 3");

    env.controller.launch("web", JobMode::Full).unwrap();
    assert_eq!(env.wait_until_finished("web").await, JobStatus::Failed);
    assert_eq!(env.wait_for_exit_code("web").await, 3);
    // stays failed
    assert_eq!(env.wait_until_finished("web").await, JobStatus::Failed);
}

#[tokio::test]
async fn killed_job_stays_killed_after_it_exits() {
    let _lock = script_lock();
    let env = Env::new("timemachine.sh", "exec sleep 30");

    let handle = env.controller.launch("db1", JobMode::Full).unwrap();
    let result = env.controller.kill("db1").unwrap();
    assert_eq!(
        result,
        KillResult::Killed {
            key: handle.key.clone(),
            pid: handle.pid
        }
    );
    assert_eq!(env.wait_for_exit_code("db1").await, 128 + 15);
    for _ in 0..3 {
        assert_eq!(env.wait_until_finished("db1").await, JobStatus::Killed);
    }
    let log = fs::read_to_string(&handle.log_path).unwrap();
    assert!(log.contains(&format!(
        "[WARN ] Backup killed by user via dashboard (PID {})",
        handle.pid
    )));
    assert_eq!(env.controller.kill("db1").unwrap(), KillResult::NotFound);
}

#[tokio::test]
async fn unexecutable_script_fails_launch_without_running_record() {
    let _lock = script_lock();
    let env = Env::new("timemachine.sh", "exit 0");
    write_script(&env.script("timemachine.sh"), "exit 0", 0o644);

    let err = env.controller.launch("db1", JobMode::Full).unwrap_err();
    assert!(matches!(err, ControlError::Spawn { .. }));
    let views = env.controller.list();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].status, JobStatus::Failed);
    assert!(!env.controller.is_running("db1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_launches_for_distinct_subjects() {
    let _lock = script_lock();
    let env = Env::new("timemachine.sh", "sleep 1");
    let subjects = (0..8).map(|n| format!("host{n}")).collect::<Vec<_>>();

    let mut tasks = tokio::task::JoinSet::new();
    for subject in subjects.clone() {
        let controller = env.controller.clone();
        tasks.spawn(async move { controller.launch(&subject, JobMode::Full) });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task").expect("launch");
    }

    let views = env.controller.list();
    assert_eq!(views.len(), 8);
    for subject in &subjects {
        assert_eq!(views.iter().filter(|view| &view.hostname == subject).count(), 1);
    }
    for subject in &subjects {
        assert_eq!(env.wait_until_finished(subject).await, JobStatus::Completed);
    }
}

#[tokio::test]
async fn reconciler_adopts_unrecorded_backup_process() {
    let _lock = script_lock();
    let env = Env::new("tm-adopt-probe.sh", "sleep 30");
    let mut orphan = std::process::Command::new(env.script("tm-adopt-probe.sh"))
        .args(["orphan1", "--trigger", "api", "--files-only"])
        .spawn()
        .expect("spawn orphan");
    // give the shell time to exec
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reconciler = Reconciler::new(env.controller.clone(), Arc::new(SysinfoEnumerator));
    let report = reconciler.run().unwrap();
    let second = reconciler.run().unwrap();
    let _ = orphan.kill();
    let _ = orphan.wait();

    assert_eq!(report.adopted.len(), 1);
    assert!(second.adopted.is_empty());
    let records = env.store.records::<JobMode>().collect::<Vec<_>>();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subject, "orphan1");
    assert_eq!(records[0].pid, orphan.id());
    assert_eq!(records[0].mode(), JobMode::FilesOnly);
    assert_eq!(records[0].status, JobStatus::Running);
}

#[tokio::test]
async fn restore_runs_with_requested_arguments() {
    let _lock = script_lock();
    let env = Env::new("timemachine.sh", "exit 0");
    write_script(
        &env.script("restore.sh"),
        "echo \"[INFO ] restore $*\"\necho \"[ERROR] 2 files skipped\"\nexit 0",
        0o755,
    );
    let request = serde_json::from_str::<tm_control::controller::RestoreRequest>(
        r#"{"snapshot":"2026-03-01","path":"/etc","mode":"files-only"}"#,
    )
    .unwrap();

    let handle = env.controller.launch_restore("web", &request).unwrap();
    let mut status = JobStatus::Running;
    for _ in 0..200 {
        let views = env.controller.list_restores();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, handle.key);
        assert_eq!(views[0].description, "2026-03-01 /etc");
        status = views[0].status;
        if status != JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // the supervisor goes by the exit status, not by log markers
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(env.store.exit_code("web"), None);
    let log = fs::read_to_string(&handle.log_path).unwrap();
    assert!(log.contains("restore web --date 2026-03-01 --no-confirm --path /etc --files-only"));
}
