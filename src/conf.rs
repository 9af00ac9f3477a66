use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use twelf::reexports::serde::{Deserialize, Serialize};
use twelf::{config, Layer};

use crate::error::ControlError;

pub const ENV_PREFIX: &str = "TM_";
const DEFAULT_HOME_DIR: &str = "/home/timemachine";
const DEFAULT_LOG_DIR: &str = "/var/log/timemachine";
const DEFAULT_BACKUP_SCRIPT: &str = "timemachine.sh";
const DEFAULT_RESTORE_SCRIPT: &str = "restore.sh";
const DEFAULT_RESTORE_RETENTION_DAYS: u64 = 30;

/// Raw configuration as read from the TOML file and `TM_*` variables.
#[config]
#[derive(Debug, Default)]
pub struct Config {
    #[serde(default)]
    home_dir: Option<String>,
    #[serde(default)]
    state_dir: Option<String>,
    #[serde(default)]
    log_dir: Option<String>,
    #[serde(default)]
    project_root: Option<String>,
    #[serde(default)]
    backup_script: Option<String>,
    #[serde(default)]
    restore_script: Option<String>,
    #[serde(default)]
    restore_retention_days: Option<u64>,
}

impl Config {
    pub fn load(config_path: Option<&Path>) -> crate::error::Result<Self> {
        let mut layers = Vec::new();
        if let Some(path) = config_path {
            layers.push(Layer::Toml(path.to_path_buf()));
        }
        layers.push(Layer::Env(Some(ENV_PREFIX.to_string())));
        Config::with_layers(&layers).map_err(|err| ControlError::Config(err.to_string()))
    }
}

/// Resolved, immutable configuration snapshot handed to every component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    project_root: PathBuf,
    state_dir: PathBuf,
    log_dir: PathBuf,
    backup_script: PathBuf,
    restore_script: PathBuf,
    restore_retention_days: u64,
}

impl Settings {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        backup_script: impl Into<PathBuf>,
        restore_script: impl Into<PathBuf>,
    ) -> Self {
        let backup_script = backup_script.into();
        let project_root = backup_script
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            project_root,
            state_dir: state_dir.into(),
            log_dir: log_dir.into(),
            backup_script,
            restore_script: restore_script.into(),
            restore_retention_days: DEFAULT_RESTORE_RETENTION_DAYS,
        }
    }

    /// Applies defaults. `project_root` from the command line wins over the config value.
    pub fn from_config(config: Config, project_root: Option<PathBuf>) -> Self {
        let project_root = project_root
            .or_else(|| non_empty(config.project_root).map(PathBuf::from))
            .unwrap_or_else(default_project_root);
        let home_dir = non_empty(config.home_dir).unwrap_or_else(|| DEFAULT_HOME_DIR.to_string());
        let state_dir = non_empty(config.state_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home_dir).join("state"));
        let log_dir = non_empty(config.log_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let script_dir = project_root.join("bin");
        let backup_script = resolve_script(&script_dir, config.backup_script, DEFAULT_BACKUP_SCRIPT);
        let restore_script =
            resolve_script(&script_dir, config.restore_script, DEFAULT_RESTORE_SCRIPT);
        Self {
            project_root,
            state_dir,
            log_dir,
            backup_script,
            restore_script,
            restore_retention_days: config
                .restore_retention_days
                .unwrap_or(DEFAULT_RESTORE_RETENTION_DAYS),
        }
    }

    pub fn load(config_path: Option<&Path>, project_root: Option<PathBuf>) -> crate::error::Result<Self> {
        Ok(Self::from_config(Config::load(config_path)?, project_root))
    }

    pub fn with_restore_retention_days(mut self, days: u64) -> Self {
        self.restore_retention_days = days;
        self
    }

    pub fn get_project_root(&self) -> &Path {
        &self.project_root
    }
    pub fn get_state_dir(&self) -> &Path {
        &self.state_dir
    }
    pub fn get_log_dir(&self) -> &Path {
        &self.log_dir
    }
    pub fn get_backup_script(&self) -> &Path {
        &self.backup_script
    }
    pub fn get_restore_script(&self) -> &Path {
        &self.restore_script
    }
    pub fn get_restore_retention_days(&self) -> u64 {
        self.restore_retention_days
    }

    /// File name the backup executable shows up with in process listings.
    pub fn get_backup_script_name(&self) -> String {
        self.backup_script
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Shared accessor for the current [`Settings`]. Readers take a snapshot per
/// operation; a reload swaps in a new snapshot.
#[derive(Clone, Debug)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, settings: Settings) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(settings);
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_script(script_dir: &Path, value: Option<String>, default_name: &str) -> PathBuf {
    match non_empty(value) {
        Some(value) => {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                path
            } else {
                script_dir.join(path)
            }
        }
        None => script_dir.join(default_name),
    }
}

// <root>/bin/tm-control -> <root>
fn default_project_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().and_then(Path::parent).map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
