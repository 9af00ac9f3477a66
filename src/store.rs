use chrono::NaiveDateTime;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::IntoIter;
use tracing::debug;

use crate::record::{key_stem, JobStatus, RecordDetail, StateRecord, RECORD_EXTENSION};
use crate::utils::is_not_found;

const MAX_KEY_ATTEMPTS: u32 = 100;
const EXIT_CODE_PREFIX: &str = "exit-";
const EXIT_CODE_EXTENSION: &str = "code";

/// File-backed record table. One `<key>.state` file per job attempt plus one
/// `exit-<subject>.code` marker per subject. Every write replaces a whole file
/// through a temp file and a rename.
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    // Serialises read-check-write sequences; plain writes do not take it.
    transitions: Mutex<()>,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            transitions: Mutex::new(()),
        }
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Persists a new record. Fails with `AlreadyExists` instead of replacing a key.
    pub fn create<D: RecordDetail>(&self, record: &StateRecord<D>) -> io::Result<()> {
        let path = self.record_path(&record.key);
        let tmp_path = self.write_temp(&record.key, &record.to_line())?;
        let linked = fs::hard_link(&tmp_path, &path);
        let _ = fs::remove_file(&tmp_path);
        linked
    }

    /// Creates a record under the first free key for `(subject, started_at)`.
    /// `make` receives the key stem and builds the record for it.
    pub fn create_unique<D, F>(
        &self,
        subject: &str,
        started_at: NaiveDateTime,
        mut make: F,
    ) -> io::Result<StateRecord<D>>
    where
        D: RecordDetail,
        F: FnMut(&str) -> StateRecord<D>,
    {
        for attempt in 0..MAX_KEY_ATTEMPTS {
            let record = make(&key_stem(subject, started_at, attempt));
            match self.create(&record) {
                Ok(()) => return Ok(record),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free record key for {subject} at {started_at}"),
        ))
    }

    pub fn write<D: RecordDetail>(&self, record: &StateRecord<D>) -> io::Result<()> {
        let tmp_path = self.write_temp(&record.key, &record.to_line())?;
        if let Err(err) = fs::rename(&tmp_path, self.record_path(&record.key)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }

    pub fn read<D: RecordDetail>(&self, key: &str) -> io::Result<Option<StateRecord<D>>> {
        match fs::read_to_string(self.record_path(key)) {
            Ok(content) => Ok(StateRecord::from_line(key, &content)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Every record whose key starts with `prefix`, parsed lazily. Calling it
    /// again starts a fresh enumeration.
    pub fn read_all<D: RecordDetail>(&self, prefix: &str) -> RecordIter<D> {
        let mut keys = Vec::new();
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let Some(key) = name
                        .strip_suffix(RECORD_EXTENSION)
                        .and_then(|stem| stem.strip_suffix('.'))
                    else {
                        continue;
                    };
                    if key.starts_with('.') || !key.starts_with(prefix) {
                        continue;
                    }
                    keys.push(key.to_string());
                }
            }
            Err(err) => debug!("Failed to read state dir {:?}: {}", self.dir, err),
        }
        keys.sort();
        RecordIter {
            dir: self.dir.clone(),
            keys: keys.into_iter(),
            _detail: PhantomData,
        }
    }

    pub fn records<D: RecordDetail>(&self) -> RecordIter<D> {
        self.read_all(D::KIND.prefix())
    }

    pub fn delete(&self, key: &str) -> io::Result<()> {
        remove_if_exists(&self.record_path(key))
    }

    /// Applies `update` to the stored record while holding the transition lock.
    /// The record is rewritten only when `update` returns `true`.
    pub fn modify<D, F>(&self, key: &str, update: F) -> io::Result<Option<StateRecord<D>>>
    where
        D: RecordDetail,
        F: FnOnce(&mut StateRecord<D>) -> bool,
    {
        let _guard = self
            .transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(mut record) = self.read::<D>(key)? else {
            return Ok(None);
        };
        if !update(&mut record) {
            return Ok(None);
        }
        self.write(&record)?;
        Ok(Some(record))
    }

    /// Moves a `running` record to `to`. Returns `None` when the record is gone
    /// or another writer already made it terminal.
    pub fn transition<D: RecordDetail>(
        &self,
        key: &str,
        to: JobStatus,
    ) -> io::Result<Option<StateRecord<D>>> {
        self.modify(key, |record: &mut StateRecord<D>| {
            if record.status.is_terminal() {
                return false;
            }
            record.status = to;
            true
        })
    }

    pub fn exit_code(&self, subject: &str) -> Option<i32> {
        let content = fs::read_to_string(self.exit_code_path(subject)).ok()?;
        content.trim().parse::<i32>().ok()
    }

    pub fn set_exit_code(&self, subject: &str, code: i32) -> io::Result<()> {
        let marker = self.exit_code_name(subject);
        let tmp_path = self.write_temp(&marker, &code.to_string())?;
        if let Err(err) = fs::rename(&tmp_path, self.exit_code_path(subject)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }

    /// Writes the marker unless one already exists. Returns whether it was written.
    pub fn set_exit_code_if_absent(&self, subject: &str, code: i32) -> io::Result<bool> {
        let marker = self.exit_code_name(subject);
        let tmp_path = self.write_temp(&marker, &code.to_string())?;
        let linked = fs::hard_link(&tmp_path, self.exit_code_path(subject));
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn clear_exit_code(&self, subject: &str) -> io::Result<()> {
        remove_if_exists(&self.exit_code_path(subject))
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, RECORD_EXTENSION))
    }

    fn exit_code_name(&self, subject: &str) -> String {
        format!("{}{}", EXIT_CODE_PREFIX, subject)
    }

    fn exit_code_path(&self, subject: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            self.exit_code_name(subject),
            EXIT_CODE_EXTENSION
        ))
    }

    fn write_temp(&self, name: &str, content: &str) -> io::Result<PathBuf> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
        let tmp_path = self
            .dir
            .join(format!(".{}.tmp-{}-{}", name, std::process::id(), counter));
        let result = (|| {
            let mut file = File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(tmp_path)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Lazy enumeration returned by [`RecordStore::read_all`]. Files that disappear
/// or fail to parse are skipped.
pub struct RecordIter<D> {
    dir: PathBuf,
    keys: IntoIter<String>,
    _detail: PhantomData<D>,
}

impl<D: RecordDetail> Iterator for RecordIter<D> {
    type Item = StateRecord<D>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            let path = self.dir.join(format!("{}.{}", key, RECORD_EXTENSION));
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    debug!("Skipping record {}: {}", key, err);
                    continue;
                }
            };
            match StateRecord::from_line(&key, &content) {
                Some(record) => return Some(record),
                None => debug!("Skipping malformed record {}", key),
            }
        }
        None
    }
}
