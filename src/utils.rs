use chrono::{Local, NaiveDateTime, Timelike};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::record::STARTED_FORMAT;

/// Local wall clock truncated to whole seconds.
pub fn now_local() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn now_string() -> String {
    Local::now().format(STARTED_FORMAT).to_string()
}

pub fn is_not_found(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOENT)
}

pub fn append_log_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// Whole file as text; invalid UTF-8 is replaced rather than rejected.
pub fn read_lossy(path: &Path) -> Option<String> {
    fs::read(path)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

pub fn read_tail_lines(path: &Path, limit: usize) -> Vec<String> {
    if let Some(content) = read_lossy(path) {
        let mut lines = content.lines().map(|l| l.to_string()).collect::<Vec<_>>();
        if lines.len() > limit {
            lines.drain(0..lines.len() - limit);
        }
        lines
    } else {
        Vec::new()
    }
}

/// Files directly inside `dir` whose name passes `matches`, most recently
/// modified first. Entries without readable metadata are skipped.
pub fn files_matching<F>(dir: &Path, matches: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> bool,
{
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found = entries
        .flatten()
        .filter(|entry| matches(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|meta| meta.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect::<Vec<(SystemTime, PathBuf)>>();
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    found.into_iter().map(|(_, path)| path).collect()
}

pub fn latest_file_matching<F>(dir: &Path, matches: F) -> Option<PathBuf>
where
    F: Fn(&str) -> bool,
{
    files_matching(dir, matches).into_iter().next()
}
