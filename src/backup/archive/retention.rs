//! Age- or count-based pruning of one job's archives.
//!
//! Only files whose name is exactly `<key>-<timestamp>.<ext>` take part;
//! ordering and age come from that timestamp, never from mtime. The scan is a
//! point-in-time listing, so an archive written concurrently is never counted
//! and never deleted: a race under-deletes.

use crate::backup::archive::naming;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::AddMsg;
use chrono::{DateTime, Local, TimeDelta};
use itertools::Itertools;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionPolicy {
    MaxAge { days: u32 },
    MaxCount { count: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub date_time: DateTime<Local>,
}

impl RetentionPolicy {
    /// Archives the policy wants gone, oldest first.
    pub fn select_for_deletion(&self, files: Vec<ArchiveFile>, now: DateTime<Local>) -> Vec<ArchiveFile> {
        let files = files
            .into_iter()
            .sorted_by(|a, b| a.date_time.cmp(&b.date_time).then_with(|| a.path.cmp(&b.path)))
            .collect_vec();

        match *self {
            RetentionPolicy::MaxAge { days } => {
                let max_age = TimeDelta::days(days as i64);
                files
                    .into_iter()
                    .filter(|f| now.signed_duration_since(f.date_time) > max_age)
                    .collect()
            }
            RetentionPolicy::MaxCount { count } => {
                let excess = files.len().saturating_sub(count);
                files.into_iter().take(excess).collect()
            }
        }
    }
}

/// Every archive of `key` under `<archive_root>/<host>/<YYYY>/<MM>/`.
pub fn scan<P: AsRef<Path>>(archive_root: P, host: &str, key: &str, ext: &str) -> Result<Vec<ArchiveFile>> {
    let host_dir = naming::host_dir(archive_root, host);
    if !host_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&host_dir).min_depth(3).max_depth(3) {
        let entry = match entry {
            Ok(entry) => entry,
            // pruned by a concurrent run between listing and stat
            Err(e) if e.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => continue,
            Err(e) => {
                return Err(Error::from(e).add_msg(format!("Scan archives in {:?} failed", host_dir)))
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let parsed = entry
            .file_name()
            .to_str()
            .and_then(|name| naming::parse_archive_time(name, key, ext))
            .and_then(naming::local_time);
        if let Some(date_time) = parsed {
            files.push(ArchiveFile {
                path: entry.into_path(),
                date_time,
            });
        }
    }
    Ok(files)
}

/// Applies `policy` to `key`'s archives and returns the removed paths.
/// Running it again right away removes nothing.
pub fn prune<P: AsRef<Path>>(
    archive_root: P,
    host: &str,
    key: &str,
    ext: &str,
    policy: RetentionPolicy,
    now: DateTime<Local>,
) -> Result<Vec<PathBuf>> {
    let archive_root = archive_root.as_ref();
    let files = scan(archive_root, host, key, ext)?;
    let total = files.len();
    let doomed = policy.select_for_deletion(files, now);
    tracing::debug!(host, key, "Retention {:?}: {} of {} archives to remove", policy, doomed.len(), total);

    let mut removed = Vec::new();
    let mut errors = Vec::new();
    for file in doomed {
        match std::fs::remove_file(&file.path) {
            Ok(_) => {
                tracing::info!(host, key, "Removed old archive {:?}", file.path);
                removed.push(file.path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => errors.push(Error::from(e).add_msg(format!("Remove archive {:?} failed", file.path))),
        }
    }

    let host_dir = naming::host_dir(archive_root, host);
    for dir in removed.iter().filter_map(|p| p.parent()).unique() {
        remove_empty_dirs_up_to(dir, &host_dir);
    }

    convert_error_vec(errors).map(|_| removed)
}

/// Removes `dir` and then its parents while they are empty, stopping at `stop`.
fn remove_empty_dirs_up_to(dir: &Path, stop: &Path) {
    let mut current = Some(dir);
    while let Some(dir) = current.filter(|d| *d != stop && d.starts_with(stop)) {
        // fails on non-empty dirs, which is the stop condition
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        tracing::debug!("Removed empty archive directory {:?}", dir);
        current = dir.parent();
    }
}
