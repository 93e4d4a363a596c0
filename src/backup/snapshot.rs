//! Generational hard-link snapshots of a host's Live directory.
//!
//! `Snapshot.0` is always the newest. The new clone is staged under
//! `.Snapshot.0.partial` before any existing slot moves, so a failed or
//! interrupted clone leaves the previous generations exactly as they were.

use crate::backup::cancel::Cancellation;
use crate::backup::function_path;
use crate::backup::job::LIVE_DIR_NAME;
use crate::backup::report::SkipReason;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use itertools::Itertools;
use std::fs::Permissions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub static SNAPSHOT_PREFIX: &str = "Snapshot.";
static STAGING_DIR_NAME: &str = ".Snapshot.0.partial";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Created { path: PathBuf },
    Failed { detail: String },
    Skipped(SkipReason),
}

impl SnapshotOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SnapshotOutcome::Failed { .. })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SnapshotRotator {
    count: usize,
}

impl SnapshotRotator {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }

    pub fn slot_path<P: AsRef<Path>>(host_dir: P, index: usize) -> PathBuf {
        host_dir.as_ref().join(format!("{SNAPSHOT_PREFIX}{index}"))
    }

    /// Indices of the `Snapshot.<n>` directories under `host_dir`, ascending.
    pub fn existing_slots<P: AsRef<Path>>(host_dir: P) -> Result<Vec<usize>> {
        let read_dir = match std::fs::read_dir(host_dir.as_ref()) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut slots = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let index = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(SNAPSHOT_PREFIX))
                .and_then(|index| index.parse::<usize>().ok());
            if let Some(index) = index {
                if entry.file_type()?.is_dir() {
                    slots.push(index);
                }
            }
        }
        Ok(slots.into_iter().sorted().collect())
    }

    /// Blocking. Returns `Err` only when interrupted.
    pub fn rotate<P: AsRef<Path>>(&self, host_dir: P, cancel: &Cancellation) -> Result<SnapshotOutcome> {
        let host_dir = host_dir.as_ref();
        let live = host_dir.join(LIVE_DIR_NAME);
        if !live.is_dir() {
            tracing::info!("No Live directory at {:?}, skipping snapshot", live);
            return Ok(SnapshotOutcome::Skipped(SkipReason::NoLiveDirectory));
        }

        match self.rotate_inner(host_dir, &live, cancel) {
            Ok(path) => {
                tracing::info!("Created snapshot {:?}", path);
                Ok(SnapshotOutcome::Created { path })
            }
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                tracing::error!("Snapshot of {:?} failed: {e}", host_dir);
                Ok(SnapshotOutcome::Failed {
                    detail: e.to_string(),
                })
            }
        }
    }

    #[named]
    fn rotate_inner(&self, host_dir: &Path, live: &Path, cancel: &Cancellation) -> Result<PathBuf> {
        let staging = host_dir.join(STAGING_DIR_NAME);
        remove_dir_if_exists(&staging)
            .add_msg(format!("Remove stale staging directory {:?} failed", staging))
            .add_fn_name(function_path!())?;

        if let Err(e) = clone_tree(live, &staging, cancel) {
            if let Err(cleanup) = remove_dir_if_exists(&staging) {
                tracing::warn!("Cleanup of {:?} failed: {cleanup}", staging);
            }
            return Err(e
                .add_msg(format!("Hard-link clone of {:?} failed", live))
                .add_fn_name(function_path!()));
        }

        // The oldest retained slot, plus anything left over from a larger count.
        for index in Self::existing_slots(host_dir)?
            .into_iter()
            .filter(|index| *index + 1 >= self.count)
        {
            let slot = Self::slot_path(host_dir, index);
            tracing::debug!("Removing expired snapshot {:?}", slot);
            remove_dir_if_exists(&slot)
                .add_msg(format!("Remove expired snapshot {:?} failed", slot))
                .add_fn_name(function_path!())?;
        }

        // Descending, so no slot is overwritten before it has moved.
        for index in (0..self.count.saturating_sub(1)).rev() {
            let from = Self::slot_path(host_dir, index);
            if from.is_dir() {
                let to = Self::slot_path(host_dir, index + 1);
                std::fs::rename(&from, &to)
                    .map_err(Error::from)
                    .add_msg(format!("Shift snapshot {:?} to {:?} failed", from, to))
                    .add_fn_name(function_path!())?;
            }
        }

        let newest = Self::slot_path(host_dir, 0);
        std::fs::rename(&staging, &newest)
            .map_err(Error::from)
            .add_msg(format!("Move {:?} to {:?} failed", staging, newest))
            .add_fn_name(function_path!())?;
        Ok(newest)
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recreates `src` at `dst`: directories are created, regular files
/// hard-linked, symlinks copied as symlinks. Directory permissions are applied
/// last so read-only directories can still be filled.
fn clone_tree(src: &Path, dst: &Path, cancel: &Cancellation) -> Result<()> {
    let mut dir_permissions: Vec<(PathBuf, Permissions)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        cancel.check()?;
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::from(std::io::Error::other(e)))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir(&target)?;
            dir_permissions.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_file() {
            std::fs::hard_link(entry.path(), &target)
                .map_err(Error::from)
                .add_msg(format!("Link {:?} failed", entry.path()))?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            symlink(&link, &target)?;
        } else {
            tracing::debug!("Skipping special file {:?}", entry.path());
        }
    }

    for (dir, permissions) in dir_permissions.into_iter().rev() {
        std::fs::set_permissions(&dir, permissions)?;
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(original: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::other(format!("cannot recreate symlink to {:?}", original)))
}
