//! One run per configuration at a time.
//!
//! The lock is a pid file named after the canonical configuration path. A
//! record whose process is gone is stale and gets replaced. The file is removed
//! when the [`RunLock`] is dropped, which covers normal completion, error
//! returns and interrupts (the signal listener turns SIGINT/SIGTERM into a
//! regular unwinding of `main`).

use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use function_name::named;
use sanitize_filename::Options;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

static LOCK_FILE_PREFIX: &str = "k_rsync_backup-";
static LOCK_FILE_EXT: &str = "pid";
static STAGING_SUFFIX: &str = ".pid.tmp";
static MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
}

impl RunLock {
    /// Lock key for a configuration file: its canonical path.
    pub fn key_for_config<P: AsRef<Path>>(config_path: P) -> Result<String> {
        let canonical = std::fs::canonicalize(config_path.as_ref())
            .map_err(Error::from)
            .add_msg(format!("Resolve config path failed: {:?}", config_path.as_ref()))?;
        Ok(canonical.to_string_lossy().into_owned())
    }

    pub fn lock_path<P: AsRef<Path>>(lock_dir: P, key: &str) -> PathBuf {
        let name = sanitize_filename::sanitize_with_options(
            key.trim_start_matches('/'),
            Options {
                replacement: "_",
                ..Options::default()
            },
        );
        lock_dir
            .as_ref()
            .join(format!("{LOCK_FILE_PREFIX}{name}.{LOCK_FILE_EXT}"))
    }

    /// The record is written to a temp file and linked into place without
    /// clobbering, so it never exists without a pid in it.
    #[named]
    pub fn acquire<P: AsRef<Path>>(lock_dir: P, key: &str) -> Result<RunLock> {
        let lock_dir = lock_dir.as_ref();
        let path = Self::lock_path(lock_dir, key);
        let pid = std::process::id();

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match write_record(lock_dir, &path, pid) {
                Ok(_) => {
                    tracing::debug!("Acquired run lock {:?}", path);
                    return Ok(RunLock { path, pid });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_pid(&path) {
                    Some(holder) if is_process_alive(holder) => {
                        return Err(Error::already_running(holder, path));
                    }
                    holder => {
                        tracing::warn!(
                            "Removing stale lock record {:?} (pid {:?} is not running)",
                            path,
                            holder
                        );
                        reclaim_stale(&path, holder)
                            .map_err(Error::from)
                            .add_msg(format!("Remove stale lock {:?} failed", path))
                            .add_fn_name(function_path!())?;
                    }
                },
                Err(e) => {
                    return Err(Error::from(e)
                        .add_msg(format!("Create lock record {:?} failed", path))
                        .add_fn_name(function_path!()))
                }
            }
        }

        Err(Error::from(std::io::Error::other(format!(
            "lock record {:?} keeps reappearing",
            path
        )))
        .add_fn_name(function_path!()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Only remove the record if it is still ours.
        if read_pid(&self.path) != Some(self.pid as i32) {
            tracing::warn!("Lock record {:?} no longer holds our pid, leaving it", self.path);
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(_) => tracing::debug!("Released run lock {:?}", self.path),
            Err(e) => tracing::warn!("Release run lock {:?} failed: {e}", self.path),
        }
    }
}

fn write_record(lock_dir: &Path, path: &Path, pid: u32) -> std::io::Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(STAGING_SUFFIX)
        .tempfile_in(lock_dir)?;
    temp.write_all(pid.to_string().as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist_noclobber(path).map(|_| ()).map_err(|e| e.error)
}

/// Moves the stale record aside before deleting it. If what was moved is not
/// the record that was judged stale, another run has just taken the lock; its
/// record is linked back unless something already replaced it.
fn reclaim_stale(path: &Path, stale: Option<i32>) -> std::io::Result<()> {
    let aside = path.with_extension(format!("{LOCK_FILE_EXT}.{}.stale", std::process::id()));
    match std::fs::rename(path, &aside) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    if read_pid(&aside) != stale {
        match std::fs::hard_link(&aside, path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    std::fs::remove_file(&aside)
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn is_process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists under another user.
    match kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(_) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_alive(pid: i32) -> bool {
    pid as u32 == std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp_dir = TempDir::new().unwrap();
        let lock = RunLock::acquire(temp_dir.path(), "/etc/backup/a.yml").unwrap();
        assert!(lock.path().is_file());

        match RunLock::acquire(temp_dir.path(), "/etc/backup/a.yml") {
            Err(Error::AlreadyRunning { pid, .. }) => assert_eq!(pid as u32, std::process::id()),
            other => panic!("Expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn test_distinct_configs_do_not_conflict() {
        let temp_dir = TempDir::new().unwrap();
        let a = RunLock::acquire(temp_dir.path(), "/etc/backup/a.yml").unwrap();
        let b = RunLock::acquire(temp_dir.path(), "/etc/backup/b.yml").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_release_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = {
            let lock = RunLock::acquire(temp_dir.path(), "/etc/backup/a.yml").unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
        assert!(RunLock::acquire(temp_dir.path(), "/etc/backup/a.yml").is_ok());
    }

    #[test]
    fn test_stale_record_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let path = RunLock::lock_path(temp_dir.path(), "/etc/backup/a.yml");
        // pid_max on Linux is at most 2^22, so this pid cannot exist.
        std::fs::write(&path, "99999999").unwrap();

        let lock = RunLock::acquire(temp_dir.path(), "/etc/backup/a.yml").unwrap();
        let recorded = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(recorded, std::process::id().to_string());
    }

    #[test]
    fn test_garbage_record_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let path = RunLock::lock_path(temp_dir.path(), "k");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(RunLock::acquire(temp_dir.path(), "k").is_ok());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let temp_dir = TempDir::new().unwrap();
        for round in 0..200 {
            let key = format!("/etc/backup/{round}.yml");
            let barrier = Arc::new(Barrier::new(2));
            let handles = (0..2)
                .map(|_| {
                    let dir = temp_dir.path().to_path_buf();
                    let key = key.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        RunLock::acquire(&dir, &key).ok()
                    })
                })
                .collect::<Vec<_>>();
            let held = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect::<Vec<_>>();
            assert_eq!(held.len(), 1, "round {round}");
            assert_eq!(
                std::fs::read_to_string(held[0].path()).unwrap(),
                std::process::id().to_string()
            );
        }
        // no staging files left behind
        let leftovers = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(STAGING_SUFFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_reclaim_keeps_fresh_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = RunLock::lock_path(temp_dir.path(), "k");
        std::fs::write(&path, std::process::id().to_string()).unwrap();

        // judged stale from an older read, but a live run has since written it
        reclaim_stale(&path, Some(99999999)).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_lock_path_is_flat_file_name() {
        let path = RunLock::lock_path("/run/lock", "/etc/backup/site a.yml");
        assert_eq!(path.parent(), Some(Path::new("/run/lock")));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(LOCK_FILE_PREFIX));
        assert!(name.ends_with(".pid"));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_key_for_config_is_canonical() {
        let temp_dir = TempDir::new().unwrap();
        let config = temp_dir.path().join("c.yml");
        std::fs::write(&config, "").unwrap();
        let direct = RunLock::key_for_config(&config).unwrap();
        let indirect = RunLock::key_for_config(temp_dir.path().join("./c.yml")).unwrap();
        assert_eq!(direct, indirect);
    }
}
