pub mod compress;
pub mod naming;
pub mod retention;

use crate::backup::archive::compress::{CompressorConfig, Finish};
use crate::backup::archive::retention::RetentionPolicy;
use crate::backup::backup_config::ArchiveConfig;
use crate::backup::cancel::Cancellation;
use crate::backup::function_path;
use crate::backup::job::Job;
use crate::backup::report::SkipReason;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use chrono::{DateTime, Local};
use function_name::named;
use std::io::{BufWriter, IntoInnerError};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Hidden in-progress name, never matches `<key>-<timestamp>.<ext>`.
static PARTIAL_PREFIX: &str = ".";
static PARTIAL_SUFFIX: &str = ".partial";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created {
        path: PathBuf,
        pruned: Vec<PathBuf>,
        /// Pruning problems are reported but do not fail the job.
        prune_error: Option<String>,
    },
    Failed {
        detail: String,
    },
    Skipped(SkipReason),
}

impl ArchiveOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ArchiveOutcome::Failed { .. })
    }
}

/// Builds one compressed tarball per successful job and applies the retention
/// policy to that job's older archives.
#[derive(Clone, Debug)]
pub struct ArchiveRetentionManager {
    archive_root: PathBuf,
    compressor: CompressorConfig,
    retention: Option<RetentionPolicy>,
}

impl ArchiveRetentionManager {
    pub fn new<P: Into<PathBuf>>(archive_root: P, config: &ArchiveConfig) -> Self {
        Self {
            archive_root: archive_root.into(),
            compressor: config.compressor.clone(),
            retention: config.retention.policy(),
        }
    }

    /// Blocking. Returns `Err` only when interrupted; other problems become
    /// [`ArchiveOutcome::Failed`].
    pub fn archive(
        &self,
        job: &Job,
        destination: &Path,
        now: DateTime<Local>,
        cancel: &Cancellation,
    ) -> Result<ArchiveOutcome> {
        let path = match self.create(job, destination, now, cancel) {
            Ok(path) => path,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => {
                tracing::error!(job = %job.name(), "Archive failed: {e}");
                return Ok(ArchiveOutcome::Failed {
                    detail: e.to_string(),
                });
            }
        };
        tracing::info!(job = %job.name(), "Created archive {:?}", path);

        let (pruned, prune_error) = match self.retention {
            None => (Vec::new(), None),
            Some(policy) => match retention::prune(
                &self.archive_root,
                job.host(),
                job.archive_key(),
                self.compressor.file_ext(),
                policy,
                now,
            ) {
                Ok(pruned) => (pruned, None),
                Err(e) => {
                    tracing::warn!(job = %job.name(), "Archive retention incomplete: {e}");
                    (Vec::new(), Some(e.to_string()))
                }
            },
        };

        Ok(ArchiveOutcome::Created {
            path,
            pruned,
            prune_error,
        })
    }

    /// Writes `<archive_root>/<host>/<YYYY>/<MM>/<key>-<timestamp>.<ext>`.
    /// The tarball is assembled in a hidden temp file next to its final name and
    /// only renamed into place once complete; any early return drops (deletes) it.
    #[named]
    pub fn create(
        &self,
        job: &Job,
        destination: &Path,
        now: DateTime<Local>,
        cancel: &Cancellation,
    ) -> Result<PathBuf> {
        if !destination.exists() {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("nothing to archive at {:?}", destination),
            ))
            .add_fn_name(function_path!()));
        }

        let key = job.archive_key();
        let month_dir = naming::month_dir(&self.archive_root, job.host(), &now);
        let final_path = month_dir.join(naming::archive_file_name(key, self.compressor.file_ext(), &now));

        std::fs::create_dir_all(&month_dir)
            .map_err(Error::from)
            .add_msg(format!("Create archive directory {:?} failed", month_dir))
            .add_fn_name(function_path!())?;

        let mut temp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(&month_dir)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        let writer = self
            .compressor
            .build_compressor(BufWriter::new(&mut temp))
            .add_fn_name(function_path!())?;
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        let mut entry_count = 0usize;
        for entry in WalkDir::new(destination).follow_links(false).sort_by_file_name() {
            cancel.check()?;
            let entry = entry.map_err(Error::from).add_fn_name(function_path!())?;
            let file_type = entry.file_type();
            if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
                tracing::debug!(job = %job.name(), "Skipping special file {:?}", entry.path());
                continue;
            }
            let name = match entry.path().strip_prefix(destination) {
                Ok(relative) if relative.as_os_str().is_empty() => PathBuf::from(key),
                Ok(relative) => Path::new(key).join(relative),
                Err(_) => continue,
            };
            builder
                .append_path_with_name(entry.path(), &name)
                .map_err(Error::from)
                .add_msg(format!("Add {:?} to archive failed", entry.path()))
                .add_fn_name(function_path!())?;
            entry_count += 1;
        }
        cancel.check()?;

        builder
            .into_inner()
            .and_then(|compressor| compressor.finish())
            .and_then(|w| w.into_inner().map_err(IntoInnerError::into_error))
            .map_err(Error::from)
            .add_msg(format!("Finish archive {:?} failed", final_path))
            .add_fn_name(function_path!())?;
        temp.as_file()
            .sync_all()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        temp.persist_noclobber(&final_path)
            .map_err(Error::from)
            .add_msg(format!("Move archive into place at {:?} failed", final_path))
            .add_fn_name(function_path!())?;

        tracing::debug!(job = %job.name(), "Archived {} entries from {:?}", entry_count, destination);
        Ok(final_path)
    }
}
