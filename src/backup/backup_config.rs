use crate::backup::archive::compress::CompressorConfig;
use crate::backup::archive::retention::RetentionPolicy;
use crate::backup::arcvec::ArcVec;
use crate::backup::function_path;
use crate::backup::notifications::NotificationConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::validate::{validate_dir_if_exists, validate_not_blank, validate_writable_dir};
use function_name::named;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

static DEFAULT_SNAPSHOT_COUNT: usize = 7;
static DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything read from the configuration file. Loaded once per run and never
/// mutated afterwards.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    #[validate(custom(function = validate_writable_dir))]
    pub backup_root: PathBuf,
    #[validate(custom(function = validate_writable_dir))]
    pub archive_root: PathBuf,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    /// Jobs to run, in order. Every declared job runs when absent.
    pub active_jobs: Option<Vec<String>>,
    #[serde(default)]
    #[validate(nested)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    #[validate(nested)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    #[validate(nested)]
    pub transport: TransportConfig,
    #[validate(custom(function = validate_dir_if_exists))]
    pub lock_dir: Option<PathBuf>,
    #[serde(default)]
    pub log: LogConfig,
    #[validate(nested)]
    pub notification: Option<NotificationConfig>,
}

/// A declared job. Name and source are checked by the job registry so that a
/// bad declaration aborts the run before any host is touched.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,
    /// `user@host[:port]:/remote/path`
    pub source: Option<String>,
    #[serde(default)]
    pub excludes: ArcVec<String>,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Clone, Copy, Default, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    #[serde(default)]
    pub max_age_days: u32,
    #[serde(default)]
    pub max_count: usize,
}

impl RetentionConfig {
    /// Age wins over count when both are set.
    pub fn policy(&self) -> Option<RetentionPolicy> {
        if self.max_age_days > 0 {
            Some(RetentionPolicy::MaxAge {
                days: self.max_age_days,
            })
        } else if self.max_count > 0 {
            Some(RetentionPolicy::MaxCount {
                count: self.max_count,
            })
        } else {
            None
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_snapshot_count")]
    #[validate(range(min = 1))]
    pub count: usize,
}

fn default_snapshot_count() -> usize {
    DEFAULT_SNAPSHOT_COUNT
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            count: DEFAULT_SNAPSHOT_COUNT,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_rsync_bin")]
    #[validate(custom(function = validate_not_blank))]
    pub rsync_bin: String,
    #[serde(default = "default_ssh_bin")]
    #[validate(custom(function = validate_not_blank))]
    pub ssh_bin: String,
    /// Extra arguments for every ssh invocation, e.g. `["-i", "/root/.ssh/backup"]`.
    #[serde(default)]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub probe_timeout: Duration,
}

fn default_rsync_bin() -> String {
    "rsync".to_string()
}

fn default_ssh_bin() -> String {
    "ssh".to_string()
}

fn default_probe_timeout() -> Duration {
    DEFAULT_PROBE_TIMEOUT
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rsync_bin: default_rsync_bin(),
            ssh_bin: default_ssh_bin(),
            ssh_options: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub verbose: bool,
    /// Route log output to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// Keep each job's raw rsync output under `<dir>/<host>/<job>.log`.
    pub job_output_dir: Option<PathBuf>,
}

impl BackupConfig {
    #[named]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .add_msg(format!("Open config file failed: {:?}", path))
            .and_then(|f| {
                serde_yml::from_reader::<_, BackupConfig>(f)
                    .map_err(Error::from)
                    .add_msg(format!("Parse YAML config failed: {:?}", path))
            })
            .add_fn_name(function_path!())?;

        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {:?}", path))
            .add_fn_name(function_path!())?;

        Ok(config)
    }

    /// Creates the lock directory and, unless this is a dry run, the backup
    /// and archive roots. Loading only checks them, so a dry run leaves the
    /// filesystem as it found it apart from the lock record.
    #[named]
    pub fn prepare_dirs(&self, dry_run: bool) -> Result<()> {
        let roots = [&self.backup_root, &self.archive_root];
        let dirs = self
            .lock_dir
            .iter()
            .chain(roots.into_iter().filter(|_| !dry_run));
        for dir in dirs {
            std::fs::create_dir_all(dir)
                .map_err(Error::from)
                .add_msg(format!("Create directory {:?} failed", dir))
                .add_fn_name(function_path!())?;
        }
        Ok(())
    }
}

/// Per-invocation switches from the command line.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Appended to every job's excludes for this run only.
    pub extra_excludes: ArcVec<String>,
}
