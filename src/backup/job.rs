//! Job declarations resolved into runnable [`Job`]s, grouped per host.

use crate::backup::arcvec::ArcVec;
use crate::backup::backup_config::{BackupConfig, JobConfig};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::validate::is_valid_job_name;
use derive_more::Display;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub static DEFAULT_SSH_PORT: u16 = 22;
pub static LOCALHOST: &str = "localhost";
pub static LIVE_DIR_NAME: &str = "Live";

/// Parsed `user@host[:port]:/remote/path`.
#[derive(Clone, Debug, PartialEq, Eq, Getters, Display)]
#[display("{user}@{host}:{port}:{path}")]
#[getset(get = "pub")]
pub struct SourceSpec {
    user: String,
    host: String,
    port: u16,
    path: String,
}

impl FromStr for SourceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::config(format!(
                "invalid source {s:?} ({reason}), expected user@host[:port]:/remote/path"
            ))
        };

        let (user, rest) = s.split_once('@').ok_or_else(|| invalid("missing user"))?;
        let (host, rest) = rest.split_once(':').ok_or_else(|| invalid("missing path"))?;

        // A numeric field between the first two colons is the port.
        let (port, path) = match rest.split_once(':') {
            Some((port, path)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port out of range"))?;
                (port, path)
            }
            _ => (DEFAULT_SSH_PORT, rest),
        };

        if user.is_empty() {
            return Err(invalid("missing user"));
        }
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if !path.starts_with('/') {
            return Err(invalid("remote path must be absolute"));
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl SourceSpec {
    pub fn is_local(&self) -> bool {
        self.host == LOCALHOST
    }

    /// The remote path without leading or trailing slashes, as rsync's
    /// `--relative` recreates it under the Live directory.
    pub fn relative_path(&self) -> &str {
        self.path.trim_matches('/')
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct Job {
    name: Arc<str>,
    source: SourceSpec,
    excludes: ArcVec<String>,
}

impl Job {
    pub fn new<S: Into<Arc<str>>>(name: S, source: SourceSpec, excludes: ArcVec<String>) -> Self {
        Self {
            name: name.into(),
            source,
            excludes,
        }
    }

    pub fn host(&self) -> &str {
        self.source.host()
    }

    pub fn is_local(&self) -> bool {
        self.source.is_local()
    }

    /// `<backup_root>/<host>`
    pub fn host_dir<P: AsRef<Path>>(&self, backup_root: P) -> PathBuf {
        backup_root.as_ref().join(self.host())
    }

    /// `<backup_root>/<host>/Live`
    pub fn live_dir<P: AsRef<Path>>(&self, backup_root: P) -> PathBuf {
        self.host_dir(backup_root).join(LIVE_DIR_NAME)
    }

    /// `<backup_root>/<host>/Live/<remote-relative-path>`
    pub fn destination<P: AsRef<Path>>(&self, backup_root: P) -> PathBuf {
        let live = self.live_dir(backup_root);
        match self.source.relative_path() {
            "" => live,
            relative => live.join(relative),
        }
    }

    /// Basename of the destination, used to name and match this job's archives.
    pub fn archive_key(&self) -> &str {
        self.source
            .relative_path()
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("root")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct HostGroup {
    host: String,
    jobs: Vec<Job>,
}

impl HostGroup {
    pub fn is_local(&self) -> bool {
        self.host == LOCALHOST
    }

    /// Port of the first job, used for the connectivity probe.
    pub fn probe_port(&self) -> u16 {
        self.jobs
            .first()
            .map(|job| *job.source().port())
            .unwrap_or(DEFAULT_SSH_PORT)
    }
}

pub struct JobRegistry;

impl JobRegistry {
    /// Validates every active job and groups them by host. Hosts come back
    /// sorted; jobs keep their declaration order within a host. Any invalid
    /// declaration fails the whole load.
    #[named]
    pub fn load(config: &BackupConfig) -> Result<Vec<HostGroup>> {
        Self::load_jobs(&config.jobs, config.active_jobs.as_deref()).add_fn_name(function_path!())
    }

    pub fn load_jobs(declared: &[JobConfig], active: Option<&[String]>) -> Result<Vec<HostGroup>> {
        let mut by_name: HashMap<&str, &JobConfig> = HashMap::new();
        for job in declared {
            if by_name.insert(job.name.as_str(), job).is_some() {
                return Err(Error::config(format!("job {:?} declared twice", job.name)));
            }
        }

        let active: Vec<&str> = match active {
            Some(names) => names.iter().map(String::as_str).collect(),
            None => declared.iter().map(|j| j.name.as_str()).collect(),
        };
        if let Some(dup) = active.iter().duplicates().next() {
            return Err(Error::config(format!("job {dup:?} listed twice in active_jobs")));
        }

        let mut groups: BTreeMap<String, Vec<Job>> = BTreeMap::new();
        for name in active {
            let job = Self::resolve(name, by_name.get(name).copied())?;
            tracing::debug!("Loaded job {} from {}", job.name(), job.source());
            groups.entry(job.host().to_string()).or_default().push(job);
        }

        Ok(groups
            .into_iter()
            .map(|(host, jobs)| HostGroup { host, jobs })
            .collect())
    }

    fn resolve(name: &str, declared: Option<&JobConfig>) -> Result<Job> {
        if !is_valid_job_name(name) {
            return Err(Error::config(format!(
                "invalid job name {name:?}, only [A-Za-z0-9_] allowed"
            )));
        }

        let source = declared
            .and_then(|job| job.source.as_deref())
            .filter(|source| !source.trim().is_empty())
            .ok_or_else(|| Error::config(format!("job {name:?} has no source")))?;

        let excludes = declared.map(|job| job.excludes.clone()).unwrap_or_default();
        Ok(Job::new(name, source.trim().parse()?, excludes))
    }
}
