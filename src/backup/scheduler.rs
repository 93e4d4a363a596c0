//! Hosts one after another, the jobs of a host all at once.
//!
//! Per host: `Pending -> ProbingConnectivity -> (Skipped | Running) ->
//! Aggregating -> Done`. `Running` is a barrier: archives and the snapshot are
//! only produced once every job of the host has finished, and the next host
//! does not start until this one is `Done`.

use crate::backup::archive::{ArchiveOutcome, ArchiveRetentionManager};
use crate::backup::backup_config::{BackupConfig, RunOptions};
use crate::backup::cancel::Cancellation;
use crate::backup::executor::{JobExecutor, JobResult, JobStatus};
use crate::backup::job::{HostGroup, Job};
use crate::backup::probe::{ConnectivityProbe, Reachability};
use crate::backup::report::{RunReport, SkipReason, Status};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::snapshot::{SnapshotOutcome, SnapshotRotator};
use chrono::Local;
use derive_more::Display;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum HostState {
    Pending,
    ProbingConnectivity,
    Skipped,
    Running,
    Aggregating,
    Done,
}

#[derive(Clone, Debug)]
pub struct JobReport {
    pub result: JobResult,
    pub archive: ArchiveOutcome,
}

impl JobReport {
    pub fn status(&self) -> Status {
        let job_ok = match &self.result.status {
            JobStatus::Success => true,
            JobStatus::Skipped(reason) => *reason != SkipReason::HostUnreachable,
            JobStatus::Failed => false,
        };
        if job_ok && !self.archive.is_failed() {
            Status::Success
        } else {
            Status::Failure
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostResult {
    pub host: String,
    /// Worst of the job, archive and snapshot outcomes.
    pub status: Status,
    /// In declaration order, whatever order the jobs finished in.
    pub jobs: Vec<JobReport>,
    pub snapshot: SnapshotOutcome,
    pub unreachable: Option<String>,
    pub duration: Duration,
}

impl HostResult {
    fn new(
        host: &str,
        jobs: Vec<JobReport>,
        snapshot: SnapshotOutcome,
        unreachable: Option<String>,
        duration: Duration,
    ) -> Self {
        let status = jobs
            .iter()
            .map(JobReport::status)
            .fold(Status::Success, Status::worst)
            .worst(if snapshot.is_failed() || unreachable.is_some() {
                Status::Failure
            } else {
                Status::Success
            });
        Self {
            host: host.to_string(),
            status,
            jobs,
            snapshot,
            unreachable,
            duration,
        }
    }
}

pub struct HostScheduler {
    executor: Arc<JobExecutor>,
    probe: ConnectivityProbe,
    archiver: Option<ArchiveRetentionManager>,
    snapshots: Option<SnapshotRotator>,
    options: RunOptions,
}

impl HostScheduler {
    pub fn new(
        executor: JobExecutor,
        probe: ConnectivityProbe,
        archiver: Option<ArchiveRetentionManager>,
        snapshots: Option<SnapshotRotator>,
        options: RunOptions,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            probe,
            archiver,
            snapshots,
            options,
        }
    }

    pub fn from_config(config: &BackupConfig, options: RunOptions) -> Self {
        let executor = JobExecutor::new(
            config.transport.clone(),
            &config.backup_root,
            config.log.job_output_dir.clone(),
        );
        let archiver = config
            .archive
            .enabled
            .then(|| ArchiveRetentionManager::new(&config.archive_root, &config.archive));
        let snapshots = config
            .snapshot
            .enabled
            .then(|| SnapshotRotator::new(config.snapshot.count));
        Self::new(
            executor,
            ConnectivityProbe::new(config.transport.probe_timeout),
            archiver,
            snapshots,
            options,
        )
    }

    /// Processes every host to completion. Failures stay inside their host's
    /// result; only an interrupt ends the run early.
    pub async fn run(&self, hosts: &[HostGroup], cancel: &Cancellation) -> Result<RunReport> {
        let started_at = Local::now();
        let started = Instant::now();
        let mut results = Vec::with_capacity(hosts.len());

        for group in hosts {
            cancel.check()?;
            let result = self
                .run_host(group, cancel)
                .await
                .add_msg(format!("Backup of host {} aborted", group.host()))?;
            tracing::info!(host = %result.host, "Host finished with {}", result.status);
            results.push(result);
        }

        Ok(RunReport {
            started_at,
            duration: started.elapsed(),
            dry_run: self.options.dry_run,
            hosts: results,
        })
    }

    pub async fn run_host(&self, group: &HostGroup, cancel: &Cancellation) -> Result<HostResult> {
        let host = group.host().as_str();
        let started = Instant::now();
        transition(host, HostState::Pending);

        transition(host, HostState::ProbingConnectivity);
        if let Reachability::Unreachable(detail) = self.probe(group, cancel).await? {
            transition(host, HostState::Skipped);
            tracing::error!(host, "Host unreachable, skipping {} jobs: {detail}", group.jobs().len());
            let jobs = group
                .jobs()
                .iter()
                .map(|job| JobReport {
                    result: JobResult::skipped(job, self.executor.backup_root(), SkipReason::HostUnreachable),
                    archive: ArchiveOutcome::Skipped(SkipReason::HostUnreachable),
                })
                .collect();
            let snapshot = SnapshotOutcome::Skipped(SkipReason::HostUnreachable);
            transition(host, HostState::Done);
            return Ok(HostResult::new(host, jobs, snapshot, Some(detail), started.elapsed()));
        }

        transition(host, HostState::Running);
        let results = self.run_jobs(group, cancel).await?;

        transition(host, HostState::Aggregating);
        let mut jobs = Vec::with_capacity(results.len());
        for result in results {
            let archive = self.archive(&result, cancel).await?;
            jobs.push(JobReport { result, archive });
        }
        let snapshot = self.snapshot(group, cancel).await?;

        transition(host, HostState::Done);
        Ok(HostResult::new(host, jobs, snapshot, None, started.elapsed()))
    }

    async fn probe(&self, group: &HostGroup, cancel: &Cancellation) -> Result<Reachability> {
        if group.is_local() {
            tracing::debug!("Local host, no probe needed");
            return Ok(Reachability::Reachable);
        }
        tokio::select! {
            reachability = self.probe.check(group.host(), group.probe_port()) => Ok(reachability),
            _ = cancel.cancelled() => Err(Error::Interrupted),
        }
    }

    /// Starts every job of the host and waits for all of them.
    async fn run_jobs(&self, group: &HostGroup, cancel: &Cancellation) -> Result<Vec<JobResult>> {
        let jobs = group.jobs();
        let mut set = JoinSet::new();
        let mut index_by_task = HashMap::with_capacity(jobs.len());

        for (index, job) in jobs.iter().enumerate() {
            let executor = self.executor.clone();
            let options = self.options.clone();
            let cancel = cancel.clone();
            let job = job.clone();
            let handle = set.spawn(async move { executor.run(&job, &options, &cancel).await });
            index_by_task.insert(handle.id(), index);
        }

        let mut results: Vec<Option<JobResult>> = vec![None; jobs.len()];
        let mut interrupted = false;
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, Ok(result))) => {
                    if let Some(index) = index_by_task.get(&id) {
                        results[*index] = Some(result);
                    }
                }
                Ok((_, Err(e))) => {
                    interrupted |= e.is_interrupted();
                    if !e.is_interrupted() {
                        tracing::error!(host = %group.host(), "Job worker error: {e}");
                    }
                }
                Err(e) => {
                    tracing::error!(host = %group.host(), "Job worker panicked: {e}");
                    if let Some(index) = index_by_task.get(&e.id()) {
                        let detail = format!("job worker panicked: {e}");
                        results[*index] = Some(JobResult::crashed(&jobs[*index], self.executor.backup_root(), &detail));
                    }
                }
            }
        }

        if interrupted || cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        Ok(results
            .into_iter()
            .zip(jobs)
            .map(|(result, job)| {
                result.unwrap_or_else(|| {
                    JobResult::crashed(job, self.executor.backup_root(), "job worker returned no result")
                })
            })
            .collect())
    }

    async fn archive(&self, result: &JobResult, cancel: &Cancellation) -> Result<ArchiveOutcome> {
        let Some(archiver) = &self.archiver else {
            return Ok(ArchiveOutcome::Skipped(SkipReason::Disabled));
        };
        if self.options.dry_run {
            return Ok(ArchiveOutcome::Skipped(SkipReason::DryRun));
        }
        if !result.is_success() {
            return Ok(ArchiveOutcome::Skipped(SkipReason::JobFailed));
        }

        let archiver = archiver.clone();
        let job: Job = result.job.clone();
        let destination = result.destination.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || archiver.archive(&job, &destination, Local::now(), &cancel)).await?
    }

    async fn snapshot(&self, group: &HostGroup, cancel: &Cancellation) -> Result<SnapshotOutcome> {
        let Some(rotator) = self.snapshots else {
            return Ok(SnapshotOutcome::Skipped(SkipReason::Disabled));
        };
        if self.options.dry_run {
            return Ok(SnapshotOutcome::Skipped(SkipReason::DryRun));
        }

        let host_dir = self.executor.backup_root().join(group.host());
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || rotator.rotate(&host_dir, &cancel)).await?
    }
}

fn transition(host: &str, state: HostState) {
    tracing::debug!(host, "Host state -> {state}");
}
