//! Run-level outcome vocabulary and the plain-text rendering handed to
//! notifications.

use crate::backup::archive::ArchiveOutcome;
use crate::backup::executor::JobStatus;
use crate::backup::scheduler::HostResult;
use crate::backup::snapshot::SnapshotOutcome;
use chrono::{DateTime, Local};
use derive_more::Display;
use std::fmt::{Display, Formatter};
use std::time::Duration;

static SUBJECT_PREFIX: &str = "[k_rsync_backup]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Status {
    #[display("SUCCESS")]
    Success,
    #[display("FAILURE")]
    Failure,
}

impl Status {
    pub fn worst(self, other: Status) -> Status {
        match (self, other) {
            (Status::Success, Status::Success) => Status::Success,
            _ => Status::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SkipReason {
    #[display("dry run")]
    DryRun,
    #[display("disabled")]
    Disabled,
    #[display("job failed")]
    JobFailed,
    #[display("host unreachable")]
    HostUnreachable,
    #[display("no Live directory")]
    NoLiveDirectory,
}

/// Everything a notification needs, without looking at raw rsync output.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub duration: Duration,
    pub dry_run: bool,
    pub hosts: Vec<HostResult>,
}

impl RunReport {
    /// Logical OR of every host's failure.
    pub fn status(&self) -> Status {
        self.hosts
            .iter()
            .fold(Status::Success, |status, host| status.worst(host.status))
    }

    pub fn subject(&self) -> String {
        let dry_run = if self.dry_run { " (dry run)" } else { "" };
        format!("{SUBJECT_PREFIX} {}{dry_run}", self.status())
    }
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Backup run started {} finished with {} after {}s{}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.status(),
            self.duration.as_secs(),
            if self.dry_run { " (dry run)" } else { "" }
        )?;
        if self.hosts.is_empty() {
            writeln!(f, "\nNo jobs were configured to run.")?;
        }
        for host in &self.hosts {
            writeln!(f)?;
            write!(f, "{host}")?;
        }
        Ok(())
    }
}

impl Display for HostResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "== {}: {} ({}s)",
            self.host,
            self.status,
            self.duration.as_secs()
        )?;
        if let Some(detail) = &self.unreachable {
            writeln!(f, "   unreachable: {detail}")?;
        }
        for job in &self.jobs {
            let result = &job.result;
            match &result.status {
                JobStatus::Success => writeln!(f, "   {}: SUCCESS", result.job.name())?,
                JobStatus::Skipped(reason) => {
                    writeln!(f, "   {}: SKIPPED ({reason})", result.job.name())?
                }
                JobStatus::Failed => writeln!(
                    f,
                    "   {}: FAILED: {}",
                    result.job.name(),
                    result.error_summary().unwrap_or_default()
                )?,
            }
            match &job.archive {
                ArchiveOutcome::Created {
                    path, prune_error, ..
                } => {
                    writeln!(f, "      archive: {}", path.display())?;
                    if let Some(e) = prune_error {
                        writeln!(f, "      archive retention warning: {e}")?;
                    }
                }
                ArchiveOutcome::Failed { detail } => {
                    writeln!(f, "      archive: FAILED: {detail}")?
                }
                ArchiveOutcome::Skipped(SkipReason::Disabled) => {}
                ArchiveOutcome::Skipped(reason) => {
                    writeln!(f, "      archive: SKIPPED ({reason})")?
                }
            }
        }
        match &self.snapshot {
            SnapshotOutcome::Created { path } => writeln!(f, "   snapshot: {}", path.display()),
            SnapshotOutcome::Failed { detail } => writeln!(f, "   snapshot: FAILED: {detail}"),
            SnapshotOutcome::Skipped(SkipReason::Disabled) => Ok(()),
            SnapshotOutcome::Skipped(reason) => writeln!(f, "   snapshot: SKIPPED ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst() {
        assert_eq!(Status::Success.worst(Status::Success), Status::Success);
        assert_eq!(Status::Success.worst(Status::Failure), Status::Failure);
        assert_eq!(Status::Failure.worst(Status::Success), Status::Failure);
    }

    #[test]
    fn test_empty_report_succeeds() {
        let report = RunReport {
            started_at: Local::now(),
            duration: Duration::from_secs(3),
            dry_run: true,
            hosts: Vec::new(),
        };
        assert_eq!(report.status(), Status::Success);
        assert_eq!(report.subject(), "[k_rsync_backup] SUCCESS (dry run)");
        assert!(report.to_string().contains("No jobs"));
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::HostUnreachable.to_string(), "host unreachable");
        assert_eq!(SkipReason::DryRun.to_string(), "dry run");
    }
}
