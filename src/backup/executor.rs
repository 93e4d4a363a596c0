//! Runs one job as a supervised rsync child process.

use crate::backup::backup_config::{RunOptions, TransportConfig};
use crate::backup::cancel::Cancellation;
use crate::backup::classify::{Classification, OutcomeClassifier};
use crate::backup::job::Job;
use crate::backup::report::SkipReason;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use derive_more::Display;
use itertools::Itertools;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// How long a child gets to exit after SIGTERM before it is killed.
static TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Archive mode plus hard links, ACLs, xattrs and numeric ids; mirror deletions
/// (including newly excluded paths); recreate the remote path under the
/// destination.
static RSYNC_BASE_ARGS: &[&str] = &[
    "-aHAX",
    "--numeric-ids",
    "--delete",
    "--delete-excluded",
    "--relative",
    "-v",
];

#[derive(Clone, Debug, PartialEq, Eq, Display)]
pub enum JobStatus {
    #[display("SUCCESS")]
    Success,
    #[display("FAILED")]
    Failed,
    #[display("SKIPPED ({_0})")]
    Skipped(SkipReason),
}

#[derive(Clone, Debug)]
pub struct JobResult {
    pub job: Job,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    /// Set when the job ran, or failed to start.
    pub classification: Option<Classification>,
    pub destination: PathBuf,
    /// Combined stdout and stderr of the rsync run.
    pub output: Arc<str>,
    pub output_log: Option<PathBuf>,
    pub duration: Duration,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }

    pub fn skipped<P: AsRef<Path>>(job: &Job, backup_root: P, reason: SkipReason) -> Self {
        Self {
            job: job.clone(),
            status: JobStatus::Skipped(reason),
            exit_code: None,
            classification: None,
            destination: job.destination(backup_root),
            output: Arc::from(""),
            output_log: None,
            duration: Duration::ZERO,
        }
    }

    /// A job whose worker died without producing a result.
    pub fn crashed<P: AsRef<Path>>(job: &Job, backup_root: P, detail: &str) -> Self {
        Self {
            job: job.clone(),
            status: JobStatus::Failed,
            exit_code: None,
            classification: Some(OutcomeClassifier.classify(None, detail)),
            destination: job.destination(backup_root),
            output: Arc::from(detail),
            output_log: None,
            duration: Duration::ZERO,
        }
    }

    /// Short human readable error line, if the job did not succeed.
    pub fn error_summary(&self) -> Option<String> {
        match &self.status {
            JobStatus::Success => None,
            JobStatus::Skipped(reason) => Some(format!("skipped: {reason}")),
            JobStatus::Failed => Some(
                self.classification
                    .as_ref()
                    .map(Classification::to_string)
                    .unwrap_or_else(|| "failed".to_string()),
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobExecutor {
    transport: TransportConfig,
    backup_root: PathBuf,
    job_output_dir: Option<PathBuf>,
    classifier: OutcomeClassifier,
}

impl JobExecutor {
    pub fn new<P: Into<PathBuf>>(
        transport: TransportConfig,
        backup_root: P,
        job_output_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            transport,
            backup_root: backup_root.into(),
            job_output_dir,
            classifier: OutcomeClassifier,
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn rsync_args(&self, job: &Job, options: &RunOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = RSYNC_BASE_ARGS.iter().map(OsString::from).collect();

        if options.dry_run {
            args.push("--dry-run".into());
        }

        args.extend(
            job.excludes()
                .iter()
                .chain(options.extra_excludes.iter())
                .map(|pattern| OsString::from(format!("--exclude={pattern}"))),
        );

        let source = job.source();
        if job.is_local() {
            args.push(source.path().into());
        } else {
            args.push("-e".into());
            args.push(self.remote_shell(*source.port()).into());
            args.push(format!("{}@{}:{}", source.user(), source.host(), source.path()).into());
        }

        // trailing slash: sync into Live, --relative adds the remote path
        let mut live = job.live_dir(&self.backup_root).into_os_string();
        live.push("/");
        args.push(live);

        args
    }

    fn remote_shell(&self, port: u16) -> String {
        std::iter::once(self.transport.ssh_bin.clone())
            .chain(["-p".to_string(), port.to_string()])
            .chain(["-o".to_string(), "BatchMode=yes".to_string()])
            .chain(self.transport.ssh_options.iter().cloned())
            .join(" ")
    }

    /// Returns `Err` only when the run was interrupted; every other problem,
    /// including a failure to start rsync, is reported as a failed job.
    pub async fn run(&self, job: &Job, options: &RunOptions, cancel: &Cancellation) -> Result<JobResult> {
        cancel.check()?;
        let started = Instant::now();
        let destination = job.destination(&self.backup_root);
        let args = self.rsync_args(job, options);

        tracing::info!(
            job = %job.name(),
            host = %job.host(),
            dry_run = options.dry_run,
            "Starting rsync into {:?}",
            destination
        );
        tracing::debug!(job = %job.name(), "{} {:?}", self.transport.rsync_bin, args);

        let (exit_code, output) = match self.spawn_and_wait(job, &args, options, cancel).await {
            Ok(done) => done,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => (None, format!("failed to run {}: {e}", self.transport.rsync_bin)),
        };

        let classification = self.classifier.classify(exit_code, &output);
        let status = if classification.is_success() {
            JobStatus::Success
        } else {
            JobStatus::Failed
        };
        let output_log = self.persist_output(job, &output).await;
        let duration = started.elapsed();

        match status {
            JobStatus::Success => tracing::info!(
                job = %job.name(),
                "rsync finished in {:.1}s",
                duration.as_secs_f64()
            ),
            _ => tracing::error!(
                job = %job.name(),
                exit_code = ?exit_code,
                "rsync failed: {}",
                classification
            ),
        }

        Ok(JobResult {
            job: job.clone(),
            status,
            exit_code,
            classification: Some(classification),
            destination,
            output: output.into(),
            output_log,
            duration,
        })
    }

    async fn spawn_and_wait(
        &self,
        job: &Job,
        args: &[OsString],
        options: &RunOptions,
        cancel: &Cancellation,
    ) -> Result<(Option<i32>, String)> {
        if !options.dry_run {
            tokio::fs::create_dir_all(job.live_dir(&self.backup_root)).await?;
        }

        let mut child = Command::new(&self.transport.rsync_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = tokio::select! {
            res = async {
                let lines = collect_output(stdout, stderr).await?;
                let status = child.wait().await?;
                Ok::<(ExitStatus, Vec<String>), std::io::Error>((status, lines))
            } => Some(res),
            _ = cancel.cancelled() => None,
        };

        match finished {
            Some(res) => {
                let (status, lines) = res?;
                Ok((status.code(), lines.join("\n")))
            }
            None => {
                tracing::warn!(job = %job.name(), "Interrupted, terminating rsync");
                terminate(&mut child).await;
                Err(Error::Interrupted)
            }
        }
    }

    async fn persist_output(&self, job: &Job, output: &str) -> Option<PathBuf> {
        let dir = self.job_output_dir.as_ref()?.join(job.host());
        let path = dir.join(format!("{}.log", job.name()));
        let res = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, output).await
        }
        .await;
        match res {
            Ok(_) => Some(path),
            Err(e) => {
                tracing::warn!(job = %job.name(), "Write job output to {:?} failed: {e}", path);
                None
            }
        }
    }
}

/// Reads both pipes to EOF, interleaving lines in arrival order.
async fn collect_output<O, E>(stdout: Option<O>, stderr: Option<E>) -> std::io::Result<Vec<String>>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(|s| BufReader::new(s).lines());
    let mut err = stderr.map(|s| BufReader::new(s).lines());
    let mut lines = Vec::new();

    loop {
        let (from_stdout, line) = match (out.as_mut(), err.as_mut()) {
            (None, None) => break,
            (Some(o), None) => (true, o.next_line().await?),
            (None, Some(e)) => (false, e.next_line().await?),
            (Some(o), Some(e)) => tokio::select! {
                line = o.next_line() => (true, line?),
                line = e.next_line() => (false, line?),
            },
        };
        match (line, from_stdout) {
            (Some(line), _) => lines.push(line),
            (None, true) => out = None,
            (None, false) => err = None,
        }
    }

    Ok(lines)
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, "SIGTERM failed: {e}");
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(_) => return,
            Err(_) => tracing::warn!(pid, "rsync ignored SIGTERM, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!("Kill rsync failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::arcvec::ArcVec;
    use crate::backup::cancel::cancellation;
    use crate::backup::classify::Verdict;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes an executable shell script standing in for rsync.
    fn fake_rsync(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-rsync");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn executor(temp_dir: &TempDir, rsync_bin: String) -> JobExecutor {
        let transport = TransportConfig {
            rsync_bin,
            ..TransportConfig::default()
        };
        JobExecutor::new(transport, temp_dir.path().join("mirror"), None)
    }

    fn job(source: &str, excludes: &[&str]) -> Job {
        Job::new(
            "www",
            source.parse().unwrap(),
            excludes.iter().map(|s| s.to_string()).collect::<ArcVec<_>>(),
        )
    }

    #[test]
    fn test_remote_args() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, "rsync".to_string());
        let options = RunOptions {
            dry_run: false,
            extra_excludes: vec!["*.tmp".to_string()].into(),
        };
        let args = executor.rsync_args(&job("root@web1:2222:/var/www", &["*.log"]), &options);
        let args = args.iter().map(|a| a.to_string_lossy().into_owned()).collect_vec();

        assert!(args.contains(&"-aHAX".to_string()));
        assert!(args.contains(&"--numeric-ids".to_string()));
        assert!(args.contains(&"--delete-excluded".to_string()));
        assert!(args.contains(&"--relative".to_string()));
        assert!(!args.contains(&"--dry-run".to_string()));

        let log = args.iter().position(|a| a == "--exclude=*.log").unwrap();
        let tmp = args.iter().position(|a| a == "--exclude=*.tmp").unwrap();
        assert!(log < tmp, "job excludes come before run-wide excludes");

        let e = args.iter().position(|a| a == "-e").unwrap();
        assert_eq!(args[e + 1], "ssh -p 2222 -o BatchMode=yes");
        assert_eq!(args[e + 2], "root@web1:/var/www");

        let expected_dest = format!("{}/", temp_dir.path().join("mirror/web1/Live").display());
        assert_eq!(args.last().unwrap(), &expected_dest);
    }

    #[test]
    fn test_local_args_bypass_ssh() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, "rsync".to_string());
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let args = executor.rsync_args(&job("me@localhost:/data/photos", &[]), &options);
        let args = args.iter().map(|a| a.to_string_lossy().into_owned()).collect_vec();

        assert!(args.contains(&"--dry-run".to_string()));
        assert!(!args.contains(&"-e".to_string()));
        assert_eq!(args[args.len() - 2], "/data/photos");
    }

    #[tokio::test]
    async fn test_run_success_creates_live_dir() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_rsync(temp_dir.path(), "echo \"sending incremental file list\"\necho \"data/a.txt\"\nexit 0");
        let executor = executor(&temp_dir, bin);
        let job = job("me@localhost:/data", &[]);

        let result = executor
            .run(&job, &RunOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.output.contains("data/a.txt"));
        assert!(result.error_summary().is_none());
        assert_eq!(result.destination, temp_dir.path().join("mirror/localhost/Live/data"));
        assert!(temp_dir.path().join("mirror/localhost/Live").is_dir());
    }

    #[tokio::test]
    async fn test_run_zero_exit_with_error_output_fails() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_rsync(
            temp_dir.path(),
            "echo 'rsync: opendir \"/data/private\" failed: Permission denied (13)' >&2\nexit 0",
        );
        let executor = executor(&temp_dir, bin);

        let result = executor
            .run(&job("me@localhost:/data", &[]), &RunOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        let classification = result.classification.as_ref().unwrap();
        assert_eq!(classification.verdict, Verdict::Failed);
        assert!(result.error_summary().unwrap().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_fails() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_rsync(temp_dir.path(), "exit 23");
        let executor = executor(&temp_dir, bin);

        let result = executor
            .run(&job("me@localhost:/data", &[]), &RunOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(23));
        assert!(result.error_summary().unwrap().contains("No specific error message"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_failed_job() {
        let temp_dir = TempDir::new().unwrap();
        let executor = executor(&temp_dir, temp_dir.path().join("nope").to_string_lossy().into_owned());

        let result = executor
            .run(&job("me@localhost:/data", &[]), &RunOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.exit_code.is_none());
        assert!(result.error_summary().unwrap().contains("failed to run"));
    }

    #[tokio::test]
    async fn test_dry_run_does_not_create_live_dir() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_rsync(temp_dir.path(), "echo \"would transfer data/a.txt\"");
        let executor = executor(&temp_dir, bin);
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        let result = executor
            .run(&job("me@localhost:/data", &[]), &options, &Cancellation::never())
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(!temp_dir.path().join("mirror").exists());
    }

    #[tokio::test]
    async fn test_output_persisted_when_configured() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_rsync(temp_dir.path(), "echo out\necho err >&2");
        let transport = TransportConfig {
            rsync_bin: bin,
            ..TransportConfig::default()
        };
        let logs = temp_dir.path().join("logs");
        let executor = JobExecutor::new(transport, temp_dir.path().join("mirror"), Some(logs.clone()));

        let result = executor
            .run(&job("me@localhost:/data", &[]), &RunOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(result.output_log, Some(logs.join("localhost/www.log")));
        let saved = std::fs::read_to_string(logs.join("localhost/www.log")).unwrap();
        assert!(saved.contains("out"));
        assert!(saved.contains("err"));
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let temp_dir = TempDir::new().unwrap();
        let bin = fake_rsync(temp_dir.path(), "exec sleep 30");
        let executor = executor(&temp_dir, bin);
        let (trigger, cancel) = cancellation();

        let started = Instant::now();
        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .run(&job("me@localhost:/data", &[]), &RunOptions::default(), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();

        let res = handle.await.unwrap();
        assert!(matches!(res, Err(Error::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
