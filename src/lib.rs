//! # k-rsync-backup
//!
//! Mirrors directories from many hosts with rsync, then keeps per-job
//! compressed archives and per-host hard-link snapshots of the mirror.
//!
//! ## Features
//!
//! - **Per-host parallelism**: hosts run one at a time, a host's jobs run concurrently
//! - **Honest classification**: rsync output is scanned for errors even on exit code 0
//! - **Archives**: tar + XZ (LZMA) per job, pruned by age or count
//! - **Snapshots**: rotated `Snapshot.0..N-1` hard-link clones of `Live`
//! - **Single instance**: a pid lock per configuration file
//! - **Notifications**: run summary by SMTP
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_rsync_backup::backup::backup_config::{BackupConfig, RunOptions};
//! use k_rsync_backup::backup::cancel::Cancellation;
//! use k_rsync_backup::backup::job::JobRegistry;
//! use k_rsync_backup::backup::scheduler::HostScheduler;
//!
//! let config = BackupConfig::load("backup.yml")?;
//! let hosts = JobRegistry::load(&config)?;
//! let scheduler = HostScheduler::from_config(&config, RunOptions::default());
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let report = runtime.block_on(scheduler.run(&hosts, &Cancellation::never()))?;
//! println!("{}\n{}", report.subject(), report);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
