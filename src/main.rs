use clap::Parser;
use k_rsync_backup::backup::backup_config::{BackupConfig, LogConfig, RunOptions};
use k_rsync_backup::backup::cancel::{cancellation, listen_for_signals};
use k_rsync_backup::backup::job::JobRegistry;
use k_rsync_backup::backup::lock::RunLock;
use k_rsync_backup::backup::notifications::Notification;
use k_rsync_backup::backup::result_error::error::Error;
use k_rsync_backup::backup::result_error::result::Result;
use k_rsync_backup::backup::result_error::AddMsg;
use k_rsync_backup::backup::scheduler::HostScheduler;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Mutex;
use tracing::{error, info, warn, Level};

static EXIT_OK: i32 = 0;
static EXIT_FATAL: i32 = 1;
static EXIT_INTERRUPTED: i32 = 130;

/// Mirror remote directories with rsync, then archive and snapshot them
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    config: PathBuf,
    /// Run rsync with --dry-run and write no archive or snapshot
    #[arg(long)]
    dry_run: bool,
    /// Exclude pattern added to every job for this run (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version also come through here
            let code = if e.use_stderr() { EXIT_FATAL } else { EXIT_OK };
            let _ = e.print();
            exit(code);
        }
    };

    exit(run(args));
}

fn run(args: Args) -> i32 {
    let config = match BackupConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            let _ = init_logging(&LogConfig::default());
            error!("{e}");
            return EXIT_FATAL;
        }
    };
    if let Err(e) = init_logging(&config.log) {
        warn!("{e}");
    }

    let hosts = match JobRegistry::load(&config) {
        Ok(hosts) => hosts,
        Err(e) => {
            error!("{e}");
            return EXIT_FATAL;
        }
    };

    if let Err(e) = config.prepare_dirs(args.dry_run) {
        error!("{e}");
        return EXIT_FATAL;
    }

    let lock_dir = config.lock_dir.clone().unwrap_or_else(std::env::temp_dir);
    let _lock = match RunLock::key_for_config(&args.config)
        .and_then(|key| RunLock::acquire(&lock_dir, &key))
    {
        Ok(lock) => lock,
        Err(e) => {
            error!("{e}");
            return EXIT_FATAL;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Start async runtime failed: {e}");
            return EXIT_FATAL;
        }
    };

    let options = RunOptions {
        dry_run: args.dry_run,
        extra_excludes: args.excludes.into(),
    };
    info!(
        "Starting backup of {} hosts{}",
        hosts.len(),
        if options.dry_run { " (dry run)" } else { "" }
    );
    let scheduler = HostScheduler::from_config(&config, options);

    let res = runtime.block_on(async {
        let (trigger, cancel) = cancellation();
        let listener = listen_for_signals(trigger);
        let res = scheduler.run(&hosts, &cancel).await;
        listener.abort();
        res
    });
    drop(runtime);

    match res {
        Ok(report) => {
            info!("{}\n{}", report.subject(), report);
            if let Some(notification) = &config.notification {
                notification.notify(&report);
            }
            EXIT_OK
        }
        Err(e) if e.is_interrupted() => {
            warn!("Backup interrupted, cleaned up and exiting");
            EXIT_INTERRUPTED
        }
        Err(e) => {
            error!("{e}");
            EXIT_FATAL
        }
    }
}

/// INFO by default, DEBUG when verbose. With `log.file` set, output is
/// appended there; if it cannot be opened, stderr is used and the error
/// returned.
fn init_logging(log: &LogConfig) -> Result<()> {
    let level = if log.verbose { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt().with_max_level(level);

    let Some(path) = &log.file else {
        builder.init();
        return Ok(());
    };

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
            Ok(())
        }
        Err(e) => {
            builder.init();
            Err(Error::from(e).add_msg(format!("Open log file {:?} failed, logging to stderr", path)))
        }
    }
}
