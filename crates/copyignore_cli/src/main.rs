//! `copy-ignore`: back up VCS-ignored files from every repository under a
//! search root into a mirrored backup tree.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use copyignore_fs::{
    BackupRunError, C_HISTORY_SUBDIR_DEFAULT, GitCli, N_BACKUPS_KEEP_DEFAULT,
    N_QUEUE_CAPACITY_DEFAULT, N_WORKERS_COPY_DEFAULT, ReportRun, SpecBackupOptions,
    SpecCopyProgress, run_backup,
};
use tracing_subscriber::EnvFilter;

const N_STATUS_WIDTH: usize = 100;

#[derive(Debug, Parser)]
#[command(
    name = "copy-ignore",
    version,
    about = "Back up git-ignored files from many repositories into one mirrored tree"
)]
struct ArgsCli {
    /// Directory searched for repositories
    #[arg(env = "COPY_IGNORE_SEARCH_ROOT")]
    search_root: PathBuf,

    /// Root of the mirrored backup tree
    #[arg(env = "COPY_IGNORE_BACKUP_ROOT")]
    backup_root: PathBuf,

    /// Exclusion pattern; repeat for several
    #[arg(long = "exclude", value_name = "PATTERN", action = ArgAction::Append, env = "COPY_IGNORE_EXCLUDE")]
    excludes: Vec<String>,

    /// Scan and list what would be copied, without writing anything
    #[arg(long, env = "COPY_IGNORE_DRY_RUN")]
    dry_run: bool,

    /// Number of copy workers
    #[arg(long, default_value_t = N_WORKERS_COPY_DEFAULT, env = "COPY_IGNORE_CONCURRENCY")]
    concurrency: usize,

    /// Number of scan workers [default: number of CPUs]
    #[arg(long, env = "COPY_IGNORE_SCAN_WORKERS")]
    scan_workers: Option<usize>,

    /// Log every copy, skip and exclude decision
    #[arg(short, long, env = "COPY_IGNORE_VERBOSE")]
    verbose: bool,

    /// Versions kept per backed-up path
    #[arg(long, default_value_t = N_BACKUPS_KEEP_DEFAULT, env = "COPY_IGNORE_BACKUP_KEEP")]
    backup_keep: usize,

    /// History subdirectory under the backup root
    #[arg(long, default_value = C_HISTORY_SUBDIR_DEFAULT, env = "COPY_IGNORE_HISTORY_SUBDIR")]
    history_subdir: String,

    /// Explicit history root; overrides --history-subdir
    #[arg(long, env = "COPY_IGNORE_HISTORY_DIR")]
    history_dir: Option<PathBuf>,

    /// Capacity of the queue between scan and copy
    #[arg(long, default_value_t = N_QUEUE_CAPACITY_DEFAULT, env = "COPY_IGNORE_QUEUE_CAPACITY")]
    queue_capacity: usize,

    /// Minimum milliseconds between progress lines
    #[arg(long, default_value_t = 500, env = "COPY_IGNORE_PROGRESS_MS")]
    progress_ms: u64,

    /// Keep backups whose sources were deleted instead of moving them to history
    #[arg(long, env = "COPY_IGNORE_NO_CLEANUP")]
    no_cleanup: bool,

    /// Path to the git executable
    #[arg(long, default_value = "git", env = "COPY_IGNORE_GIT")]
    git: String,
}

impl ArgsCli {
    fn to_options(&self) -> SpecBackupOptions {
        SpecBackupOptions {
            path_dir_search: self.search_root.clone(),
            path_dir_backup: self.backup_root.clone(),
            patterns_exclude: self.excludes.clone(),
            if_dry_run: self.dry_run,
            num_workers_copy: self.concurrency,
            num_workers_scan: self.scan_workers,
            if_verbose: self.verbose,
            num_backups_keep: self.backup_keep,
            name_history_subdir: self.history_subdir.clone(),
            path_dir_history: self.history_dir.clone(),
            c_timestamp: None,
            num_queue_capacity: self.queue_capacity,
            duration_progress_interval: Duration::from_millis(self.progress_ms),
            if_cleanup_orphans: !self.no_cleanup,
        }
    }
}

fn init_logging(if_verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if if_verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn truncate_left(c_text: &str, n_width: usize) -> String {
    let n_chars = c_text.chars().count();
    if n_chars <= n_width {
        return c_text.to_string();
    }
    let n_tail = n_width.saturating_sub(3);
    let c_tail: String = c_text.chars().skip(n_chars - n_tail).collect();
    format!("...{c_tail}")
}

fn print_status(c_line: &str) {
    let mut stdout = io::stdout().lock();
    let _ = write!(stdout, "\r{:<width$}", c_line, width = N_STATUS_WIDTH);
    let _ = stdout.flush();
}

fn print_visit(path_dir: &Path) {
    let c_path = path_dir.display().to_string();
    print_status(&format!("scanning: {}", truncate_left(&c_path, N_STATUS_WIDTH - 10)));
}

fn print_progress(progress: &SpecCopyProgress) {
    if progress.if_final {
        print_status(&format!(
            "copied={} skipped={} errors={} total={}",
            progress.cnt_copied, progress.cnt_skipped, progress.cnt_errors, progress.cnt_total
        ));
        println!();
        return;
    }
    let c_path = progress.path_src.display().to_string();
    print_status(&format!(
        "[{}/{}] {}",
        progress.cnt_copied + progress.cnt_skipped + progress.cnt_errors,
        progress.cnt_total,
        truncate_left(&c_path, N_STATUS_WIDTH - 20)
    ));
}

fn print_summary(args: &ArgsCli, report: &ReportRun) {
    println!();
    if args.dry_run {
        for spec_entry in &report.entries_planned {
            println!(
                "{} -> {}",
                spec_entry.path_abs().display(),
                spec_entry.destination_in(&args.backup_root).display()
            );
        }
    }
    println!("{report}");
    if let Some(report_copy) = &report.report_copy {
        for spec_error in &report_copy.errors {
            eprintln!(
                "error [{}] {}: {}",
                spec_error.kind.as_str(),
                spec_error.path.display(),
                spec_error.exception
            );
        }
    }
    for (path_repo, c_message) in &report.report_scan.repositories_failed {
        eprintln!("repository skipped {}: {c_message}", path_repo.display());
    }
    for path_dir in &report.report_scan.dirs_unreadable {
        eprintln!("directory not readable {}", path_dir.display());
    }
}

fn run(args: &ArgsCli) -> anyhow::Result<ReportRun> {
    let spec_options = args.to_options();
    let oracle = GitCli::new(args.git.clone());
    let report = run_backup(&spec_options, &oracle, print_visit, Some(&print_progress))
        .context("backup run failed")?;
    print_summary(args, &report);
    Ok(report)
}

fn main() -> ExitCode {
    let args = ArgsCli::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(report) => {
            if !report.is_clean() {
                tracing::warn!("Backup finished with errors");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("\nError: {e:#}");
            match e.downcast_ref::<BackupRunError>() {
                Some(BackupRunError::ConfigInvalid(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
