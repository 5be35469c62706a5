//! End-to-end backup run: validate, scan, copy, clean up.

use std::path::{Path, PathBuf};
use std::thread;

use chrono::Local;
use crossbeam_channel::bounded;

use crate::backup::BackupManager;
use crate::copy::{CopyEngine, FnCopyProgress};
use crate::exclude::ExcludeMatcher;
use crate::report::{ReportCleanup, ReportRun, ReportScan};
use crate::scan::ScanOrchestrator;
use crate::spec::{BackupRunError, C_TIMESTAMP_FORMAT, SpecBackupOptions, SpecDiscoveredEntry};
use crate::util::derive_relative_path;
use crate::vcs::IgnoreOracle;

/// Run one backup described by `spec_options`.
///
/// The scan and copy stages run concurrently, connected by a bounded queue.
/// Orphan cleanup starts only after every copy worker has finished, and only
/// when the scan walked the whole tree. A dry run scans and returns the
/// planned entries without touching the backup root.
///
/// Per-entry and per-repository failures are reported in [`ReportRun`]; the
/// returned error covers configuration, traversal and setup failures.
pub fn run_backup<V>(
    spec_options: &SpecBackupOptions,
    oracle: &dyn IgnoreOracle,
    on_visit: V,
    on_progress: Option<FnCopyProgress<'_>>,
) -> Result<ReportRun, BackupRunError>
where
    V: FnMut(&Path),
{
    spec_options.validate()?;
    let c_timestamp = spec_options
        .c_timestamp
        .clone()
        .unwrap_or_else(|| Local::now().format(C_TIMESTAMP_FORMAT).to_string());
    let matcher = ExcludeMatcher::new(&spec_options.patterns_exclude);
    tracing::info!(
        search_root = %spec_options.path_dir_search.display(),
        backup_root = %spec_options.path_dir_backup.display(),
        timestamp = %c_timestamp,
        patterns = %matcher,
        dry_run = spec_options.if_dry_run,
        "Starting backup run"
    );

    let path_dir_history = spec_options.history_root();
    let orchestrator = ScanOrchestrator::new(oracle, &matcher, &spec_options.path_dir_search)
        .with_workers(spec_options.num_workers_scan)
        .with_skipped_paths([spec_options.path_dir_backup.clone(), path_dir_history.clone()]);
    let (tx_entries, rx_entries) = bounded::<SpecDiscoveredEntry>(spec_options.num_queue_capacity);

    if spec_options.if_dry_run {
        let (res_scan, l_entries) = thread::scope(|scope| {
            let handle_collect = scope.spawn(move || rx_entries.iter().collect::<Vec<_>>());
            let res_scan = orchestrator.run(&tx_entries, on_visit);
            drop(tx_entries);
            (res_scan, handle_collect.join())
        });
        let report_scan = res_scan?;
        let mut entries_planned = l_entries.map_err(|_| BackupRunError::WorkerPanicked("dry-run"))?;
        entries_planned.sort();
        if spec_options.if_verbose {
            for spec_entry in &entries_planned {
                tracing::info!(
                    src = %spec_entry.path_abs().display(),
                    dst = %spec_entry.destination_in(&spec_options.path_dir_backup).display(),
                    "Would copy"
                );
            }
        }
        return Ok(ReportRun {
            c_timestamp,
            report_scan,
            report_copy: None,
            report_cleanup: None,
            entries_planned,
        });
    }

    let manager_backup = BackupManager::from_options(spec_options, &c_timestamp);
    let engine = CopyEngine::new(&spec_options.path_dir_backup, &matcher)
        .with_backup_manager(&manager_backup)
        .with_workers(spec_options.num_workers_copy)
        .with_progress_interval(spec_options.duration_progress_interval);

    let (res_scan, res_copy) = thread::scope(|scope| {
        let engine = &engine;
        let handle_copy = scope.spawn(move || engine.run(rx_entries, on_progress));
        let res_scan = orchestrator.run(&tx_entries, on_visit);
        drop(tx_entries);
        (res_scan, handle_copy.join())
    });
    let report_copy = res_copy.map_err(|_| BackupRunError::WorkerPanicked("copy"))??;
    let report_scan = res_scan?;

    let report_cleanup = if spec_options.if_cleanup_orphans && report_scan.if_completed {
        Some(cleanup_after_copy(
            &manager_backup,
            &report_scan,
            &report_copy.set_paths_dst,
            spec_options,
        ))
    } else {
        tracing::info!("Skipping orphan cleanup");
        None
    };

    let report = ReportRun {
        c_timestamp,
        report_scan,
        report_copy: Some(report_copy),
        report_cleanup,
        entries_planned: Vec::new(),
    };
    tracing::info!(clean = report.is_clean(), "Backup run finished");
    Ok(report)
}

fn cleanup_after_copy(
    manager_backup: &BackupManager,
    report_scan: &ReportScan,
    set_paths_dst: &std::collections::BTreeSet<PathBuf>,
    spec_options: &SpecBackupOptions,
) -> ReportCleanup {
    let iter_paths_unscanned = report_scan
        .repositories_failed
        .iter()
        .map(|(path_repo, _)| path_repo)
        .chain(&report_scan.dirs_unreadable);
    let mut l_paths_protected = Vec::new();
    for path_unscanned in iter_paths_unscanned {
        match derive_relative_path(path_unscanned, &spec_options.path_dir_search) {
            Some(path_rel) => l_paths_protected.push(spec_options.path_dir_backup.join(path_rel)),
            None => {
                tracing::warn!(
                    path = %path_unscanned.display(),
                    "Search root itself was not scanned; skipping orphan cleanup"
                );
                return ReportCleanup::default();
            }
        }
    }

    match manager_backup.cleanup_orphans(set_paths_dst, &l_paths_protected) {
        Ok(report) => {
            tracing::info!("{report}");
            report
        }
        Err(e) => {
            tracing::warn!(error = %e, "Orphan cleanup failed");
            ReportCleanup {
                errors: vec![e.to_string()],
                ..ReportCleanup::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use super::run_backup;
    use crate::spec::{BackupRunError, SpecBackupOptions};
    use crate::vcs::MemoryIgnoreOracle;

    fn write_text(path: &Path, c_text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, c_text).expect("write");
    }

    #[test]
    fn dry_run_plans_without_writing() {
        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path().join("search");
        let path_repo = path_search.join("repo");
        fs::create_dir_all(path_repo.join(".git")).expect("mkdir");
        write_text(&path_repo.join(".env"), "SECRET=1");
        let path_backup = tmp.path().join("backup");

        let oracle = MemoryIgnoreOracle::new().with_ignored_files(&path_repo, [".env"]);
        let spec_options = SpecBackupOptions {
            if_dry_run: true,
            ..SpecBackupOptions::new(&path_search, &path_backup)
        };
        let report = run_backup(&spec_options, &oracle, |_| {}, None).expect("run");

        assert_eq!(report.entries_planned.len(), 1);
        assert_eq!(report.entries_planned[0].path_rel(), Path::new("repo/.env"));
        assert!(report.report_copy.is_none());
        assert!(!path_backup.exists());
    }

    #[test]
    fn invalid_options_fail_before_work() {
        let tmp = TempDir::new().expect("tempdir");
        let oracle = MemoryIgnoreOracle::new();
        let spec_options = SpecBackupOptions::new(tmp.path().join("absent"), tmp.path().join("b"));
        let err = run_backup(&spec_options, &oracle, |_| {}, None).expect_err("invalid");
        assert!(matches!(err, BackupRunError::ConfigInvalid(_)));
    }

    #[test]
    fn failed_repository_protects_its_backups() {
        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path().join("search");
        let path_repo = path_search.join("broken");
        fs::create_dir_all(path_repo.join(".git")).expect("mkdir");
        let path_backup = tmp.path().join("backup");
        write_text(&path_backup.join("broken/build/out.bin"), "kept");

        let oracle = MemoryIgnoreOracle::new().with_failure(&path_repo, "index locked");
        let spec_options = SpecBackupOptions {
            c_timestamp: Some("20240101-000000".to_string()),
            ..SpecBackupOptions::new(&path_search, &path_backup)
        };
        let report = run_backup(&spec_options, &oracle, |_| {}, None).expect("run");

        assert_eq!(report.report_scan.repositories_failed.len(), 1);
        assert!(path_backup.join("broken/build/out.bin").exists());
        let report_cleanup = report.report_cleanup.as_ref().expect("cleanup ran");
        assert_eq!(report_cleanup.cnt_versioned, 0);
        assert!(!report.is_clean());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_protects_its_backups() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path().join("search");
        let path_locked = path_search.join("locked");
        fs::create_dir_all(path_locked.join("repo/.git")).expect("mkdir");
        let path_backup = tmp.path().join("backup");
        write_text(&path_backup.join("locked/repo/.env"), "kept");
        write_text(&path_backup.join("gone/old.txt"), "orphan");

        fs::set_permissions(&path_locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&path_locked).is_ok() {
            // Privileged user: permissions do not restrict listing.
            fs::set_permissions(&path_locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let oracle = MemoryIgnoreOracle::new();
        let spec_options = SpecBackupOptions {
            c_timestamp: Some("20240101-000000".to_string()),
            ..SpecBackupOptions::new(&path_search, &path_backup)
        };
        let res = run_backup(&spec_options, &oracle, |_| {}, None);
        fs::set_permissions(&path_locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        let report = res.expect("run");
        assert_eq!(report.report_scan.dirs_unreadable, vec![path_locked]);
        assert_eq!(report.report_cleanup.expect("cleanup ran").cnt_versioned, 1);
        assert!(path_backup.join("locked/repo/.env").exists());
        assert!(!path_backup.join("gone/old.txt").exists());
    }
}
