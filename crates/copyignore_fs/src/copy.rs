//! Copy stage: mirror discovered entries into the backup tree.
//!
//! Workers pull entries from the scan stage's queue. A file is written only
//! when its destination is missing or strictly older than the source; an
//! older destination is versioned first. Directory entries are walked and
//! each file inside gets the same treatment.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use rayon::ThreadPoolBuilder;

use crate::backup::BackupManager;
use crate::exclude::Excluder;
use crate::report::{ProgressThrottle, ReportCopy, ReportCopyBuilder, SpecCopyProgress};
use crate::spec::{
    BackupRunError, EnumCopyErrorKind, EnumCopyOutcome, EnumSkipReason, SpecCopyError,
    SpecDiscoveredEntry, DURATION_PROGRESS_INTERVAL_DEFAULT, N_WORKERS_COPY_DEFAULT,
};
use crate::util::{
    TablePathLocks, calculate_worker_limit, copy_file_atomic, is_strictly_older,
    validate_destination_path_safety, with_path_lock,
};

/// Progress callback shared by all copy workers.
pub type FnCopyProgress<'a> = &'a (dyn Fn(&SpecCopyProgress) + Sync);

#[derive(Debug, Default)]
struct SpecDirTally {
    cnt_copied: u64,
    cnt_failed: u64,
    error_first: Option<SpecCopyError>,
}

/// Concurrent copier for one backup root.
pub struct CopyEngine<'a> {
    path_dir_dst: PathBuf,
    excluder: &'a dyn Excluder,
    manager_backup: Option<&'a BackupManager>,
    n_workers: usize,
    duration_progress_interval: Duration,
    table_locks: TablePathLocks,
}

impl<'a> CopyEngine<'a> {
    pub fn new(path_dir_dst: impl Into<PathBuf>, excluder: &'a dyn Excluder) -> Self {
        Self {
            path_dir_dst: path_dir_dst.into(),
            excluder,
            manager_backup: None,
            n_workers: N_WORKERS_COPY_DEFAULT,
            duration_progress_interval: DURATION_PROGRESS_INTERVAL_DEFAULT,
            table_locks: TablePathLocks::new(),
        }
    }

    /// Version older destinations through `manager_backup` before overwrite.
    pub fn with_backup_manager(mut self, manager_backup: &'a BackupManager) -> Self {
        self.manager_backup = Some(manager_backup);
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.n_workers = calculate_worker_limit(Some(num_workers));
        self
    }

    pub fn with_progress_interval(mut self, duration_interval: Duration) -> Self {
        self.duration_progress_interval = duration_interval;
        self
    }

    /// Copy every entry received on `rx_entries` until the sender side closes.
    ///
    /// Per-entry failures are counted in the report. Only destination setup
    /// fails the whole stage. A final progress snapshot is always emitted.
    pub fn run(
        &self,
        rx_entries: Receiver<SpecDiscoveredEntry>,
        on_progress: Option<FnCopyProgress<'_>>,
    ) -> Result<ReportCopy, BackupRunError> {
        self.prepare_destination_root()?;
        let time_start = Instant::now();
        let builder_cp_report = ReportCopyBuilder::default();
        let throttle = ProgressThrottle::new(self.duration_progress_interval);

        match ThreadPoolBuilder::new()
            .num_threads(self.n_workers)
            .thread_name(|idx| format!("copy-ignore-copy-{idx}"))
            .build()
        {
            Ok(thread_pool) => thread_pool.scope(|scope| {
                for _ in 0..self.n_workers {
                    scope.spawn(|_| {
                        for spec_entry in rx_entries.iter() {
                            self.handle_entry(spec_entry, &builder_cp_report, &throttle, on_progress);
                        }
                    });
                }
            }),
            Err(e) => {
                builder_cp_report.add_warning(format!(
                    "Failed to initialize thread pool (workers={}); fallback to serial copy: {e}",
                    self.n_workers
                ));
                for spec_entry in rx_entries.iter() {
                    self.handle_entry(spec_entry, &builder_cp_report, &throttle, on_progress);
                }
            }
        }

        if let Some(on_progress) = on_progress {
            on_progress(&builder_cp_report.snapshot_final());
        }
        let report = builder_cp_report.build();
        tracing::info!(elapsed_ms = time_start.elapsed().as_millis() as u64, "{report}");
        Ok(report)
    }

    fn prepare_destination_root(&self) -> Result<(), BackupRunError> {
        fs::create_dir_all(&self.path_dir_dst).map_err(|e| BackupRunError::DestinationInitFailed {
            path: self.path_dir_dst.clone(),
            message: e.to_string(),
        })?;
        let meta_dir_dst =
            fs::metadata(&self.path_dir_dst).map_err(|e| BackupRunError::DestinationInitFailed {
                path: self.path_dir_dst.clone(),
                message: e.to_string(),
            })?;
        if !meta_dir_dst.is_dir() {
            return Err(BackupRunError::DestinationInitFailed {
                path: self.path_dir_dst.clone(),
                message: "Backup root must be a directory.".to_string(),
            });
        }
        Ok(())
    }

    fn handle_entry(
        &self,
        spec_entry: SpecDiscoveredEntry,
        builder_cp_report: &ReportCopyBuilder,
        throttle: &ProgressThrottle,
        on_progress: Option<FnCopyProgress<'_>>,
    ) {
        builder_cp_report.add_total();
        let path_dst = spec_entry.destination_in(&self.path_dir_dst);
        let outcome = self.copy_entry(&spec_entry, builder_cp_report);
        if let EnumCopyOutcome::Failed(spec_error) = &outcome {
            tracing::warn!(
                path = %spec_error.path.display(),
                kind = spec_error.kind.as_str(),
                error = %spec_error.exception,
                "Copy failed"
            );
        }
        if outcome != EnumCopyOutcome::Vanished {
            builder_cp_report.add_destination(path_dst.clone());
        }
        builder_cp_report.add_outcome(&outcome);

        if let Some(on_progress) = on_progress
            && throttle.should_emit()
        {
            on_progress(&builder_cp_report.snapshot(spec_entry.path_abs(), &path_dst));
        }
    }

    /// Copy one discovered entry to its mirror location.
    pub fn copy_entry(
        &self,
        spec_entry: &SpecDiscoveredEntry,
        builder_cp_report: &ReportCopyBuilder,
    ) -> EnumCopyOutcome {
        let path_src = spec_entry.path_abs();
        let path_dst = spec_entry.destination_in(&self.path_dir_dst);
        let meta_src = match fs::metadata(path_src) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path_src.display(), "Source vanished before copy");
                return EnumCopyOutcome::Vanished;
            }
            Err(e) => {
                return EnumCopyOutcome::Failed(SpecCopyError::new(
                    path_src,
                    EnumCopyErrorKind::SourceStat,
                    e.to_string(),
                ));
            }
        };

        if meta_src.is_dir() {
            return self.copy_directory(path_src, &path_dst, builder_cp_report);
        }
        self.copy_file(path_src, &path_dst, &meta_src, builder_cp_report)
    }

    fn version_existing(&self, path_dst: &Path) -> Result<(), SpecCopyError> {
        let Some(manager_backup) = self.manager_backup else {
            return Ok(());
        };
        manager_backup
            .version_before_overwrite(path_dst)
            .map(|_| ())
            .map_err(|e| SpecCopyError::new(path_dst, EnumCopyErrorKind::Backup, e.to_string()))
    }

    fn copy_file(
        &self,
        path_file_src: &Path,
        path_file_dst: &Path,
        meta_src: &fs::Metadata,
        builder_cp_report: &ReportCopyBuilder,
    ) -> EnumCopyOutcome {
        with_path_lock(&self.table_locks, path_file_dst, || {
            self.copy_file_locked(path_file_src, path_file_dst, meta_src, builder_cp_report)
        })
    }

    fn copy_file_locked(
        &self,
        path_file_src: &Path,
        path_file_dst: &Path,
        meta_src: &fs::Metadata,
        builder_cp_report: &ReportCopyBuilder,
    ) -> EnumCopyOutcome {
        if let Err(message) = validate_destination_path_safety(path_file_dst, &self.path_dir_dst) {
            return EnumCopyOutcome::Failed(SpecCopyError::new(
                path_file_dst,
                EnumCopyErrorKind::UnsafeDestination,
                message,
            ));
        }

        match fs::metadata(path_file_dst) {
            Ok(meta_dst) => {
                if meta_dst.is_file() && !is_strictly_older(&meta_dst, meta_src) {
                    tracing::debug!(path = %path_file_dst.display(), "Destination up to date; skipping");
                    return EnumCopyOutcome::Skipped(EnumSkipReason::TargetNotOlder);
                }
                if let Err(spec_error) = self.version_existing(path_file_dst) {
                    return EnumCopyOutcome::Failed(spec_error);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return EnumCopyOutcome::Failed(SpecCopyError::new(
                    path_file_dst,
                    EnumCopyErrorKind::DestinationStat,
                    e.to_string(),
                ));
            }
        }

        match copy_file_atomic(path_file_src, path_file_dst, meta_src) {
            Ok(warning) => {
                if let Some(warning) = warning {
                    tracing::warn!("{warning}");
                    builder_cp_report.add_warning(warning);
                }
                tracing::debug!(
                    src = %path_file_src.display(),
                    dst = %path_file_dst.display(),
                    "Copied"
                );
                EnumCopyOutcome::Copied
            }
            Err(spec_error) => EnumCopyOutcome::Failed(spec_error),
        }
    }

    fn copy_directory(
        &self,
        path_dir_src: &Path,
        path_dir_dst: &Path,
        builder_cp_report: &ReportCopyBuilder,
    ) -> EnumCopyOutcome {
        if let Ok(meta_dst) = fs::symlink_metadata(path_dir_dst)
            && !meta_dst.is_dir()
            && let Err(spec_error) =
                with_path_lock(&self.table_locks, path_dir_dst, || self.version_existing(path_dir_dst))
        {
            return EnumCopyOutcome::Failed(spec_error);
        }

        let mut tally = SpecDirTally::default();
        self.copy_directory_inner(path_dir_src, path_dir_dst, builder_cp_report, &mut tally);

        match tally.error_first {
            Some(mut spec_error) => {
                if tally.cnt_failed > 1 {
                    spec_error.exception = format!(
                        "{} (and {} more failures under {})",
                        spec_error.exception,
                        tally.cnt_failed - 1,
                        path_dir_src.display()
                    );
                }
                EnumCopyOutcome::Failed(spec_error)
            }
            None if tally.cnt_copied > 0 => EnumCopyOutcome::Copied,
            None => EnumCopyOutcome::Skipped(EnumSkipReason::TargetNotOlder),
        }
    }

    fn copy_directory_inner(
        &self,
        path_dir_src: &Path,
        path_dir_dst: &Path,
        builder_cp_report: &ReportCopyBuilder,
        tally: &mut SpecDirTally,
    ) {
        let record_failure = |tally: &mut SpecDirTally, spec_error: SpecCopyError| {
            tally.cnt_failed += 1;
            if tally.error_first.is_none() {
                tally.error_first = Some(spec_error);
            }
        };

        let iter_entries = match fs::read_dir(path_dir_src) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                record_failure(
                    tally,
                    SpecCopyError::new(path_dir_src, EnumCopyErrorKind::SourceStat, e.to_string()),
                );
                return;
            }
        };
        if let Err(e) = fs::create_dir_all(path_dir_dst) {
            record_failure(
                tally,
                SpecCopyError::new(path_dir_dst, EnumCopyErrorKind::CopyIo, e.to_string()),
            );
            return;
        }

        let mut l_children: Vec<(PathBuf, fs::FileType)> = iter_entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_type().ok().map(|t| (entry.path(), t)))
            .collect();
        l_children.sort_by(|a, b| a.0.cmp(&b.0));

        for (path_child_src, file_type) in l_children {
            if self.excluder.should_exclude(&path_child_src) {
                tracing::debug!(path = %path_child_src.display(), "Excluded");
                continue;
            }
            let Some(name_child) = path_child_src.file_name() else {
                continue;
            };
            let path_child_dst = path_dir_dst.join(name_child);

            if file_type.is_dir() {
                self.copy_directory_inner(&path_child_src, &path_child_dst, builder_cp_report, tally);
                continue;
            }

            let meta_child = match fs::metadata(&path_child_src) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    record_failure(
                        tally,
                        SpecCopyError::new(&path_child_src, EnumCopyErrorKind::SourceStat, e.to_string()),
                    );
                    continue;
                }
            };
            if meta_child.is_dir() {
                tracing::debug!(path = %path_child_src.display(), "Not following directory symlink");
                continue;
            }

            match self.copy_file(&path_child_src, &path_child_dst, &meta_child, builder_cp_report) {
                EnumCopyOutcome::Copied => tally.cnt_copied += 1,
                EnumCopyOutcome::Failed(spec_error) => {
                    tracing::warn!(
                        path = %spec_error.path.display(),
                        kind = spec_error.kind.as_str(),
                        error = %spec_error.exception,
                        "Copy failed inside directory entry"
                    );
                    record_failure(tally, spec_error);
                }
                EnumCopyOutcome::Skipped(_) | EnumCopyOutcome::Vanished => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam_channel::unbounded;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::TempDir;

    use super::CopyEngine;
    use crate::backup::BackupManager;
    use crate::exclude::ExcludeMatcher;
    use crate::report::{ReportCopyBuilder, SpecCopyProgress};
    use crate::spec::{EnumCopyErrorKind, EnumCopyOutcome, EnumSkipReason, SpecDiscoveredEntry};

    fn write_text(path: &Path, c_text: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, c_text).expect("write");
    }

    fn set_mtime(path: &Path, n_secs: i64) {
        set_file_mtime(path, FileTime::from_unix_time(n_secs, 0)).expect("mtime");
    }

    struct TestDir {
        _tmp: TempDir,
        path_search: std::path::PathBuf,
        path_backup: std::path::PathBuf,
    }

    impl TestDir {
        fn new() -> Self {
            let tmp = TempDir::new().expect("tempdir");
            let path_search = tmp.path().join("search");
            let path_backup = tmp.path().join("backup");
            fs::create_dir_all(&path_search).expect("mkdir");
            Self {
                _tmp: tmp,
                path_search,
                path_backup,
            }
        }

        fn entry(&self, c_rel: &str) -> SpecDiscoveredEntry {
            SpecDiscoveredEntry::from_paths(
                self.path_search.join(c_rel),
                &self.path_search,
                self.path_search.join("repo"),
            )
            .expect("entry")
        }
    }

    #[test]
    fn newer_destination_is_skipped_and_older_is_versioned() {
        let t = TestDir::new();
        let path_src = t.path_search.join("repo/a.log");
        let path_dst = t.path_backup.join("repo/a.log");
        write_text(&path_src, "new");
        write_text(&path_dst, "old");
        set_mtime(&path_src, 1_700_000_000);
        set_mtime(&path_dst, 1_700_000_100);

        let matcher = ExcludeMatcher::default();
        let manager = BackupManager::new(&t.path_backup, t.path_backup.join("h"), "20240101-000000", 3);
        let engine = CopyEngine::new(&t.path_backup, &matcher).with_backup_manager(&manager);
        let builder = ReportCopyBuilder::default();

        assert_eq!(
            engine.copy_entry(&t.entry("repo/a.log"), &builder),
            EnumCopyOutcome::Skipped(EnumSkipReason::TargetNotOlder)
        );
        assert_eq!(fs::read_to_string(&path_dst).expect("read"), "old");

        set_mtime(&path_dst, 1_600_000_000);
        assert_eq!(engine.copy_entry(&t.entry("repo/a.log"), &builder), EnumCopyOutcome::Copied);
        assert_eq!(fs::read_to_string(&path_dst).expect("read"), "new");
        assert_eq!(
            fs::read_to_string(t.path_backup.join("h/20240101-000000/repo/a.log")).expect("read"),
            "old"
        );
    }

    #[test]
    fn vanished_source_is_reported_as_vanished() {
        let t = TestDir::new();
        let matcher = ExcludeMatcher::default();
        let engine = CopyEngine::new(&t.path_backup, &matcher);
        let builder = ReportCopyBuilder::default();
        assert_eq!(
            engine.copy_entry(&t.entry("repo/gone.txt"), &builder),
            EnumCopyOutcome::Vanished
        );
    }

    #[test]
    fn directory_entry_copies_per_file_and_honors_excludes() {
        let t = TestDir::new();
        write_text(&t.path_search.join("repo/build/a.o"), "a");
        write_text(&t.path_search.join("repo/build/sub/b.o"), "b");
        write_text(&t.path_search.join("repo/build/trace.log"), "log");
        let matcher = ExcludeMatcher::new(["*.log"]);
        let engine = CopyEngine::new(&t.path_backup, &matcher);
        let builder = ReportCopyBuilder::default();

        assert_eq!(engine.copy_entry(&t.entry("repo/build"), &builder), EnumCopyOutcome::Copied);
        assert!(t.path_backup.join("repo/build/a.o").exists());
        assert!(t.path_backup.join("repo/build/sub/b.o").exists());
        assert!(!t.path_backup.join("repo/build/trace.log").exists());

        assert_eq!(
            engine.copy_entry(&t.entry("repo/build"), &builder),
            EnumCopyOutcome::Skipped(EnumSkipReason::TargetNotOlder)
        );
    }

    #[test]
    fn run_drains_queue_and_reports_progress() {
        let t = TestDir::new();
        for idx in 0..20 {
            write_text(&t.path_search.join(format!("repo/f{idx}.tmp")), "x");
        }
        let matcher = ExcludeMatcher::default();
        let engine = CopyEngine::new(&t.path_backup, &matcher)
            .with_workers(4)
            .with_progress_interval(Duration::ZERO);

        let (tx, rx) = unbounded();
        for idx in 0..20 {
            tx.send(t.entry(&format!("repo/f{idx}.tmp"))).expect("send");
        }
        tx.send(t.entry("repo/missing.tmp")).expect("send");
        drop(tx);

        let cnt_calls = AtomicUsize::new(0);
        let on_progress = |progress: &SpecCopyProgress| {
            cnt_calls.fetch_add(1, Ordering::Relaxed);
            assert!(progress.cnt_copied <= progress.cnt_total);
        };
        let report = engine.run(rx, Some(&on_progress)).expect("run");

        assert_eq!(report.cnt_total, 21);
        assert_eq!(report.cnt_copied, 20);
        assert_eq!(report.cnt_vanished, 1);
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.set_paths_dst.len(), 20);
        assert_eq!(cnt_calls.load(Ordering::Relaxed), 22);
        assert!(engine.table_locks.is_empty());
    }

    #[test]
    fn failed_versioning_keeps_old_destination() {
        let t = TestDir::new();
        let path_src = t.path_search.join("repo/state.db");
        let path_dst = t.path_backup.join("repo/state.db");
        write_text(&path_src, "new");
        write_text(&path_dst, "old");
        set_mtime(&path_src, 1_700_000_100);
        set_mtime(&path_dst, 1_700_000_000);
        let path_history = t.path_backup.join("h");
        write_text(&path_history.join("20240101-000000/repo/state.db"), "older");

        let matcher = ExcludeMatcher::default();
        let manager = BackupManager::new(&t.path_backup, &path_history, "20240101-000000", 3);
        let engine = CopyEngine::new(&t.path_backup, &matcher).with_backup_manager(&manager);
        let builder = ReportCopyBuilder::default();

        let outcome = engine.copy_entry(&t.entry("repo/state.db"), &builder);
        let EnumCopyOutcome::Failed(spec_error) = outcome else {
            panic!("expected a backup failure, got {outcome:?}");
        };
        assert_eq!(spec_error.kind, EnumCopyErrorKind::Backup);
        assert_eq!(fs::read_to_string(&path_dst).expect("read"), "old");
        assert_eq!(
            fs::read_to_string(path_history.join("20240101-000000/repo/state.db")).expect("read"),
            "older"
        );
    }

    #[test]
    fn file_in_place_of_directory_is_versioned() {
        let t = TestDir::new();
        write_text(&t.path_search.join("repo/out/a.bin"), "a");
        write_text(&t.path_backup.join("repo/out"), "stale file");
        let matcher = ExcludeMatcher::default();
        let manager = BackupManager::new(&t.path_backup, t.path_backup.join("h"), "20240101-000000", 3);
        let engine = CopyEngine::new(&t.path_backup, &matcher).with_backup_manager(&manager);
        let builder = ReportCopyBuilder::default();

        assert_eq!(engine.copy_entry(&t.entry("repo/out"), &builder), EnumCopyOutcome::Copied);
        assert!(t.path_backup.join("repo/out/a.bin").is_file());
        assert!(t.path_backup.join("h/20240101-000000/repo/out").is_file());
    }
}
