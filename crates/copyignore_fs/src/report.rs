//! Scan, copy, cleanup and run reports, plus the shared copy accumulator.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::spec::{EnumCopyOutcome, SpecCopyError, SpecDiscoveredEntry};

////////////////////////////////////////////////////////////////////////////////
// #region CopyReport

/// Aggregate counters and diagnostics for one copy stage.
#[derive(Debug, Default, Clone)]
pub struct ReportCopy {
    /// Entries received from the scan stage.
    pub cnt_total: u64,
    /// Entries that wrote at least one file.
    pub cnt_copied: u64,
    /// Entries whose destination was already current.
    pub cnt_skipped: u64,
    /// Entries whose source vanished before copy.
    pub cnt_vanished: u64,
    /// Non-fatal warnings collected during copy.
    pub warnings: Vec<String>,
    /// Per-entry failures.
    pub errors: Vec<SpecCopyError>,
    /// Destination paths of every entry that still had a source.
    pub set_paths_dst: BTreeSet<PathBuf>,
}

impl ReportCopy {
    /// Number of failed entries.
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Number of collected warnings.
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Machine-readable counters.
    pub fn to_dict(&self) -> BTreeMap<String, u64> {
        let mut dict_counts = BTreeMap::new();
        dict_counts.insert("cnt_total".to_string(), self.cnt_total);
        dict_counts.insert("cnt_copied".to_string(), self.cnt_copied);
        dict_counts.insert("cnt_skipped".to_string(), self.cnt_skipped);
        dict_counts.insert("cnt_vanished".to_string(), self.cnt_vanished);
        dict_counts.insert("cnt_errors".to_string(), self.error_count() as u64);
        dict_counts.insert("cnt_warnings".to_string(), self.warning_count() as u64);
        dict_counts
    }

    /// Human-readable one-line summary.
    pub fn format(&self, prefix: &str) -> String {
        let dict_counts = self.to_dict();
        format!(
            "{prefix} total={} copied={} skipped={} vanished={} errors={} warnings={}",
            dict_counts["cnt_total"],
            dict_counts["cnt_copied"],
            dict_counts["cnt_skipped"],
            dict_counts["cnt_vanished"],
            dict_counts["cnt_errors"],
            dict_counts["cnt_warnings"]
        )
    }
}

impl fmt::Display for ReportCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format("[COPY]"))
    }
}

/// Shared accumulator for copy statistics.
///
/// Every method takes `&self`; copy workers update it concurrently and the
/// counters only ever grow.
#[derive(Debug, Default)]
pub struct ReportCopyBuilder {
    cnt_total: AtomicU64,
    cnt_copied: AtomicU64,
    cnt_skipped: AtomicU64,
    cnt_vanished: AtomicU64,
    cnt_errors: AtomicU64,
    errors: Mutex<Vec<SpecCopyError>>,
    warnings: Mutex<Vec<String>>,
    set_paths_dst: Mutex<BTreeSet<PathBuf>>,
}

impl ReportCopyBuilder {
    /// Count one received entry.
    pub fn add_total(&self) {
        self.cnt_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the outcome of one entry.
    pub fn add_outcome(&self, outcome: &EnumCopyOutcome) {
        match outcome {
            EnumCopyOutcome::Copied => {
                self.cnt_copied.fetch_add(1, Ordering::Relaxed);
            }
            EnumCopyOutcome::Skipped(_) => {
                self.cnt_skipped.fetch_add(1, Ordering::Relaxed);
            }
            EnumCopyOutcome::Failed(spec_error) => {
                self.errors.lock().push(spec_error.clone());
                self.cnt_errors.fetch_add(1, Ordering::Relaxed);
            }
            EnumCopyOutcome::Vanished => {
                self.cnt_vanished.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Add warning message.
    pub fn add_warning(&self, warning: String) {
        self.warnings.lock().push(warning);
    }

    /// Record a destination that belongs to a live source.
    pub fn add_destination(&self, path_dst: PathBuf) {
        self.set_paths_dst.lock().insert(path_dst);
    }

    /// Point-in-time counters for a progress callback.
    pub fn snapshot(&self, path_src: &Path, path_dst: &Path) -> SpecCopyProgress {
        SpecCopyProgress {
            cnt_total: self.cnt_total.load(Ordering::Relaxed),
            cnt_copied: self.cnt_copied.load(Ordering::Relaxed),
            cnt_skipped: self.cnt_skipped.load(Ordering::Relaxed),
            cnt_errors: self.cnt_errors.load(Ordering::Relaxed),
            path_src: path_src.to_path_buf(),
            path_dst: path_dst.to_path_buf(),
            if_final: false,
        }
    }

    /// Snapshot emitted once after all workers finished.
    pub fn snapshot_final(&self) -> SpecCopyProgress {
        SpecCopyProgress {
            if_final: true,
            ..self.snapshot(Path::new(""), Path::new(""))
        }
    }

    /// Finalize builder into immutable report.
    pub fn build(self) -> ReportCopy {
        ReportCopy {
            cnt_total: self.cnt_total.into_inner(),
            cnt_copied: self.cnt_copied.into_inner(),
            cnt_skipped: self.cnt_skipped.into_inner(),
            cnt_vanished: self.cnt_vanished.into_inner(),
            errors: self.errors.into_inner(),
            warnings: self.warnings.into_inner(),
            set_paths_dst: self.set_paths_dst.into_inner(),
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Progress

/// Progress snapshot handed to the progress callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecCopyProgress {
    pub cnt_total: u64,
    pub cnt_copied: u64,
    pub cnt_skipped: u64,
    pub cnt_errors: u64,
    /// Source of the entry that produced this snapshot.
    pub path_src: PathBuf,
    /// Destination of the entry that produced this snapshot.
    pub path_dst: PathBuf,
    /// Set only on the closing snapshot, which is never throttled.
    pub if_final: bool,
}

/// Coalesces progress reports to at most one per interval.
#[derive(Debug)]
pub struct ProgressThrottle {
    duration_interval: Duration,
    time_last_emit: Mutex<Option<Instant>>,
}

impl ProgressThrottle {
    pub fn new(duration_interval: Duration) -> Self {
        Self {
            duration_interval,
            time_last_emit: Mutex::new(None),
        }
    }

    /// `true` when the caller should emit now; records the emission.
    pub fn should_emit(&self) -> bool {
        let now = Instant::now();
        let mut time_last_emit = self.time_last_emit.lock();
        match *time_last_emit {
            Some(time_last) if now.duration_since(time_last) < self.duration_interval => false,
            _ => {
                *time_last_emit = Some(now);
                true
            }
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ScanReport

/// Counters for one discovery stage.
#[derive(Debug, Default, Clone)]
pub struct ReportScan {
    /// Directories visited by the breadth-first walk.
    pub cnt_dirs_visited: u64,
    /// Repository roots dispatched for enumeration.
    pub cnt_repositories: u64,
    /// Entries emitted to the copy stage.
    pub cnt_entries: u64,
    /// Repositories whose enumeration failed, with the error text.
    pub repositories_failed: Vec<(PathBuf, String)>,
    /// Directories the walk could not list.
    pub dirs_unreadable: Vec<PathBuf>,
    /// Wall time of the stage.
    pub duration_elapsed: Duration,
    /// `false` when the walk stopped early.
    pub if_completed: bool,
}

impl ReportScan {
    pub fn format(&self, prefix: &str) -> String {
        format!(
            "{prefix} dirs={} unreadable={} repositories={} failed={} entries={} elapsed={:.2}s",
            self.cnt_dirs_visited,
            self.dirs_unreadable.len(),
            self.cnt_repositories,
            self.repositories_failed.len(),
            self.cnt_entries,
            self.duration_elapsed.as_secs_f64()
        )
    }
}

impl fmt::Display for ReportScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format("[SCAN]"))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region CleanupReport

/// Result of the orphan cleanup pass.
#[derive(Debug, Default, Clone)]
pub struct ReportCleanup {
    /// Backup files inspected.
    pub cnt_checked: u64,
    /// Orphans moved into history.
    pub cnt_versioned: u64,
    /// Orphans that could not be versioned.
    pub errors: Vec<String>,
}

impl fmt::Display for ReportCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[CLEANUP] checked={} versioned={} errors={}",
            self.cnt_checked,
            self.cnt_versioned,
            self.errors.len()
        )
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region RunReport

/// Everything one pipeline run produced.
#[derive(Debug, Default, Clone)]
pub struct ReportRun {
    /// Run timestamp used for history directories.
    pub c_timestamp: String,
    pub report_scan: ReportScan,
    /// Absent on dry runs.
    pub report_copy: Option<ReportCopy>,
    /// Absent when cleanup did not run.
    pub report_cleanup: Option<ReportCleanup>,
    /// Entries a dry run would have copied.
    pub entries_planned: Vec<SpecDiscoveredEntry>,
}

impl ReportRun {
    /// `true` when nothing failed at any stage.
    pub fn is_clean(&self) -> bool {
        self.report_scan.repositories_failed.is_empty()
            && self
                .report_copy
                .as_ref()
                .is_none_or(|report| report.error_count() == 0)
            && self
                .report_cleanup
                .as_ref()
                .is_none_or(|report| report.errors.is_empty())
    }
}

impl fmt::Display for ReportRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.report_scan)?;
        match &self.report_copy {
            Some(report_copy) => write!(f, "\n{report_copy}")?,
            None => write!(f, "\n[DRY-RUN] planned={}", self.entries_planned.len())?,
        }
        if let Some(report_cleanup) = &self.report_cleanup {
            write!(f, "\n{report_cleanup}")?;
        }
        Ok(())
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::{ProgressThrottle, ReportCopy, ReportCopyBuilder, ReportRun};
    use crate::spec::{EnumCopyErrorKind, EnumCopyOutcome, EnumSkipReason, SpecCopyError};

    #[test]
    fn report_copy_to_dict_and_format() {
        let report = ReportCopy {
            cnt_total: 7,
            cnt_copied: 3,
            cnt_skipped: 2,
            cnt_vanished: 1,
            warnings: vec!["w".to_string()],
            errors: vec![SpecCopyError::new(
                "/x",
                EnumCopyErrorKind::CopyIo,
                "boom".to_string(),
            )],
            ..ReportCopy::default()
        };

        let dict_counts = report.to_dict();
        assert_eq!(dict_counts["cnt_total"], 7);
        assert_eq!(dict_counts["cnt_errors"], 1);
        assert_eq!(dict_counts["cnt_warnings"], 1);

        let txt = report.format("[COPY]");
        assert_eq!(
            txt,
            "[COPY] total=7 copied=3 skipped=2 vanished=1 errors=1 warnings=1"
        );
        assert_eq!(report.to_string(), txt);
    }

    #[test]
    fn builder_counts_each_outcome() {
        let builder = ReportCopyBuilder::default();
        for outcome in [
            EnumCopyOutcome::Copied,
            EnumCopyOutcome::Copied,
            EnumCopyOutcome::Skipped(EnumSkipReason::TargetNotOlder),
            EnumCopyOutcome::Vanished,
            EnumCopyOutcome::Failed(SpecCopyError::new(
                "/y",
                EnumCopyErrorKind::Rename,
                "rename".to_string(),
            )),
        ] {
            builder.add_total();
            builder.add_outcome(&outcome);
        }
        builder.add_destination(PathBuf::from("/b/one"));

        let progress = builder.snapshot(Path::new("/s"), Path::new("/d"));
        assert_eq!(progress.cnt_total, 5);
        assert_eq!(progress.cnt_errors, 1);
        assert!(!progress.if_final);
        assert!(builder.snapshot_final().if_final);

        let report = builder.build();
        assert_eq!(report.cnt_copied, 2);
        assert_eq!(report.cnt_skipped, 1);
        assert_eq!(report.cnt_vanished, 1);
        assert_eq!(report.error_count(), 1);
        assert!(report.set_paths_dst.contains(Path::new("/b/one")));
    }

    #[test]
    fn throttle_coalesces_within_interval() {
        let throttle = ProgressThrottle::new(Duration::from_secs(3600));
        assert!(throttle.should_emit());
        assert!(!throttle.should_emit());

        let throttle_open = ProgressThrottle::new(Duration::ZERO);
        assert!(throttle_open.should_emit());
        assert!(throttle_open.should_emit());
    }

    #[test]
    fn run_report_is_clean_without_failures() {
        let mut report = ReportRun::default();
        assert!(report.is_clean());
        report
            .report_scan
            .repositories_failed
            .push((PathBuf::from("/r"), "bad".to_string()));
        assert!(!report.is_clean());
    }
}
