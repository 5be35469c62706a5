//! Run options, enums and top-level error types.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::util::{derive_relative_path, is_within};

////////////////////////////////////////////////////////////////////////////////
// #region Constants

/// Default number of copy workers.
pub const N_WORKERS_COPY_DEFAULT: usize = 8;
/// Default number of versions retained per relative path.
pub const N_BACKUPS_KEEP_DEFAULT: usize = 3;
/// Default capacity of the discovered-entry queue between scan and copy.
pub const N_QUEUE_CAPACITY_DEFAULT: usize = 1024;
/// Default history subdirectory created under the backup root.
pub const C_HISTORY_SUBDIR_DEFAULT: &str = "copy-ignore-history";
/// `chrono` format of run timestamps. Fixed width, sorts by time.
pub const C_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Default minimum gap between two coalesced progress reports.
pub const DURATION_PROGRESS_INTERVAL_DEFAULT: Duration = Duration::from_millis(500);

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Normalized form of one exclusion pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumPatternForm {
    /// Case-insensitive path prefix, no wildcard semantics.
    AbsolutePrefix,
    /// Glob evaluated against a forward-slash path.
    Glob,
}

/// Why a discovered entry was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumSkipReason {
    /// Destination modification time is equal to or newer than the source.
    TargetNotOlder,
}

/// Per-entry failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumCopyErrorKind {
    /// Source could not be inspected.
    SourceStat,
    /// Destination could not be inspected.
    DestinationStat,
    /// Destination resolves outside the backup root.
    UnsafeDestination,
    /// Reading, writing or flushing file content failed.
    CopyIo,
    /// Temporary file could not be renamed onto the destination.
    Rename,
    /// Existing destination could not be versioned before overwrite.
    Backup,
}

impl EnumCopyErrorKind {
    /// Stable lower-case label used in logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceStat => "source-stat-failure",
            Self::DestinationStat => "destination-stat-failure",
            Self::UnsafeDestination => "unsafe-destination",
            Self::CopyIo => "copy-io-failure",
            Self::Rename => "rename-failure",
            Self::Backup => "backup-failure",
        }
    }
}

/// Result of copying one discovered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumCopyOutcome {
    /// At least one file was written to the backup tree.
    Copied,
    /// Nothing needed writing.
    Skipped(EnumSkipReason),
    /// The entry failed; counted and logged, never fatal.
    Failed(SpecCopyError),
    /// Source disappeared after discovery. Not counted as copy, skip or error.
    Vanished,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Structs

/// One discovered ignored path, ready for the copy stage.
///
/// The relative path is never empty and never contains `..`, so the
/// destination `backup_root/relative_path` cannot escape the backup root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpecDiscoveredEntry {
    path_abs: PathBuf,
    path_rel: PathBuf,
    path_repo_root: PathBuf,
}

impl SpecDiscoveredEntry {
    /// Build an entry for `path_abs` under `path_dir_search`.
    ///
    /// Returns `None` when the path is the search root itself or lies outside it.
    pub fn from_paths(
        path_abs: impl Into<PathBuf>,
        path_dir_search: &Path,
        path_repo_root: impl Into<PathBuf>,
    ) -> Option<Self> {
        let path_abs = path_abs.into();
        let path_rel = derive_relative_path(&path_abs, path_dir_search)?;
        Some(Self {
            path_abs,
            path_rel,
            path_repo_root: path_repo_root.into(),
        })
    }

    /// Absolute source path.
    pub fn path_abs(&self) -> &Path {
        &self.path_abs
    }

    /// Path relative to the search root.
    pub fn path_rel(&self) -> &Path {
        &self.path_rel
    }

    /// Repository that owns the entry.
    pub fn path_repo_root(&self) -> &Path {
        &self.path_repo_root
    }

    /// Mirror location of this entry under `path_dir_backup`.
    pub fn destination_in(&self, path_dir_backup: &Path) -> PathBuf {
        path_dir_backup.join(&self.path_rel)
    }
}

/// One per-entry failure with path + error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecCopyError {
    /// Failed source or destination path.
    pub path: PathBuf,
    /// Failure classification.
    pub kind: EnumCopyErrorKind,
    /// User-facing error text.
    pub exception: String,
}

impl SpecCopyError {
    pub fn new(path: impl Into<PathBuf>, kind: EnumCopyErrorKind, exception: String) -> Self {
        Self {
            path: path.into(),
            kind,
            exception,
        }
    }
}

/// Input options for one backup run.
///
/// Passed by reference into every component; nothing reads ambient state.
#[derive(Debug, Clone)]
pub struct SpecBackupOptions {
    /// Directory searched for repositories.
    pub path_dir_search: PathBuf,
    /// Root of the mirrored backup tree.
    pub path_dir_backup: PathBuf,
    /// Raw user exclusion patterns.
    pub patterns_exclude: Vec<String>,
    /// Scan and report only; no filesystem mutation.
    pub if_dry_run: bool,
    /// Copy workers pulling from the entry queue.
    pub num_workers_copy: usize,
    /// Scan workers; `None` means host parallelism.
    pub num_workers_scan: Option<usize>,
    /// Emit every copy/skip/exclude decision.
    pub if_verbose: bool,
    /// Versions kept per relative path.
    pub num_backups_keep: usize,
    /// History subdirectory name under the backup root.
    pub name_history_subdir: String,
    /// Explicit history root; overrides `name_history_subdir`.
    pub path_dir_history: Option<PathBuf>,
    /// Fixed run timestamp (`YYYYMMDD-HHMMSS`); generated when `None`.
    pub c_timestamp: Option<String>,
    /// Capacity of the bounded entry queue.
    pub num_queue_capacity: usize,
    /// Minimum gap between coalesced progress reports.
    pub duration_progress_interval: Duration,
    /// Version out backup files whose source disappeared.
    pub if_cleanup_orphans: bool,
}

impl Default for SpecBackupOptions {
    fn default() -> Self {
        Self {
            path_dir_search: PathBuf::new(),
            path_dir_backup: PathBuf::new(),
            patterns_exclude: Vec::new(),
            if_dry_run: false,
            num_workers_copy: N_WORKERS_COPY_DEFAULT,
            num_workers_scan: None,
            if_verbose: false,
            num_backups_keep: N_BACKUPS_KEEP_DEFAULT,
            name_history_subdir: C_HISTORY_SUBDIR_DEFAULT.to_string(),
            path_dir_history: None,
            c_timestamp: None,
            num_queue_capacity: N_QUEUE_CAPACITY_DEFAULT,
            duration_progress_interval: DURATION_PROGRESS_INTERVAL_DEFAULT,
            if_cleanup_orphans: true,
        }
    }
}

impl SpecBackupOptions {
    /// Options with defaults for everything except the two roots.
    pub fn new(path_dir_search: impl Into<PathBuf>, path_dir_backup: impl Into<PathBuf>) -> Self {
        Self {
            path_dir_search: path_dir_search.into(),
            path_dir_backup: path_dir_backup.into(),
            ..Self::default()
        }
    }

    /// Root holding one subtree per run timestamp.
    pub fn history_root(&self) -> PathBuf {
        match &self.path_dir_history {
            Some(path) => path.clone(),
            None => self.path_dir_backup.join(&self.name_history_subdir),
        }
    }

    /// Check the options before any work starts.
    pub fn validate(&self) -> Result<(), BackupRunError> {
        let path_dir_search = &self.path_dir_search;
        if path_dir_search.as_os_str().is_empty() {
            return Err(BackupRunError::ConfigInvalid(
                "Search root must not be empty.".to_string(),
            ));
        }
        match std::fs::metadata(path_dir_search) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BackupRunError::ConfigInvalid(format!(
                    "Search root is not a directory: {}",
                    path_dir_search.display()
                )));
            }
            Err(e) => {
                return Err(BackupRunError::ConfigInvalid(format!(
                    "Search root is not accessible: {} ({e})",
                    path_dir_search.display()
                )));
            }
        }

        let path_dir_backup = &self.path_dir_backup;
        if path_dir_backup.as_os_str().is_empty() {
            return Err(BackupRunError::ConfigInvalid(
                "Backup root must not be empty.".to_string(),
            ));
        }
        match std::fs::metadata(path_dir_backup) {
            Ok(meta) if !meta.is_dir() => {
                return Err(BackupRunError::ConfigInvalid(format!(
                    "Backup root is not a directory: {}",
                    path_dir_backup.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackupRunError::ConfigInvalid(format!(
                    "Backup root is not accessible: {} ({e})",
                    path_dir_backup.display()
                )));
            }
        }
        if is_within(path_dir_search, path_dir_backup) {
            return Err(BackupRunError::ConfigInvalid(format!(
                "Backup root must not contain the search root: {} <-> {}",
                path_dir_backup.display(),
                path_dir_search.display()
            )));
        }

        if self.num_workers_copy == 0 {
            return Err(BackupRunError::ConfigInvalid(
                "Copy concurrency must be greater than 0.".to_string(),
            ));
        }
        if self.num_workers_scan == Some(0) {
            return Err(BackupRunError::ConfigInvalid(
                "Scan concurrency must be greater than 0.".to_string(),
            ));
        }
        if self.num_backups_keep == 0 {
            return Err(BackupRunError::ConfigInvalid(
                "Backup retention count must be greater than 0.".to_string(),
            ));
        }
        if self.num_queue_capacity == 0 {
            return Err(BackupRunError::ConfigInvalid(
                "Queue capacity must be greater than 0.".to_string(),
            ));
        }
        if self.path_dir_history.is_none() && self.name_history_subdir.trim().is_empty() {
            return Err(BackupRunError::ConfigInvalid(
                "History subdirectory name must not be empty.".to_string(),
            ));
        }
        if let Some(c_timestamp) = &self.c_timestamp
            && !is_valid_timestamp(c_timestamp)
        {
            return Err(BackupRunError::ConfigInvalid(format!(
                "Timestamp must look like YYYYMMDD-HHMMSS: {c_timestamp}"
            )));
        }
        Ok(())
    }
}

/// `true` when `c_value` is a well-formed run timestamp.
pub fn is_valid_timestamp(c_value: &str) -> bool {
    c_value.len() == 15 && NaiveDateTime::parse_from_str(c_value, C_TIMESTAMP_FORMAT).is_ok()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Errors

/// "Run failed" errors: configuration, traversal and destination setup.
#[derive(Debug, Error)]
pub enum BackupRunError {
    /// Options rejected before any work started.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    /// Directory listing failed for a reason other than permissions.
    #[error("Failed to traverse {}: {source}", .path.display())]
    TraversalFailed {
        /// Directory that could not be listed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Destination root could not be prepared.
    #[error("Failed to initialize destination {}: {message}", .path.display())]
    DestinationInitFailed {
        /// Destination path that failed initialization.
        path: PathBuf,
        /// Underlying error text.
        message: String,
    },
    /// A worker thread panicked.
    #[error("Worker panicked during the {0} stage")]
    WorkerPanicked(&'static str),
}

/// Failures of the repository-marker collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The external program could not be started.
    #[error("Failed to run `{program}` in {}: {source}", .path_repo.display())]
    CommandSpawn {
        program: String,
        path_repo: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The external program exited unsuccessfully.
    #[error("`{program}` exited with {status} in {}: {stderr}", .path_repo.display())]
    CommandFailed {
        program: String,
        path_repo: PathBuf,
        status: String,
        stderr: String,
    },
    /// The repository directory itself could not be read.
    #[error("Failed to read repository {}: {source}", .path_repo.display())]
    ReadRepository {
        path_repo: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The repository is unknown to an in-memory collaborator.
    #[error("Unknown repository: {}", .path_repo.display())]
    UnknownRepository { path_repo: PathBuf },
}

/// Failures while versioning or pruning backup content.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Path {} is outside backup root {}", .path.display(), .path_dir_backup.display())]
    OutsideBackupRoot {
        path: PathBuf,
        path_dir_backup: PathBuf,
    },
    #[error("Failed to inspect {}: {source}", .path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to version {} into {}: {source}", .path.display(), .path_target.display())]
    MoveFailed {
        path: PathBuf,
        path_target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "Version slot {} is already taken; keeping {}",
        .path_target.display(),
        .path.display()
    )]
    VersionSlotTaken { path: PathBuf, path_target: PathBuf },
    #[error("Failed to prune versions under {}: {source}", .path.display())]
    PruneFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to walk backup tree {}: {source}", .path.display())]
    WalkFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{BackupRunError, SpecBackupOptions, SpecDiscoveredEntry, is_valid_timestamp};
    use std::path::Path;

    #[test]
    fn discovered_entry_rejects_root_and_outside_paths() {
        let path_search = Path::new("/work/search");
        assert!(SpecDiscoveredEntry::from_paths("/work/search", path_search, "/work/search").is_none());
        assert!(SpecDiscoveredEntry::from_paths("/work/other/a", path_search, "/work/other").is_none());

        let spec_entry =
            SpecDiscoveredEntry::from_paths("/work/search/repo/build", path_search, "/work/search/repo")
                .expect("entry");
        assert_eq!(spec_entry.path_rel(), Path::new("repo/build"));
        assert_eq!(
            spec_entry.destination_in(Path::new("/backup")),
            Path::new("/backup/repo/build")
        );
    }

    #[test]
    fn timestamp_format_is_checked() {
        assert!(is_valid_timestamp("20240131-235959"));
        assert!(!is_valid_timestamp("2024-01-31"));
        assert!(!is_valid_timestamp("20241331-000000"));
    }

    #[test]
    fn validate_accepts_missing_backup_root() {
        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path().join("search");
        fs::create_dir_all(&path_search).expect("mkdir");

        let spec_options = SpecBackupOptions::new(&path_search, tmp.path().join("backup"));
        spec_options.validate().expect("valid options");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path().join("search");
        fs::create_dir_all(&path_search).expect("mkdir");
        let path_backup = tmp.path().join("backup");

        let cases = [
            SpecBackupOptions::new(tmp.path().join("missing"), &path_backup),
            SpecBackupOptions {
                num_workers_copy: 0,
                ..SpecBackupOptions::new(&path_search, &path_backup)
            },
            SpecBackupOptions {
                num_backups_keep: 0,
                ..SpecBackupOptions::new(&path_search, &path_backup)
            },
            SpecBackupOptions {
                c_timestamp: Some("yesterday".to_string()),
                ..SpecBackupOptions::new(&path_search, &path_backup)
            },
            SpecBackupOptions::new(&path_search, tmp.path()),
            SpecBackupOptions::new(&path_search, &path_search),
        ];
        for spec_options in cases {
            let err = spec_options.validate().expect_err("must be rejected");
            assert!(matches!(err, BackupRunError::ConfigInvalid(_)), "{err}");
        }
    }

    #[test]
    fn validate_rejects_file_as_backup_root() {
        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path().join("search");
        fs::create_dir_all(&path_search).expect("mkdir");
        let path_file = tmp.path().join("backup.txt");
        fs::write(&path_file, "x").expect("write");

        let err = SpecBackupOptions::new(&path_search, &path_file)
            .validate()
            .expect_err("file backup root");
        assert!(matches!(err, BackupRunError::ConfigInvalid(_)));
    }
}
