//! `copyignore_fs`:
//! back up version-control-ignored files from many repositories into one
//! mirrored tree with timestamped history.
//!
//! Modules:
//! - `exclude` : exclusion pattern normalization and matching
//! - `vcs`     : repository detection and ignore queries
//! - `locate`  : breadth-first repository discovery
//! - `collect` : per-repository ignored-path enumeration
//! - `scan`    : discovery stage orchestration
//! - `copy`    : concurrent mirror copy engine
//! - `backup`  : version history, retention, orphan cleanup
//! - `run`     : end-to-end pipeline
//! - `spec`    : options/enums/errors
//! - `report`  : run-time report models
//! - `util`    : shared helper functions

pub mod backup;
pub mod collect;
pub mod copy;
pub mod exclude;
pub mod locate;
pub mod report;
pub mod run;
pub mod scan;
pub mod spec;
pub mod vcs;
mod util;

pub use backup::BackupManager;
pub use collect::{IgnoredFileCollector, collapse_redundant_entries};
pub use copy::{CopyEngine, FnCopyProgress};
pub use exclude::{ExcludeMatcher, Excluder, normalize_pattern};
pub use locate::{RepositoryLocator, SpecWalkSummary};
pub use report::{
    ProgressThrottle, ReportCleanup, ReportCopy, ReportCopyBuilder, ReportRun, ReportScan,
    SpecCopyProgress,
};
pub use run::run_backup;
pub use scan::ScanOrchestrator;
pub use spec::{
    BackupError, BackupRunError, C_HISTORY_SUBDIR_DEFAULT, C_TIMESTAMP_FORMAT, EnumCopyErrorKind,
    EnumCopyOutcome, EnumPatternForm, EnumSkipReason, N_BACKUPS_KEEP_DEFAULT,
    N_QUEUE_CAPACITY_DEFAULT, N_WORKERS_COPY_DEFAULT, SpecBackupOptions, SpecCopyError,
    SpecDiscoveredEntry, VcsError,
};
pub use vcs::{GitCli, IgnoreOracle, MemoryIgnoreOracle};
