//! Version history for the backup tree.
//!
//! Layout: `history_root/<YYYYMMDD-HHMMSS>/<relative path>`. One run uses one
//! timestamp for every version it moves aside. After each move the versions
//! of that relative path are pruned down to the retention count, oldest first.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::report::ReportCleanup;
use crate::spec::{BackupError, SpecBackupOptions};
use crate::util::{
    TablePathLocks, copy_path_recursive, derive_relative_path, remove_empty_ancestors, remove_path,
    with_path_lock,
};

static RE_TIMESTAMP_DIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}-\d{6}$").expect("static timestamp regex is valid"));

/// `true` for directory names produced by the run timestamp format.
pub fn is_timestamp_dir_name(c_name: &str) -> bool {
    RE_TIMESTAMP_DIR.is_match(c_name)
}

/// Moves replaced or orphaned backup content into timestamped history.
#[derive(Debug)]
pub struct BackupManager {
    path_dir_backup: PathBuf,
    path_dir_history: PathBuf,
    c_timestamp: String,
    n_keep: usize,
    table_locks: TablePathLocks,
}

impl BackupManager {
    pub fn new(
        path_dir_backup: impl Into<PathBuf>,
        path_dir_history: impl Into<PathBuf>,
        c_timestamp: impl Into<String>,
        n_keep: usize,
    ) -> Self {
        Self {
            path_dir_backup: path_dir_backup.into(),
            path_dir_history: path_dir_history.into(),
            c_timestamp: c_timestamp.into(),
            n_keep: n_keep.max(1),
            table_locks: TablePathLocks::new(),
        }
    }

    /// Manager for one run described by `spec_options`.
    pub fn from_options(spec_options: &SpecBackupOptions, c_timestamp: &str) -> Self {
        Self::new(
            &spec_options.path_dir_backup,
            spec_options.history_root(),
            c_timestamp,
            spec_options.num_backups_keep,
        )
    }

    pub fn path_dir_history(&self) -> &Path {
        &self.path_dir_history
    }

    pub fn timestamp(&self) -> &str {
        &self.c_timestamp
    }

    /// Move the current content at `path_dst` into this run's history.
    ///
    /// Returns the history location, or `None` when nothing was there. When
    /// the history slot for this timestamp is already occupied (a second run
    /// within the same second) the content stays in place and
    /// `VersionSlotTaken` is returned. Pruning failures after a successful
    /// move are only logged.
    pub fn version_before_overwrite(&self, path_dst: &Path) -> Result<Option<PathBuf>, BackupError> {
        let path_rel = derive_relative_path(path_dst, &self.path_dir_backup).ok_or_else(|| {
            BackupError::OutsideBackupRoot {
                path: path_dst.to_path_buf(),
                path_dir_backup: self.path_dir_backup.clone(),
            }
        })?;
        with_path_lock(&self.table_locks, &path_rel, || self.version_locked(path_dst, &path_rel))
    }

    fn version_locked(&self, path_dst: &Path, path_rel: &Path) -> Result<Option<PathBuf>, BackupError> {
        match fs::symlink_metadata(path_dst) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BackupError::Inspect {
                    path: path_dst.to_path_buf(),
                    source,
                });
            }
        }

        let path_target = self.path_dir_history.join(&self.c_timestamp).join(path_rel);
        if fs::symlink_metadata(&path_target).is_ok() {
            return Err(BackupError::VersionSlotTaken {
                path: path_dst.to_path_buf(),
                path_target,
            });
        }
        _move_path(path_dst, &path_target).map_err(|source| BackupError::MoveFailed {
            path: path_dst.to_path_buf(),
            path_target: path_target.clone(),
            source,
        })?;
        tracing::debug!(
            path = %path_dst.display(),
            history = %path_target.display(),
            "Versioned previous backup"
        );

        match self.prune_versions(path_rel) {
            Ok(0) => {}
            Ok(cnt_pruned) => {
                tracing::debug!(path = %path_rel.display(), pruned = cnt_pruned, "Pruned old versions");
            }
            Err(e) => {
                tracing::warn!(path = %path_rel.display(), error = %e, "Failed to prune old versions");
            }
        }
        Ok(Some(path_target))
    }

    /// Timestamps holding a version of `path_rel`, newest first.
    pub fn list_versions(&self, path_rel: &Path) -> Result<Vec<String>, BackupError> {
        let iter_entries = match fs::read_dir(&self.path_dir_history) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(BackupError::PruneFailed {
                    path: self.path_dir_history.clone(),
                    source,
                });
            }
        };

        let mut l_versions = Vec::new();
        for entry in iter_entries {
            let entry = entry.map_err(|source| BackupError::PruneFailed {
                path: self.path_dir_history.clone(),
                source,
            })?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Ok(c_name) = entry.file_name().into_string() else {
                continue;
            };
            if !is_timestamp_dir_name(&c_name) {
                continue;
            }
            if fs::symlink_metadata(entry.path().join(path_rel)).is_ok() {
                l_versions.push(c_name);
            }
        }
        l_versions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(l_versions)
    }

    fn prune_versions(&self, path_rel: &Path) -> Result<usize, BackupError> {
        let l_versions = self.list_versions(path_rel)?;
        let mut cnt_pruned = 0;
        for c_timestamp in l_versions.iter().skip(self.n_keep) {
            let path_dir_stamp = self.path_dir_history.join(c_timestamp);
            let path_version = path_dir_stamp.join(path_rel);
            remove_path(&path_version).map_err(|source| BackupError::PruneFailed {
                path: path_version.clone(),
                source,
            })?;
            if let Some(path_parent) = path_version.parent() {
                remove_empty_ancestors(path_parent, &self.path_dir_history);
            }
            cnt_pruned += 1;
        }
        Ok(cnt_pruned)
    }

    /// Version every backup file whose source no longer exists.
    ///
    /// A file survives when it or one of its ancestors is in
    /// `set_paths_dst`, or when it lies under one of `l_paths_protected`
    /// (destinations of repositories or directories the scan could not
    /// read). The
    /// history subtree is never inspected.
    pub fn cleanup_orphans(
        &self,
        set_paths_dst: &BTreeSet<PathBuf>,
        l_paths_protected: &[PathBuf],
    ) -> Result<ReportCleanup, BackupError> {
        let mut report = ReportCleanup::default();
        let path_dir_history = &self.path_dir_history;

        let mut l_orphans = Vec::new();
        let iter_walk = WalkDir::new(&self.path_dir_backup)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !e.path().starts_with(path_dir_history));
        for entry in iter_walk {
            let entry = entry.map_err(|source| BackupError::WalkFailed {
                path: self.path_dir_backup.clone(),
                source,
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            report.cnt_checked += 1;
            let path_file = entry.path();
            if _is_discovered(path_file, set_paths_dst, &self.path_dir_backup)
                || l_paths_protected.iter().any(|p| path_file.starts_with(p))
            {
                continue;
            }
            l_orphans.push(path_file.to_path_buf());
        }

        for path_orphan in l_orphans {
            tracing::debug!(path = %path_orphan.display(), "Source deleted; versioning backup");
            match self.version_before_overwrite(&path_orphan) {
                Ok(_) => {
                    report.cnt_versioned += 1;
                    if let Some(path_parent) = path_orphan.parent() {
                        remove_empty_ancestors(path_parent, &self.path_dir_backup);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path_orphan.display(), error = %e, "Failed to version orphaned backup");
                    report.errors.push(e.to_string());
                }
            }
        }
        Ok(report)
    }
}

fn _is_discovered(path_file: &Path, set_paths_dst: &BTreeSet<PathBuf>, path_dir_backup: &Path) -> bool {
    path_file
        .ancestors()
        .take_while(|p| *p != path_dir_backup)
        .any(|p| set_paths_dst.contains(p))
}

fn _move_path(path_src: &Path, path_dst: &Path) -> io::Result<()> {
    if let Some(path_parent) = path_dst.parent() {
        fs::create_dir_all(path_parent)?;
    }
    match fs::rename(path_src, path_dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e, "Rename into history failed; copying instead");
            copy_path_recursive(path_src, path_dst)?;
            remove_path(path_src)
        }
    }
}
