//! Breadth-first discovery of repository roots under a search root.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::spec::BackupRunError;
use crate::util::visit_key;
use crate::vcs::IgnoreOracle;

/// Outcome of one directory walk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpecWalkSummary {
    pub cnt_dirs_visited: u64,
    /// Directories skipped because listing them was not permitted.
    pub dirs_unreadable: Vec<PathBuf>,
}

/// Walks a directory tree level by level and reports repository roots.
///
/// A repository's interior is never entered, so nested repositories are
/// invisible. Each directory is visited once even when reachable through
/// several symlinks, and symlinks leading outside the search root are ignored.
pub struct RepositoryLocator<'a> {
    oracle: &'a dyn IgnoreOracle,
    l_paths_skip: Vec<PathBuf>,
    flag_cancel: Option<&'a AtomicBool>,
}

impl<'a> RepositoryLocator<'a> {
    pub fn new(oracle: &'a dyn IgnoreOracle) -> Self {
        Self {
            oracle,
            l_paths_skip: Vec::new(),
            flag_cancel: None,
        }
    }

    /// Subtrees never entered, such as a backup root inside the search root.
    pub fn with_skipped_paths<I>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        self.l_paths_skip
            .extend(paths.into_iter().map(|p| visit_key(&p)));
        self
    }

    /// Stop the walk early once `flag_cancel` is set.
    pub fn with_cancel_flag(mut self, flag_cancel: &'a AtomicBool) -> Self {
        self.flag_cancel = Some(flag_cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.flag_cancel
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Collect every repository root under `path_root`.
    pub fn locate(&self, path_root: &Path) -> Result<Vec<PathBuf>, BackupRunError> {
        let mut l_repos = Vec::new();
        self.walk(path_root, |_| {}, |path_repo| l_repos.push(path_repo))?;
        Ok(l_repos)
    }

    /// Walk `path_root`, calling `on_visit` for each directory and
    /// `on_repository` for each repository root.
    ///
    /// Unreadable directories are skipped with a warning and listed in the
    /// summary; any other listing failure stops the walk.
    pub fn walk<V, R>(
        &self,
        path_root: &Path,
        mut on_visit: V,
        mut on_repository: R,
    ) -> Result<SpecWalkSummary, BackupRunError>
    where
        V: FnMut(&Path),
        R: FnMut(PathBuf),
    {
        let path_root_key = visit_key(path_root);
        let mut queue_dirs = VecDeque::from([path_root.to_path_buf()]);
        let mut set_visited: HashSet<PathBuf> = HashSet::new();
        let mut summary = SpecWalkSummary::default();

        while let Some(path_dir) = queue_dirs.pop_front() {
            if self.is_cancelled() {
                tracing::debug!("Directory walk cancelled");
                break;
            }
            let path_key = visit_key(&path_dir);
            if !set_visited.insert(path_key.clone()) {
                continue;
            }
            if !path_key.starts_with(&path_root_key) {
                tracing::debug!(path = %path_dir.display(), "Skipping symlink leaving the search root");
                continue;
            }
            if self.l_paths_skip.iter().any(|p| path_key.starts_with(p)) {
                tracing::debug!(path = %path_dir.display(), "Skipping backup subtree");
                continue;
            }

            summary.cnt_dirs_visited += 1;
            on_visit(&path_dir);

            if self.oracle.is_repository_root(&path_dir) {
                tracing::debug!(repo = %path_dir.display(), "Found repository");
                on_repository(path_dir);
                continue;
            }

            let iter_entries = match fs::read_dir(&path_dir) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    tracing::warn!(path = %path_dir.display(), error = %e, "Skipping unreadable directory");
                    summary.dirs_unreadable.push(path_dir);
                    continue;
                }
                Err(source) => {
                    return Err(BackupRunError::TraversalFailed {
                        path: path_dir,
                        source,
                    });
                }
            };

            let mut l_children = Vec::new();
            for entry in iter_entries {
                let entry = entry.map_err(|source| BackupRunError::TraversalFailed {
                    path: path_dir.clone(),
                    source,
                })?;
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let path_child = entry.path();
                let b_is_dir = file_type.is_dir() || (file_type.is_symlink() && path_child.is_dir());
                if b_is_dir {
                    l_children.push(path_child);
                }
            }
            l_children.sort();
            queue_dirs.extend(l_children);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    use tempfile::TempDir;

    use super::RepositoryLocator;
    use crate::spec::BackupRunError;
    use crate::vcs::MemoryIgnoreOracle;

    fn make_repo(path: &std::path::Path) {
        fs::create_dir_all(path.join(".git")).expect("mkdir");
    }

    #[test]
    fn finds_repositories_without_entering_them() {
        let tmp = TempDir::new().expect("tempdir");
        let path_root = tmp.path();
        make_repo(&path_root.join("a"));
        make_repo(&path_root.join("group/b"));
        make_repo(&path_root.join("a/nested"));
        fs::create_dir_all(path_root.join("plain/deeper")).expect("mkdir");

        let oracle = MemoryIgnoreOracle::new();
        let mut l_visited = Vec::new();
        let mut l_repos = Vec::new();
        let summary = RepositoryLocator::new(&oracle)
            .walk(path_root, |p| l_visited.push(p.to_path_buf()), |p| l_repos.push(p))
            .expect("walk");

        assert_eq!(l_repos, vec![path_root.join("a"), path_root.join("group/b")]);
        assert!(!l_visited.contains(&path_root.join("a/nested")));
        assert_eq!(summary.cnt_dirs_visited as usize, l_visited.len());
        assert!(summary.dirs_unreadable.is_empty());
    }

    #[test]
    fn skipped_paths_are_not_entered() {
        let tmp = TempDir::new().expect("tempdir");
        let path_root = tmp.path();
        make_repo(&path_root.join("backup/copy-of-repo"));
        make_repo(&path_root.join("work/repo"));

        let oracle = MemoryIgnoreOracle::new();
        let l_repos = RepositoryLocator::new(&oracle)
            .with_skipped_paths([path_root.join("backup")])
            .locate(path_root)
            .expect("locate");
        assert_eq!(l_repos, vec![path_root.join("work/repo")]);
    }

    #[test]
    fn cancelled_walk_stops_immediately() {
        let tmp = TempDir::new().expect("tempdir");
        make_repo(&tmp.path().join("r"));
        let flag_cancel = AtomicBool::new(true);
        let oracle = MemoryIgnoreOracle::new();
        let l_repos: Vec<PathBuf> = RepositoryLocator::new(&oracle)
            .with_cancel_flag(&flag_cancel)
            .locate(tmp.path())
            .expect("locate");
        assert!(l_repos.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_are_visited_once() {
        let tmp = TempDir::new().expect("tempdir");
        let path_root = tmp.path().join("root");
        fs::create_dir_all(path_root.join("a")).expect("mkdir");
        make_repo(&path_root.join("a/repo"));
        std::os::unix::fs::symlink(&path_root, path_root.join("a/loop")).expect("symlink");

        let outside = tmp.path().join("outside");
        make_repo(&outside.join("foreign"));
        std::os::unix::fs::symlink(&outside, path_root.join("escape")).expect("symlink");

        let oracle = MemoryIgnoreOracle::new();
        let l_repos = RepositoryLocator::new(&oracle)
            .locate(&path_root)
            .expect("locate");
        assert_eq!(l_repos, vec![path_root.join("a/repo")]);
    }

    #[test]
    fn listing_error_other_than_permission_aborts_walk() {
        let tmp = TempDir::new().expect("tempdir");
        let path_root = fs::canonicalize(tmp.path()).expect("canonicalize").join("root");
        fs::create_dir_all(path_root.join("a")).expect("mkdir");
        fs::create_dir_all(path_root.join("b")).expect("mkdir");
        let path_doomed = path_root.join("b");

        let oracle = MemoryIgnoreOracle::new();
        let res = RepositoryLocator::new(&oracle).walk(
            &path_root,
            |p| {
                if p.ends_with("a") {
                    fs::remove_dir(&path_doomed).expect("remove queued sibling");
                }
            },
            |_| {},
        );
        match res {
            Err(BackupRunError::TraversalFailed { path, .. }) => assert_eq!(path, path_doomed),
            other => panic!("expected TraversalFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tempdir");
        let path_root = tmp.path().join("root");
        let path_locked = path_root.join("locked");
        make_repo(&path_locked.join("hidden"));
        make_repo(&path_root.join("open/repo"));

        fs::set_permissions(&path_locked, fs::Permissions::from_mode(0o000)).expect("chmod");
        if fs::read_dir(&path_locked).is_ok() {
            // Privileged user: permissions do not restrict listing.
            fs::set_permissions(&path_locked, fs::Permissions::from_mode(0o755)).expect("chmod");
            return;
        }

        let oracle = MemoryIgnoreOracle::new();
        let mut l_repos = Vec::new();
        let res = RepositoryLocator::new(&oracle).walk(&path_root, |_| {}, |p| l_repos.push(p));
        fs::set_permissions(&path_locked, fs::Permissions::from_mode(0o755)).expect("chmod");

        let summary = res.expect("walk completes");
        assert_eq!(l_repos, vec![path_root.join("open/repo")]);
        assert_eq!(summary.dirs_unreadable, vec![path_locked]);
    }
}
