//! Per-repository enumeration of ignored paths.
//!
//! Two phases:
//! 1. each direct child directory of the repository root is probed; an
//!    ignored child becomes one directory entry;
//! 2. the full ignored-file listing is filtered against the exclusion
//!    matcher and against phase-1 directories, then files sharing a parent
//!    directory are collapsed into that directory.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::exclude::Excluder;
use crate::spec::{SpecDiscoveredEntry, VcsError};
use crate::util::sanitize_relative_path;
use crate::vcs::{C_MARKER_NAME, IgnoreOracle};

/// Produces discovered entries for one repository at a time.
pub struct IgnoredFileCollector<'a> {
    oracle: &'a dyn IgnoreOracle,
    excluder: &'a dyn Excluder,
    path_dir_search: PathBuf,
}

impl<'a> IgnoredFileCollector<'a> {
    pub fn new(
        oracle: &'a dyn IgnoreOracle,
        excluder: &'a dyn Excluder,
        path_dir_search: &Path,
    ) -> Self {
        Self {
            oracle,
            excluder,
            path_dir_search: path_dir_search.to_path_buf(),
        }
    }

    /// Entries for `path_repo_root`, directories first, in path order.
    pub fn collect(&self, path_repo_root: &Path) -> Result<Vec<SpecDiscoveredEntry>, VcsError> {
        let (mut l_entries, set_dirs_ignored) = self.collect_ignored_dirs(path_repo_root)?;

        let l_paths_ignored = self.oracle.list_ignored_files(path_repo_root)?;
        let mut l_entries_file = Vec::with_capacity(l_paths_ignored.len());
        for path_listed in l_paths_ignored {
            let Some(path_rel_repo) = sanitize_relative_path(&path_listed) else {
                tracing::warn!(
                    repo = %path_repo_root.display(),
                    path = %path_listed.display(),
                    "Dropping listed path that leaves the repository"
                );
                continue;
            };
            if set_dirs_ignored.iter().any(|d| path_rel_repo.starts_with(d)) {
                continue;
            }
            let path_abs = path_repo_root.join(&path_rel_repo);
            if self.excluder.should_exclude(&path_abs) {
                tracing::debug!(path = %path_abs.display(), "Excluded");
                continue;
            }
            if let Some(spec_entry) =
                SpecDiscoveredEntry::from_paths(path_abs, &self.path_dir_search, path_repo_root)
            {
                l_entries_file.push(spec_entry);
            }
        }

        l_entries.extend(collapse_redundant_entries(
            l_entries_file,
            &self.path_dir_search,
            path_repo_root,
        ));
        Ok(l_entries)
    }

    fn collect_ignored_dirs(
        &self,
        path_repo_root: &Path,
    ) -> Result<(Vec<SpecDiscoveredEntry>, BTreeSet<PathBuf>), VcsError> {
        let iter_entries = fs::read_dir(path_repo_root).map_err(|source| VcsError::ReadRepository {
            path_repo: path_repo_root.to_path_buf(),
            source,
        })?;
        let mut l_names: Vec<OsString> = Vec::new();
        for entry in iter_entries {
            let entry = entry.map_err(|source| VcsError::ReadRepository {
                path_repo: path_repo_root.to_path_buf(),
                source,
            })?;
            if entry.file_type().is_ok_and(|t| t.is_dir()) && entry.file_name() != C_MARKER_NAME {
                l_names.push(entry.file_name());
            }
        }
        l_names.sort();

        let mut l_entries = Vec::new();
        let mut set_dirs_ignored = BTreeSet::new();
        for name in l_names {
            let path_dir = path_repo_root.join(&name);
            if self.excluder.should_exclude(&path_dir) {
                tracing::debug!(path = %path_dir.display(), "Excluded");
                continue;
            }
            match self.oracle.is_path_ignored(path_repo_root, &path_dir) {
                Ok(true) => {
                    set_dirs_ignored.insert(PathBuf::from(&name));
                    if let Some(spec_entry) =
                        SpecDiscoveredEntry::from_paths(path_dir, &self.path_dir_search, path_repo_root)
                    {
                        l_entries.push(spec_entry);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(path = %path_dir.display(), error = %e, "Ignore probe failed; skipping directory");
                }
            }
        }
        Ok((l_entries, set_dirs_ignored))
    }
}

/// Collapse files sharing a parent directory into that directory.
///
/// Groups of two or more files become one directory entry. Single files stay
/// as they are. Files directly under the repository root are never
/// collapsed, which would turn the whole repository into one entry.
pub fn collapse_redundant_entries(
    l_entries: Vec<SpecDiscoveredEntry>,
    path_dir_search: &Path,
    path_repo_root: &Path,
) -> Vec<SpecDiscoveredEntry> {
    let mut map_groups: BTreeMap<PathBuf, Vec<SpecDiscoveredEntry>> = BTreeMap::new();
    for spec_entry in l_entries {
        let path_parent_rel = spec_entry
            .path_abs()
            .strip_prefix(path_repo_root)
            .ok()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        map_groups.entry(path_parent_rel).or_default().push(spec_entry);
    }

    let mut l_result = Vec::new();
    for (path_parent_rel, mut l_group) in map_groups {
        if l_group.len() >= 2 && !path_parent_rel.as_os_str().is_empty() {
            let path_dir_abs = path_repo_root.join(&path_parent_rel);
            if let Some(spec_entry) =
                SpecDiscoveredEntry::from_paths(path_dir_abs, path_dir_search, path_repo_root)
            {
                tracing::debug!(
                    dir = %spec_entry.path_abs().display(),
                    files = l_group.len(),
                    "Collapsed ignored files into directory"
                );
                l_result.push(spec_entry);
                continue;
            }
        }
        l_group.sort();
        l_result.extend(l_group);
    }
    l_result
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use super::{IgnoredFileCollector, collapse_redundant_entries};
    use crate::exclude::ExcludeMatcher;
    use crate::spec::SpecDiscoveredEntry;
    use crate::vcs::MemoryIgnoreOracle;

    fn entry(path_search: &Path, path_repo: &Path, c_rel: &str) -> SpecDiscoveredEntry {
        SpecDiscoveredEntry::from_paths(path_repo.join(c_rel), path_search, path_repo).expect("entry")
    }

    fn rel_paths(l_entries: &[SpecDiscoveredEntry]) -> Vec<PathBuf> {
        l_entries.iter().map(|e| e.path_rel().to_path_buf()).collect()
    }

    #[test]
    fn collapse_groups_siblings_and_keeps_singles() {
        let path_search = Path::new("/search");
        let path_repo = Path::new("/search/repo1");
        let l_entries = vec![
            entry(path_search, path_repo, "dir1/file1.txt"),
            entry(path_search, path_repo, "dir1/file2.txt"),
            entry(path_search, path_repo, "dir2/file3.txt"),
            entry(path_search, path_repo, "dir3/subdir/file4.txt"),
            entry(path_search, path_repo, "dir3/subdir/file5.txt"),
            entry(path_search, path_repo, "dir3/file6.txt"),
        ];

        let l_result = collapse_redundant_entries(l_entries, path_search, path_repo);
        assert_eq!(
            rel_paths(&l_result),
            vec![
                PathBuf::from("repo1/dir1"),
                PathBuf::from("repo1/dir2/file3.txt"),
                PathBuf::from("repo1/dir3/file6.txt"),
                PathBuf::from("repo1/dir3/subdir"),
            ]
        );
    }

    #[test]
    fn collapse_never_folds_repository_root() {
        let path_search = Path::new("/search");
        let path_repo = Path::new("/search/deep/repo");
        let l_entries = vec![
            entry(path_search, path_repo, ".env"),
            entry(path_search, path_repo, "local.cfg"),
        ];
        let l_result = collapse_redundant_entries(l_entries, path_search, path_repo);
        assert_eq!(
            rel_paths(&l_result),
            vec![
                PathBuf::from("deep/repo/.env"),
                PathBuf::from("deep/repo/local.cfg"),
            ]
        );
    }

    #[test]
    fn collector_probes_directories_then_filters_files() {
        let tmp = TempDir::new().expect("tempdir");
        let path_search = tmp.path();
        let path_repo = path_search.join("repo");
        fs::create_dir_all(path_repo.join(".git")).expect("mkdir");
        fs::create_dir_all(path_repo.join("build/obj")).expect("mkdir");
        fs::create_dir_all(path_repo.join("src")).expect("mkdir");
        fs::create_dir_all(path_repo.join("node_modules")).expect("mkdir");

        let oracle = MemoryIgnoreOracle::new()
            .with_ignored_dirs(&path_repo, ["build", "node_modules"])
            .with_ignored_files(
                &path_repo,
                ["build/obj/a.o", "src/debug.log", "src/local.cfg", "app.log", "../outside"],
            );
        let matcher = ExcludeMatcher::new(["node_modules", "*.log"]);

        let collector = IgnoredFileCollector::new(&oracle, &matcher, path_search);
        let l_entries = collector.collect(&path_repo).expect("collect");
        assert_eq!(
            rel_paths(&l_entries),
            vec![PathBuf::from("repo/build"), PathBuf::from("repo/src/local.cfg")]
        );
        assert!(l_entries.iter().all(|e| e.path_repo_root() == path_repo));
    }

    #[test]
    fn collector_reports_listing_failure() {
        let tmp = TempDir::new().expect("tempdir");
        let path_repo = tmp.path().join("repo");
        fs::create_dir_all(path_repo.join(".git")).expect("mkdir");
        let oracle = MemoryIgnoreOracle::new().with_failure(&path_repo, "corrupt index");
        let matcher = ExcludeMatcher::default();

        let res = IgnoredFileCollector::new(&oracle, &matcher, tmp.path()).collect(&path_repo);
        assert!(res.is_err());
    }
}
