//! Repository detection and ignore-status queries.
//!
//! [`IgnoreOracle`] is the seam between discovery and the version-control
//! system. [`GitCli`] shells out to `git`; [`MemoryIgnoreOracle`] answers from
//! a fixed listing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::spec::VcsError;
use crate::util::sanitize_relative_path;

/// Name of the repository marker entry.
pub const C_MARKER_NAME: &str = ".git";
const C_GITDIR_PREFIX: &str = "gitdir:";

/// Version-control collaborator used by discovery.
pub trait IgnoreOracle: Send + Sync {
    /// `true` when `path_dir` is the root of a working tree.
    fn is_repository_root(&self, path_dir: &Path) -> bool {
        has_repository_marker(path_dir)
    }

    /// Ignored, untracked files of a repository, relative to its root.
    fn list_ignored_files(&self, path_repo_root: &Path) -> Result<Vec<PathBuf>, VcsError>;

    /// `true` when `path` inside the repository is ignored.
    fn is_path_ignored(&self, path_repo_root: &Path, path: &Path) -> Result<bool, VcsError>;
}

/// Marker check on the filesystem.
///
/// A `.git` directory counts. A `.git` file counts only when its `gitdir:`
/// line points at an existing directory.
pub fn has_repository_marker(path_dir: &Path) -> bool {
    let path_marker = path_dir.join(C_MARKER_NAME);
    let Ok(meta_marker) = fs::metadata(&path_marker) else {
        return false;
    };
    if meta_marker.is_dir() {
        return true;
    }
    if !meta_marker.is_file() {
        return false;
    }
    let Ok(c_content) = fs::read_to_string(&path_marker) else {
        return false;
    };
    c_content
        .lines()
        .find_map(|line| line.trim().strip_prefix(C_GITDIR_PREFIX))
        .map(|c_target| path_dir.join(c_target.trim()).is_dir())
        .unwrap_or(false)
}

/// Split `-z` output into clean relative paths.
///
/// Entries that are empty or would escape the repository are dropped.
pub fn parse_nul_separated(raw: &[u8]) -> Vec<PathBuf> {
    raw.split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .filter_map(|chunk| sanitize_relative_path(&_path_from_bytes(chunk)))
        .collect()
}

#[cfg(unix)]
fn _path_from_bytes(raw: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(raw))
}

#[cfg(not(unix))]
fn _path_from_bytes(raw: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(raw).into_owned())
}

////////////////////////////////////////////////////////////////////////////////
// #region GitCli

/// [`IgnoreOracle`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    c_program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            c_program: "git".to_string(),
        }
    }
}

impl GitCli {
    /// Use a specific `git` executable.
    pub fn new(c_program: impl Into<String>) -> Self {
        Self {
            c_program: c_program.into(),
        }
    }

    fn run(&self, path_repo_root: &Path, args: &[&std::ffi::OsStr]) -> Result<Output, VcsError> {
        Command::new(&self.c_program)
            .arg("-C")
            .arg(path_repo_root)
            .args(args)
            .output()
            .map_err(|source| VcsError::CommandSpawn {
                program: self.c_program.clone(),
                path_repo: path_repo_root.to_path_buf(),
                source,
            })
    }

    fn failure(&self, path_repo_root: &Path, output: &Output) -> VcsError {
        VcsError::CommandFailed {
            program: self.c_program.clone(),
            path_repo: path_repo_root.to_path_buf(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

impl IgnoreOracle for GitCli {
    fn list_ignored_files(&self, path_repo_root: &Path) -> Result<Vec<PathBuf>, VcsError> {
        let args = ["ls-files", "-i", "-o", "--exclude-standard", "-z"].map(std::ffi::OsStr::new);
        let output = self.run(path_repo_root, &args)?;
        if !output.status.success() {
            return Err(self.failure(path_repo_root, &output));
        }
        Ok(parse_nul_separated(&output.stdout))
    }

    fn is_path_ignored(&self, path_repo_root: &Path, path: &Path) -> Result<bool, VcsError> {
        let path_rel = path.strip_prefix(path_repo_root).unwrap_or(path);
        let mut c_query = path_rel.as_os_str().to_os_string();
        // Directory rules such as `build/` only match with a trailing slash.
        if path.is_dir() {
            c_query.push("/");
        }
        let args = [
            std::ffi::OsStr::new("check-ignore"),
            std::ffi::OsStr::new("-q"),
            std::ffi::OsStr::new("--"),
            c_query.as_os_str(),
        ];
        let output = self.run(path_repo_root, &args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure(path_repo_root, &output)),
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region MemoryIgnoreOracle

/// [`IgnoreOracle`] answering from a fixed per-repository listing.
///
/// Repository roots are still detected from markers on disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryIgnoreOracle {
    map_repositories: BTreeMap<PathBuf, SpecIgnoreListing>,
}

#[derive(Debug, Clone, Default)]
struct SpecIgnoreListing {
    l_files: Vec<PathBuf>,
    set_dirs: BTreeSet<PathBuf>,
    c_failure: Option<String>,
}

impl MemoryIgnoreOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register ignored files (relative to the repository) for `path_repo_root`.
    pub fn with_ignored_files<I, P>(mut self, path_repo_root: impl Into<PathBuf>, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let listing = self.map_repositories.entry(path_repo_root.into()).or_default();
        listing.l_files.extend(files.into_iter().map(Into::into));
        self
    }

    /// Register ignored directories (relative to the repository) for `path_repo_root`.
    pub fn with_ignored_dirs<I, P>(mut self, path_repo_root: impl Into<PathBuf>, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let listing = self.map_repositories.entry(path_repo_root.into()).or_default();
        listing.set_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    /// Make every query for `path_repo_root` fail with `c_message`.
    pub fn with_failure(mut self, path_repo_root: impl Into<PathBuf>, c_message: impl Into<String>) -> Self {
        let listing = self.map_repositories.entry(path_repo_root.into()).or_default();
        listing.c_failure = Some(c_message.into());
        self
    }

    fn listing(&self, path_repo_root: &Path) -> Result<&SpecIgnoreListing, VcsError> {
        let listing = self
            .map_repositories
            .get(path_repo_root)
            .ok_or_else(|| VcsError::UnknownRepository {
                path_repo: path_repo_root.to_path_buf(),
            })?;
        if let Some(c_failure) = &listing.c_failure {
            return Err(VcsError::CommandFailed {
                program: "memory".to_string(),
                path_repo: path_repo_root.to_path_buf(),
                status: "failure".to_string(),
                stderr: c_failure.clone(),
            });
        }
        Ok(listing)
    }
}

impl IgnoreOracle for MemoryIgnoreOracle {
    fn list_ignored_files(&self, path_repo_root: &Path) -> Result<Vec<PathBuf>, VcsError> {
        Ok(self.listing(path_repo_root)?.l_files.clone())
    }

    fn is_path_ignored(&self, path_repo_root: &Path, path: &Path) -> Result<bool, VcsError> {
        let listing = self.listing(path_repo_root)?;
        let path_rel = path.strip_prefix(path_repo_root).unwrap_or(path);
        Ok(listing.set_dirs.contains(path_rel) || listing.l_files.iter().any(|p| p == path_rel))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
