use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use filetime::{FileTime, set_file_times};
use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::spec::{EnumCopyErrorKind, SpecCopyError};

/// Prefix of in-flight temporary files written next to their destination.
pub(crate) const C_TEMP_FILE_PREFIX: &str = ".copy-ignore-";

////////////////////////////////////////////////////////////////////////////////
// #region PathUtilities

pub(crate) fn absolutize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

/// Canonical form when the path exists, absolute form otherwise.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    absolutize_path(path)
}

/// Key identifying a directory during traversal.
///
/// Symlinks are resolved; on case-insensitive platforms the key is also
/// case-folded so two spellings of one directory collapse.
pub(crate) fn visit_key(path: &Path) -> PathBuf {
    let path_resolved = normalize_path(path);
    #[cfg(windows)]
    {
        PathBuf::from(path_resolved.to_string_lossy().to_lowercase())
    }
    #[cfg(not(windows))]
    {
        path_resolved
    }
}

/// `true` when `path` equals `base` or lies below it, after normalization.
pub(crate) fn is_within(path: &Path, base: &Path) -> bool {
    normalize_path(path).starts_with(normalize_path(base))
}

/// Keep only normal components; reject `..`, roots and prefixes.
///
/// Returns `None` for an empty result.
pub(crate) fn sanitize_relative_path(path: &Path) -> Option<PathBuf> {
    let mut path_clean = PathBuf::new();
    for part in path.components() {
        match part {
            Component::Normal(name) => path_clean.push(name),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if path_clean.as_os_str().is_empty() {
        return None;
    }
    Some(path_clean)
}

/// Path of `path` relative to `base`, lexically. `None` when outside or equal.
pub(crate) fn derive_relative_path(path: &Path, base: &Path) -> Option<PathBuf> {
    let path_rel = path.strip_prefix(base).ok()?;
    sanitize_relative_path(path_rel)
}

pub(crate) fn validate_destination_path_safety(
    path_dst_item: &Path,
    path_dir_dst_root: &Path,
) -> Result<(), String> {
    let path_dir_dst_root_abs = absolutize_path(path_dir_dst_root);
    let path_dst_item_abs = absolutize_path(path_dst_item);

    let path_rel = path_dst_item_abs
        .strip_prefix(&path_dir_dst_root_abs)
        .map_err(|_| {
            format!(
                "Destination escapes backup root: {} (root={})",
                path_dst_item.display(),
                path_dir_dst_root.display()
            )
        })?;

    let mut path_cursor = path_dir_dst_root_abs.clone();
    for part_rel in path_rel.components() {
        if !matches!(part_rel, Component::Normal(_)) {
            return Err(format!(
                "Destination contains a non-normal component: {}",
                path_dst_item.display()
            ));
        }
        path_cursor.push(part_rel.as_os_str());
        match fs::symlink_metadata(&path_cursor) {
            Ok(meta_cursor) if meta_cursor.file_type().is_symlink() => {
                return Err(format!(
                    "Destination traverses a symlink: {}",
                    path_cursor.display()
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => {
                return Err(format!(
                    "Failed to inspect destination component {} ({e})",
                    path_cursor.display()
                ));
            }
        }
    }
    Ok(())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FileOperations

/// Write `path_file_src` to `path_file_dst` through a sibling temp file.
///
/// The destination is replaced by a single rename, so a reader never sees a
/// partial file. Permissions, timestamps and (on Linux) xattrs follow the
/// source. A timestamp failure does not fail the copy; its text is returned.
pub(crate) fn copy_file_atomic(
    path_file_src: &Path,
    path_file_dst: &Path,
    meta_src: &fs::Metadata,
) -> Result<Option<String>, SpecCopyError> {
    let fail = |kind: EnumCopyErrorKind, exception: String| {
        SpecCopyError::new(path_file_dst, kind, exception)
    };

    let path_parent_dst = path_file_dst.parent().ok_or_else(|| {
        fail(
            EnumCopyErrorKind::CopyIo,
            "Destination has no parent directory".to_string(),
        )
    })?;
    fs::create_dir_all(path_parent_dst).map_err(|e| {
        fail(
            EnumCopyErrorKind::CopyIo,
            format!("Failed to create {}: {e}", path_parent_dst.display()),
        )
    })?;

    let mut file_tmp = tempfile::Builder::new()
        .prefix(C_TEMP_FILE_PREFIX)
        .suffix(".tmp")
        .tempfile_in(path_parent_dst)
        .map_err(|e| {
            fail(
                EnumCopyErrorKind::CopyIo,
                format!("Failed to create temporary file: {e}"),
            )
        })?;
    let mut file_src = File::open(path_file_src).map_err(|e| {
        fail(
            EnumCopyErrorKind::CopyIo,
            format!("Failed to open source {}: {e}", path_file_src.display()),
        )
    })?;
    io::copy(&mut file_src, file_tmp.as_file_mut())
        .map_err(|e| fail(EnumCopyErrorKind::CopyIo, format!("Failed to copy content: {e}")))?;
    file_tmp
        .as_file()
        .sync_all()
        .map_err(|e| fail(EnumCopyErrorKind::CopyIo, format!("Failed to flush content: {e}")))?;
    fs::set_permissions(file_tmp.path(), meta_src.permissions()).map_err(|e| {
        fail(
            EnumCopyErrorKind::CopyIo,
            format!("Failed to apply permissions: {e}"),
        )
    })?;
    #[cfg(target_os = "linux")]
    copy_xattrs_linux(path_file_src, file_tmp.path());

    file_tmp.persist(path_file_dst).map_err(|e| {
        fail(
            EnumCopyErrorKind::Rename,
            format!("Failed to rename temporary file into place: {}", e.error),
        )
    })?;

    let file_time_access = FileTime::from_last_access_time(meta_src);
    let file_time_modify = FileTime::from_last_modification_time(meta_src);
    match set_file_times(path_file_dst, file_time_access, file_time_modify) {
        Ok(()) => Ok(None),
        Err(e) => Ok(Some(format!(
            "Failed to preserve modification time on {}: {e}",
            path_file_dst.display()
        ))),
    }
}

#[cfg(target_os = "linux")]
fn copy_xattrs_linux(path_file_src: &Path, path_file_dst: &Path) {
    let Ok(iter_xattr_names) = xattr::list(path_file_src) else {
        return;
    };
    for name in iter_xattr_names {
        let Some(raw_value) = xattr::get(path_file_src, &name).ok().flatten() else {
            continue;
        };
        let _ = xattr::set(path_file_dst, &name, &raw_value);
    }
}

/// `true` when the destination is strictly older than the source.
pub(crate) fn is_strictly_older(meta_dst: &fs::Metadata, meta_src: &fs::Metadata) -> bool {
    FileTime::from_last_modification_time(meta_dst) < FileTime::from_last_modification_time(meta_src)
}

/// Remove a file, symlink or directory tree.
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file or directory tree, keeping modification times.
pub(crate) fn copy_path_recursive(path_src: &Path, path_dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(path_src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let path_rel = entry
            .path()
            .strip_prefix(path_src)
            .map_err(io::Error::other)?;
        let path_target = if path_rel.as_os_str().is_empty() {
            path_dst.to_path_buf()
        } else {
            path_dst.join(path_rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&path_target)?;
            continue;
        }
        if let Some(path_parent) = path_target.parent() {
            fs::create_dir_all(path_parent)?;
        }
        if file_type.is_symlink() {
            copy_symlink(entry.path(), &path_target)?;
            continue;
        }
        fs::copy(entry.path(), &path_target)?;
        let meta = entry.metadata().map_err(io::Error::other)?;
        set_file_times(
            &path_target,
            FileTime::from_last_access_time(&meta),
            FileTime::from_last_modification_time(&meta),
        )?;
    }
    Ok(())
}

fn copy_symlink(path_src: &Path, path_dst: &Path) -> io::Result<()> {
    let path_link_target = fs::read_link(path_src)?;
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&path_link_target, path_dst)
    }
    #[cfg(windows)]
    {
        if path_src.is_dir() {
            std::os::windows::fs::symlink_dir(&path_link_target, path_dst)
        } else {
            std::os::windows::fs::symlink_file(&path_link_target, path_dst)
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = path_link_target;
        fs::copy(path_src, path_dst).map(|_| ())
    }
}

/// Remove empty directories from `path_start` upward, stopping at `path_stop`.
pub(crate) fn remove_empty_ancestors(path_start: &Path, path_stop: &Path) {
    let mut path_cursor = path_start;
    while path_cursor != path_stop && path_cursor.starts_with(path_stop) {
        if fs::remove_dir(path_cursor).is_err() {
            break;
        }
        let Some(path_parent) = path_cursor.parent() else {
            break;
        };
        path_cursor = path_parent;
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Workers

/// Per-path mutexes; an entry lives only while some worker holds or waits on it.
pub(crate) type TablePathLocks = DashMap<PathBuf, Arc<Mutex<()>>>;

/// Run `f` under the mutex for `path`, then drop the entry if nobody else
/// is queued on it.
pub(crate) fn with_path_lock<T>(table_locks: &TablePathLocks, path: &Path, f: impl FnOnce() -> T) -> T {
    let lock = table_locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .value()
        .clone();
    let out = {
        let _guard = lock.lock();
        f()
    };
    drop(lock);
    table_locks.remove_if(path, |_, lock_held| Arc::strong_count(lock_held) == 1);
    out
}

/// Resolve a worker count; `None` means host parallelism.
pub(crate) fn calculate_worker_limit(num_workers: Option<usize>) -> usize {
    match num_workers {
        Some(n) => n.max(1),
        None => std::thread::available_parallelism()
            .map(|v| v.get())
            .unwrap_or(1),
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
