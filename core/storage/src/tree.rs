//! Directory tree walking: copy, summarise, verify, remove.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::progress::{OperationReport, Progress};
use phantomvault_common::{io_err, Error, Result, StorageError};

/// Shape of a tree, used to confirm a copy is complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeSummary {
    /// Regular files.
    pub files: u64,
    /// Directories below the root.
    pub dirs: u64,
    /// Symbolic links.
    pub symlinks: u64,
    /// Total size of regular files.
    pub bytes: u64,
}

/// Map a walkdir failure onto a storage error.
pub fn walk_error(err: walkdir::Error) -> Error {
    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
    match err.into_io_error() {
        Some(io) => StorageError::from_io(&path, io).into(),
        None => StorageError::Io {
            path,
            message: "filesystem loop detected".to_string(),
        }
        .into(),
    }
}

/// Count files, directories and bytes under `root`.
pub fn summarize(root: &Path) -> Result<TreeSummary> {
    let mut summary = TreeSummary::default();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(walk_error)?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            summary.dirs += 1;
        } else if file_type.is_symlink() {
            summary.symlinks += 1;
        } else {
            summary.files += 1;
            summary.bytes += entry.metadata().map_err(walk_error)?.len();
        }
    }
    Ok(summary)
}

/// Total size in bytes of the regular files under `root`.
pub fn folder_size(root: &Path) -> Result<u64> {
    if !root.exists() {
        return Err(StorageError::SourceMissing(root.to_path_buf()).into());
    }
    if root.is_file() {
        return fs::metadata(root).map(|m| m.len()).map_err(io_err(root));
    }
    Ok(summarize(root)?.bytes)
}

/// Copy the tree at `src` to `dst`, which must not exist.
///
/// Cancellation is checked before each entry. On failure the caller owns
/// cleanup of the partial destination.
pub fn copy_tree(src: &Path, dst: &Path, progress: &Progress) -> Result<OperationReport> {
    let total = summarize(src)?.bytes;
    let mut report = OperationReport::default();

    fs::create_dir(dst).map_err(io_err(dst))?;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1).sort_by_file_name() {
        progress.check_cancelled()?;
        let entry = entry.map_err(walk_error)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| Error::InvalidInput(format!("{} escaped copy root", entry.path().display())))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(io_err(&target))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            let bytes = fs::copy(entry.path(), &target).map_err(io_err(&target))?;
            report.record(relative, bytes);
            progress.report("copy", entry.path(), report.bytes_processed, total);
        }
    }

    debug!(
        src = %src.display(),
        dst = %dst.display(),
        files = report.processed_paths.len(),
        bytes = report.bytes_processed,
        "tree copied"
    );
    Ok(report)
}

/// Recreate the symlink at `src` as `dst`.
#[cfg(unix)]
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).map_err(io_err(src))?;
    std::os::unix::fs::symlink(target, dst).map_err(io_err(dst))
}

/// Copy the target of `src` to `dst`.
#[cfg(not(unix))]
pub fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(io_err(dst))?;
    Ok(())
}

/// Whether every entry under `root` can be read.
///
/// Returns false for a missing root, an unreadable directory, a file that
/// cannot be read to the end, or a dangling symlink.
pub fn verify_tree(root: &Path) -> bool {
    if !root.is_dir() {
        return false;
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "tree entry unreadable");
                return false;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            if fs::metadata(entry.path()).is_err() {
                debug!(path = %entry.path().display(), "dangling symlink");
                return false;
            }
        } else if file_type.is_file() && !file_readable(entry.path()) {
            debug!(path = %entry.path().display(), "file unreadable");
            return false;
        }
    }
    true
}

fn file_readable(path: &Path) -> bool {
    fs::File::open(path)
        .and_then(|mut file| io::copy(&mut file, &mut io::sink()))
        .is_ok()
}

/// Remove a file or directory tree. Missing paths are not an error.
pub fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_err(path)),
        Ok(_) => fs::remove_file(path).map_err(io_err(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Relative paths of all regular files under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_file() {
            if let Ok(relative) = entry.path().strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantomvault_common::Error;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("sub/b.bin"), vec![1u8; 100]).unwrap();
        fs::write(root.join("sub/deeper/c"), b"").unwrap();
    }

    #[test]
    fn test_copy_tree_preserves_structure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);

        let report = copy_tree(&src, &dst, &Progress::silent()).unwrap();

        assert_eq!(report.bytes_processed, 105);
        assert_eq!(report.processed_paths.len(), 3);
        assert_eq!(summarize(&src).unwrap(), summarize(&dst).unwrap());
        assert_eq!(fs::read(dst.join("sub/b.bin")).unwrap(), vec![1u8; 100]);
        assert_eq!(list_files(&dst).unwrap(), list_files(&src).unwrap());
    }

    #[test]
    fn test_copy_tree_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        sample_tree(&src);
        fs::create_dir(&dst).unwrap();

        assert!(matches!(
            copy_tree(&src, &dst, &Progress::silent()),
            Err(Error::Storage(StorageError::DestinationExists(_)))
        ));
    }

    #[test]
    fn test_copy_tree_cancelled() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        sample_tree(&src);

        let progress = Progress::silent();
        progress.cancellation().cancel();

        assert!(matches!(
            copy_tree(&src, &dir.path().join("dst"), &progress),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_folder_size() {
        let dir = TempDir::new().unwrap();
        sample_tree(dir.path());
        assert_eq!(folder_size(dir.path()).unwrap(), 105);
        assert!(folder_size(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_verify_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        sample_tree(&root);
        assert!(verify_tree(&root));
        assert!(!verify_tree(&dir.path().join("missing")));
    }

    #[cfg(unix)]
    #[test]
    fn test_verify_tree_dangling_symlink() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        sample_tree(&root);
        std::os::unix::fs::symlink(root.join("gone"), root.join("link")).unwrap();
        assert!(!verify_tree(&root));
    }

    #[test]
    fn test_remove_path() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tree");
        sample_tree(&root);

        remove_path(&root).unwrap();
        assert!(!root.exists());
        remove_path(&root).unwrap();
    }
}
